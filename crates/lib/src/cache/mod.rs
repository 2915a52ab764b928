//! Content-addressed artifact storage.
//!
//! The cache maps a build key to the artifact produced under that key.
//! `publish` is idempotent: the first writer wins and later writers get the
//! canonical entry back, because identical build keys are guaranteed to
//! yield behaviorally identical artifacts. `lookup` never observes a
//! partially written entry.
//!
//! Two stores are provided: [`MemoryCache`] for tests and single-process
//! use, and [`DirCache`] persisting entries to a directory tree. Eviction is
//! left to the surrounding system; neither store evicts.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};

use thiserror::Error;
use tracing::debug;

use crate::artifact::Artifact;
use crate::key::BuildKey;

mod dir;

pub use dir::DirCache;

/// Errors from cache storage.
///
/// A failed `publish` is retried once by the executor; if it fails again the
/// owning target is marked failed with this error preserved as the cause.
#[derive(Debug, Error)]
pub enum CacheError {
  #[error("cache i/o failure at {path}: {source}")]
  Io {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },

  #[error("corrupt cache entry for {key}: {message}")]
  Corrupt { key: BuildKey, message: String },
}

/// Lookup and atomic publish over content-addressed artifacts.
pub trait ArtifactCache: Send + Sync {
  /// Fetch the artifact published under `key`, if any.
  fn lookup(&self, key: &BuildKey) -> Result<Option<Arc<Artifact>>, CacheError>;

  /// Publish an artifact under `key` and return the canonical entry.
  ///
  /// Idempotent: if another artifact already exists under the same key the
  /// new one is discarded and the existing entry is returned.
  fn publish(&self, key: &BuildKey, artifact: Artifact) -> Result<Arc<Artifact>, CacheError>;
}

/// Unbounded in-memory cache.
#[derive(Default)]
pub struct MemoryCache {
  entries: Mutex<HashMap<BuildKey, Arc<Artifact>>>,
}

impl MemoryCache {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn len(&self) -> usize {
    self
      .entries
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }
}

impl ArtifactCache for MemoryCache {
  fn lookup(&self, key: &BuildKey) -> Result<Option<Arc<Artifact>>, CacheError> {
    let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
    Ok(entries.get(key).cloned())
  }

  fn publish(&self, key: &BuildKey, artifact: Artifact) -> Result<Arc<Artifact>, CacheError> {
    use std::collections::hash_map::Entry;

    let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
    match entries.entry(key.clone()) {
      Entry::Occupied(existing) => {
        // First writer won; contents under one key are interchangeable.
        debug!(key = %key, "discarding duplicate publish");
        Ok(existing.get().clone())
      }
      Entry::Vacant(slot) => Ok(slot.insert(Arc::new(artifact)).clone()),
    }
  }
}
