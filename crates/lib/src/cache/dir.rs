//! Directory-backed artifact cache.
//!
//! # Layout
//!
//! ```text
//! <root>/
//! └── obj/
//!     └── <build key>/
//!         ├── artifact.bin   # the blob
//!         └── meta.json      # kind, key, size
//! ```
//!
//! Publishing stages the entry into a temporary directory under `<root>` and
//! renames it into place, so a concurrent reader sees either nothing or a
//! complete entry. When two writers race on one key the rename loser
//! discards its staging directory and reads back the winner's entry.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::artifact::Artifact;
use crate::consts::{CACHE_BLOB_FILE, CACHE_META_FILE};
use crate::key::BuildKey;
use crate::target::TargetKind;

use super::{ArtifactCache, CacheError};

/// Metadata sidecar stored next to the blob.
#[derive(Debug, Serialize, Deserialize)]
struct EntryMeta {
  kind: TargetKind,
  key: BuildKey,
  size: u64,
}

/// A cache persisting artifacts under a directory root.
///
/// Reopening a `DirCache` on the same root sees everything published by
/// earlier sessions, which is what makes warm rebuilds free.
pub struct DirCache {
  root: PathBuf,
}

impl DirCache {
  /// Open (and if needed initialize) a cache rooted at `root`.
  pub fn open(root: impl Into<PathBuf>) -> Result<Self, CacheError> {
    let root = root.into();
    let obj = root.join("obj");
    fs::create_dir_all(&obj).map_err(|e| CacheError::Io {
      path: obj,
      source: e,
    })?;
    Ok(Self { root })
  }

  pub fn root(&self) -> &Path {
    &self.root
  }

  fn entry_dir(&self, key: &BuildKey) -> PathBuf {
    self.root.join("obj").join(&key.0)
  }

  fn read_entry(&self, key: &BuildKey, dir: &Path) -> Result<Arc<Artifact>, CacheError> {
    let meta_path = dir.join(CACHE_META_FILE);
    let meta_text = fs::read_to_string(&meta_path).map_err(|e| CacheError::Io {
      path: meta_path,
      source: e,
    })?;
    let meta: EntryMeta = serde_json::from_str(&meta_text).map_err(|e| CacheError::Corrupt {
      key: key.clone(),
      message: e.to_string(),
    })?;

    let blob_path = dir.join(CACHE_BLOB_FILE);
    let bytes = fs::read(&blob_path).map_err(|e| CacheError::Io {
      path: blob_path,
      source: e,
    })?;

    if bytes.len() as u64 != meta.size {
      return Err(CacheError::Corrupt {
        key: key.clone(),
        message: format!("blob is {} bytes, metadata says {}", bytes.len(), meta.size),
      });
    }

    Ok(Arc::new(Artifact::new(meta.kind, meta.key, bytes)))
  }
}

impl ArtifactCache for DirCache {
  fn lookup(&self, key: &BuildKey) -> Result<Option<Arc<Artifact>>, CacheError> {
    let dir = self.entry_dir(key);
    if !dir.join(CACHE_META_FILE).exists() {
      return Ok(None);
    }
    self.read_entry(key, &dir).map(Some)
  }

  fn publish(&self, key: &BuildKey, artifact: Artifact) -> Result<Arc<Artifact>, CacheError> {
    let dir = self.entry_dir(key);
    if let Some(existing) = self.lookup(key)? {
      debug!(key = %key, "entry already published");
      return Ok(existing);
    }

    // Stage in the cache root so the final rename stays on one filesystem.
    let staged = tempfile::Builder::new()
      .prefix("publish-")
      .tempdir_in(&self.root)
      .map_err(|e| CacheError::Io {
        path: self.root.clone(),
        source: e,
      })?;

    let blob_path = staged.path().join(CACHE_BLOB_FILE);
    fs::write(&blob_path, &artifact.bytes).map_err(|e| CacheError::Io {
      path: blob_path,
      source: e,
    })?;

    let meta = EntryMeta {
      kind: artifact.kind,
      key: key.clone(),
      size: artifact.size(),
    };
    let meta_text = serde_json::to_string_pretty(&meta).map_err(|e| CacheError::Corrupt {
      key: key.clone(),
      message: e.to_string(),
    })?;
    let meta_path = staged.path().join(CACHE_META_FILE);
    fs::write(&meta_path, meta_text).map_err(|e| CacheError::Io {
      path: meta_path,
      source: e,
    })?;

    let staged = staged.keep();
    match fs::rename(&staged, &dir) {
      Ok(()) => {
        debug!(key = %key, size = artifact.size(), "published artifact");
        Ok(Arc::new(artifact))
      }
      Err(rename_err) => {
        let _ = fs::remove_dir_all(&staged);
        if dir.join(CACHE_META_FILE).exists() {
          // Lost the race; the winner's entry is equivalent.
          warn!(key = %key, "publish raced, keeping first writer");
          self.read_entry(key, &dir)
        } else {
          Err(CacheError::Io {
            path: dir,
            source: rename_err,
          })
        }
      }
    }
  }
}
