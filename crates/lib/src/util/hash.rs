//! Content hashing for build keys and artifact addressing.
//!
//! This module provides:
//! - `ContentHash`: a full 64-character SHA-256 hash
//! - `hash_bytes()`: arbitrary byte hashing
//! - `hash_file()`: streaming single file hashing
//! - `hash_directory()`: deterministic directory tree hashing

use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use walkdir::WalkDir;

/// A full SHA-256 content hash as lowercase hexadecimal.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContentHash(pub String);

impl std::fmt::Display for ContentHash {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "{}", self.0)
  }
}

/// Error while hashing file or directory contents.
#[derive(Debug, Error)]
pub enum HashError {
  #[error("failed to read {path}: {source}")]
  Read {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },

  #[error("failed to walk {path}: {message}")]
  Walk { path: PathBuf, message: String },
}

/// Hash arbitrary bytes.
pub fn hash_bytes(data: &[u8]) -> ContentHash {
  let mut hasher = Sha256::new();
  hasher.update(data);
  ContentHash(format!("{:x}", hasher.finalize()))
}

/// Hash a file's contents without loading it whole into memory.
pub fn hash_file(path: &Path) -> Result<ContentHash, HashError> {
  let mut file = fs::File::open(path).map_err(|e| HashError::Read {
    path: path.to_path_buf(),
    source: e,
  })?;

  let mut hasher = Sha256::new();
  let mut buffer = [0u8; 8192];

  loop {
    let n = file.read(&mut buffer).map_err(|e| HashError::Read {
      path: path.to_path_buf(),
      source: e,
    })?;
    if n == 0 {
      break;
    }
    hasher.update(&buffer[..n]);
  }

  Ok(ContentHash(format!("{:x}", hasher.finalize())))
}

/// Compute a deterministic hash of a directory tree.
///
/// The hash covers file contents, directory structure, and symlink targets;
/// it ignores metadata such as timestamps and permissions. Entries are
/// visited in sorted order so the result is stable across platforms.
pub fn hash_directory(root: &Path) -> Result<ContentHash, HashError> {
  let mut hasher = Sha256::new();

  for entry in WalkDir::new(root).sort_by_file_name() {
    let entry = entry.map_err(|e| HashError::Walk {
      path: root.to_path_buf(),
      message: e.to_string(),
    })?;

    let rel = entry
      .path()
      .strip_prefix(root)
      .unwrap_or(entry.path())
      .to_string_lossy()
      .replace('\\', "/");

    // The root itself carries no information.
    if rel.is_empty() {
      continue;
    }

    let file_type = entry.file_type();
    if file_type.is_file() {
      let content = hash_file(entry.path())?;
      hasher.update(format!("f {} {}\n", rel, content.0).as_bytes());
    } else if file_type.is_dir() {
      hasher.update(format!("d {}\n", rel).as_bytes());
    } else if file_type.is_symlink() {
      let link = fs::read_link(entry.path()).map_err(|e| HashError::Read {
        path: entry.path().to_path_buf(),
        source: e,
      })?;
      hasher.update(format!("l {} {}\n", rel, link.to_string_lossy()).as_bytes());
    }
    // Sockets, devices and the like are skipped.
  }

  Ok(ContentHash(format!("{:x}", hasher.finalize())))
}
