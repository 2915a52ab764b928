//! The toolchain invoker contract.
//!
//! The engine never depends on a concrete compiler. It consumes exactly two
//! operations, `compile` and `link`, each synchronous from the engine's
//! perspective (an implementation may block on a subprocess; the executor
//! wraps calls in a blocking task). The engine treats both as pure functions
//! of their inputs for caching purposes; a non-deterministic toolchain voids
//! the cache correctness guarantee.
//!
//! [`CcToolchain`] shells out to a real C compiler. [`StubToolchain`] is a
//! deterministic in-memory implementation for tests.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;

use crate::artifact::Artifact;
use crate::key::BuildKey;
use crate::target::{TargetConfig, TargetId, TargetKind};

mod cc;
mod stub;

pub use cc::CcToolchain;
pub use stub::StubToolchain;

/// Toolchain-reported failures.
///
/// These attach to the failing target and are non-fatal to the session as a
/// whole: independent branches of the graph keep building.
#[derive(Debug, Error)]
pub enum ToolchainError {
  #[error("compiling {unit} failed: {message}")]
  Compile { unit: PathBuf, message: String },

  #[error("linking {output} failed: {message}")]
  Link { output: TargetId, message: String },

  #[error("toolchain failure: {message}")]
  Io { message: String },
}

/// One source file compiled under a target's configuration.
#[derive(Debug)]
pub struct CompileRequest<'a> {
  /// The target this unit belongs to.
  pub target: &'a TargetId,
  pub source: &'a Path,
  pub config: &'a TargetConfig,
  /// Build key of the producing target, recorded on the artifact.
  pub key: &'a BuildKey,
}

/// A link step over already-produced artifacts.
///
/// `inputs` are ordered: the target's own compiled objects first, then its
/// dependency artifacts in dependency order. A request with kind
/// `CompileUnit` asks for a relocatable merge of several objects into one.
#[derive(Debug)]
pub struct LinkRequest<'a> {
  pub target: &'a TargetId,
  pub kind: TargetKind,
  pub inputs: &'a [Arc<Artifact>],
  pub config: &'a TargetConfig,
  pub key: &'a BuildKey,
}

/// The two-operation capability interface the engine is polymorphic over.
pub trait Toolchain: Send + Sync {
  fn compile(&self, request: &CompileRequest<'_>) -> Result<Artifact, ToolchainError>;

  fn link(&self, request: &LinkRequest<'_>) -> Result<Artifact, ToolchainError>;
}
