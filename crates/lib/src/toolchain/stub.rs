//! Deterministic in-memory toolchain for tests.
//!
//! Produces textual pseudo-artifacts derived only from the request, counts
//! every invocation, tracks worker concurrency, and fails on demand. Lives
//! in the library (not behind `cfg(test)`) so integration tests can use it.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use crate::artifact::Artifact;

use super::{CompileRequest, LinkRequest, Toolchain, ToolchainError};

/// A scriptable toolchain double.
#[derive(Default)]
pub struct StubToolchain {
  compile_calls: AtomicUsize,
  link_calls: AtomicUsize,
  active: AtomicUsize,
  max_active: AtomicUsize,
  delay: Option<Duration>,
  failing_sources: Mutex<HashSet<PathBuf>>,
  failing_links: Mutex<HashSet<String>>,
}

/// Decrements the active-call gauge even on early return.
struct ActiveGuard<'a>(&'a StubToolchain);

impl Drop for ActiveGuard<'_> {
  fn drop(&mut self) {
    self.0.active.fetch_sub(1, Ordering::SeqCst);
  }
}

impl StubToolchain {
  pub fn new() -> Self {
    Self::default()
  }

  /// Sleep this long inside every call, to widen concurrency windows.
  pub fn with_delay(mut self, delay: Duration) -> Self {
    self.delay = Some(delay);
    self
  }

  /// Make compiling the given source fail.
  pub fn fail_source(&self, source: impl Into<PathBuf>) {
    self
      .failing_sources
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .insert(source.into());
  }

  /// Make linking the given target fail.
  pub fn fail_link(&self, target: impl Into<String>) {
    self
      .failing_links
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .insert(target.into());
  }

  pub fn compile_calls(&self) -> usize {
    self.compile_calls.load(Ordering::SeqCst)
  }

  pub fn link_calls(&self) -> usize {
    self.link_calls.load(Ordering::SeqCst)
  }

  pub fn total_calls(&self) -> usize {
    self.compile_calls() + self.link_calls()
  }

  /// Highest number of calls that were in flight at once.
  pub fn max_active(&self) -> usize {
    self.max_active.load(Ordering::SeqCst)
  }

  fn enter(&self) -> ActiveGuard<'_> {
    let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
    self.max_active.fetch_max(now, Ordering::SeqCst);
    if let Some(delay) = self.delay {
      std::thread::sleep(delay);
    }
    ActiveGuard(self)
  }
}

impl Toolchain for StubToolchain {
  fn compile(&self, request: &CompileRequest<'_>) -> Result<Artifact, ToolchainError> {
    let _guard = self.enter();
    self.compile_calls.fetch_add(1, Ordering::SeqCst);

    let failing = self
      .failing_sources
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .contains(request.source);
    if failing {
      return Err(ToolchainError::Compile {
        unit: request.source.to_path_buf(),
        message: "scripted compile failure".to_string(),
      });
    }

    let bytes = format!("obj({})\n", request.source.display()).into_bytes();
    Ok(Artifact::new(
      crate::target::TargetKind::CompileUnit,
      request.key.clone(),
      bytes,
    ))
  }

  fn link(&self, request: &LinkRequest<'_>) -> Result<Artifact, ToolchainError> {
    let _guard = self.enter();
    self.link_calls.fetch_add(1, Ordering::SeqCst);

    let failing = self
      .failing_links
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .contains(&request.target.0);
    if failing {
      return Err(ToolchainError::Link {
        output: request.target.clone(),
        message: "scripted link failure".to_string(),
      });
    }

    let mut bytes = format!("{}({})\n", request.kind, request.target).into_bytes();
    for input in request.inputs {
      bytes.extend_from_slice(&input.bytes);
    }
    Ok(Artifact::new(request.kind, request.key.clone(), bytes))
  }
}
