//! Build sessions.
//!
//! A `BuildSession` owns one invocation's target graph, worker pool, and
//! final status. Callers construct the graph, hand it to a session together
//! with an artifact cache and a toolchain, submit the requested top-level
//! targets, and receive a result summary. No process-wide state survives a
//! session; rebuild economics come entirely from sharing the cache between
//! sessions.

mod executor;
mod flight;
mod state;

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use thiserror::Error;
use tracing::info;

use crate::artifact::Artifact;
use crate::cache::{ArtifactCache, CacheError};
use crate::graph::{GraphError, TargetGraph};
use crate::key::{BuildKey, KeyError, compute_keys};
use crate::target::TargetId;
use crate::toolchain::{Toolchain, ToolchainError};

pub use state::BuildState;

/// Errors fatal to a session before any execution begins.
#[derive(Debug, Error)]
pub enum SessionError {
  #[error(transparent)]
  Graph(#[from] GraphError),

  #[error(transparent)]
  Key(#[from] KeyError),
}

/// A per-target execution failure. Non-fatal to the session: independent
/// branches of the graph keep building around it.
#[derive(Debug, Error)]
pub enum BuildError {
  #[error(transparent)]
  Toolchain(#[from] ToolchainError),

  #[error("failed to publish artifact under {key}: {source}")]
  CachePublish {
    key: BuildKey,
    #[source]
    source: CacheError,
  },
}

impl BuildError {
  /// Whether the toolchain rejected a compile step.
  pub fn is_compile_error(&self) -> bool {
    matches!(self, BuildError::Toolchain(ToolchainError::Compile { .. }))
  }

  /// Whether the toolchain rejected a link step.
  pub fn is_link_error(&self) -> bool {
    matches!(self, BuildError::Toolchain(ToolchainError::Link { .. }))
  }
}

/// Cooperative cancellation signal for one session.
///
/// Cancelling prevents any new dispatch; already running toolchain calls
/// finish normally so no partial artifact is ever observed. Targets that
/// never started report Blocked.
#[derive(Clone, Debug, Default)]
pub struct CancelToken {
  flag: Arc<AtomicBool>,
}

impl CancelToken {
  pub fn cancel(&self) {
    self.flag.store(true, Ordering::SeqCst);
  }

  pub fn is_cancelled(&self) -> bool {
    self.flag.load(Ordering::SeqCst)
  }
}

/// Tunables for one session.
#[derive(Debug, Clone)]
pub struct SessionOptions {
  /// Maximum number of targets building at once. Clamped to at least 1.
  pub concurrency: usize,
}

impl Default for SessionOptions {
  fn default() -> Self {
    Self {
      concurrency: available_parallelism(),
    }
  }
}

impl SessionOptions {
  pub fn with_concurrency(concurrency: usize) -> Self {
    Self { concurrency }
  }
}

fn available_parallelism() -> usize {
  std::thread::available_parallelism().map(|p| p.get()).unwrap_or(4)
}

/// Overall outcome of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
  /// The full requested closure is Done.
  Success,
  /// At least one target failed; independent successes are still reported.
  Failed,
  /// The session was cancelled before the closure completed.
  Cancelled,
}

/// A root failure, attributed to the target that caused it.
#[derive(Debug)]
pub struct TargetFailure {
  pub target: TargetId,
  /// Shared with every requester that observed this outcome.
  pub error: Arc<BuildError>,
}

/// Final per-target report.
#[derive(Debug, Clone)]
pub struct TargetReport {
  pub state: BuildState,
  pub key: BuildKey,
  /// Present exactly when the target is Done.
  pub artifact: Option<Arc<Artifact>>,
  /// Root failures that blocked this target; empty unless Blocked.
  pub blocked_on: Vec<TargetId>,
}

/// Counters for one session.
#[derive(Debug, Clone, Copy, Default)]
pub struct SessionStats {
  /// Targets settled by the artifact cache without a toolchain call.
  pub cache_hits: usize,
  /// Targets dispatched to the toolchain.
  pub executed: usize,
}

/// Result summary handed back to the caller.
#[derive(Debug)]
pub struct SessionResult {
  pub status: SessionStatus,
  pub targets: BTreeMap<TargetId, TargetReport>,
  /// Root failures only; blocked targets reference these by identity.
  pub errors: Vec<TargetFailure>,
  pub stats: SessionStats,
}

impl SessionResult {
  pub fn is_success(&self) -> bool {
    self.status == SessionStatus::Success
  }

  pub fn state(&self, id: &TargetId) -> Option<BuildState> {
    self.targets.get(id).map(|report| report.state)
  }

  pub fn artifact(&self, id: &TargetId) -> Option<&Arc<Artifact>> {
    self.targets.get(id).and_then(|report| report.artifact.as_ref())
  }
}

/// One invocation's graph instance, worker pool, and final status.
pub struct BuildSession {
  graph: TargetGraph,
  cache: Arc<dyn ArtifactCache>,
  toolchain: Arc<dyn Toolchain>,
  options: SessionOptions,
  cancel: CancelToken,
}

impl BuildSession {
  /// Take ownership of a graph for one build.
  ///
  /// The acyclicity check runs here, once, before any work; a cyclic graph
  /// never reaches execution. After this the graph is frozen.
  pub fn new(
    graph: TargetGraph,
    cache: Arc<dyn ArtifactCache>,
    toolchain: Arc<dyn Toolchain>,
    options: SessionOptions,
  ) -> Result<Self, SessionError> {
    graph.validate()?;

    Ok(Self {
      graph,
      cache,
      toolchain,
      options,
      cancel: CancelToken::default(),
    })
  }

  /// A handle for cancelling this session from elsewhere.
  pub fn cancel_token(&self) -> CancelToken {
    self.cancel.clone()
  }

  pub fn graph(&self) -> &TargetGraph {
    &self.graph
  }

  /// Build the requested targets and everything they depend on.
  ///
  /// Duplicate requests collapse; requesting an unknown target fails before
  /// any execution. Execution-time failures do not abort the session: they
  /// are aggregated into the returned summary.
  pub async fn run(
    self,
    requested: impl IntoIterator<Item = TargetId>,
  ) -> Result<SessionResult, SessionError> {
    let requested: BTreeSet<TargetId> = requested.into_iter().collect();
    let work_set = self.graph.transitive_closure(requested.iter().cloned())?;
    let keys = compute_keys(&self.graph, &work_set)?;

    info!(
      requested = requested.len(),
      work_set = work_set.len(),
      "session resolved"
    );

    let driver = executor::Driver {
      graph: &self.graph,
      keys: &keys,
      cache: self.cache.clone(),
      toolchain: self.toolchain.clone(),
      concurrency: self.options.concurrency.max(1),
      cancel: self.cancel.clone(),
    };

    let outcome = driver.drive(&work_set).await;

    let all_done = outcome
      .states
      .values()
      .all(|state| *state == BuildState::Done);
    let status = if all_done {
      SessionStatus::Success
    } else if outcome.failures.is_empty() && self.cancel.is_cancelled() {
      SessionStatus::Cancelled
    } else {
      SessionStatus::Failed
    };

    let mut targets = BTreeMap::new();
    for id in &work_set {
      let state = outcome
        .states
        .get(id)
        .copied()
        .unwrap_or(BuildState::Blocked);
      let Some(key) = keys.get(id) else {
        continue;
      };

      targets.insert(
        id.clone(),
        TargetReport {
          state,
          key: key.clone(),
          artifact: outcome.artifacts.get(id).cloned(),
          blocked_on: outcome
            .blocked_on
            .get(id)
            .map(|roots| roots.iter().cloned().collect())
            .unwrap_or_default(),
        },
      );
    }

    info!(status = ?status, errors = outcome.failures.len(), "session finished");

    Ok(SessionResult {
      status,
      targets,
      errors: outcome.failures,
      stats: outcome.stats,
    })
  }
}
