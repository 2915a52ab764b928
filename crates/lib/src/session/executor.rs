//! The scheduler: topological, concurrency-bounded, singleflight dispatch.
//!
//! An event-driven driver walks the frozen graph: each round it claims every
//! target whose dependencies are Done, checks the artifact cache by build
//! key (a hit settles the target without touching the toolchain), and
//! dispatches cache misses to a bounded pool of workers. Completions feed
//! the next round. A failure blocks its transitive dependents and the rest
//! of the graph keeps building; the session aggregates everything at the
//! end instead of failing fast.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::artifact::Artifact;
use crate::cache::{ArtifactCache, CacheError};
use crate::graph::TargetGraph;
use crate::key::BuildKey;
use crate::target::{Target, TargetId, TargetKind};
use crate::toolchain::{CompileRequest, LinkRequest, Toolchain, ToolchainError};

use super::flight::{Claim, FlightBoard, FlightOutcome};
use super::state::{BuildState, StateTable};
use super::{BuildError, CancelToken, SessionStats, TargetFailure};

/// Everything the driver hands back to the session.
pub(crate) struct DriveOutcome {
  pub states: HashMap<TargetId, BuildState>,
  pub blocked_on: BTreeMap<TargetId, BTreeSet<TargetId>>,
  pub artifacts: HashMap<TargetId, Arc<Artifact>>,
  pub failures: Vec<TargetFailure>,
  pub stats: SessionStats,
}

/// One session's scheduler over a frozen graph.
pub(crate) struct Driver<'a> {
  pub graph: &'a TargetGraph,
  pub keys: &'a HashMap<TargetId, BuildKey>,
  pub cache: Arc<dyn ArtifactCache>,
  pub toolchain: Arc<dyn Toolchain>,
  pub concurrency: usize,
  pub cancel: CancelToken,
}

impl Driver<'_> {
  pub async fn drive(self, work_set: &BTreeSet<TargetId>) -> DriveOutcome {
    let mut table = StateTable::new(work_set);
    let mut artifacts: HashMap<TargetId, Arc<Artifact>> = HashMap::new();
    let mut failures: Vec<TargetFailure> = Vec::new();
    let mut stats = SessionStats::default();

    let flights = FlightBoard::default();
    let semaphore = Arc::new(Semaphore::new(self.concurrency));
    let mut workers: JoinSet<(TargetId, FlightOutcome)> = JoinSet::new();

    info!(
      targets = work_set.len(),
      concurrency = self.concurrency,
      "starting session execution"
    );

    loop {
      if !self.cancel.is_cancelled() {
        self.dispatch_ready(
          &mut table,
          &mut artifacts,
          &mut stats,
          &flights,
          &semaphore,
          &mut workers,
        );
      }

      // Nothing running and nothing dispatchable: the session is settled
      // (or cancellation stopped new dispatch).
      let Some(joined) = workers.join_next().await else {
        break;
      };

      let (id, outcome) = match joined {
        Ok(pair) => pair,
        Err(join_error) => {
          // The worker wrapper itself never panics; nothing to attribute.
          error!(error = %join_error, "build worker panicked");
          continue;
        }
      };

      // A follower may replay an outcome the owner already delivered;
      // the first one stands.
      if table.get(&id).is_some_and(|state| state.is_terminal()) {
        continue;
      }

      match outcome {
        Ok(artifact) => {
          info!(target = %id, size = artifact.size(), "target built");
          table.mark_done(&id);
          artifacts.insert(id, artifact);
        }
        Err(error) => {
          error!(target = %id, error = %error, "target failed");
          let newly_blocked = table.mark_failed(&id, self.graph);
          for blocked in &newly_blocked {
            warn!(target = %blocked, root = %id, "blocked by failed dependency");
          }
          failures.push(TargetFailure {
            target: id,
            error,
          });
        }
      }
    }

    if self.cancel.is_cancelled() {
      let blocked = table.block_remaining();
      if !blocked.is_empty() {
        warn!(count = blocked.len(), "cancellation blocked remaining targets");
      }
    }

    debug_assert!(table.is_settled());

    let (states, blocked_on) = table.into_parts();
    info!(
      done = states.values().filter(|s| **s == BuildState::Done).count(),
      failed = failures.len(),
      cache_hits = stats.cache_hits,
      executed = stats.executed,
      "session execution complete"
    );

    DriveOutcome {
      states,
      blocked_on,
      artifacts,
      failures,
      stats,
    }
  }

  /// Claim and dispatch every currently ready target.
  ///
  /// Loops because a cache hit settles a target immediately, which can make
  /// its dependents ready within the same round.
  fn dispatch_ready(
    &self,
    table: &mut StateTable,
    artifacts: &mut HashMap<TargetId, Arc<Artifact>>,
    stats: &mut SessionStats,
    flights: &FlightBoard,
    semaphore: &Arc<Semaphore>,
    workers: &mut JoinSet<(TargetId, FlightOutcome)>,
  ) {
    loop {
      let ready = self.graph.ready_targets(table.states());
      if ready.is_empty() {
        return;
      }

      let mut settled_any = false;

      for id in ready {
        table.mark_ready(&id);

        let Some(key) = self.keys.get(&id) else {
          continue;
        };
        let Some(target) = self.graph.target(&id) else {
          continue;
        };

        match self.cache.lookup(key) {
          Ok(Some(artifact)) => {
            debug!(target = %id, key = %key, "cache hit");
            stats.cache_hits += 1;
            table.mark_done(&id);
            artifacts.insert(id.clone(), artifact);
            settled_any = true;
            continue;
          }
          Ok(None) => {}
          Err(error) => {
            warn!(target = %id, error = %error, "cache lookup failed, rebuilding");
          }
        }

        let handle = match flights.claim(&id) {
          Claim::Owner(handle) => handle,
          Claim::Follower(rx) => {
            // An earlier claim owns this build; adopt its outcome when it
            // lands instead of running the toolchain a second time.
            let follower_id = id.clone();
            workers.spawn(async move {
              let outcome = FlightBoard::wait(rx).await.unwrap_or_else(|| {
                Err(Arc::new(BuildError::Toolchain(ToolchainError::Io {
                  message: "flight abandoned without an outcome".to_string(),
                })))
              });
              (follower_id, outcome)
            });
            continue;
          }
        };

        table.mark_running(&id);
        stats.executed += 1;
        debug!(target = %id, key = %key, "dispatching");

        let dep_artifacts: Vec<Arc<Artifact>> = self
          .graph
          .dependencies(&id)
          .iter()
          .filter_map(|dep| artifacts.get(dep).cloned())
          .collect();

        let target = target.clone();
        let key = key.clone();
        let cache = self.cache.clone();
        let toolchain = self.toolchain.clone();
        let semaphore = semaphore.clone();

        workers.spawn(async move {
          let _permit = semaphore.acquire().await.unwrap();

          let id = target.id.clone();
          let built = tokio::task::spawn_blocking(move || {
            build_target(&target, &key, &dep_artifacts, toolchain.as_ref(), cache.as_ref())
          })
          .await;

          let outcome: FlightOutcome = match built {
            Ok(Ok(artifact)) => Ok(artifact),
            Ok(Err(error)) => Err(Arc::new(error)),
            Err(join_error) => Err(Arc::new(BuildError::Toolchain(ToolchainError::Io {
              message: format!("build worker panicked: {join_error}"),
            }))),
          };

          handle.fulfill(outcome.clone());
          (id, outcome)
        });
      }

      if !settled_any {
        return;
      }
    }
  }
}

/// Build one target inside a worker.
///
/// Compiles the target's own sources in order, then runs the link step over
/// those objects and the dependency artifacts; the two phases of one target
/// never overlap. The produced artifact is published before the target is
/// reported Done, so a Done target is always reproducible from the cache.
fn build_target(
  target: &Target,
  key: &BuildKey,
  deps: &[Arc<Artifact>],
  toolchain: &dyn Toolchain,
  cache: &dyn ArtifactCache,
) -> Result<Arc<Artifact>, BuildError> {
  let mut objects = Vec::with_capacity(target.sources.len());
  for source in &target.sources {
    let request = CompileRequest {
      target: &target.id,
      source,
      config: &target.config,
      key,
    };
    objects.push(toolchain.compile(&request)?);
  }

  let artifact = if target.kind == TargetKind::CompileUnit && objects.len() == 1 {
    // A single-source compile unit is its own object; nothing to merge.
    objects.swap_remove(0)
  } else {
    let mut inputs: Vec<Arc<Artifact>> = objects.into_iter().map(Arc::new).collect();
    if target.kind.links_dependencies() {
      inputs.extend(deps.iter().cloned());
    }

    let request = LinkRequest {
      target: &target.id,
      kind: target.kind,
      inputs: &inputs,
      config: &target.config,
      key,
    };
    toolchain.link(&request)?
  };

  publish_with_retry(cache, key, artifact)
}

/// Publish an artifact, retrying a failed write once before giving up.
fn publish_with_retry(
  cache: &dyn ArtifactCache,
  key: &BuildKey,
  artifact: Artifact,
) -> Result<Arc<Artifact>, BuildError> {
  match cache.publish(key, artifact.clone()) {
    Ok(published) => Ok(published),
    Err(first) => {
      warn!(key = %key, error = %first, "publish failed, retrying once");
      cache
        .publish(key, artifact)
        .map_err(|source: CacheError| BuildError::CachePublish {
          key: key.clone(),
          source,
        })
    }
  }
}
