//! Per-target build state for one session.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};

use crate::graph::TargetGraph;
use crate::target::TargetId;

/// Lifecycle of a target within a session.
///
/// `Pending -> Ready` when every dependency is Done, `Ready -> Running` when
/// a worker claims the target, `Running -> Done | Failed` on completion.
/// `Blocked` is derived: anything depending on a Failed or Blocked target
/// becomes Blocked, never silently skipped. Done is permanent for the
/// session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BuildState {
  Pending,
  Ready,
  Running,
  Done,
  Failed,
  Blocked,
}

impl BuildState {
  /// Whether the target will not change state again this session.
  pub fn is_terminal(&self) -> bool {
    matches!(self, BuildState::Done | BuildState::Failed | BuildState::Blocked)
  }
}

impl std::fmt::Display for BuildState {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    let name = match self {
      BuildState::Pending => "pending",
      BuildState::Ready => "ready",
      BuildState::Running => "running",
      BuildState::Done => "done",
      BuildState::Failed => "failed",
      BuildState::Blocked => "blocked",
    };
    write!(f, "{}", name)
  }
}

/// State bookkeeping for one session's work set.
///
/// Owns the state of every target in the work set plus the root-failure
/// attribution for Blocked targets.
pub(crate) struct StateTable {
  states: HashMap<TargetId, BuildState>,
  blocked_on: BTreeMap<TargetId, BTreeSet<TargetId>>,
}

impl StateTable {
  pub fn new(work_set: &BTreeSet<TargetId>) -> Self {
    Self {
      states: work_set
        .iter()
        .map(|id| (id.clone(), BuildState::Pending))
        .collect(),
      blocked_on: BTreeMap::new(),
    }
  }

  pub fn states(&self) -> &HashMap<TargetId, BuildState> {
    &self.states
  }

  pub fn get(&self, id: &TargetId) -> Option<BuildState> {
    self.states.get(id).copied()
  }

  pub fn mark_ready(&mut self, id: &TargetId) {
    self.states.insert(id.clone(), BuildState::Ready);
  }

  pub fn mark_running(&mut self, id: &TargetId) {
    self.states.insert(id.clone(), BuildState::Running);
  }

  pub fn mark_done(&mut self, id: &TargetId) {
    self.states.insert(id.clone(), BuildState::Done);
  }

  /// Record a failure and block every transitive dependent still in play.
  ///
  /// Returns the targets newly marked Blocked. Each blocked target is
  /// attributed to `id` as a root failure; a target blocked by several
  /// failures accumulates all of their roots.
  pub fn mark_failed(&mut self, id: &TargetId, graph: &TargetGraph) -> Vec<TargetId> {
    self.states.insert(id.clone(), BuildState::Failed);

    let mut newly_blocked = Vec::new();
    let mut queue: VecDeque<TargetId> = VecDeque::from([id.clone()]);
    let mut seen: BTreeSet<TargetId> = BTreeSet::new();

    while let Some(current) = queue.pop_front() {
      for dependent in graph.dependents(&current) {
        if !seen.insert(dependent.clone()) {
          continue;
        }
        // Only targets in this session's work set are tracked.
        let Some(state) = self.states.get(&dependent).copied() else {
          continue;
        };

        match state {
          BuildState::Pending | BuildState::Ready => {
            self.states.insert(dependent.clone(), BuildState::Blocked);
            newly_blocked.push(dependent.clone());
          }
          BuildState::Blocked => {}
          // Running, Done and Failed dependents are impossible here: a
          // dependent never starts before all of its dependencies are Done.
          _ => continue,
        }

        self
          .blocked_on
          .entry(dependent.clone())
          .or_default()
          .insert(id.clone());
        queue.push_back(dependent);
      }
    }

    newly_blocked
  }

  /// Block everything that has not started yet. Used after cancellation.
  pub fn block_remaining(&mut self) -> Vec<TargetId> {
    let mut blocked = Vec::new();
    for (id, state) in self.states.iter_mut() {
      if matches!(state, BuildState::Pending | BuildState::Ready) {
        *state = BuildState::Blocked;
        blocked.push(id.clone());
      }
    }
    blocked.sort();
    blocked
  }

  /// True once nothing is Pending, Ready, or Running.
  pub fn is_settled(&self) -> bool {
    self.states.values().all(BuildState::is_terminal)
  }

  pub fn into_parts(
    self,
  ) -> (
    HashMap<TargetId, BuildState>,
    BTreeMap<TargetId, BTreeSet<TargetId>>,
  ) {
    (self.states, self.blocked_on)
  }
}
