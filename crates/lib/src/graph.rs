//! The frozen dependency graph of build targets.
//!
//! A `TargetGraph` owns the targets for one build session and the edges
//! between them. Construction is the only mutable phase: once a session has
//! validated the graph it takes ownership and the graph is read-only for the
//! rest of the run.
//!
//! Edges point from a dependency to its dependents, so topological order
//! visits dependencies first.

use std::collections::{BTreeSet, HashMap, VecDeque};

use petgraph::Direction;
use petgraph::graph::{DiGraph, NodeIndex};
use thiserror::Error;

use crate::session::BuildState;
use crate::target::{Target, TargetId};

/// A path through a dependency cycle; the first target is repeated at the
/// end so the loop reads naturally.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CyclePath(pub Vec<TargetId>);

impl std::fmt::Display for CyclePath {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    let names: Vec<&str> = self.0.iter().map(|id| id.0.as_str()).collect();
    write!(f, "{}", names.join(" -> "))
  }
}

/// Errors raised while constructing or validating a graph.
///
/// All of these are fatal to a session before any execution begins.
#[derive(Debug, Error)]
pub enum GraphError {
  #[error("duplicate target: {0}")]
  DuplicateTarget(TargetId),

  #[error("unknown target: {0}")]
  UnknownTarget(TargetId),

  #[error("dependency cycle detected: {0}")]
  CycleDetected(CyclePath),
}

/// In-memory representation of targets and their dependency edges.
#[derive(Debug, Default)]
pub struct TargetGraph {
  graph: DiGraph<TargetId, ()>,
  nodes: HashMap<TargetId, NodeIndex>,
  targets: HashMap<TargetId, Target>,
  /// Direct dependencies per target, in declaration order, deduplicated.
  deps: HashMap<TargetId, Vec<TargetId>>,
}

impl TargetGraph {
  pub fn new() -> Self {
    Self::default()
  }

  /// Register a target. Fails if the identity is already taken.
  pub fn add_target(&mut self, target: Target) -> Result<(), GraphError> {
    if self.nodes.contains_key(&target.id) {
      return Err(GraphError::DuplicateTarget(target.id.clone()));
    }

    let id = target.id.clone();
    let idx = self.graph.add_node(id.clone());
    self.nodes.insert(id.clone(), idx);
    self.deps.insert(id.clone(), Vec::new());
    self.targets.insert(id, target);
    Ok(())
  }

  /// Declare that `from` depends on `to`. Both sides must already be
  /// registered; exact duplicates are ignored.
  pub fn add_dependency(&mut self, from: &TargetId, to: &TargetId) -> Result<(), GraphError> {
    let &from_idx = self
      .nodes
      .get(from)
      .ok_or_else(|| GraphError::UnknownTarget(from.clone()))?;
    let &to_idx = self
      .nodes
      .get(to)
      .ok_or_else(|| GraphError::UnknownTarget(to.clone()))?;

    let entry = self.deps.entry(from.clone()).or_default();
    if entry.contains(to) {
      return Ok(());
    }
    entry.push(to.clone());

    // Edge from dependency to dependent.
    self.graph.add_edge(to_idx, from_idx, ());
    Ok(())
  }

  /// Depth-first cycle check, run once before any execution begins.
  ///
  /// On failure the error names a path through the cycle.
  pub fn validate(&self) -> Result<(), GraphError> {
    #[derive(Clone, Copy, PartialEq)]
    enum Color {
      White,
      Gray,
      Black,
    }

    let mut colors: HashMap<NodeIndex, Color> =
      self.graph.node_indices().map(|i| (i, Color::White)).collect();

    fn visit(
      graph: &DiGraph<TargetId, ()>,
      node: NodeIndex,
      colors: &mut HashMap<NodeIndex, Color>,
      path: &mut Vec<NodeIndex>,
    ) -> Option<Vec<NodeIndex>> {
      colors.insert(node, Color::Gray);
      path.push(node);

      for next in graph.neighbors_directed(node, Direction::Outgoing) {
        match colors.get(&next).copied().unwrap_or(Color::White) {
          Color::Gray => {
            // Back edge: the cycle is the path suffix from `next` onward.
            let start = path.iter().position(|&n| n == next).unwrap_or(0);
            let mut cycle: Vec<NodeIndex> = path[start..].to_vec();
            cycle.push(next);
            return Some(cycle);
          }
          Color::White => {
            if let Some(cycle) = visit(graph, next, colors, path) {
              return Some(cycle);
            }
          }
          Color::Black => {}
        }
      }

      path.pop();
      colors.insert(node, Color::Black);
      None
    }

    for start in self.graph.node_indices() {
      if colors.get(&start).copied() != Some(Color::White) {
        continue;
      }
      let mut path = Vec::new();
      if let Some(cycle) = visit(&self.graph, start, &mut colors, &mut path) {
        let named = cycle.into_iter().map(|i| self.graph[i].clone()).collect();
        return Err(GraphError::CycleDetected(CyclePath(named)));
      }
    }

    Ok(())
  }

  pub fn target(&self, id: &TargetId) -> Option<&Target> {
    self.targets.get(id)
  }

  pub fn contains(&self, id: &TargetId) -> bool {
    self.targets.contains_key(id)
  }

  pub fn len(&self) -> usize {
    self.targets.len()
  }

  pub fn is_empty(&self) -> bool {
    self.targets.is_empty()
  }

  pub fn targets(&self) -> impl Iterator<Item = &Target> {
    self.targets.values()
  }

  /// Direct dependencies of a target, in declaration order.
  pub fn dependencies(&self, id: &TargetId) -> &[TargetId] {
    self.deps.get(id).map(Vec::as_slice).unwrap_or(&[])
  }

  /// Direct dependents of a target.
  pub fn dependents(&self, id: &TargetId) -> Vec<TargetId> {
    let Some(&idx) = self.nodes.get(id) else {
      return Vec::new();
    };

    self
      .graph
      .neighbors_directed(idx, Direction::Outgoing)
      .map(|i| self.graph[i].clone())
      .collect()
  }

  /// The transitive dependency closure of the given roots: the work set of
  /// a session requesting them.
  pub fn transitive_closure(
    &self,
    roots: impl IntoIterator<Item = TargetId>,
  ) -> Result<BTreeSet<TargetId>, GraphError> {
    let mut closure = BTreeSet::new();
    let mut queue = VecDeque::new();

    for root in roots {
      if !self.contains(&root) {
        return Err(GraphError::UnknownTarget(root));
      }
      if closure.insert(root.clone()) {
        queue.push_back(root);
      }
    }

    while let Some(id) = queue.pop_front() {
      for dep in self.dependencies(&id) {
        if closure.insert(dep.clone()) {
          queue.push_back(dep.clone());
        }
      }
    }

    Ok(closure)
  }

  /// Order a subset of targets so every dependency precedes its dependents.
  ///
  /// The graph must have passed `validate()`.
  pub fn topo_order(&self, set: &BTreeSet<TargetId>) -> Vec<TargetId> {
    let mut pending: HashMap<TargetId, usize> = set
      .iter()
      .map(|id| {
        let n = self
          .dependencies(id)
          .iter()
          .filter(|d| set.contains(*d))
          .count();
        (id.clone(), n)
      })
      .collect();

    let mut order = Vec::with_capacity(set.len());

    while !pending.is_empty() {
      let mut ready: Vec<TargetId> = pending
        .iter()
        .filter(|(_, n)| **n == 0)
        .map(|(id, _)| id.clone())
        .collect();
      ready.sort();

      if ready.is_empty() {
        // Unreachable on a validated graph; bail out rather than spin.
        break;
      }

      for id in ready {
        pending.remove(&id);

        for dependent in self.dependents(&id) {
          if let Some(n) = pending.get_mut(&dependent) {
            *n = n.saturating_sub(1);
          }
        }

        order.push(id);
      }
    }

    order
  }

  /// Targets ready to run: still Pending, with every dependency Done.
  ///
  /// Consulted by the scheduler each round; only targets present in
  /// `states` (the session work set) are considered. The result is sorted
  /// so dispatch order is deterministic.
  pub fn ready_targets(&self, states: &HashMap<TargetId, BuildState>) -> Vec<TargetId> {
    let mut ready: Vec<TargetId> = states
      .iter()
      .filter(|(id, state)| {
        **state == BuildState::Pending
          && self
            .dependencies(*id)
            .iter()
            .all(|dep| states.get(dep).copied() == Some(BuildState::Done))
      })
      .map(|(id, _)| id.clone())
      .collect();

    ready.sort();
    ready
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::target::TargetKind;

  fn unit(name: &str) -> Target {
    Target::new(name, TargetKind::CompileUnit)
  }

  fn graph_of(names: &[&str], edges: &[(&str, &str)]) -> TargetGraph {
    let mut graph = TargetGraph::new();
    for name in names {
      graph.add_target(unit(name)).unwrap();
    }
    for (from, to) in edges {
      graph
        .add_dependency(&TargetId::from(*from), &TargetId::from(*to))
        .unwrap();
    }
    graph
  }

  #[test]
  fn duplicate_target_is_rejected() {
    let mut graph = TargetGraph::new();
    graph.add_target(unit("add")).unwrap();

    let err = graph.add_target(unit("add")).unwrap_err();
    assert!(matches!(err, GraphError::DuplicateTarget(id) if id.0 == "add"));
  }

  #[test]
  fn dependency_on_unknown_target_is_rejected() {
    let mut graph = TargetGraph::new();
    graph.add_target(unit("app")).unwrap();

    let err = graph
      .add_dependency(&TargetId::from("app"), &TargetId::from("ghost"))
      .unwrap_err();
    assert!(matches!(err, GraphError::UnknownTarget(id) if id.0 == "ghost"));
  }

  #[test]
  fn duplicate_edges_collapse() {
    let mut graph = graph_of(&["app", "mathlib"], &[("app", "mathlib")]);
    graph
      .add_dependency(&TargetId::from("app"), &TargetId::from("mathlib"))
      .unwrap();

    assert_eq!(graph.dependencies(&TargetId::from("app")).len(), 1);
  }

  #[test]
  fn diamond_validates() {
    let graph = graph_of(
      &["a", "b", "c", "d"],
      &[("b", "a"), ("c", "a"), ("d", "b"), ("d", "c")],
    );
    assert!(graph.validate().is_ok());
  }

  #[test]
  fn cycle_is_detected_and_named() {
    let graph = graph_of(&["a", "b", "c"], &[("a", "b"), ("b", "c"), ("c", "a")]);

    let err = graph.validate().unwrap_err();
    let GraphError::CycleDetected(path) = err else {
      panic!("expected a cycle");
    };

    // First and last entries close the loop; every member participates.
    assert_eq!(path.0.first(), path.0.last());
    assert_eq!(path.0.len(), 4);
    let rendered = path.to_string();
    for name in ["a", "b", "c"] {
      assert!(rendered.contains(name), "cycle path missing {name}: {rendered}");
    }
  }

  #[test]
  fn self_cycle_is_detected() {
    let graph = graph_of(&["a"], &[("a", "a")]);
    assert!(matches!(graph.validate(), Err(GraphError::CycleDetected(_))));
  }

  #[test]
  fn closure_walks_transitively() {
    let graph = graph_of(
      &["app", "mathlib", "stringlib", "other"],
      &[("app", "mathlib"), ("mathlib", "stringlib")],
    );

    let closure = graph.transitive_closure([TargetId::from("app")]).unwrap();
    assert_eq!(closure.len(), 3);
    assert!(!closure.contains(&TargetId::from("other")));
  }

  #[test]
  fn closure_of_unknown_root_fails() {
    let graph = graph_of(&["a"], &[]);
    let err = graph.transitive_closure([TargetId::from("nope")]).unwrap_err();
    assert!(matches!(err, GraphError::UnknownTarget(_)));
  }

  #[test]
  fn topo_order_puts_dependencies_first() {
    let graph = graph_of(
      &["app", "mathlib", "stringlib"],
      &[("app", "mathlib"), ("mathlib", "stringlib")],
    );

    let set = graph.transitive_closure([TargetId::from("app")]).unwrap();
    let order = graph.topo_order(&set);

    let pos =
      |name: &str| order.iter().position(|id| id.0 == name).unwrap();
    assert!(pos("stringlib") < pos("mathlib"));
    assert!(pos("mathlib") < pos("app"));
  }

  #[test]
  fn ready_targets_follow_completion() {
    let graph = graph_of(&["app", "add", "subtract"], &[("app", "add"), ("app", "subtract")]);

    let mut states: HashMap<TargetId, BuildState> = [
      (TargetId::from("app"), BuildState::Pending),
      (TargetId::from("add"), BuildState::Pending),
      (TargetId::from("subtract"), BuildState::Pending),
    ]
    .into_iter()
    .collect();

    // Leaves are ready immediately; the binary is not.
    let ready = graph.ready_targets(&states);
    assert_eq!(ready, vec![TargetId::from("add"), TargetId::from("subtract")]);

    states.insert(TargetId::from("add"), BuildState::Done);
    assert_eq!(graph.ready_targets(&states), vec![TargetId::from("subtract")]);

    states.insert(TargetId::from("subtract"), BuildState::Done);
    assert_eq!(graph.ready_targets(&states), vec![TargetId::from("app")]);
  }
}
