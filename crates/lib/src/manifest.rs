//! Target declaration input.
//!
//! The engine never parses source files or command lines; a surrounding
//! collaborator (a config loader, a test harness) hands it a finished
//! mapping from target identity to kind, sources, dependencies, and
//! configuration. This module is that boundary: a serde model loadable from
//! JSON and convertible into a [`TargetGraph`].

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::graph::{GraphError, TargetGraph};
use crate::target::{Target, TargetConfig, TargetId, TargetKind};

/// Declaration of one target.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetDecl {
  pub kind: TargetKind,

  #[serde(default)]
  pub sources: Vec<PathBuf>,

  /// Names of targets this one depends on, in link order.
  #[serde(default)]
  pub deps: Vec<String>,

  #[serde(flatten)]
  pub config: TargetConfig,
}

/// A full set of target declarations.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Manifest {
  pub targets: BTreeMap<String, TargetDecl>,
}

impl Manifest {
  pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
    serde_json::from_str(text)
  }

  /// Materialize the declarations into a graph: targets first, then edges
  /// in declaration order. Dependency names that match no declared target
  /// surface as `UnknownTarget`.
  pub fn into_graph(self) -> Result<TargetGraph, GraphError> {
    let mut graph = TargetGraph::new();

    for (name, decl) in &self.targets {
      graph.add_target(Target {
        id: TargetId::new(name.clone()),
        kind: decl.kind,
        sources: decl.sources.clone(),
        config: decl.config.clone(),
      })?;
    }

    for (name, decl) in &self.targets {
      let from = TargetId::new(name.clone());
      for dep in &decl.deps {
        graph.add_dependency(&from, &TargetId::new(dep.clone()))?;
      }
    }

    Ok(graph)
  }
}
