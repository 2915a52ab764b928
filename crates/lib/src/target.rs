//! Target identities, kinds, and per-target configuration.
//!
//! A target is a named unit of build work: a compile unit, a static or
//! shared library, or a binary. Targets are owned by a `TargetGraph` for the
//! lifetime of a build session; dependency edges live on the graph, not on
//! the target itself, so the frozen graph is the single source of edge truth.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Unique identity of a target within one graph.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TargetId(pub String);

impl TargetId {
  pub fn new(name: impl Into<String>) -> Self {
    Self(name.into())
  }
}

impl std::fmt::Display for TargetId {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "{}", self.0)
  }
}

impl From<&str> for TargetId {
  fn from(name: &str) -> Self {
    Self(name.to_string())
  }
}

impl From<String> for TargetId {
  fn from(name: String) -> Self {
    Self(name)
  }
}

/// What a target produces when built.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetKind {
  /// One or more sources compiled into a single object.
  CompileUnit,
  /// An archive over its inputs.
  StaticLibrary,
  /// A dynamically loadable library.
  SharedLibrary,
  /// An executable program.
  Binary,
}

impl TargetKind {
  /// Whether building this kind ends in a link step over dependency
  /// artifacts. Compile units only merge their own objects.
  pub fn links_dependencies(&self) -> bool {
    !matches!(self, TargetKind::CompileUnit)
  }
}

impl std::fmt::Display for TargetKind {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    let name = match self {
      TargetKind::CompileUnit => "compile_unit",
      TargetKind::StaticLibrary => "static_library",
      TargetKind::SharedLibrary => "shared_library",
      TargetKind::Binary => "binary",
    };
    write!(f, "{}", name)
  }
}

/// Per-target build configuration.
///
/// Every field is build key material: changing any value changes the key of
/// the target and of everything depending on it. `defines` is a `BTreeMap`
/// so the serialized form is deterministic.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetConfig {
  /// Preprocessor definitions, name to value. An empty value stands for a
  /// bare `-DNAME`.
  #[serde(default)]
  pub defines: BTreeMap<String, String>,

  /// Header search paths. The contents of existing directories are hashed
  /// into the build key.
  #[serde(default)]
  pub include_paths: Vec<PathBuf>,

  /// Extra flags passed to link steps.
  #[serde(default)]
  pub link_flags: Vec<String>,
}

/// A named unit of build work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Target {
  pub id: TargetId,
  pub kind: TargetKind,

  /// Sources compiled as part of this target, in compile order.
  #[serde(default)]
  pub sources: Vec<PathBuf>,

  #[serde(default)]
  pub config: TargetConfig,
}

impl Target {
  pub fn new(id: impl Into<TargetId>, kind: TargetKind) -> Self {
    Self {
      id: id.into(),
      kind,
      sources: Vec::new(),
      config: TargetConfig::default(),
    }
  }

  /// Append a source file, keeping declaration order.
  pub fn with_source(mut self, source: impl Into<PathBuf>) -> Self {
    self.sources.push(source.into());
    self
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn kind_serde_names_are_snake_case() {
    let json = serde_json::to_string(&TargetKind::SharedLibrary).unwrap();
    assert_eq!(json, "\"shared_library\"");

    let kind: TargetKind = serde_json::from_str("\"compile_unit\"").unwrap();
    assert_eq!(kind, TargetKind::CompileUnit);
  }

  #[test]
  fn only_compile_units_skip_dependency_linking() {
    assert!(!TargetKind::CompileUnit.links_dependencies());
    assert!(TargetKind::StaticLibrary.links_dependencies());
    assert!(TargetKind::SharedLibrary.links_dependencies());
    assert!(TargetKind::Binary.links_dependencies());
  }

  #[test]
  fn target_builder_keeps_source_order() {
    let target = Target::new("app", TargetKind::Binary)
      .with_source("src/main.c")
      .with_source("src/extra.c");

    assert_eq!(target.sources.len(), 2);
    assert_eq!(target.sources[0], PathBuf::from("src/main.c"));
  }
}
