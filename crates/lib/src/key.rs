//! Build key derivation.
//!
//! A build key is the deterministic fingerprint of everything that can
//! change a target's output: the content hashes of its sources, the content
//! of its include trees, its configuration, and the keys of its dependencies
//! (recursively). Wall-clock time never participates, and path strings only
//! appear as part of the configuration, next to the content hashes of what
//! they point at.
//!
//! Two targets with identical build keys are interchangeable; this is what
//! makes caching and cross-session reuse correct.

use std::collections::{BTreeSet, HashMap};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::debug;

use crate::consts::BUILD_KEY_PREFIX_LEN;
use crate::graph::TargetGraph;
use crate::target::{TargetConfig, TargetId, TargetKind};
use crate::util::hash::{ContentHash, HashError, hash_directory, hash_file};

/// Deterministic fingerprint of a target's inputs and resolved dependency
/// outputs, as a truncated lowercase-hex SHA-256.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BuildKey(pub String);

impl std::fmt::Display for BuildKey {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "{}", self.0)
  }
}

/// Errors while deriving build keys.
///
/// Key derivation runs before any execution, so these abort the session.
#[derive(Debug, Error)]
pub enum KeyError {
  #[error(transparent)]
  Hash(#[from] HashError),

  #[error("failed to canonicalize key material for {target}: {source}")]
  Canonicalize {
    target: TargetId,
    #[source]
    source: serde_json::Error,
  },
}

/// The canonical form hashed into a build key.
///
/// Serialized as JSON; every collection is ordered, so the serialization is
/// stable for equal inputs.
#[derive(Serialize)]
struct KeyMaterial<'a> {
  kind: TargetKind,
  sources: Vec<ContentHash>,
  includes: Vec<ContentHash>,
  config: &'a TargetConfig,
  deps: Vec<&'a BuildKey>,
}

/// Derive build keys for every target in `set`, dependencies first.
///
/// `set` must be closed under dependencies (a session work set); the graph
/// must have passed `validate()`.
pub fn compute_keys(
  graph: &TargetGraph,
  set: &BTreeSet<TargetId>,
) -> Result<HashMap<TargetId, BuildKey>, KeyError> {
  let mut keys: HashMap<TargetId, BuildKey> = HashMap::with_capacity(set.len());

  for id in graph.topo_order(set) {
    let Some(target) = graph.target(&id) else {
      continue;
    };

    let mut sources = Vec::with_capacity(target.sources.len());
    for source in &target.sources {
      sources.push(hash_file(source)?);
    }

    let mut includes = Vec::with_capacity(target.config.include_paths.len());
    for path in &target.config.include_paths {
      // A search path that does not exist yet contributes nothing; creating
      // it later changes the key, which forces the rebuild it should.
      if path.is_dir() {
        includes.push(hash_directory(path)?);
      }
    }

    let mut deps = Vec::new();
    for dep in graph.dependencies(&id) {
      if let Some(key) = keys.get(dep) {
        deps.push(key);
      }
    }

    let material = KeyMaterial {
      kind: target.kind,
      sources,
      includes,
      config: &target.config,
      deps,
    };

    let canonical = serde_json::to_string(&material).map_err(|e| KeyError::Canonicalize {
      target: id.clone(),
      source: e,
    })?;

    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    let full = format!("{:x}", hasher.finalize());
    let key = BuildKey(full[..BUILD_KEY_PREFIX_LEN].to_string());

    debug!(target = %id, key = %key, "derived build key");
    keys.insert(id, key);
  }

  Ok(keys)
}

#[cfg(test)]
mod tests {
  use std::fs;

  use tempfile::TempDir;

  use super::*;
  use crate::target::{Target, TargetKind};

  struct Fixture {
    temp: TempDir,
    graph: TargetGraph,
  }

  /// app (binary) -> mathlib (compile unit), each with one real source.
  fn fixture() -> Fixture {
    let temp = TempDir::new().unwrap();
    let mathlib_src = temp.path().join("multiply.c");
    let app_src = temp.path().join("main.c");
    fs::write(&mathlib_src, "int multiply(int a, int b) { return a * b; }").unwrap();
    fs::write(&app_src, "int main(void) { return 0; }").unwrap();

    let mut graph = TargetGraph::new();
    graph
      .add_target(Target::new("mathlib", TargetKind::CompileUnit).with_source(&mathlib_src))
      .unwrap();
    graph
      .add_target(Target::new("app", TargetKind::Binary).with_source(&app_src))
      .unwrap();
    graph
      .add_dependency(&TargetId::from("app"), &TargetId::from("mathlib"))
      .unwrap();

    Fixture { temp, graph }
  }

  fn all(graph: &TargetGraph) -> BTreeSet<TargetId> {
    graph.transitive_closure([TargetId::from("app")]).unwrap()
  }

  #[test]
  fn keys_are_stable_for_unchanged_inputs() {
    let fx = fixture();
    let set = all(&fx.graph);

    let first = compute_keys(&fx.graph, &set).unwrap();
    let second = compute_keys(&fx.graph, &set).unwrap();
    assert_eq!(first, second);
    assert_eq!(first.len(), 2);
    assert_eq!(first[&TargetId::from("app")].0.len(), BUILD_KEY_PREFIX_LEN);
  }

  #[test]
  fn source_change_rekeys_target_and_dependents() {
    let fx = fixture();
    let set = all(&fx.graph);
    let before = compute_keys(&fx.graph, &set).unwrap();

    fs::write(
      fx.temp.path().join("multiply.c"),
      "int multiply(int a, int b) { return b * a; }",
    )
    .unwrap();
    let after = compute_keys(&fx.graph, &set).unwrap();

    assert_ne!(before[&TargetId::from("mathlib")], after[&TargetId::from("mathlib")]);
    assert_ne!(before[&TargetId::from("app")], after[&TargetId::from("app")]);
  }

  #[test]
  fn define_change_rekeys_exactly_the_affected_subtree() {
    let mut fx = fixture();
    let other_src = fx.temp.path().join("other.c");
    fs::write(&other_src, "int other(void) { return 1; }").unwrap();
    fx.graph
      .add_target(Target::new("other", TargetKind::CompileUnit).with_source(&other_src))
      .unwrap();

    let set = fx
      .graph
      .transitive_closure([TargetId::from("app"), TargetId::from("other")])
      .unwrap();
    let before = compute_keys(&fx.graph, &set).unwrap();

    let mathlib = TargetId::from("mathlib");
    if let Some(target) = fx.graph.target(&mathlib).cloned() {
      let mut changed = target;
      changed
        .config
        .defines
        .insert("FAST_MATH".to_string(), "1".to_string());
      // Rebuild the graph with the changed config, as a new session would.
      let mut graph = TargetGraph::new();
      graph.add_target(changed).unwrap();
      for id in ["app", "other"] {
        if let Some(t) = fx.graph.target(&TargetId::from(id)) {
          graph.add_target(t.clone()).unwrap();
        }
      }
      graph
        .add_dependency(&TargetId::from("app"), &mathlib)
        .unwrap();

      let after = compute_keys(&graph, &set).unwrap();
      assert_ne!(before[&mathlib], after[&mathlib]);
      assert_ne!(before[&TargetId::from("app")], after[&TargetId::from("app")]);
      assert_eq!(before[&TargetId::from("other")], after[&TargetId::from("other")]);
    } else {
      panic!("mathlib missing from fixture");
    }
  }

  #[test]
  fn include_tree_content_feeds_the_key() {
    let fx = fixture();
    let inc = fx.temp.path().join("include");
    fs::create_dir(&inc).unwrap();
    fs::write(inc.join("math.h"), "int multiply(int, int);").unwrap();

    let mut graph = TargetGraph::new();
    let mathlib = TargetId::from("mathlib");
    if let Some(t) = fx.graph.target(&mathlib) {
      let mut with_inc = t.clone();
      with_inc.config.include_paths.push(inc.clone());
      graph.add_target(with_inc).unwrap();
    }

    let set: BTreeSet<TargetId> = [mathlib.clone()].into_iter().collect();
    let before = compute_keys(&graph, &set).unwrap();

    fs::write(inc.join("math.h"), "int multiply(int a, int b);").unwrap();
    let after = compute_keys(&graph, &set).unwrap();

    assert_ne!(before[&mathlib], after[&mathlib]);
  }

  #[test]
  fn missing_source_aborts_key_derivation() {
    let mut graph = TargetGraph::new();
    graph
      .add_target(Target::new("ghost", TargetKind::CompileUnit).with_source("/no/such/file.c"))
      .unwrap();

    let set: BTreeSet<TargetId> = [TargetId::from("ghost")].into_iter().collect();
    let err = compute_keys(&graph, &set).unwrap_err();
    assert!(matches!(err, KeyError::Hash(HashError::Read { .. })));
  }
}
