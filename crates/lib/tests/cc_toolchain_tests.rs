//! End-to-end builds through a real C compiler.
//!
//! Every test probes for a working `cc` first and skips quietly when the
//! host has none, so the suite stays green on minimal machines.

#![cfg(unix)]

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::process::Command;
use std::sync::Arc;

use tempfile::TempDir;

use kiln_lib::artifact::Artifact;
use kiln_lib::cache::DirCache;
use kiln_lib::graph::TargetGraph;
use kiln_lib::session::{BuildSession, SessionOptions, SessionResult};
use kiln_lib::target::{Target, TargetId, TargetKind};
use kiln_lib::toolchain::CcToolchain;

fn id(name: &str) -> TargetId {
  TargetId::from(name)
}

fn write_source(dir: &Path, name: &str, body: &str) -> std::path::PathBuf {
  let path = dir.join(name);
  fs::write(&path, body).unwrap();
  path
}

fn run_with_cc(graph: TargetGraph, store: &Path, requested: &[&str]) -> SessionResult {
  let session = BuildSession::new(
    graph,
    Arc::new(DirCache::open(store).unwrap()),
    Arc::new(CcToolchain::new()),
    SessionOptions::with_concurrency(4),
  )
  .unwrap();

  let requested: Vec<TargetId> = requested.iter().copied().map(id).collect();
  tokio::runtime::Builder::new_multi_thread()
    .worker_threads(4)
    .enable_all()
    .build()
    .unwrap()
    .block_on(session.run(requested))
    .unwrap()
}

/// Write a produced binary artifact to disk and execute it.
fn execute(artifact: &Artifact, dir: &Path) -> std::process::Output {
  let path = dir.join("produced");
  fs::write(&path, &artifact.bytes).unwrap();
  fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
  Command::new(&path).output().unwrap()
}

#[test]
fn multiply_fixture_computes_eighty_four() {
  if !CcToolchain::new().available() {
    eprintln!("skipping: no C compiler on PATH");
    return;
  }

  let temp = TempDir::new().unwrap();
  let store = TempDir::new().unwrap();

  let mut graph = TargetGraph::new();
  graph
    .add_target(Target::new("mathlib", TargetKind::CompileUnit).with_source(write_source(
      temp.path(),
      "multiply.c",
      "int multiply(int a, int b) { return a * b; }\n",
    )))
    .unwrap();
  graph
    .add_target(Target::new("app", TargetKind::Binary).with_source(write_source(
      temp.path(),
      "main.c",
      r#"
      #include <stdio.h>
      extern int multiply(int a, int b);
      int main(void) {
        int a = multiply(7, 12);
        printf("7 * 12 = %d\n", a);
        return a == 84 ? 0 : 1;
      }
      "#,
    )))
    .unwrap();
  graph.add_dependency(&id("app"), &id("mathlib")).unwrap();

  let result = run_with_cc(graph, store.path(), &["app"]);
  assert!(result.is_success(), "session failed: {:?}", result.errors);

  let output = execute(result.artifact(&id("app")).unwrap(), temp.path());
  assert!(output.status.success());
  assert!(String::from_utf8_lossy(&output.stdout).contains("84"));
}

#[test]
fn concurrent_units_link_into_one_program() {
  if !CcToolchain::new().available() {
    eprintln!("skipping: no C compiler on PATH");
    return;
  }

  let temp = TempDir::new().unwrap();
  let store = TempDir::new().unwrap();

  let mut graph = TargetGraph::new();
  for (name, op) in [("add", "+"), ("subtract", "-"), ("multiply", "*")] {
    graph
      .add_target(Target::new(name, TargetKind::CompileUnit).with_source(write_source(
        temp.path(),
        &format!("{name}.c"),
        &format!("int {name}(int a, int b) {{ return a {op} b; }}\n"),
      )))
      .unwrap();
  }
  graph
    .add_target(Target::new("app", TargetKind::Binary).with_source(write_source(
      temp.path(),
      "main.c",
      r#"
      extern int multiply(int a, int b);
      extern int add(int a, int b);
      extern int subtract(int a, int b);
      int main(void) {
        if (multiply(7, 12) != 84) return 1;
        if (add(9, 2) != 11) return 2;
        if (subtract(64, 3) != 61) return 3;
        return 0;
      }
      "#,
    )))
    .unwrap();
  for dep in ["add", "subtract", "multiply"] {
    graph.add_dependency(&id("app"), &id(dep)).unwrap();
  }

  let result = run_with_cc(graph, store.path(), &["app"]);
  assert!(result.is_success(), "session failed: {:?}", result.errors);

  let output = execute(result.artifact(&id("app")).unwrap(), temp.path());
  assert!(output.status.success(), "program exited with {:?}", output.status);
}

#[test]
fn static_archive_links_into_a_binary() {
  if !CcToolchain::new().available() {
    eprintln!("skipping: no C compiler on PATH");
    return;
  }

  let temp = TempDir::new().unwrap();
  let store = TempDir::new().unwrap();

  let mut graph = TargetGraph::new();
  graph
    .add_target(Target::new("square_unit", TargetKind::CompileUnit).with_source(write_source(
      temp.path(),
      "square.c",
      "int square(int x) { return x * x; }\n",
    )))
    .unwrap();
  graph
    .add_target(Target::new("squarelib", TargetKind::StaticLibrary))
    .unwrap();
  graph
    .add_target(Target::new("app", TargetKind::Binary).with_source(write_source(
      temp.path(),
      "main.c",
      "extern int square(int x);\nint main(void) { return square(9) == 81 ? 0 : 1; }\n",
    )))
    .unwrap();
  graph
    .add_dependency(&id("squarelib"), &id("square_unit"))
    .unwrap();
  graph.add_dependency(&id("app"), &id("squarelib")).unwrap();

  let result = run_with_cc(graph, store.path(), &["app"]);
  assert!(result.is_success(), "session failed: {:?}", result.errors);

  let output = execute(result.artifact(&id("app")).unwrap(), temp.path());
  assert!(output.status.success(), "program exited with {:?}", output.status);
}

#[test]
fn broken_source_surfaces_a_compile_error() {
  if !CcToolchain::new().available() {
    eprintln!("skipping: no C compiler on PATH");
    return;
  }

  let temp = TempDir::new().unwrap();
  let store = TempDir::new().unwrap();

  let mut graph = TargetGraph::new();
  graph
    .add_target(Target::new("broken", TargetKind::CompileUnit).with_source(write_source(
      temp.path(),
      "broken.c",
      "int broken(void) { return missing_symbol; }\n",
    )))
    .unwrap();

  let result = run_with_cc(graph, store.path(), &["broken"]);

  assert!(!result.is_success());
  assert_eq!(result.errors.len(), 1);
  assert!(result.errors[0].error.is_compile_error());
}
