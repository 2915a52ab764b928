//! Process-backed C toolchain.
//!
//! Shells out to a C compiler for compilation and final links, `ar` for
//! static archives, and `ld -r` for relocatable merges. Every invocation
//! runs in a private scratch directory: dependency artifact blobs are
//! materialized to files there, the tool runs, and the produced bytes are
//! read back as the artifact.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use tempfile::TempDir;
use tracing::{debug, trace};

use crate::artifact::Artifact;
use crate::target::{TargetConfig, TargetKind};

use super::{CompileRequest, LinkRequest, Toolchain, ToolchainError};

/// A toolchain invoking an external C compiler.
pub struct CcToolchain {
  compiler: String,
  archiver: String,
  merger: String,
}

impl Default for CcToolchain {
  fn default() -> Self {
    Self {
      compiler: "cc".to_string(),
      archiver: "ar".to_string(),
      merger: "ld".to_string(),
    }
  }
}

impl CcToolchain {
  pub fn new() -> Self {
    Self::default()
  }

  /// Use a specific compiler program (for example `gcc` or `clang`).
  pub fn with_compiler(mut self, program: impl Into<String>) -> Self {
    self.compiler = program.into();
    self
  }

  /// Whether the configured compiler can be invoked at all. Lets callers
  /// and tests skip gracefully on hosts without a C toolchain.
  pub fn available(&self) -> bool {
    Command::new(&self.compiler)
      .arg("--version")
      .output()
      .map(|out| out.status.success())
      .unwrap_or(false)
  }

  fn scratch(&self) -> Result<TempDir, ToolchainError> {
    tempfile::Builder::new()
      .prefix("kiln-tc-")
      .tempdir()
      .map_err(|e| ToolchainError::Io {
        message: format!("failed to create scratch directory: {e}"),
      })
  }

  fn run(mut command: Command, fail: impl FnOnce(String) -> ToolchainError) -> Result<(), ToolchainError> {
    trace!(command = ?command, "invoking tool");

    let output = command.output().map_err(|e| ToolchainError::Io {
      message: format!("failed to spawn {:?}: {e}", command.get_program()),
    })?;

    if !output.status.success() {
      let mut message = String::from_utf8_lossy(&output.stderr).trim().to_string();
      if message.is_empty() {
        message = format!("exited with {}", output.status);
      }
      return Err(fail(message));
    }

    Ok(())
  }

  fn read_output(path: &Path) -> Result<Vec<u8>, ToolchainError> {
    fs::read(path).map_err(|e| ToolchainError::Io {
      message: format!("failed to read tool output {}: {e}", path.display()),
    })
  }

  /// Materialize input artifact blobs as files the linker can consume.
  fn materialize_inputs(
    dir: &Path,
    inputs: &[std::sync::Arc<Artifact>],
  ) -> Result<Vec<PathBuf>, ToolchainError> {
    let mut paths = Vec::with_capacity(inputs.len());
    for (i, artifact) in inputs.iter().enumerate() {
      let ext = match artifact.kind {
        TargetKind::CompileUnit => "o",
        TargetKind::StaticLibrary => "a",
        TargetKind::SharedLibrary => "so",
        TargetKind::Binary => "bin",
      };
      let path = dir.join(format!("input-{i}.{ext}"));
      fs::write(&path, &artifact.bytes).map_err(|e| ToolchainError::Io {
        message: format!("failed to stage input {}: {e}", path.display()),
      })?;
      paths.push(path);
    }
    Ok(paths)
  }
}

/// `-D` flags for the configured preprocessor definitions, in map order.
fn define_args(config: &TargetConfig) -> Vec<String> {
  config
    .defines
    .iter()
    .map(|(name, value)| {
      if value.is_empty() {
        format!("-D{name}")
      } else {
        format!("-D{name}={value}")
      }
    })
    .collect()
}

/// `-I` flags for the configured header search paths.
fn include_args(config: &TargetConfig) -> Vec<String> {
  config
    .include_paths
    .iter()
    .map(|path| format!("-I{}", path.display()))
    .collect()
}

impl Toolchain for CcToolchain {
  fn compile(&self, request: &CompileRequest<'_>) -> Result<Artifact, ToolchainError> {
    let scratch = self.scratch()?;
    let object = scratch.path().join("out.o");

    let mut command = Command::new(&self.compiler);
    command
      .arg("-c")
      .arg(request.source)
      .arg("-o")
      .arg(&object)
      .args(define_args(request.config))
      .args(include_args(request.config));

    debug!(target = %request.target, source = %request.source.display(), "compiling");
    Self::run(command, |message| ToolchainError::Compile {
      unit: request.source.to_path_buf(),
      message,
    })?;

    let bytes = Self::read_output(&object)?;
    Ok(Artifact::new(TargetKind::CompileUnit, request.key.clone(), bytes))
  }

  fn link(&self, request: &LinkRequest<'_>) -> Result<Artifact, ToolchainError> {
    let scratch = self.scratch()?;
    let inputs = Self::materialize_inputs(scratch.path(), request.inputs)?;

    let fail = |message| ToolchainError::Link {
      output: request.target.clone(),
      message,
    };

    let output = match request.kind {
      TargetKind::Binary => {
        let out = scratch.path().join("out");
        let mut command = Command::new(&self.compiler);
        command
          .args(&inputs)
          .arg("-o")
          .arg(&out)
          .args(&request.config.link_flags);
        debug!(target = %request.target, inputs = inputs.len(), "linking binary");
        Self::run(command, fail)?;
        out
      }
      TargetKind::SharedLibrary => {
        let out = scratch.path().join("out.so");
        let mut command = Command::new(&self.compiler);
        command
          .arg("-shared")
          .args(&inputs)
          .arg("-o")
          .arg(&out)
          .args(&request.config.link_flags);
        debug!(target = %request.target, inputs = inputs.len(), "linking shared library");
        Self::run(command, fail)?;
        out
      }
      TargetKind::StaticLibrary => {
        let out = scratch.path().join("out.a");
        let mut command = Command::new(&self.archiver);
        command.arg("rcs").arg(&out).args(&inputs);
        debug!(target = %request.target, inputs = inputs.len(), "archiving");
        Self::run(command, fail)?;
        out
      }
      TargetKind::CompileUnit => {
        // Relocatable merge of several objects into one.
        let out = scratch.path().join("out.o");
        let mut command = Command::new(&self.merger);
        command.arg("-r").args(&inputs).arg("-o").arg(&out);
        debug!(target = %request.target, inputs = inputs.len(), "merging objects");
        Self::run(command, fail)?;
        out
      }
    };

    let bytes = Self::read_output(&output)?;
    Ok(Artifact::new(request.kind, request.key.clone(), bytes))
  }
}
