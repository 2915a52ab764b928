//! kiln-lib: a concurrent build orchestration engine.
//!
//! The engine turns a set of declared targets into artifacts, exactly once
//! each, under a bounded amount of parallelism:
//!
//! - `graph`: the frozen dependency graph of targets, validated acyclic
//!   before any work starts
//! - `key`: deterministic build keys derived from source content,
//!   configuration, and dependency keys
//! - `cache`: content-addressed artifact storage with atomic, idempotent
//!   publish
//! - `toolchain`: the two-operation compile/link contract the engine is
//!   polymorphic over, plus a process-backed C implementation
//! - `session`: one invocation's scheduler, worker pool, singleflight
//!   barriers, and result summary
//! - `manifest`: the serde boundary where a surrounding config loader hands
//!   declarations to the engine
//!
//! Invoking an external compiler is the engine's only interface to the
//! operating environment; everything else is a pure function of the graph
//! and the cache.

pub mod artifact;
pub mod cache;
pub mod consts;
pub mod graph;
pub mod key;
pub mod manifest;
pub mod session;
pub mod target;
pub mod toolchain;
pub mod util;
