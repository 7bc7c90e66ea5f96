//! kiln-engine: the incremental build engine underneath kiln.
//!
//! The engine computes the value of a requested key while doing the minimum
//! work required across successive invocations:
//! - `Rule`s associate keys with task factories and validity checks
//! - `Task`s are live computations whose inputs the engine resolves
//! - the `Database` persists results so later runs only rebuild what changed
//! - the makefile-deps parser turns compiler-emitted `target: prereq ...`
//!   output into discovered dependencies
//!
//! The crate is policy-free: what keys mean, how values are encoded, and
//! where task bodies run is decided by the layer on top (kiln-build).

pub mod db;
pub mod deps;
pub mod engine;
pub mod trace;
pub mod types;

pub use db::{Database, DatabaseError, DbResult, FileDatabase, MemoryDatabase};
pub use engine::{BuildEngine, DeferredCompletion, EngineDelegate, EngineError, TaskInterface};
pub use types::{Key, Rule, RuleResult, StatusKind, Task, Value};
