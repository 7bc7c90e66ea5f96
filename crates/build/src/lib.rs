//! kiln-build: the build-system layer on top of the kiln engine.
//!
//! Where kiln-engine is policy-free, this crate supplies the policy:
//! - a build-description format (tools, targets, nodes, commands) and its
//!   loader
//! - a tagged key space and value union for file-oriented builds
//! - nodes with file stamps, shell and phony commands, and the external
//!   command body they share
//! - a lane-based execution queue for running command processes in parallel
//! - `BuildSystem`, which wires all of it onto an engine instance

pub mod buildfile;
pub mod command;
pub mod doc;
pub mod fileinfo;
pub mod key;
pub mod node;
pub mod queue;
pub mod system;
pub mod value;

pub use buildfile::{BuildFileDelegate, LoadError, LoadedBuildFile, Target};
pub use command::{AttrValue, Command, CommandInterface, ConfigureCtx, Tool};
pub use fileinfo::FileInfo;
pub use key::BuildKey;
pub use node::BuildNode;
pub use queue::{default_lane_count, ExecutionQueue, QueueJob, QueueJobContext};
pub use system::{
  BuildContext, BuildResults, BuildSystem, BuildSystemConfig, BuildSystemDelegate, BuildSystemError,
};
pub use value::BuildValue;
