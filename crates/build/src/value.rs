//! The value space the build system runs through the engine.
//!
//! The engine only compares values for equality; this module gives those
//! bytes meaning. Values are serialised as canonical JSON, which keeps the
//! byte-equality the engine relies on (field order is fixed by the struct
//! definitions) and keeps database dumps legible.

use kiln_engine::Value;
use serde::{Deserialize, Serialize};

use crate::fileinfo::FileInfo;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum BuildValue {
  /// Sentinel injected for commands that disappeared from the description;
  /// never valid, so dependants re-run.
  Invalid,
  /// A node with no file behind it.
  VirtualInput,
  /// An input file that exists, with its stamp.
  ExistingInput { info: FileInfo },
  /// An input file that does not exist and has no producer.
  MissingInput,
  /// Projection of a failed or skipped producer onto one of its outputs.
  FailedInput,
  /// A command that ran to completion, with one stamp per output.
  SuccessfulCommand { outputs: Vec<FileInfo>, signature: u64 },
  /// A command whose process exited nonzero.
  FailedCommand,
  /// A command not run because of cancellation or a bad input.
  SkippedCommand,
  /// The result of building a top-level target.
  Target,
}

impl BuildValue {
  pub fn to_value(&self) -> Value {
    // A closed enum of plain data; serialisation cannot fail.
    Value::new(serde_json::to_vec(self).expect("build value serialisation is infallible"))
  }

  /// Decode engine bytes; `None` for anything this version cannot read,
  /// which validators treat as "rebuild".
  pub fn from_value(value: &Value) -> Option<BuildValue> {
    serde_json::from_slice(value.as_bytes()).ok()
  }

  pub fn is_failed_or_skipped(&self) -> bool {
    matches!(self, BuildValue::FailedCommand | BuildValue::SkippedCommand)
  }
}
