//! JSON-lines trace of engine decisions.
//!
//! When tracing is enabled the engine appends one record per decision:
//! which rules were scanned, why a rule was marked dirty, and when tasks
//! were created and finished. The format is one `serde_json` object per
//! line, suitable for grep and jq.

use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;

use serde::Serialize;
use tracing::warn;

#[derive(Serialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
enum TraceEvent<'a> {
  BuildStarted {
    iteration: u64,
  },
  BuildEnded {
    iteration: u64,
  },
  ScanningRule {
    key: &'a str,
    iteration: u64,
  },
  RuleNeedsToRun {
    key: &'a str,
    iteration: u64,
    reason: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    input: Option<&'a str>,
  },
  RuleIsValid {
    key: &'a str,
    iteration: u64,
  },
  TaskStarted {
    key: &'a str,
    iteration: u64,
  },
  TaskFinished {
    key: &'a str,
    iteration: u64,
    changed: bool,
  },
}

pub struct EngineTrace {
  out: BufWriter<File>,
  /// Once a write fails the trace goes quiet rather than failing the build.
  broken: bool,
}

impl EngineTrace {
  pub fn open(path: &Path) -> io::Result<Self> {
    let file = File::create(path)?;
    Ok(EngineTrace {
      out: BufWriter::new(file),
      broken: false,
    })
  }

  fn emit(&mut self, event: &TraceEvent<'_>) {
    if self.broken {
      return;
    }
    let line = match serde_json::to_string(event) {
      Ok(line) => line,
      Err(err) => {
        warn!(%err, "failed to serialise trace event, disabling trace");
        self.broken = true;
        return;
      }
    };
    if let Err(err) = writeln!(self.out, "{line}") {
      warn!(%err, "failed to write trace event, disabling trace");
      self.broken = true;
    }
  }

  pub(crate) fn build_started(&mut self, iteration: u64) {
    self.emit(&TraceEvent::BuildStarted { iteration });
  }

  pub(crate) fn build_ended(&mut self, iteration: u64) {
    self.emit(&TraceEvent::BuildEnded { iteration });
    if !self.broken {
      if let Err(err) = self.out.flush() {
        warn!(%err, "failed to flush trace file");
        self.broken = true;
      }
    }
  }

  pub(crate) fn scanning_rule(&mut self, key: &str, iteration: u64) {
    self.emit(&TraceEvent::ScanningRule { key, iteration });
  }

  pub(crate) fn rule_needs_to_run(
    &mut self,
    key: &str,
    iteration: u64,
    reason: &'static str,
    input: Option<&str>,
  ) {
    self.emit(&TraceEvent::RuleNeedsToRun {
      key,
      iteration,
      reason,
      input,
    });
  }

  pub(crate) fn rule_is_valid(&mut self, key: &str, iteration: u64) {
    self.emit(&TraceEvent::RuleIsValid { key, iteration });
  }

  pub(crate) fn task_started(&mut self, key: &str, iteration: u64) {
    self.emit(&TraceEvent::TaskStarted { key, iteration });
  }

  pub(crate) fn task_finished(&mut self, key: &str, iteration: u64, changed: bool) {
    self.emit(&TraceEvent::TaskFinished {
      key,
      iteration,
      changed,
    });
  }
}
