//! Core data model: keys, values, rules, tasks, and result records.
//!
//! Keys and values are opaque byte strings. The engine never interprets a
//! value beyond comparing it for equality against the previously stored one;
//! interpretation belongs to the layer that registered the rule.

use std::fmt;

use crate::engine::TaskInterface;

/// An opaque byte string uniquely identifying a rule.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Key(Vec<u8>);

impl Key {
  pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
    Key(bytes.into())
  }

  pub fn as_bytes(&self) -> &[u8] {
    &self.0
  }

  /// Lossy UTF-8 rendering for diagnostics and traces.
  pub fn display(&self) -> String {
    String::from_utf8_lossy(&self.0).into_owned()
  }
}

impl From<&str> for Key {
  fn from(s: &str) -> Self {
    Key(s.as_bytes().to_vec())
  }
}

impl From<String> for Key {
  fn from(s: String) -> Self {
    Key(s.into_bytes())
  }
}

impl From<Vec<u8>> for Key {
  fn from(bytes: Vec<u8>) -> Self {
    Key(bytes)
  }
}

impl fmt::Debug for Key {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "Key({:?})", String::from_utf8_lossy(&self.0))
  }
}

impl fmt::Display for Key {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}", String::from_utf8_lossy(&self.0))
  }
}

/// An opaque byte sequence produced by a rule.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Value(Vec<u8>);

impl Value {
  pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
    Value(bytes.into())
  }

  pub fn as_bytes(&self) -> &[u8] {
    &self.0
  }

  pub fn into_bytes(self) -> Vec<u8> {
    self.0
  }
}

impl From<Vec<u8>> for Value {
  fn from(bytes: Vec<u8>) -> Self {
    Value(bytes)
  }
}

impl fmt::Debug for Value {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "Value({} bytes)", self.0.len())
  }
}

/// Rule status transitions reported through the optional status callback.
///
/// A rule that participates in a build sees each of these exactly once:
/// `IsScanning` when the engine starts deciding whether it must run, and
/// `IsComplete` once its value is available (whether recomputed or validated).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusKind {
  IsScanning,
  IsComplete,
}

pub type TaskFactory = Box<dyn Fn() -> Box<dyn Task>>;
pub type ResultValidator = Box<dyn Fn(&Key, &Value) -> bool>;
pub type StatusCallback = Box<dyn Fn(StatusKind)>;

/// A registered entry associating a key with the machinery to (re)compute it.
pub struct Rule {
  /// The key this rule computes.
  pub key: Key,
  /// Factory constructing a fresh task instance when the rule must run.
  pub action: TaskFactory,
  /// Returns true if a stored value is still current with respect to
  /// external state, assuming the rule's dependencies are unchanged. Absent
  /// means the stored value is always acceptable on that axis.
  pub is_result_valid: Option<ResultValidator>,
  /// Invoked on rule state transitions.
  pub update_status: Option<StatusCallback>,
}

impl Rule {
  pub fn new(key: impl Into<Key>, action: impl Fn() -> Box<dyn Task> + 'static) -> Self {
    Rule {
      key: key.into(),
      action: Box::new(action),
      is_result_valid: None,
      update_status: None,
    }
  }

  pub fn validator(mut self, check: impl Fn(&Key, &Value) -> bool + 'static) -> Self {
    self.is_result_valid = Some(Box::new(check));
    self
  }

  pub fn status(mut self, callback: impl Fn(StatusKind) + 'static) -> Self {
    self.update_status = Some(Box::new(callback));
    self
  }
}

impl fmt::Debug for Rule {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Rule")
      .field("key", &self.key)
      .field("has_validator", &self.is_result_valid.is_some())
      .finish()
  }
}

/// A live computation instance for one rule during one build.
///
/// The engine owns the task exclusively while it runs and destroys it after
/// completion. All lifecycle calls arrive on the engine thread; work that
/// must happen elsewhere is handed off through
/// [`TaskInterface::defer`](crate::engine::TaskInterface::defer).
pub trait Task {
  /// The task should declare its known inputs via
  /// [`TaskInterface::task_needs_input`].
  fn start(&mut self, engine: &mut TaskInterface<'_>);

  /// The value computed for this rule in the previous build, if any.
  /// Delivered once, before any input values.
  fn provide_prior_value(&mut self, _engine: &mut TaskInterface<'_>, _value: &Value) {}

  /// One declared input has resolved; `input_id` is the identifier the task
  /// passed to `task_needs_input`.
  fn provide_value(&mut self, engine: &mut TaskInterface<'_>, input_id: usize, value: &Value);

  /// All declared inputs have been delivered. The task must eventually
  /// complete via [`TaskInterface::task_is_complete`] or a deferred
  /// completion; it may first request further inputs or report discovered
  /// dependencies.
  fn inputs_available(&mut self, engine: &mut TaskInterface<'_>);
}

/// The persisted outcome of running (or validating) a rule.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuleResult {
  /// The computed value.
  pub value: Value,
  /// Iteration in which the value last changed.
  pub built_at: u64,
  /// Iteration in which the engine last confirmed the result valid.
  pub checked_at: u64,
  /// Keys requested through `task_needs_input`, in delivery order.
  pub declared_deps: Vec<Key>,
  /// Keys reported through `task_discovered_dependency`, in report order.
  pub discovered_deps: Vec<Key>,
}

impl RuleResult {
  /// Total size of the dependency set.
  pub fn dep_count(&self) -> usize {
    self.declared_deps.len() + self.discovered_deps.len()
  }

  /// The dependency set in scan order: declared inputs first, then
  /// discovered ones.
  pub fn dep_at(&self, index: usize) -> &Key {
    if index < self.declared_deps.len() {
      &self.declared_deps[index]
    } else {
      &self.discovered_deps[index - self.declared_deps.len()]
    }
  }

  pub fn dependencies(&self) -> impl Iterator<Item = &Key> {
    self.declared_deps.iter().chain(self.discovered_deps.iter())
  }
}
