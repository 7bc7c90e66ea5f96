//! The build engine: rule table, dependency scanning, and task execution.
//!
//! A build interleaves two phases per key. *Scanning* walks the stored
//! dependency set of a rule to decide whether its persisted result is still
//! valid; *execution* instantiates a task for each dirty rule and resolves
//! the inputs it declares. Both phases run on explicit work stacks owned by
//! the engine. Nothing here recurses over the dependency graph, so chains
//! tens of thousands of rules deep scan in constant stack space.
//!
//! The engine itself is single-threaded: every lifecycle call on a task
//! happens on the thread that called [`BuildEngine::build`]. Work that must
//! run elsewhere finishes the task through a [`DeferredCompletion`], which
//! posts a completion record the engine dequeues on its loop.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::mpsc::{self, Receiver, Sender};

use thiserror::Error;
use tracing::{debug, warn};

use crate::db::{Database, DatabaseError};
use crate::trace::EngineTrace;
use crate::types::{Key, Rule, RuleResult, StatusKind, Task, Value};

type RuleId = usize;
type TaskId = u64;

/// Client hooks the engine consults while building.
pub trait EngineDelegate {
  /// Produce a rule for a key no one registered. Consulted at most once per
  /// key; returning `None` fails the build with
  /// [`EngineError::UnknownRule`].
  fn lookup_rule(&mut self, key: &Key) -> Option<Rule> {
    let _ = key;
    None
  }

  /// A dependency cycle was found. `path` runs from the first offending key
  /// back to itself. Invoked exactly once per failed build.
  fn cycle_detected(&mut self, path: &[Key]) {
    let _ = path;
  }
}

#[derive(Debug, Error)]
pub enum EngineError {
  #[error("no rule to build key '{0}'")]
  UnknownRule(Key),

  #[error("cycle detected while building: {}", format_cycle(.0))]
  Cycle(Vec<Key>),

  #[error(transparent)]
  Database(#[from] DatabaseError),

  #[error("unable to open trace file: {0}")]
  Trace(#[source] std::io::Error),
}

fn format_cycle(path: &[Key]) -> String {
  path.iter().map(Key::display).collect::<Vec<_>>().join(" -> ")
}

/// A request by a task (or the build itself, when `task` is `None`) for the
/// value of `input_rule`.
#[derive(Clone, Copy)]
struct InputRequest {
  task: Option<TaskId>,
  input_rule: RuleId,
  input_id: usize,
}

/// A paused walk over one rule's stored dependency set.
#[derive(Clone, Copy)]
struct ScanRequest {
  rule: RuleId,
  input_index: usize,
  /// Cached id of the dependency at `input_index`, filled on first look-up
  /// so a deferred request does not repeat the key hash.
  input_rule: Option<RuleId>,
}

/// Bookkeeping attached to a rule only while it is being scanned.
#[derive(Default)]
struct ScanRecord {
  /// Input requests waiting for this rule's scan to finish.
  paused_input_requests: Vec<InputRequest>,
  /// Scan requests of other rules waiting on this rule.
  deferred_scan_requests: Vec<ScanRequest>,
  /// The rule this rule's own scan is currently deferred on. Following
  /// these links is how scan-time cycles are found.
  waiting_on: Option<RuleId>,
}

enum RuleState {
  /// Initial state, and the state every unfinished rule returns to after a
  /// failed build.
  Incomplete,
  Scanning(ScanRecord),
  NeedsToRun,
  DoesNotNeedToRun,
  /// Task created, inputs still being delivered.
  InProgressWaiting(TaskId),
  /// All declared inputs delivered; the task is computing its value.
  InProgressComputing(TaskId),
  /// Result available. Only current if `checked_at` matches the build
  /// iteration; stale completeness lapses lazily at the next scan.
  Complete,
}

struct RuleInfo {
  rule: Rule,
  state: RuleState,
  result: Option<RuleResult>,
}

impl RuleInfo {
  fn is_complete(&self, current_iteration: u64) -> bool {
    matches!(self.state, RuleState::Complete)
      && self.result.as_ref().is_some_and(|r| r.checked_at == current_iteration)
  }

  fn is_scanned(&self, current_iteration: u64) -> bool {
    match self.state {
      RuleState::Incomplete | RuleState::Scanning(_) => false,
      RuleState::Complete => self.is_complete(current_iteration),
      _ => true,
    }
  }

  fn pending_task(&self) -> Option<TaskId> {
    match self.state {
      RuleState::InProgressWaiting(task) | RuleState::InProgressComputing(task) => Some(task),
      _ => None,
    }
  }
}

struct TaskInfo {
  task: Option<Box<dyn Task>>,
  for_rule: RuleId,
  /// Declared inputs not yet delivered.
  wait_count: usize,
  /// Input requests fulfilled once this task completes.
  requested_by: Vec<InputRequest>,
  /// Scan requests of rules waiting on this task's completion.
  deferred_scan_requests: Vec<ScanRequest>,
  declared_deps: Vec<Key>,
  discovered_deps: Vec<Key>,
}

struct TaskCompletion {
  task: TaskId,
  value: Value,
  discovered: Vec<Key>,
  force_change: bool,
}

/// Completes a task from outside the engine thread.
///
/// Obtained through [`TaskInterface::defer`]; typically captured by a job
/// submitted to an execution queue. Dropping the handle without calling
/// [`complete`](DeferredCompletion::complete) wedges the build and is a
/// programmer error.
pub struct DeferredCompletion {
  task: TaskId,
  tx: Sender<TaskCompletion>,
  discovered: Vec<Key>,
}

impl DeferredCompletion {
  /// Record a dependency discovered while the deferred work ran. Delivered
  /// to the engine together with the completion value.
  pub fn discovered_dependency(&mut self, key: impl Into<Key>) {
    self.discovered.push(key.into());
  }

  pub fn complete(self, value: Value) {
    let DeferredCompletion { task, tx, discovered } = self;
    // The engine may already have torn the build down; a dead receiver is
    // not this side's problem.
    let _ = tx.send(TaskCompletion {
      task,
      value,
      discovered,
      force_change: false,
    });
  }
}

/// Callback surface handed to task lifecycle methods.
///
/// Only valid for the duration of the lifecycle call it was passed to.
pub struct TaskInterface<'eng> {
  engine: &'eng mut BuildEngine,
  task: TaskId,
}

impl TaskInterface<'_> {
  /// Declare an input this task requires. The engine resolves the key
  /// (scanning or executing as needed) and delivers the value through
  /// [`Task::provide_value`] with the same `input_id`.
  pub fn task_needs_input(&mut self, key: impl Into<Key>, input_id: usize) {
    let key = key.into();
    let rule_id = self.engine.task_rule(self.task);
    assert!(
      self.engine.rules[rule_id].pending_task() == Some(self.task),
      "task for '{}' requested an input outside its execution window",
      self.engine.rules[rule_id].rule.key
    );

    let Some(input_rule) = self.engine.rule_id_for_key(&key) else {
      self.engine.fail_build(EngineError::UnknownRule(key));
      return;
    };
    self.engine.input_requests.push(InputRequest {
      task: Some(self.task),
      input_rule,
      input_id,
    });
    if let Some(info) = self.engine.tasks.get_mut(&self.task) {
      info.wait_count += 1;
    }
  }

  /// Report a key whose value influenced this task's output without having
  /// been requested up front. The value is not delivered; the key is only
  /// recorded on the result so future builds scan it.
  pub fn task_discovered_dependency(&mut self, key: impl Into<Key>) {
    let rule_id = self.engine.task_rule(self.task);
    assert!(
      matches!(self.engine.rules[rule_id].state, RuleState::InProgressComputing(_)),
      "task for '{}' reported a discovered dependency before its inputs were available",
      self.engine.rules[rule_id].rule.key
    );
    if let Some(info) = self.engine.tasks.get_mut(&self.task) {
      info.discovered_deps.push(key.into());
    }
  }

  /// Complete the task with its computed value.
  pub fn task_is_complete(&mut self, value: Value) {
    self.complete(value, false);
  }

  /// Complete the task, treating the value as changed even if it is
  /// byte-equal to the stored one. Dependants will re-run.
  pub fn task_is_complete_forced(&mut self, value: Value) {
    self.complete(value, true);
  }

  fn complete(&mut self, value: Value, force_change: bool) {
    let rule_id = self.engine.task_rule(self.task);
    assert!(
      matches!(self.engine.rules[rule_id].state, RuleState::InProgressComputing(_)),
      "task for '{}' completed before its inputs were available",
      self.engine.rules[rule_id].rule.key
    );
    self.engine.finished_tasks.push(TaskCompletion {
      task: self.task,
      value,
      discovered: Vec::new(),
      force_change,
    });
  }

  /// Hand completion of this task to work running off the engine thread.
  pub fn defer(&mut self) -> DeferredCompletion {
    let rule_id = self.engine.task_rule(self.task);
    assert!(
      matches!(self.engine.rules[rule_id].state, RuleState::InProgressComputing(_)),
      "task for '{}' deferred before its inputs were available",
      self.engine.rules[rule_id].rule.key
    );
    DeferredCompletion {
      task: self.task,
      tx: self.engine.completion_tx.clone(),
      discovered: Vec::new(),
    }
  }
}

/// An incremental build engine instance.
///
/// Owns all mutable state; multiple engines may coexist. `build` may be
/// called repeatedly, but never concurrently.
pub struct BuildEngine {
  delegate: Box<dyn EngineDelegate>,
  db: Option<Box<dyn Database>>,
  trace: Option<EngineTrace>,

  /// Monotonic counter identifying a build; persisted through the database.
  current_iteration: u64,

  rules: Vec<RuleInfo>,
  rule_ids: HashMap<Key, RuleId>,

  tasks: HashMap<TaskId, TaskInfo>,
  next_task: TaskId,

  // Work queues, drained by `execute_tasks`. All are processed
  // last-in-first-out except the completion channel.
  scan_requests: Vec<ScanRequest>,
  input_requests: Vec<InputRequest>,
  finished_input_requests: Vec<InputRequest>,
  ready_tasks: Vec<TaskId>,
  finished_tasks: Vec<TaskCompletion>,

  /// Tasks whose `inputs_available` ran but whose completion has not been
  /// processed. While nonzero and no other work exists, the engine blocks
  /// on the completion channel.
  outstanding_tasks: usize,
  completion_tx: Sender<TaskCompletion>,
  completion_rx: Receiver<TaskCompletion>,

  build_failed: Option<EngineError>,
}

impl BuildEngine {
  pub fn new(delegate: impl EngineDelegate + 'static) -> Self {
    let (completion_tx, completion_rx) = mpsc::channel();
    BuildEngine {
      delegate: Box::new(delegate),
      db: None,
      trace: None,
      current_iteration: 0,
      rules: Vec::new(),
      rule_ids: HashMap::new(),
      tasks: HashMap::new(),
      next_task: 0,
      scan_requests: Vec::new(),
      input_requests: Vec::new(),
      finished_input_requests: Vec::new(),
      ready_tasks: Vec::new(),
      finished_tasks: Vec::new(),
      outstanding_tasks: 0,
      completion_tx,
      completion_rx,
      build_failed: None,
    }
  }

  /// Register a rule. All rules must be registered (or synthesised through
  /// the delegate) before the key is built.
  pub fn add_rule(&mut self, rule: Rule) {
    self.insert_rule(rule);
  }

  /// Attach the persistent result database. Must happen before any rule is
  /// registered; the engine adopts the database's iteration counter.
  pub fn attach_db(&mut self, db: Box<dyn Database>) -> Result<(), EngineError> {
    assert!(self.db.is_none(), "attach_db may only be called once");
    assert!(self.rules.is_empty(), "attach_db must precede rule registration");
    self.current_iteration = db.current_iteration()?;
    self.db = Some(db);
    Ok(())
  }

  /// Write a JSON-lines trace of engine decisions to `path`.
  pub fn enable_tracing(&mut self, path: &Path) -> Result<(), EngineError> {
    self.trace = Some(EngineTrace::open(path).map_err(EngineError::Trace)?);
    Ok(())
  }

  /// Build `key`, blocking until its value is produced.
  pub fn build(&mut self, key: impl Into<Key>) -> Result<Value, EngineError> {
    let key = key.into();
    debug_assert!(self.tasks.is_empty(), "build() is not re-entrant");
    self.build_failed = None;

    let Some(root) = self.rule_id_for_key(&key) else {
      return Err(EngineError::UnknownRule(key));
    };

    if let Some(db) = self.db.as_mut() {
      db.build_started()?;
    }

    self.current_iteration += 1;
    assert!(self.current_iteration != 0, "build iteration counter overflowed");
    debug!(iteration = self.current_iteration, key = %key, "build started");
    if let Some(trace) = self.trace.as_mut() {
      trace.build_started(self.current_iteration);
    }

    self.input_requests.push(InputRequest {
      task: None,
      input_rule: root,
      input_id: 0,
    });
    self.execute_tasks();

    if let Some(db) = self.db.as_mut() {
      let flushed = db
        .set_current_iteration(self.current_iteration)
        .and_then(|()| db.build_complete());
      if let Err(err) = flushed {
        if self.build_failed.is_none() {
          self.build_failed = Some(err.into());
        }
      }
    }
    if let Some(trace) = self.trace.as_mut() {
      trace.build_ended(self.current_iteration);
    }

    if let Some(err) = self.build_failed.take() {
      self.reset_after_failure();
      return Err(err);
    }

    if !self.rules[root].is_complete(self.current_iteration) {
      // Quiescence without completion means a wait the detectors missed;
      // surface it rather than hand back a stale value.
      self.reset_after_failure();
      return Err(EngineError::Cycle(vec![self.rules[root].rule.key.clone()]));
    }
    match self.rules[root].result.as_ref() {
      Some(result) => Ok(result.value.clone()),
      None => unreachable!("complete rule without a result"),
    }
  }

  /// Drive all work queues until nothing is left to do.
  fn execute_tasks(&mut self) {
    loop {
      if self.build_failed.is_some() {
        self.clear_work_queues();
      }
      let mut did_work = false;

      while let Some(request) = self.scan_requests.pop() {
        did_work = true;
        self.process_scan_request(request);
        if self.build_failed.is_some() {
          break;
        }
      }

      while let Some(request) = self.input_requests.pop() {
        did_work = true;
        self.process_input_request(request);
        if self.build_failed.is_some() {
          break;
        }
      }

      while let Some(request) = self.finished_input_requests.pop() {
        did_work = true;
        self.process_finished_input(request);
        if self.build_failed.is_some() {
          break;
        }
      }

      while let Some(task_id) = self.ready_tasks.pop() {
        did_work = true;
        self.dispatch_ready_task(task_id);
        if self.build_failed.is_some() {
          break;
        }
      }

      while let Ok(completion) = self.completion_rx.try_recv() {
        self.finished_tasks.push(completion);
      }
      while let Some(completion) = self.finished_tasks.pop() {
        did_work = true;
        self.process_finished_task(completion);
      }

      // Out of local work with tasks still computing on lanes: sleep until
      // one posts its completion record.
      if !did_work && self.outstanding_tasks > 0 {
        if let Ok(completion) = self.completion_rx.recv() {
          self.finished_tasks.push(completion);
          did_work = true;
        }
      }

      if !did_work {
        break;
      }
    }

    // Quiescent with live tasks left: every one of them is waiting on
    // another, which means the request graph has a cycle.
    if !self.tasks.is_empty() && self.build_failed.is_none() {
      self.report_request_cycle();
    }
    if self.build_failed.is_some() {
      self.tasks.clear();
      self.clear_work_queues();
    }
  }

  fn clear_work_queues(&mut self) {
    self.scan_requests.clear();
    self.input_requests.clear();
    self.finished_input_requests.clear();
    self.ready_tasks.clear();
  }

  /// Begin (or continue) deciding whether `rule_id` must run.
  ///
  /// Returns true if the rule is already scanned; otherwise the rule has
  /// been enqueued and callers must defer on it.
  fn scan_rule(&mut self, rule_id: RuleId) -> bool {
    if self.rules[rule_id].is_scanned(self.current_iteration) {
      return true;
    }
    if matches!(self.rules[rule_id].state, RuleState::Scanning(_)) {
      return false;
    }

    self.emit_trace(rule_id, |t, k, i| t.scanning_rule(k, i));
    if let Some(status) = &self.rules[rule_id].rule.update_status {
      status(StatusKind::IsScanning);
    }

    if self.rules[rule_id].result.is_none() {
      self.emit_trace(rule_id, |t, k, i| t.rule_needs_to_run(k, i, "never-built", None));
      self.rules[rule_id].state = RuleState::NeedsToRun;
      return true;
    }

    let valid = {
      let info = &self.rules[rule_id];
      match (&info.rule.is_result_valid, &info.result) {
        (Some(validator), Some(result)) => validator(&info.rule.key, &result.value),
        _ => true,
      }
    };
    if !valid {
      self.emit_trace(rule_id, |t, k, i| t.rule_needs_to_run(k, i, "invalid-value", None));
      self.rules[rule_id].state = RuleState::NeedsToRun;
      return true;
    }

    let dep_count = self.rules[rule_id].result.as_ref().map_or(0, RuleResult::dep_count);
    if dep_count == 0 {
      self.emit_trace(rule_id, |t, k, i| t.rule_is_valid(k, i));
      self.rules[rule_id].state = RuleState::DoesNotNeedToRun;
      return true;
    }

    self.rules[rule_id].state = RuleState::Scanning(ScanRecord::default());
    self.scan_requests.push(ScanRequest {
      rule: rule_id,
      input_index: 0,
      input_rule: None,
    });
    false
  }

  /// Demand the value of a scanned rule.
  ///
  /// Returns true if the value is already available; otherwise the rule's
  /// task has been started (or is running) and callers must wait on it.
  fn demand_rule(&mut self, rule_id: RuleId) -> bool {
    debug_assert!(self.rules[rule_id].is_scanned(self.current_iteration));

    if self.rules[rule_id].is_complete(self.current_iteration) {
      return true;
    }
    if self.rules[rule_id].pending_task().is_some() {
      return false;
    }

    if matches!(self.rules[rule_id].state, RuleState::DoesNotNeedToRun) {
      self.set_complete(rule_id);
      if let Some(status) = &self.rules[rule_id].rule.update_status {
        status(StatusKind::IsComplete);
      }
      return true;
    }

    debug_assert!(matches!(self.rules[rule_id].state, RuleState::NeedsToRun));

    let task = (self.rules[rule_id].rule.action)();
    let task_id = self.next_task;
    self.next_task += 1;
    self.tasks.insert(
      task_id,
      TaskInfo {
        task: Some(task),
        for_rule: rule_id,
        wait_count: 0,
        requested_by: Vec::new(),
        deferred_scan_requests: Vec::new(),
        declared_deps: Vec::new(),
        discovered_deps: Vec::new(),
      },
    );
    self.emit_trace(rule_id, |t, k, i| t.task_started(k, i));
    self.rules[rule_id].state = RuleState::InProgressWaiting(task_id);

    self.with_task(task_id, |task, iface| task.start(iface));

    let prior = self.rules[rule_id].result.as_ref().map(|r| r.value.clone());
    if let Some(value) = prior {
      self.with_task(task_id, |task, iface| task.provide_prior_value(iface, &value));
    }

    if self.tasks.get(&task_id).is_some_and(|t| t.wait_count == 0) {
      self.ready_tasks.push(task_id);
    }
    false
  }

  /// Walk one rule's stored dependencies until done, dirty, or deferred.
  fn process_scan_request(&mut self, mut request: ScanRequest) {
    debug_assert!(matches!(self.rules[request.rule].state, RuleState::Scanning(_)));

    loop {
      let dep_count = self.rules[request.rule].result.as_ref().map_or(0, RuleResult::dep_count);
      if request.input_index >= dep_count {
        break;
      }

      let input_rule = match request.input_rule {
        Some(id) => id,
        None => {
          let key = match self.rules[request.rule].result.as_ref() {
            Some(result) => result.dep_at(request.input_index).clone(),
            None => break,
          };
          let Some(id) = self.rule_id_for_key(&key) else {
            self.fail_build(EngineError::UnknownRule(key));
            return;
          };
          request.input_rule = Some(id);
          id
        }
      };

      if !self.scan_rule(input_rule) {
        // The input's own scan is in flight. Deferring on it would add the
        // edge `request.rule -> input_rule` to the chain of waiting scans;
        // if the chain already leads back, that edge closes a cycle.
        if let Some(path) = self.scan_cycle_path(request.rule, input_rule) {
          self.delegate.cycle_detected(&path);
          self.fail_build(EngineError::Cycle(path));
          return;
        }
        if let RuleState::Scanning(record) = &mut self.rules[request.rule].state {
          record.waiting_on = Some(input_rule);
        }
        if let RuleState::Scanning(record) = &mut self.rules[input_rule].state {
          record.deferred_scan_requests.push(request);
        }
        return;
      }

      if !self.demand_rule(input_rule) {
        // The input is running; resume this scan when its task finishes.
        let Some(task_id) = self.rules[input_rule].pending_task() else {
          return;
        };
        if let Some(info) = self.tasks.get_mut(&task_id) {
          info.deferred_scan_requests.push(request);
        }
        return;
      }

      let checked_at = self.rules[request.rule].result.as_ref().map_or(0, |r| r.checked_at);
      let input_built_at = self.rules[input_rule]
        .result
        .as_ref()
        .map_or(u64::MAX, |r| r.built_at);
      if checked_at < input_built_at {
        if self.trace.is_some() {
          let input = self.rules[input_rule].rule.key.display();
          self.emit_trace(request.rule, |t, k, i| {
            t.rule_needs_to_run(k, i, "input-rebuilt", Some(&input))
          });
        }
        self.finish_scan_request(request.rule, RuleState::NeedsToRun);
        return;
      }

      request.input_index += 1;
      request.input_rule = None;
    }

    self.emit_trace(request.rule, |t, k, i| t.rule_is_valid(k, i));
    self.finish_scan_request(request.rule, RuleState::DoesNotNeedToRun);
  }

  /// Move a fully scanned rule out of `Scanning`, waking everything that
  /// was waiting on the verdict.
  fn finish_scan_request(&mut self, rule_id: RuleId, new_state: RuleState) {
    let record = match std::mem::replace(&mut self.rules[rule_id].state, new_state) {
      RuleState::Scanning(record) => record,
      _ => unreachable!("finishing a scan for a rule that is not scanning"),
    };
    self.scan_requests.extend(record.deferred_scan_requests);
    self.input_requests.extend(record.paused_input_requests);
  }

  /// If deferring `from`'s scan on `target` would close a loop of waiting
  /// scans, return the cycle path from the re-entered key back to itself.
  fn scan_cycle_path(&self, from: RuleId, target: RuleId) -> Option<Vec<Key>> {
    if from == target {
      let key = self.rules[from].rule.key.clone();
      return Some(vec![key.clone(), key]);
    }
    let mut path = vec![self.rules[from].rule.key.clone()];
    let mut cursor = target;
    loop {
      path.push(self.rules[cursor].rule.key.clone());
      let RuleState::Scanning(record) = &self.rules[cursor].state else {
        return None;
      };
      match record.waiting_on {
        Some(next) if next == from => {
          path.push(self.rules[from].rule.key.clone());
          return Some(path);
        }
        Some(next) => cursor = next,
        None => return None,
      }
    }
  }

  fn process_input_request(&mut self, request: InputRequest) {
    if !self.scan_rule(request.input_rule) {
      if let RuleState::Scanning(record) = &mut self.rules[request.input_rule].state {
        record.paused_input_requests.push(request);
      }
      return;
    }

    let available = self.demand_rule(request.input_rule);
    if request.task.is_none() {
      return;
    }
    if available {
      self.finished_input_requests.push(request);
    } else if let Some(task_id) = self.rules[request.input_rule].pending_task() {
      if let Some(info) = self.tasks.get_mut(&task_id) {
        info.requested_by.push(request);
      }
    }
  }

  /// Deliver a resolved input to the task that requested it.
  fn process_finished_input(&mut self, request: InputRequest) {
    let Some(task_id) = request.task else { return };
    if !self.tasks.contains_key(&task_id) {
      return;
    }

    let (key, value) = {
      let input = &self.rules[request.input_rule];
      debug_assert!(input.is_complete(self.current_iteration));
      match input.result.as_ref() {
        Some(result) => (input.rule.key.clone(), result.value.clone()),
        None => return,
      }
    };

    if let Some(info) = self.tasks.get_mut(&task_id) {
      info.declared_deps.push(key);
    }
    self.with_task(task_id, |task, iface| {
      task.provide_value(iface, request.input_id, &value)
    });
    self.decrement_wait_count(task_id);
  }

  fn decrement_wait_count(&mut self, task_id: TaskId) {
    let Some(info) = self.tasks.get_mut(&task_id) else { return };
    debug_assert!(info.wait_count > 0);
    info.wait_count -= 1;
    if info.wait_count == 0 {
      self.ready_tasks.push(task_id);
    }
  }

  /// All declared inputs are in; let the task compute.
  fn dispatch_ready_task(&mut self, task_id: TaskId) {
    let Some(info) = self.tasks.get(&task_id) else { return };
    let rule_id = info.for_rule;

    match self.rules[rule_id].state {
      RuleState::InProgressWaiting(pending) => {
        debug_assert_eq!(pending, task_id);
        self.rules[rule_id].state = RuleState::InProgressComputing(task_id);
        self.outstanding_tasks += 1;
      }
      // The task asked for more inputs after `inputs_available`; this is a
      // follow-up delivery round, not a state change.
      RuleState::InProgressComputing(_) => {}
      _ => return,
    }

    self.with_task(task_id, |task, iface| task.inputs_available(iface));
  }

  fn process_finished_task(&mut self, completion: TaskCompletion) {
    let Some(info) = self.tasks.remove(&completion.task) else {
      return;
    };
    let TaskInfo {
      for_rule: rule_id,
      requested_by,
      deferred_scan_requests,
      declared_deps,
      mut discovered_deps,
      ..
    } = info;
    debug_assert!(matches!(self.rules[rule_id].state, RuleState::InProgressComputing(_)));
    self.outstanding_tasks = self.outstanding_tasks.saturating_sub(1);

    discovered_deps.extend(completion.discovered);

    // An unchanged value keeps its original build iteration, so dependants
    // that already consumed it stay clean.
    let current = self.current_iteration;
    let (value, built_at, changed) = match self.rules[rule_id].result.take() {
      Some(prior) if !completion.force_change && prior.value == completion.value => {
        (prior.value, prior.built_at, false)
      }
      _ => (completion.value, current, true),
    };
    let result = RuleResult {
      value,
      built_at,
      checked_at: current,
      declared_deps,
      discovered_deps,
    };
    self.emit_trace(rule_id, |t, k, i| t.task_finished(k, i, changed));

    // Persist before anything can observe the completion.
    let mut db_error = None;
    if let Some(db) = self.db.as_mut() {
      if let Err(err) = db.set_rule_result(&self.rules[rule_id].rule.key, &result) {
        db_error = Some(err);
      }
    }

    self.rules[rule_id].result = Some(result);
    self.rules[rule_id].state = RuleState::Complete;
    if let Some(status) = &self.rules[rule_id].rule.update_status {
      status(StatusKind::IsComplete);
    }

    // Discovered dependencies are not delivered, but they must be brought
    // up to date within this build; a dummy request does that.
    let discovered: Vec<Key> = self.rules[rule_id]
      .result
      .as_ref()
      .map(|r| r.discovered_deps.clone())
      .unwrap_or_default();
    for key in discovered {
      match self.rule_id_for_key(&key) {
        Some(id) => self.input_requests.push(InputRequest {
          task: None,
          input_rule: id,
          input_id: 0,
        }),
        None => {
          self.fail_build(EngineError::UnknownRule(key));
          break;
        }
      }
    }

    self.scan_requests.extend(deferred_scan_requests);
    self.finished_input_requests.extend(requested_by);

    if let Some(err) = db_error {
      self.fail_build(err.into());
    }
  }

  /// Reconstruct the waits-for graph from live tasks and scanning rules,
  /// report the cycle it must contain, and fail the build.
  fn report_request_cycle(&mut self) {
    // Successor direction: an edge `a -> b` means b is waiting on a.
    let mut graph: HashMap<RuleId, Vec<RuleId>> = HashMap::new();
    let mut scan_roots: Vec<RuleId> = Vec::new();

    for info in self.tasks.values() {
      let successors = graph.entry(info.for_rule).or_default();
      for request in &info.requested_by {
        if let Some(waiter) = request.task.and_then(|t| self.tasks.get(&t)) {
          successors.push(waiter.for_rule);
        }
      }
      for request in &info.deferred_scan_requests {
        successors.push(request.rule);
        scan_roots.push(request.rule);
      }
    }

    let mut visited: HashSet<RuleId> = HashSet::new();
    while let Some(rule_id) = scan_roots.pop() {
      if !visited.insert(rule_id) {
        continue;
      }
      let RuleState::Scanning(record) = &self.rules[rule_id].state else {
        continue;
      };
      let mut additions: Vec<RuleId> = Vec::new();
      for request in &record.paused_input_requests {
        if let Some(waiter) = request.task.and_then(|t| self.tasks.get(&t)) {
          additions.push(waiter.for_rule);
        }
      }
      for request in &record.deferred_scan_requests {
        additions.push(request.rule);
        scan_roots.push(request.rule);
      }
      graph.entry(rule_id).or_default().extend(additions);
    }

    let mut ordered: Vec<RuleId> = graph.keys().copied().collect();
    ordered.sort_by(|a, b| self.rules[*a].rule.key.cmp(&self.rules[*b].rule.key));

    let mut cycle: Option<Vec<RuleId>> = None;
    'roots: for &root in &ordered {
      let mut path: Vec<RuleId> = vec![root];
      let mut on_path: HashSet<RuleId> = HashSet::from([root]);
      let mut cursors: Vec<usize> = vec![0];

      while let Some(cursor) = cursors.last_mut() {
        let node = *path.last().unwrap_or(&root);
        let next = graph.get(&node).and_then(|s| s.get(*cursor)).copied();
        match next {
          Some(successor) => {
            *cursor += 1;
            if on_path.contains(&successor) {
              let start = path.iter().position(|&r| r == successor).unwrap_or(0);
              let mut looped = path[start..].to_vec();
              looped.push(successor);
              cycle = Some(looped);
              break 'roots;
            }
            path.push(successor);
            on_path.insert(successor);
            cursors.push(0);
          }
          None => {
            cursors.pop();
            if let Some(popped) = path.pop() {
              on_path.remove(&popped);
            }
          }
        }
      }
    }

    // The successor graph runs dependency -> dependant; reverse to report
    // the path in dependency order. A quiescent engine with live tasks and
    // no cycle would mean a task neither completed nor deferred; fall back
    // to naming every stuck rule.
    let path: Vec<Key> = match cycle {
      Some(mut looped) => {
        looped.reverse();
        looped.iter().map(|&id| self.rules[id].rule.key.clone()).collect()
      }
      None => ordered.iter().map(|&id| self.rules[id].rule.key.clone()).collect(),
    };

    warn!(path = %format_cycle(&path), "cycle detected");
    self.delegate.cycle_detected(&path);
    self.fail_build(EngineError::Cycle(path));
  }

  fn fail_build(&mut self, err: EngineError) {
    if self.build_failed.is_none() {
      self.build_failed = Some(err);
    }
    self.clear_work_queues();
  }

  /// Put every unfinished rule back to its initial state so the engine can
  /// run another build after a failure.
  fn reset_after_failure(&mut self) {
    for info in &mut self.rules {
      match info.state {
        RuleState::Complete => {}
        _ => info.state = RuleState::Incomplete,
      }
    }
  }

  fn set_complete(&mut self, rule_id: RuleId) {
    self.rules[rule_id].state = RuleState::Complete;
    let current = self.current_iteration;
    if let Some(result) = self.rules[rule_id].result.as_mut() {
      result.checked_at = current;
    }
  }

  fn rule_id_for_key(&mut self, key: &Key) -> Option<RuleId> {
    if let Some(&id) = self.rule_ids.get(key) {
      return Some(id);
    }
    let rule = self.delegate.lookup_rule(key)?;
    debug_assert_eq!(&rule.key, key, "delegate returned a rule for a different key");
    Some(self.insert_rule(rule))
  }

  fn insert_rule(&mut self, rule: Rule) -> RuleId {
    assert!(
      !self.rule_ids.contains_key(&rule.key),
      "attempt to register duplicate rule '{}'",
      rule.key
    );
    let id = self.rules.len();
    let mut info = RuleInfo {
      rule,
      state: RuleState::Incomplete,
      result: None,
    };
    if let Some(db) = self.db.as_mut() {
      match db.lookup_rule_result(&info.rule.key) {
        Ok(result) => info.result = result,
        // A database that cannot answer costs a rebuild, nothing more.
        Err(err) => warn!(key = %info.rule.key, %err, "database lookup failed, treating rule as unbuilt"),
      }
    }
    self.rule_ids.insert(info.rule.key.clone(), id);
    self.rules.push(info);
    id
  }

  fn task_rule(&self, task_id: TaskId) -> RuleId {
    match self.tasks.get(&task_id) {
      Some(info) => info.for_rule,
      None => unreachable!("lifecycle call for an unregistered task"),
    }
  }

  /// Run one lifecycle method on a task, temporarily taking it out of the
  /// table so the engine can be borrowed by the callback surface.
  fn with_task(&mut self, task_id: TaskId, f: impl FnOnce(&mut Box<dyn Task>, &mut TaskInterface<'_>)) {
    let Some(mut task) = self.tasks.get_mut(&task_id).and_then(|info| info.task.take()) else {
      return;
    };
    let mut iface = TaskInterface {
      engine: &mut *self,
      task: task_id,
    };
    f(&mut task, &mut iface);
    if let Some(info) = self.tasks.get_mut(&task_id) {
      info.task = Some(task);
    }
  }

  fn emit_trace(&mut self, rule_id: RuleId, f: impl FnOnce(&mut EngineTrace, &str, u64)) {
    if self.trace.is_some() {
      let key = self.rules[rule_id].rule.key.display();
      let iteration = self.current_iteration;
      if let Some(trace) = self.trace.as_mut() {
        f(trace, &key, iteration);
      }
    }
  }
}
