//! The build system: ties the engine, a loaded build description, and the
//! execution queue together.
//!
//! Every engine key the system uses carries a [`BuildKey`] kind, and the
//! engine delegate synthesises the matching rule on demand: target rules
//! fan out to their nodes, node rules stat files or chain to their producer
//! command, and command rules drive the command objects from the
//! description.

use std::cell::RefCell;
use std::collections::HashMap;
use std::path::Path;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use kiln_engine::{
  BuildEngine, EngineDelegate, EngineError, FileDatabase, Key, Rule, Task, TaskInterface, Value,
};
use thiserror::Error;
use tracing::debug;

use crate::buildfile::{
  load_build_description, BuildFileDelegate, LoadError, LoadedBuildFile, PropertyList,
};
use crate::command::{Command, CommandInterface, PhonyTool, ShellTool, Tool};
use crate::doc::Span;
use crate::key::BuildKey;
use crate::node::BuildNode;
use crate::queue::ExecutionQueue;
use crate::value::BuildValue;

/// Shared flags and counters for one build system instance.
///
/// Lives behind an `Arc` so queue jobs can report failures and observe
/// cancellation without touching the single-threaded system state.
pub struct BuildContext {
  cancelled: Arc<AtomicBool>,
  num_errors: AtomicUsize,
  num_failed_commands: AtomicUsize,
}

impl BuildContext {
  fn new(cancelled: Arc<AtomicBool>) -> BuildContext {
    BuildContext {
      cancelled,
      num_errors: AtomicUsize::new(0),
      num_failed_commands: AtomicUsize::new(0),
    }
  }

  pub fn is_cancelled(&self) -> bool {
    self.cancelled.load(Ordering::Relaxed)
  }

  /// Cooperative: pending work observes the flag and reports itself skipped.
  pub fn cancel(&self) {
    self.cancelled.store(true, Ordering::Relaxed);
  }

  /// A command failed; the rest of the build winds down.
  pub fn command_failed(&self) {
    self.num_failed_commands.fetch_add(1, Ordering::Relaxed);
    self.cancel();
  }

  pub(crate) fn count_error(&self) {
    self.num_errors.fetch_add(1, Ordering::Relaxed);
  }

  pub fn num_errors(&self) -> usize {
    self.num_errors.load(Ordering::Relaxed)
  }

  pub fn num_failed_commands(&self) -> usize {
    self.num_failed_commands.load(Ordering::Relaxed)
  }
}

/// Client hooks for a build system instance.
pub trait BuildSystemDelegate {
  /// The name the description's `client` section must declare.
  fn client_name(&self) -> &str;

  /// Schema version for the client check and the database.
  fn client_version(&self) -> u32 {
    0
  }

  /// Client tools take precedence over the builtin `shell` and `phony`.
  fn lookup_tool(&mut self, name: &str) -> Option<Box<dyn Tool>> {
    let _ = name;
    None
  }

  /// Diagnostic sink. `span` is a byte range in the build description when
  /// the message has a source location.
  fn error(&mut self, filename: &str, span: Option<Span>, message: &str);
}

/// State shared between the build system, its engine delegate, and the
/// tasks it spawns.
pub struct SystemShared {
  filename: String,
  delegate: RefCell<Box<dyn BuildSystemDelegate>>,
  file: RefCell<Option<LoadedBuildFile>>,
  /// Nodes that only exist because a stored dependency named them.
  dynamic_nodes: RefCell<HashMap<String, Rc<BuildNode>>>,
  queue: ExecutionQueue,
  context: Arc<BuildContext>,
}

impl SystemShared {
  pub(crate) fn queue(&self) -> &ExecutionQueue {
    &self.queue
  }

  pub(crate) fn context(&self) -> &BuildContext {
    &self.context
  }

  pub(crate) fn context_arc(&self) -> Arc<BuildContext> {
    self.context.clone()
  }

  pub(crate) fn report_error(&self, message: &str) {
    self.context.count_error();
    self.delegate.borrow_mut().error(&self.filename, None, message);
  }

  fn node(&self, name: &str) -> Rc<BuildNode> {
    if let Some(file) = self.file.borrow().as_ref() {
      if let Some(node) = file.nodes.get(name) {
        return node.clone();
      }
    }
    if let Some(node) = self.dynamic_nodes.borrow().get(name) {
      return node.clone();
    }
    let node = BuildNode::new(name);
    self.dynamic_nodes.borrow_mut().insert(name.to_string(), node.clone());
    node
  }

  fn command(&self, name: &str) -> Option<Rc<RefCell<dyn Command>>> {
    self.file.borrow().as_ref().and_then(|file| file.commands.get(name).cloned())
  }
}

/// Builds a target: requests every node in the target's list.
struct TargetTask {
  name: String,
  nodes: Vec<String>,
  shared: Rc<SystemShared>,
  has_missing_input: bool,
}

impl Task for TargetTask {
  fn start(&mut self, engine: &mut TaskInterface<'_>) {
    for (input_id, node) in self.nodes.iter().enumerate() {
      engine.task_needs_input(BuildKey::node(node.clone()).to_key(), input_id);
    }
  }

  fn provide_value(&mut self, _engine: &mut TaskInterface<'_>, input_id: usize, value: &Value) {
    if let Some(BuildValue::MissingInput) = BuildValue::from_value(value) {
      self.has_missing_input = true;
      let node = self.nodes.get(input_id).map(String::as_str).unwrap_or("");
      self
        .shared
        .report_error(&format!("missing input '{node}' and no rule to build it"));
    }
  }

  fn inputs_available(&mut self, engine: &mut TaskInterface<'_>) {
    if self.has_missing_input {
      self
        .shared
        .report_error(&format!("cannot build target '{}' due to missing input", self.name));
      self.shared.context().command_failed();
    }
    engine.task_is_complete(BuildValue::Target.to_value());
  }
}

/// Builds a node nothing produces: stat the file behind it.
struct InputNodeTask {
  node: Rc<BuildNode>,
}

impl Task for InputNodeTask {
  fn start(&mut self, _engine: &mut TaskInterface<'_>) {}

  fn provide_value(&mut self, _engine: &mut TaskInterface<'_>, _input_id: usize, _value: &Value) {}

  fn inputs_available(&mut self, engine: &mut TaskInterface<'_>) {
    if self.node.is_virtual() {
      engine.task_is_complete(BuildValue::VirtualInput.to_value());
      return;
    }
    let info = self.node.file_info();
    if info.is_missing() {
      engine.task_is_complete(BuildValue::MissingInput.to_value());
      return;
    }
    engine.task_is_complete(BuildValue::ExistingInput { info }.to_value());
  }
}

/// Builds a node some command produces: run the producer, then project its
/// value onto this node.
struct ProducedNodeTask {
  node: Rc<BuildNode>,
  shared: Rc<SystemShared>,
  producer: Option<String>,
  result: Option<BuildValue>,
  invalid: bool,
}

impl Task for ProducedNodeTask {
  fn start(&mut self, engine: &mut TaskInterface<'_>) {
    let producers = self.node.producers();
    match producers.as_slice() {
      [producer] => {
        engine.task_needs_input(BuildKey::command(producer.clone()).to_key(), 0);
        self.producer = Some(producer.clone());
      }
      [first, second, ..] => {
        self.shared.report_error(&format!(
          "unable to build node '{}': node is produced by multiple commands (e.g. '{first}' and '{second}')",
          self.node.name()
        ));
        self.invalid = true;
      }
      [] => {
        self.invalid = true;
      }
    }
  }

  fn provide_value(&mut self, _engine: &mut TaskInterface<'_>, _input_id: usize, value: &Value) {
    let Some(decoded) = BuildValue::from_value(value) else {
      self.result = Some(BuildValue::FailedInput);
      return;
    };
    let projected = self
      .producer
      .as_ref()
      .and_then(|name| self.shared.command(name))
      .map(|command| command.borrow().result_for_output(&self.node, &decoded));
    self.result = Some(projected.unwrap_or(BuildValue::FailedInput));
  }

  fn inputs_available(&mut self, engine: &mut TaskInterface<'_>) {
    if self.invalid {
      engine.task_is_complete(BuildValue::FailedInput.to_value());
      return;
    }
    let result = self.result.take().unwrap_or(BuildValue::FailedInput);
    engine.task_is_complete(result.to_value());
  }
}

/// Drives a command object through the engine's task lifecycle.
struct CommandTask {
  command: Rc<RefCell<dyn Command>>,
  shared: Rc<SystemShared>,
}

impl Task for CommandTask {
  fn start(&mut self, engine: &mut TaskInterface<'_>) {
    let shared = self.shared.clone();
    self.command.borrow_mut().start(&mut CommandInterface {
      engine,
      system: &shared,
    });
  }

  fn provide_prior_value(&mut self, engine: &mut TaskInterface<'_>, value: &Value) {
    let Some(decoded) = BuildValue::from_value(value) else {
      return;
    };
    let shared = self.shared.clone();
    self.command.borrow_mut().provide_prior_value(
      &mut CommandInterface {
        engine,
        system: &shared,
      },
      &decoded,
    );
  }

  fn provide_value(&mut self, engine: &mut TaskInterface<'_>, input_id: usize, value: &Value) {
    let decoded = BuildValue::from_value(value).unwrap_or(BuildValue::FailedInput);
    let shared = self.shared.clone();
    self.command.borrow_mut().provide_value(
      &mut CommandInterface {
        engine,
        system: &shared,
      },
      input_id,
      &decoded,
    );
  }

  fn inputs_available(&mut self, engine: &mut TaskInterface<'_>) {
    let shared = self.shared.clone();
    self.command.borrow_mut().inputs_available(&mut CommandInterface {
      engine,
      system: &shared,
    });
  }
}

/// Stand-in for a command that disappeared from the description: produces a
/// value nothing accepts, forcing dependants to rebuild.
struct MissingCommandTask;

impl Task for MissingCommandTask {
  fn start(&mut self, _engine: &mut TaskInterface<'_>) {}

  fn provide_value(&mut self, _engine: &mut TaskInterface<'_>, _input_id: usize, _value: &Value) {}

  fn inputs_available(&mut self, engine: &mut TaskInterface<'_>) {
    engine.task_is_complete_forced(BuildValue::Invalid.to_value());
  }
}

struct SystemEngineDelegate {
  shared: Rc<SystemShared>,
}

impl SystemEngineDelegate {
  fn command_rule(&self, key: &Key, name: &str) -> Rule {
    match self.shared.command(name) {
      Some(command) => {
        let shared = self.shared.clone();
        let task_command = command.clone();
        let rule = Rule::new(key.clone(), move || {
          Box::new(CommandTask {
            command: task_command.clone(),
            shared: shared.clone(),
          })
        });
        rule.validator(move |_, value| match BuildValue::from_value(value) {
          Some(decoded) => command.borrow().is_result_valid(&decoded),
          None => false,
        })
      }
      None => Rule::new(key.clone(), || Box::new(MissingCommandTask)).validator(|_, _| false),
    }
  }

  fn node_rule(&self, key: &Key, name: &str) -> Rule {
    let node = self.shared.node(name);
    if node.producers().is_empty() {
      let task_node = node.clone();
      Rule::new(key.clone(), move || {
        Box::new(InputNodeTask {
          node: task_node.clone(),
        })
      })
      .validator(move |_, value| input_node_is_valid(&node, value))
    } else {
      let shared = self.shared.clone();
      Rule::new(key.clone(), move || {
        Box::new(ProducedNodeTask {
          node: node.clone(),
          shared: shared.clone(),
          producer: None,
          result: None,
          invalid: false,
        })
      })
      .validator(|_, value| {
        // A failure projection may fail differently next time; re-run it.
        !matches!(BuildValue::from_value(value), Some(BuildValue::FailedInput) | None)
      })
    }
  }

  fn target_rule(&self, key: &Key, name: &str) -> Option<Rule> {
    let nodes = {
      let file = self.shared.file.borrow();
      let target = file.as_ref()?.targets.iter().find(|t| t.name == name)?;
      target.nodes.clone()
    };
    let shared = self.shared.clone();
    let target_name = name.to_string();
    Some(
      Rule::new(key.clone(), move || {
        Box::new(TargetTask {
          name: target_name.clone(),
          nodes: nodes.clone(),
          shared: shared.clone(),
          has_missing_input: false,
        })
      })
      // Targets are cheap fan-out; always rebuild them.
      .validator(|_, _| false),
    )
  }
}

impl EngineDelegate for SystemEngineDelegate {
  fn lookup_rule(&mut self, key: &Key) -> Option<Rule> {
    match BuildKey::from_key(key)? {
      BuildKey::Command(name) => Some(self.command_rule(key, &name)),
      BuildKey::Node(name) => Some(self.node_rule(key, &name)),
      BuildKey::Target(name) => self.target_rule(key, &name),
    }
  }

  fn cycle_detected(&mut self, path: &[Key]) {
    let described: Vec<String> = path
      .iter()
      .map(|key| {
        BuildKey::from_key(key)
          .map(|k| k.describe())
          .unwrap_or_else(|| key.display())
      })
      .collect();
    self
      .shared
      .report_error(&format!("cycle detected while building: {}", described.join(" -> ")));
  }
}

fn input_node_is_valid(node: &BuildNode, value: &Value) -> bool {
  let Some(decoded) = BuildValue::from_value(value) else {
    return false;
  };
  if node.is_virtual() {
    return matches!(decoded, BuildValue::VirtualInput);
  }
  let BuildValue::ExistingInput { info } = decoded else {
    return false;
  };
  let current = node.file_info();
  !current.is_missing() && current == info
}

/// Bridges the loader's delegate onto the system delegate, adding the
/// builtin tools and the client name/version check.
struct SystemFileDelegate<'a> {
  shared: &'a SystemShared,
}

impl BuildFileDelegate for SystemFileDelegate<'_> {
  fn configure_client(&mut self, name: &str, version: u32, _properties: &PropertyList) -> bool {
    let delegate = self.shared.delegate.borrow();
    name == delegate.client_name() && version == delegate.client_version()
  }

  fn lookup_tool(&mut self, name: &str) -> Option<Box<dyn Tool>> {
    if let Some(tool) = self.shared.delegate.borrow_mut().lookup_tool(name) {
      return Some(tool);
    }
    match name {
      "shell" => Some(Box::new(ShellTool)),
      "phony" => Some(Box::new(PhonyTool)),
      _ => None,
    }
  }

  fn error(&mut self, filename: &str, span: Span, message: &str) {
    self.shared.delegate.borrow_mut().error(filename, Some(span), message);
  }
}

#[derive(Debug, Clone, Copy)]
pub struct BuildSystemConfig {
  /// Worker lanes for the execution queue; 1 means strictly serial.
  pub lanes: usize,
}

impl Default for BuildSystemConfig {
  fn default() -> Self {
    BuildSystemConfig {
      lanes: crate::queue::default_lane_count(usize::MAX),
    }
  }
}

#[derive(Debug, Error)]
pub enum BuildSystemError {
  #[error(transparent)]
  Load(#[from] LoadError),

  #[error(transparent)]
  Engine(#[from] EngineError),

  #[error("no rule to build {0}")]
  UnknownKey(String),

  #[error("no targets declared in '{0}'")]
  NoTargets(String),

  #[error("build description has not been loaded")]
  NotLoaded,
}

/// Error and failure tallies for a finished build.
#[derive(Debug, Clone, Copy, Default)]
pub struct BuildResults {
  pub num_errors: usize,
  pub num_failed_commands: usize,
}

impl BuildResults {
  pub fn success(&self) -> bool {
    self.num_errors == 0 && self.num_failed_commands == 0
  }
}

pub struct BuildSystem {
  engine: BuildEngine,
  shared: Rc<SystemShared>,
}

impl BuildSystem {
  pub fn new(
    delegate: Box<dyn BuildSystemDelegate>,
    description_filename: impl Into<String>,
    config: BuildSystemConfig,
  ) -> BuildSystem {
    let cancelled = Arc::new(AtomicBool::new(false));
    let context = Arc::new(BuildContext::new(cancelled.clone()));
    let queue = ExecutionQueue::with_cancel_flag(config.lanes, cancelled);
    let shared = Rc::new(SystemShared {
      filename: description_filename.into(),
      delegate: RefCell::new(delegate),
      file: RefCell::new(None),
      dynamic_nodes: RefCell::new(HashMap::new()),
      queue,
      context,
    });
    let engine = BuildEngine::new(SystemEngineDelegate {
      shared: shared.clone(),
    });
    BuildSystem { engine, shared }
  }

  /// Parse and adopt the build description. Must precede `build`.
  pub fn load(&mut self, source: &str) -> Result<(), LoadError> {
    let filename = self.shared.filename.clone();
    let mut bridge = SystemFileDelegate {
      shared: &self.shared,
    };
    let file = load_build_description(source, &filename, &mut bridge)?;
    *self.shared.file.borrow_mut() = Some(file);
    Ok(())
  }

  /// Attach the persistent database at `path`. Must precede `build`.
  pub fn attach_db(&mut self, path: &Path) -> Result<(), BuildSystemError> {
    let version = self.shared.delegate.borrow().client_version();
    let db = FileDatabase::open(path, version).map_err(EngineError::from)?;
    self.engine.attach_db(Box::new(db))?;
    Ok(())
  }

  pub fn enable_tracing(&mut self, path: &Path) -> Result<(), BuildSystemError> {
    self.engine.enable_tracing(path)?;
    Ok(())
  }

  /// The shared counters and cancellation flag.
  pub fn context(&self) -> Arc<BuildContext> {
    self.shared.context_arc()
  }

  /// Build a target; an empty name means the default (first declared)
  /// target. Returns the error/failure tallies on a completed build.
  pub fn build(&mut self, target: &str) -> Result<BuildResults, BuildSystemError> {
    let target_name = {
      let file = self.shared.file.borrow();
      let Some(file) = file.as_ref() else {
        return Err(BuildSystemError::NotLoaded);
      };
      if target.is_empty() {
        match file.default_target() {
          Some(name) => name.to_string(),
          None => return Err(BuildSystemError::NoTargets(self.shared.filename.clone())),
        }
      } else {
        target.to_string()
      }
    };

    debug!(target = %target_name, "building");
    let key = BuildKey::target(&target_name);
    match self.engine.build(key.to_key()) {
      Ok(_) => {}
      Err(EngineError::UnknownRule(unknown)) => {
        let described = BuildKey::from_key(&unknown)
          .map(|k| k.describe())
          .unwrap_or_else(|| unknown.display());
        return Err(BuildSystemError::UnknownKey(described));
      }
      Err(err) => return Err(err.into()),
    }
    self.shared.queue().wait_idle();

    Ok(BuildResults {
      num_errors: self.shared.context.num_errors(),
      num_failed_commands: self.shared.context.num_failed_commands(),
    })
  }
}
