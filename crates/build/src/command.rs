//! Tools and commands: the configurable objects behind the build
//! description, and the reusable external-command body that turns input
//! files into output files through a child process.

use std::cell::RefCell;
use std::path::Path;
use std::rc::Rc;
use std::sync::Arc;

use kiln_engine::deps::{parse_makefile_deps, ParseEvents};
use kiln_engine::{DeferredCompletion, TaskInterface};
use sha2::{Digest, Sha256};
use tracing::{error, info};

use crate::fileinfo::FileInfo;
use crate::key::BuildKey;
use crate::node::BuildNode;
use crate::queue::{QueueJob, QueueJobContext};
use crate::system::{BuildContext, SystemShared};
use crate::value::BuildValue;

/// A scalar-or-list attribute value from the build description.
#[derive(Debug, Clone, Copy)]
pub enum AttrValue<'a> {
  Scalar(&'a str),
  List(&'a [String]),
}

/// Collects diagnostics raised while configuring a tool, node, or command;
/// the loader drains them into its delegate with the right source span.
#[derive(Default)]
pub struct ConfigureCtx {
  errors: Vec<String>,
}

impl ConfigureCtx {
  pub fn new() -> ConfigureCtx {
    ConfigureCtx::default()
  }

  pub fn error(&mut self, message: impl Into<String>) {
    self.errors.push(message.into());
  }

  pub(crate) fn take_errors(&mut self) -> Vec<String> {
    std::mem::take(&mut self.errors)
  }
}

/// A tool definition: configured by the `tools` section, and the factory
/// for the commands that name it.
pub trait Tool {
  fn name(&self) -> &str;

  fn configure_attribute(&mut self, ctx: &mut ConfigureCtx, name: &str, value: AttrValue<'_>) -> bool;

  fn create_command(&self, name: &str) -> Rc<RefCell<dyn Command>>;
}

/// A command from the build description.
///
/// Configuration methods run at load time; the execution methods mirror the
/// engine's task lifecycle and run on the engine thread.
pub trait Command {
  fn name(&self) -> &str;

  fn configure_description(&mut self, description: &str);

  fn configure_inputs(&mut self, inputs: Vec<Rc<BuildNode>>);

  fn configure_outputs(&mut self, outputs: Vec<Rc<BuildNode>>);

  fn configure_attribute(&mut self, ctx: &mut ConfigureCtx, name: &str, value: AttrValue<'_>) -> bool;

  /// Project this command's value onto one of its output nodes.
  fn result_for_output(&self, node: &BuildNode, value: &BuildValue) -> BuildValue;

  fn is_result_valid(&self, value: &BuildValue) -> bool;

  fn start(&mut self, cmd: &mut CommandInterface<'_, '_>);

  fn provide_prior_value(&mut self, _cmd: &mut CommandInterface<'_, '_>, _value: &BuildValue) {}

  fn provide_value(&mut self, cmd: &mut CommandInterface<'_, '_>, input_id: usize, value: &BuildValue);

  fn inputs_available(&mut self, cmd: &mut CommandInterface<'_, '_>);
}

/// The services a command sees during execution: the engine's task surface
/// plus the execution queue and shared build state.
pub struct CommandInterface<'a, 'b> {
  pub(crate) engine: &'a mut TaskInterface<'b>,
  pub(crate) system: &'a SystemShared,
}

impl CommandInterface<'_, '_> {
  pub fn task_needs_input(&mut self, key: &BuildKey, input_id: usize) {
    self.engine.task_needs_input(key.to_key(), input_id);
  }

  pub fn task_is_complete(&mut self, value: &BuildValue) {
    self.engine.task_is_complete(value.to_value());
  }

  /// Completion handle for work submitted to the execution queue.
  pub fn defer_completion(&mut self) -> PendingCommandResult {
    PendingCommandResult {
      inner: self.engine.defer(),
    }
  }

  pub fn add_job(&self, job: QueueJob) {
    self.system.queue().add_job(job);
  }

  pub fn is_cancelled(&self) -> bool {
    self.system.context().is_cancelled()
  }

  pub fn context(&self) -> Arc<BuildContext> {
    self.system.context_arc()
  }

  pub fn report_error(&self, message: &str) {
    self.system.report_error(message);
  }
}

/// Completes a command's engine task from a queue lane.
pub struct PendingCommandResult {
  inner: DeferredCompletion,
}

impl PendingCommandResult {
  pub fn discovered_dependency(&mut self, key: &BuildKey) {
    self.inner.discovered_dependency(key.to_key());
  }

  pub fn complete(self, value: &BuildValue) {
    self.inner.complete(value.to_value());
  }
}

/// Fold a byte string into the 64-bit signature space.
fn hash_string(bytes: &[u8]) -> u64 {
  let digest = Sha256::digest(bytes);
  let mut word = [0u8; 8];
  word.copy_from_slice(&digest[..8]);
  u64::from_le_bytes(word)
}

type CommandBody = Box<dyn FnOnce(&QueueJobContext<'_>, &mut PendingCommandResult) -> bool + Send>;

/// Reusable body for commands that run a child process over file nodes.
///
/// Concrete commands embed this and supply the process invocation; the base
/// handles input bookkeeping, skip propagation, output stamping, and the
/// queue hand-off.
pub struct ExternalCommand {
  name: String,
  description: String,
  inputs: Vec<Rc<BuildNode>>,
  outputs: Vec<Rc<BuildNode>>,
  should_skip: bool,
  has_missing_input: bool,
}

impl ExternalCommand {
  pub fn new(name: impl Into<String>) -> ExternalCommand {
    ExternalCommand {
      name: name.into(),
      description: String::new(),
      inputs: Vec::new(),
      outputs: Vec::new(),
      should_skip: false,
      has_missing_input: false,
    }
  }

  pub fn name(&self) -> &str {
    &self.name
  }

  pub fn description(&self) -> &str {
    &self.description
  }

  pub fn set_description(&mut self, description: &str) {
    self.description = description.to_string();
  }

  pub fn set_inputs(&mut self, inputs: Vec<Rc<BuildNode>>) {
    self.inputs = inputs;
  }

  pub fn set_outputs(&mut self, outputs: Vec<Rc<BuildNode>>) {
    self.outputs = outputs;
  }

  pub fn outputs(&self) -> &[Rc<BuildNode>] {
    &self.outputs
  }

  /// XOR of the input and output name hashes. Concrete commands fold in
  /// whatever else identifies their invocation.
  pub fn base_signature(&self) -> u64 {
    let mut signature = 0;
    for node in self.inputs.iter().chain(&self.outputs) {
      signature ^= hash_string(node.name().as_bytes());
    }
    signature
  }

  /// A stored result is valid iff it was a success, the signature matches,
  /// and every non-virtual output still stamps the same.
  pub fn is_result_valid(&self, signature: u64, value: &BuildValue) -> bool {
    let BuildValue::SuccessfulCommand {
      outputs,
      signature: stored,
    } = value
    else {
      return false;
    };
    if *stored != signature {
      return false;
    }
    for (index, node) in self.outputs.iter().enumerate() {
      if node.is_virtual() {
        continue;
      }
      let current = node.file_info();
      if current.is_missing() {
        return false;
      }
      if outputs.get(index) != Some(&current) {
        return false;
      }
    }
    true
  }

  pub fn result_for_output(&self, node: &BuildNode, value: &BuildValue) -> BuildValue {
    // A failed or skipped producer poisons every output.
    if value.is_failed_or_skipped() {
      return BuildValue::FailedInput;
    }
    let BuildValue::SuccessfulCommand { outputs, .. } = value else {
      return BuildValue::FailedInput;
    };
    if node.is_virtual() {
      return BuildValue::VirtualInput;
    }
    let stamp = self
      .outputs
      .iter()
      .position(|candidate| candidate.name() == node.name())
      .and_then(|index| outputs.get(index));
    match stamp {
      Some(info) if !info.is_missing() => BuildValue::ExistingInput { info: *info },
      Some(_) => BuildValue::MissingInput,
      None => BuildValue::FailedInput,
    }
  }

  pub fn start(&mut self, cmd: &mut CommandInterface<'_, '_>) {
    self.should_skip = false;
    self.has_missing_input = false;
    for (input_id, node) in self.inputs.iter().enumerate() {
      cmd.task_needs_input(&BuildKey::node(node.name()), input_id);
    }
  }

  pub fn provide_value(&mut self, cmd: &mut CommandInterface<'_, '_>, input_id: usize, value: &BuildValue) {
    match value {
      BuildValue::ExistingInput { .. } | BuildValue::VirtualInput => {}
      BuildValue::MissingInput => {
        self.should_skip = true;
        self.has_missing_input = true;
        let name = self
          .inputs
          .get(input_id)
          .map(|n| n.name().to_string())
          .unwrap_or_default();
        cmd.report_error(&format!("missing input '{name}' and no rule to build it"));
      }
      _ => {
        self.should_skip = true;
      }
    }
  }

  /// Skip or run: dispatches `body` onto the execution queue unless a bad
  /// input or cancellation already decided the outcome.
  pub fn execute(&mut self, cmd: &mut CommandInterface<'_, '_>, signature: u64, body: CommandBody) {
    if cmd.is_cancelled() {
      cmd.task_is_complete(&BuildValue::SkippedCommand);
      return;
    }
    if self.should_skip {
      if self.has_missing_input {
        let output = self
          .outputs
          .first()
          .map(|n| n.name().to_string())
          .unwrap_or_else(|| self.name.clone());
        cmd.report_error(&format!("cannot build '{output}' due to missing input"));
        cmd.context().command_failed();
      }
      cmd.task_is_complete(&BuildValue::SkippedCommand);
      return;
    }

    let output_stamps: Vec<(String, bool)> = self
      .outputs
      .iter()
      .map(|node| (node.name().to_string(), node.is_virtual()))
      .collect();
    let context = cmd.context();
    let mut pending = cmd.defer_completion();

    cmd.add_job(QueueJob::new(self.name.clone(), move |job| {
      if job.is_cancelled() {
        pending.complete(&BuildValue::SkippedCommand);
        return;
      }
      if !body(job, &mut pending) {
        context.command_failed();
        pending.complete(&BuildValue::FailedCommand);
        return;
      }
      let outputs = output_stamps
        .iter()
        .map(|(name, is_virtual)| {
          if *is_virtual {
            FileInfo::default()
          } else {
            FileInfo::for_path(Path::new(name))
          }
        })
        .collect();
      pending.complete(&BuildValue::SuccessfulCommand { outputs, signature });
    }));
  }
}

/// Feed a makefile-deps file into the pending completion as discovered
/// node dependencies.
fn ingest_deps_file(path: &str, pending: &mut PendingCommandResult) -> bool {
  let buffer = match std::fs::read(path) {
    Ok(buffer) => buffer,
    Err(err) => {
      error!(path, %err, "unable to read dependencies file");
      return false;
    }
  };

  struct Ingest<'a> {
    pending: &'a mut PendingCommandResult,
    path: &'a str,
    errors: usize,
  }

  impl ParseEvents for Ingest<'_> {
    fn rule_start(&mut self, _target: &[u8]) {}

    fn rule_dependency(&mut self, prereq: &[u8]) {
      let name = String::from_utf8_lossy(prereq).into_owned();
      self.pending.discovered_dependency(&BuildKey::node(name));
    }

    fn rule_end(&mut self) {}

    fn error(&mut self, message: &str, offset: usize) {
      error!(path = self.path, offset, msg = message, "error reading dependency file");
      self.errors += 1;
    }
  }

  let mut ingest = Ingest {
    pending,
    path,
    errors: 0,
  };
  parse_makefile_deps(&buffer, &mut ingest);
  ingest.errors == 0
}

/// Command that runs a shell command line (or explicit argv).
///
/// Attributes: `args` (scalar runs through `/bin/sh -c`, a list is used as
/// argv verbatim) and `deps` (path of a makefile-deps file the process
/// writes, parsed after a successful run).
pub struct ShellCommand {
  base: ExternalCommand,
  args: Vec<String>,
  deps_path: Option<String>,
}

impl ShellCommand {
  pub fn new(name: impl Into<String>) -> ShellCommand {
    ShellCommand {
      base: ExternalCommand::new(name),
      args: Vec::new(),
      deps_path: None,
    }
  }

  fn signature(&self) -> u64 {
    self
      .args
      .iter()
      .fold(self.base.base_signature(), |signature, arg| {
        signature ^ hash_string(arg.as_bytes())
      })
  }
}

impl Command for ShellCommand {
  fn name(&self) -> &str {
    self.base.name()
  }

  fn configure_description(&mut self, description: &str) {
    self.base.set_description(description);
  }

  fn configure_inputs(&mut self, inputs: Vec<Rc<BuildNode>>) {
    self.base.set_inputs(inputs);
  }

  fn configure_outputs(&mut self, outputs: Vec<Rc<BuildNode>>) {
    self.base.set_outputs(outputs);
  }

  fn configure_attribute(&mut self, ctx: &mut ConfigureCtx, name: &str, value: AttrValue<'_>) -> bool {
    match (name, value) {
      ("args", AttrValue::Scalar(command_line)) => {
        self.args = vec![
          "/bin/sh".to_string(),
          "-c".to_string(),
          command_line.to_string(),
        ];
        true
      }
      ("args", AttrValue::List(argv)) => {
        self.args = argv.to_vec();
        true
      }
      ("deps", AttrValue::Scalar(path)) => {
        self.deps_path = Some(path.to_string());
        true
      }
      _ => {
        ctx.error(format!("unexpected attribute: '{name}'"));
        false
      }
    }
  }

  fn result_for_output(&self, node: &BuildNode, value: &BuildValue) -> BuildValue {
    self.base.result_for_output(node, value)
  }

  fn is_result_valid(&self, value: &BuildValue) -> bool {
    self.base.is_result_valid(self.signature(), value)
  }

  fn start(&mut self, cmd: &mut CommandInterface<'_, '_>) {
    self.base.start(cmd);
  }

  fn provide_value(&mut self, cmd: &mut CommandInterface<'_, '_>, input_id: usize, value: &BuildValue) {
    self.base.provide_value(cmd, input_id, value);
  }

  fn inputs_available(&mut self, cmd: &mut CommandInterface<'_, '_>) {
    let args = self.args.clone();
    let description = self.base.description().to_string();
    let deps_path = self.deps_path.clone();
    let signature = self.signature();

    self.base.execute(
      cmd,
      signature,
      Box::new(move |job, pending| {
        if description.is_empty() {
          info!(command = %args.join(" "), "running");
        } else {
          info!("{description}");
        }
        if !job.execute_process(&args) {
          return false;
        }
        match &deps_path {
          Some(path) => ingest_deps_file(path, pending),
          None => true,
        }
      }),
    );
  }
}

pub struct ShellTool;

impl Tool for ShellTool {
  fn name(&self) -> &str {
    "shell"
  }

  fn configure_attribute(&mut self, ctx: &mut ConfigureCtx, name: &str, _value: AttrValue<'_>) -> bool {
    ctx.error(format!("unexpected attribute: '{name}'"));
    false
  }

  fn create_command(&self, name: &str) -> Rc<RefCell<dyn Command>> {
    Rc::new(RefCell::new(ShellCommand::new(name)))
  }
}

/// Command with no body: exists to group nodes or anchor virtual outputs.
pub struct PhonyCommand {
  base: ExternalCommand,
}

impl PhonyCommand {
  pub fn new(name: impl Into<String>) -> PhonyCommand {
    PhonyCommand {
      base: ExternalCommand::new(name),
    }
  }
}

impl Command for PhonyCommand {
  fn name(&self) -> &str {
    self.base.name()
  }

  fn configure_description(&mut self, description: &str) {
    self.base.set_description(description);
  }

  fn configure_inputs(&mut self, inputs: Vec<Rc<BuildNode>>) {
    self.base.set_inputs(inputs);
  }

  fn configure_outputs(&mut self, outputs: Vec<Rc<BuildNode>>) {
    self.base.set_outputs(outputs);
  }

  fn configure_attribute(&mut self, ctx: &mut ConfigureCtx, name: &str, _value: AttrValue<'_>) -> bool {
    ctx.error(format!("unexpected attribute: '{name}'"));
    false
  }

  fn result_for_output(&self, node: &BuildNode, value: &BuildValue) -> BuildValue {
    self.base.result_for_output(node, value)
  }

  fn is_result_valid(&self, value: &BuildValue) -> bool {
    self.base.is_result_valid(self.base.base_signature(), value)
  }

  fn start(&mut self, cmd: &mut CommandInterface<'_, '_>) {
    self.base.start(cmd);
  }

  fn provide_value(&mut self, cmd: &mut CommandInterface<'_, '_>, input_id: usize, value: &BuildValue) {
    self.base.provide_value(cmd, input_id, value);
  }

  fn inputs_available(&mut self, cmd: &mut CommandInterface<'_, '_>) {
    let signature = self.base.base_signature();
    self.base.execute(cmd, signature, Box::new(|_job, _pending| true));
  }
}

pub struct PhonyTool;

impl Tool for PhonyTool {
  fn name(&self) -> &str {
    "phony"
  }

  fn configure_attribute(&mut self, ctx: &mut ConfigureCtx, name: &str, _value: AttrValue<'_>) -> bool {
    ctx.error(format!("unexpected attribute: '{name}'"));
    false
  }

  fn create_command(&self, name: &str) -> Rc<RefCell<dyn Command>> {
    Rc::new(RefCell::new(PhonyCommand::new(name)))
  }
}

#[cfg(test)]
mod tests {
  use std::fs;

  use tempfile::TempDir;

  use super::*;

  fn command_with_nodes(inputs: &[&str], outputs: &[&str]) -> ShellCommand {
    let mut command = ShellCommand::new("test");
    command.configure_inputs(inputs.iter().map(|n| BuildNode::new(*n)).collect());
    command.configure_outputs(outputs.iter().map(|n| BuildNode::new(*n)).collect());
    command
  }

  #[test]
  fn signature_covers_nodes_and_args() {
    let mut ctx = ConfigureCtx::new();

    let mut a = command_with_nodes(&["in"], &["out"]);
    assert!(a.configure_attribute(&mut ctx, "args", AttrValue::Scalar("cp in out")));
    let mut b = command_with_nodes(&["in"], &["out"]);
    assert!(b.configure_attribute(&mut ctx, "args", AttrValue::Scalar("cp in out")));
    assert_eq!(a.signature(), b.signature());

    // A different command line changes the signature.
    assert!(b.configure_attribute(&mut ctx, "args", AttrValue::Scalar("cp -f in out")));
    assert_ne!(a.signature(), b.signature());

    // As does a different output set.
    let c = command_with_nodes(&["in"], &["elsewhere"]);
    assert_ne!(a.signature(), c.signature());
  }

  #[test]
  fn unexpected_attributes_are_rejected() {
    let mut ctx = ConfigureCtx::new();
    let mut command = ShellCommand::new("test");
    assert!(!command.configure_attribute(&mut ctx, "bogus", AttrValue::Scalar("x")));
    assert_eq!(ctx.take_errors(), ["unexpected attribute: 'bogus'"]);
  }

  #[test]
  fn validity_requires_success_matching_signature_and_stamps() {
    let temp = TempDir::new().unwrap();
    let out_path = temp.path().join("out");
    fs::write(&out_path, b"output").unwrap();
    let out_name = out_path.to_string_lossy().into_owned();

    let mut ctx = ConfigureCtx::new();
    let mut command = command_with_nodes(&["in"], &[&out_name]);
    assert!(command.configure_attribute(&mut ctx, "args", AttrValue::Scalar("touch out")));
    let signature = command.signature();

    let good = BuildValue::SuccessfulCommand {
      outputs: vec![FileInfo::for_path(&out_path)],
      signature,
    };
    assert!(command.is_result_valid(&good));

    // Any non-success kind is stale.
    assert!(!command.is_result_valid(&BuildValue::FailedCommand));
    assert!(!command.is_result_valid(&BuildValue::SkippedCommand));

    // A stale signature is stale.
    let resigned = BuildValue::SuccessfulCommand {
      outputs: vec![FileInfo::for_path(&out_path)],
      signature: signature ^ 1,
    };
    assert!(!command.is_result_valid(&resigned));

    // A modified output is stale.
    fs::write(&out_path, b"tampered with").unwrap();
    assert!(!command.is_result_valid(&good));

    // A missing output is stale.
    fs::remove_file(&out_path).unwrap();
    assert!(!command.is_result_valid(&good));
  }

  #[test]
  fn virtual_outputs_are_ignored_by_validity() {
    let command = command_with_nodes(&[], &["<group>"]);
    let value = BuildValue::SuccessfulCommand {
      outputs: vec![FileInfo::default()],
      signature: command.signature(),
    };
    assert!(command.is_result_valid(&value));
  }

  #[test]
  fn output_projection() {
    let temp = TempDir::new().unwrap();
    let out_path = temp.path().join("out");
    fs::write(&out_path, b"x").unwrap();
    let out_name = out_path.to_string_lossy().into_owned();
    let info = FileInfo::for_path(&out_path);

    let command = command_with_nodes(&["in"], &[&out_name, "<marker>"]);
    let value = BuildValue::SuccessfulCommand {
      outputs: vec![info, FileInfo::default()],
      signature: 0,
    };

    let file_node = BuildNode::new(out_name.as_str());
    assert_eq!(
      command.result_for_output(&file_node, &value),
      BuildValue::ExistingInput { info }
    );

    let virtual_node = BuildNode::new("<marker>");
    assert_eq!(
      command.result_for_output(&virtual_node, &value),
      BuildValue::VirtualInput
    );

    // Failed and skipped commands poison their outputs.
    assert_eq!(
      command.result_for_output(&file_node, &BuildValue::FailedCommand),
      BuildValue::FailedInput
    );
    assert_eq!(
      command.result_for_output(&file_node, &BuildValue::SkippedCommand),
      BuildValue::FailedInput
    );
  }
}
