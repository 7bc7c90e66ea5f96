//! Loader mapping a build-description document onto tools, targets, nodes,
//! and commands.
//!
//! The document's top-level sections come in a fixed order, each optional
//! except `client`: `client`, `tools`, `targets`, `nodes`, `commands`.
//! Errors are reported to the delegate with the source span and counted;
//! parsing continues where feasible, and the load fails if anything was
//! counted.

use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;

use thiserror::Error;
use tracing::debug;

use crate::command::{AttrValue, Command, ConfigureCtx, Tool};
use crate::doc::{parse_document, DocEntry, DocValue, Span};
use crate::node::BuildNode;

pub type PropertyList = Vec<(String, String)>;

/// Hooks the loader needs from its host.
pub trait BuildFileDelegate {
  /// The `client` section was parsed; returning false rejects the whole
  /// description (wrong client, incompatible version).
  fn configure_client(&mut self, name: &str, version: u32, properties: &PropertyList) -> bool;

  /// Instantiate a tool by name.
  fn lookup_tool(&mut self, name: &str) -> Option<Box<dyn Tool>>;

  fn error(&mut self, filename: &str, span: Span, message: &str);
}

/// A named sequence of top-level nodes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
  pub name: String,
  pub nodes: Vec<String>,
}

/// Everything a successful load produces.
pub struct LoadedBuildFile {
  pub client_name: String,
  pub tools: HashMap<String, Box<dyn Tool>>,
  /// Targets in declaration order; the first is the default.
  pub targets: Vec<Target>,
  pub nodes: HashMap<String, Rc<BuildNode>>,
  pub commands: HashMap<String, Rc<RefCell<dyn Command>>>,
}

impl fmt::Debug for LoadedBuildFile {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("LoadedBuildFile")
      .field("client_name", &self.client_name)
      .field("tools", &self.tools.keys().collect::<Vec<_>>())
      .field("targets", &self.targets)
      .field("nodes", &self.nodes.keys().collect::<Vec<_>>())
      .field("commands", &self.commands.keys().collect::<Vec<_>>())
      .finish()
  }
}

impl LoadedBuildFile {
  pub fn default_target(&self) -> Option<&str> {
    self.targets.first().map(|t| t.name.as_str())
  }
}

#[derive(Debug, Error)]
#[error("build description contained {num_errors} error(s)")]
pub struct LoadError {
  pub num_errors: usize,
}

pub fn load_build_description(
  source: &str,
  filename: &str,
  delegate: &mut dyn BuildFileDelegate,
) -> Result<LoadedBuildFile, LoadError> {
  let document = match parse_document(source) {
    Ok(document) => document,
    Err(err) => {
      delegate.error(filename, err.span, &err.message);
      return Err(LoadError { num_errors: 1 });
    }
  };

  let mut loader = Loader {
    filename,
    delegate,
    num_errors: 0,
    client_name: String::new(),
    tools: HashMap::new(),
    targets: Vec::new(),
    nodes: HashMap::new(),
    commands: HashMap::new(),
  };
  loader.load(&document.root);

  if loader.num_errors > 0 {
    return Err(LoadError {
      num_errors: loader.num_errors,
    });
  }
  Ok(LoadedBuildFile {
    client_name: loader.client_name,
    tools: loader.tools,
    targets: loader.targets,
    nodes: loader.nodes,
    commands: loader.commands,
  })
}

struct Loader<'a> {
  filename: &'a str,
  delegate: &'a mut dyn BuildFileDelegate,
  num_errors: usize,
  client_name: String,
  tools: HashMap<String, Box<dyn Tool>>,
  targets: Vec<Target>,
  nodes: HashMap<String, Rc<BuildNode>>,
  commands: HashMap<String, Rc<RefCell<dyn Command>>>,
}

impl Loader<'_> {
  fn error(&mut self, span: Span, message: &str) {
    self.num_errors += 1;
    self.delegate.error(self.filename, span, message);
  }

  fn load(&mut self, root: &[DocEntry]) {
    let mut sections = root.iter().peekable();

    match sections.next() {
      Some(entry) if entry.key.value == "client" => {
        let DocValue::Map(attrs) = &entry.value else {
          self.error(entry.key.span, "unexpected 'client' value (expected map)");
          return;
        };
        if !self.parse_client(entry.key.span, attrs) {
          return;
        }
      }
      Some(entry) => {
        self.error(entry.key.span, "expected initial section 'client'");
        return;
      }
      None => {
        self.error(Span::default(), "expected initial section 'client'");
        return;
      }
    }

    if let Some(attrs) = take_section(&mut sections, "tools", self) {
      self.parse_tools(&attrs);
    }
    if let Some(attrs) = take_section(&mut sections, "targets", self) {
      self.parse_targets(&attrs);
    }
    if let Some(attrs) = take_section(&mut sections, "nodes", self) {
      self.parse_nodes(&attrs);
    }
    if let Some(attrs) = take_section(&mut sections, "commands", self) {
      self.parse_commands(&attrs);
    }

    for entry in sections {
      self.error(entry.key.span, "unexpected trailing top-level section");
    }
  }

  fn parse_client(&mut self, section_span: Span, attrs: &[DocEntry]) -> bool {
    let mut name = String::new();
    let mut version = 0u32;
    let mut properties: PropertyList = Vec::new();

    for attr in attrs {
      let DocValue::Scalar(value) = &attr.value else {
        self.error(attr.key.span, "invalid value type in 'client' map");
        return false;
      };
      match attr.key.value.as_str() {
        "name" => name = value.value.clone(),
        "version" => match value.value.parse::<u32>() {
          Ok(parsed) => version = parsed,
          Err(_) => self.error(value.span, "invalid version number in 'client' map"),
        },
        _ => properties.push((attr.key.value.clone(), value.value.clone())),
      }
    }

    if !self.delegate.configure_client(&name, version, &properties) {
      self.error(section_span, "unable to configure client");
      return false;
    }
    self.client_name = name;
    true
  }

  fn parse_tools(&mut self, attrs: &[DocEntry]) {
    for entry in attrs {
      let DocValue::Map(tool_attrs) = &entry.value else {
        self.error(entry.key.span, "invalid value type in 'tools' map");
        continue;
      };

      let Some(mut tool) = self.take_tool(&entry.key.value, entry.key.span) else {
        continue;
      };
      for attr in tool_attrs {
        self.configure_attribute(
          &mut |ctx, name, value| tool.configure_attribute(ctx, name, value),
          attr,
        );
      }
      self.tools.insert(entry.key.value.clone(), tool);
    }
  }

  fn parse_targets(&mut self, attrs: &[DocEntry]) {
    for entry in attrs {
      let DocValue::List(items) = &entry.value else {
        self.error(entry.key.span, "invalid value type in 'targets' map");
        continue;
      };

      let mut nodes = Vec::new();
      for item in items {
        self.get_or_create_node(&item.value);
        nodes.push(item.value.clone());
      }
      debug!(target = %entry.key.value, nodes = nodes.len(), "loaded target");
      self.targets.push(Target {
        name: entry.key.value.clone(),
        nodes,
      });
    }
  }

  fn parse_nodes(&mut self, attrs: &[DocEntry]) {
    for entry in attrs {
      let DocValue::Map(node_attrs) = &entry.value else {
        self.error(entry.key.span, "invalid value type in 'nodes' map");
        continue;
      };

      self.get_or_create_node(&entry.key.value);
      for attr in node_attrs {
        // Plain file nodes carry no configurable attributes.
        let message = format!("unexpected attribute: '{}'", attr.key.value);
        self.error(attr.key.span, &message);
      }
    }
  }

  fn parse_commands(&mut self, attrs: &[DocEntry]) {
    for entry in attrs {
      let DocValue::Map(command_attrs) = &entry.value else {
        self.error(entry.key.span, "invalid value type in 'commands' map");
        continue;
      };
      let name = entry.key.value.clone();
      if self.commands.contains_key(&name) {
        let message = format!("duplicate command '{name}'");
        self.error(entry.key.span, &message);
        continue;
      }

      // The tool must come first; it decides what the other keys mean.
      let Some(first) = command_attrs.first() else {
        self.error(entry.key.span, "missing 'tool' key for command");
        continue;
      };
      if first.key.value != "tool" {
        self.error(first.key.span, "expected 'tool' initial key for command");
        continue;
      }
      let DocValue::Scalar(tool_name) = &first.value else {
        self.error(first.key.span, "invalid 'tool' value (expected scalar)");
        continue;
      };
      let Some(tool) = self.take_tool(&tool_name.value, tool_name.span) else {
        continue;
      };
      let command = tool.create_command(&name);
      self.tools.insert(tool_name.value.clone(), tool);

      for attr in &command_attrs[1..] {
        match (attr.key.value.as_str(), &attr.value) {
          ("inputs", DocValue::List(items)) => {
            let mut nodes = Vec::new();
            for item in items {
              nodes.push(self.get_or_create_node(&item.value));
            }
            command.borrow_mut().configure_inputs(nodes);
          }
          ("inputs", _) => {
            self.error(attr.key.span, "invalid value for 'inputs' (expected list)");
          }
          ("outputs", DocValue::List(items)) => {
            let mut nodes = Vec::new();
            for item in items {
              let node = self.get_or_create_node(&item.value);
              node.add_producer(&name);
              nodes.push(node);
            }
            command.borrow_mut().configure_outputs(nodes);
          }
          ("outputs", _) => {
            self.error(attr.key.span, "invalid value for 'outputs' (expected list)");
          }
          ("description", DocValue::Scalar(value)) => {
            command.borrow_mut().configure_description(&value.value);
          }
          ("description", _) => {
            self.error(attr.key.span, "invalid value for 'description' (expected scalar)");
          }
          _ => {
            self.configure_attribute(
              &mut |ctx, key, value| command.borrow_mut().configure_attribute(ctx, key, value),
              attr,
            );
          }
        }
      }

      debug!(command = %name, "loaded command");
      self.commands.insert(name, command);
    }
  }

  /// Run one attribute through a configurable object, routing anything it
  /// complains about to the delegate with this attribute's span.
  fn configure_attribute(
    &mut self,
    configure: &mut dyn FnMut(&mut ConfigureCtx, &str, AttrValue<'_>) -> bool,
    attr: &DocEntry,
  ) {
    let mut ctx = ConfigureCtx::new();
    let accepted = match &attr.value {
      DocValue::Scalar(value) => configure(&mut ctx, &attr.key.value, AttrValue::Scalar(&value.value)),
      DocValue::List(items) => {
        let values: Vec<String> = items.iter().map(|i| i.value.clone()).collect();
        configure(&mut ctx, &attr.key.value, AttrValue::List(&values))
      }
      DocValue::Map(_) => {
        self.error(attr.key.span, "invalid attribute value (expected scalar or list)");
        return;
      }
    };

    let messages = ctx.take_errors();
    if messages.is_empty() && !accepted {
      self.error(attr.key.span, "invalid attribute");
    }
    for message in messages {
      self.error(attr.key.span, &message);
    }
  }

  /// A declared tool by name, or a freshly instantiated one.
  fn take_tool(&mut self, name: &str, span: Span) -> Option<Box<dyn Tool>> {
    if let Some(tool) = self.tools.remove(name) {
      return Some(tool);
    }
    match self.delegate.lookup_tool(name) {
      Some(tool) => Some(tool),
      None => {
        let message = format!("unknown tool '{name}'");
        self.error(span, &message);
        None
      }
    }
  }

  fn get_or_create_node(&mut self, name: &str) -> Rc<BuildNode> {
    if let Some(node) = self.nodes.get(name) {
      return node.clone();
    }
    let node = BuildNode::new(name);
    self.nodes.insert(name.to_string(), node.clone());
    node
  }
}

/// Pop the next section if its key matches `name`, validating it is a map.
fn take_section<'d>(
  sections: &mut std::iter::Peekable<std::slice::Iter<'d, DocEntry>>,
  name: &str,
  loader: &mut Loader<'_>,
) -> Option<Vec<DocEntry>> {
  let entry = sections.peek()?;
  if entry.key.value != name {
    return None;
  }
  let entry = sections.next()?;
  match &entry.value {
    DocValue::Map(attrs) => Some(attrs.clone()),
    _ => {
      let message = format!("unexpected '{name}' value (expected map)");
      loader.error(entry.key.span, &message);
      None
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::command::{PhonyTool, ShellTool};

  #[derive(Default)]
  struct TestDelegate {
    errors: Vec<(usize, String)>,
    client: Option<(String, u32, PropertyList)>,
    reject_client: bool,
  }

  impl BuildFileDelegate for TestDelegate {
    fn configure_client(&mut self, name: &str, version: u32, properties: &PropertyList) -> bool {
      self.client = Some((name.to_string(), version, properties.clone()));
      !self.reject_client
    }

    fn lookup_tool(&mut self, name: &str) -> Option<Box<dyn Tool>> {
      match name {
        "shell" => Some(Box::new(ShellTool)),
        "phony" => Some(Box::new(PhonyTool)),
        _ => None,
      }
    }

    fn error(&mut self, _filename: &str, span: Span, message: &str) {
      self.errors.push((span.offset, message.to_string()));
    }
  }

  const SAMPLE: &str = "\
client:
  name: kiln
  version: 2
  build-mode: fast
tools:
  shell: {}
targets:
  all: [out.txt, <group>]
nodes:
  out.txt: {}
commands:
  copy:
    tool: shell
    inputs: [in.txt]
    outputs: [out.txt]
    description: COPY
    args: cp in.txt out.txt
  group:
    tool: phony
    inputs: [out.txt]
    outputs: [<group>]
";

  #[test]
  fn loads_a_complete_description() {
    let mut delegate = TestDelegate::default();
    let file = load_build_description(SAMPLE, "test.kiln", &mut delegate).unwrap();
    assert!(delegate.errors.is_empty(), "{:?}", delegate.errors);

    let (name, version, properties) = delegate.client.unwrap();
    assert_eq!(name, "kiln");
    assert_eq!(version, 2);
    assert_eq!(properties, [("build-mode".to_string(), "fast".to_string())]);
    assert_eq!(file.client_name, "kiln");

    assert_eq!(file.default_target(), Some("all"));
    assert_eq!(file.targets[0].nodes, ["out.txt", "<group>"]);

    // Implicit nodes come from targets, inputs, and outputs alike.
    for node in ["in.txt", "out.txt", "<group>"] {
      assert!(file.nodes.contains_key(node), "missing node {node}");
    }
    assert!(file.nodes["<group>"].is_virtual());

    // Output nodes know their producer.
    assert_eq!(file.nodes["out.txt"].producers(), ["copy"]);
    assert_eq!(file.nodes["<group>"].producers(), ["group"]);
    assert!(file.nodes["in.txt"].producers().is_empty());

    assert!(file.commands.contains_key("copy"));
    assert!(file.commands.contains_key("group"));
    assert_eq!(file.commands["copy"].borrow().name(), "copy");
  }

  #[test]
  fn description_must_open_with_client() {
    let mut delegate = TestDelegate::default();
    let err = load_build_description("tools:\n", "test.kiln", &mut delegate).unwrap_err();
    assert_eq!(err.num_errors, 1);
    assert!(delegate.errors[0].1.contains("expected initial section 'client'"));
  }

  #[test]
  fn rejected_client_fails_the_load() {
    let mut delegate = TestDelegate {
      reject_client: true,
      ..TestDelegate::default()
    };
    let err = load_build_description("client:\n  name: other\n", "test.kiln", &mut delegate).unwrap_err();
    assert_eq!(err.num_errors, 1);
    assert!(delegate.errors[0].1.contains("unable to configure client"));
  }

  #[test]
  fn bad_version_is_reported_with_its_span() {
    let source = "client:\n  name: kiln\n  version: soon\n";
    let mut delegate = TestDelegate::default();
    let err = load_build_description(source, "test.kiln", &mut delegate).unwrap_err();
    assert_eq!(err.num_errors, 1);
    let (offset, message) = &delegate.errors[0];
    assert!(message.contains("invalid version number"));
    assert_eq!(*offset, source.find("soon").unwrap());
  }

  #[test]
  fn sections_out_of_order_are_trailing_errors() {
    let source = "client:\n  name: kiln\ncommands: {}\ntools: {}\n";
    let mut delegate = TestDelegate::default();
    let err = load_build_description(source, "test.kiln", &mut delegate).unwrap_err();
    assert_eq!(err.num_errors, 1);
    assert!(delegate.errors[0].1.contains("unexpected trailing top-level section"));
  }

  #[test]
  fn unknown_sections_are_errors() {
    let source = "client:\n  name: kiln\nextras: {}\n";
    let mut delegate = TestDelegate::default();
    assert!(load_build_description(source, "test.kiln", &mut delegate).is_err());
    assert!(delegate.errors[0].1.contains("unexpected trailing top-level section"));
  }

  #[test]
  fn command_requires_tool_first() {
    let source = "\
client:
  name: kiln
commands:
  broken:
    inputs: [a]
    tool: shell
";
    let mut delegate = TestDelegate::default();
    let err = load_build_description(source, "test.kiln", &mut delegate).unwrap_err();
    assert_eq!(err.num_errors, 1);
    assert!(delegate.errors[0].1.contains("expected 'tool' initial key"));
  }

  #[test]
  fn unknown_tool_is_reported() {
    let source = "\
client:
  name: kiln
commands:
  build:
    tool: rustc
";
    let mut delegate = TestDelegate::default();
    let err = load_build_description(source, "test.kiln", &mut delegate).unwrap_err();
    assert_eq!(err.num_errors, 1);
    let (offset, message) = &delegate.errors[0];
    assert!(message.contains("unknown tool 'rustc'"));
    assert_eq!(*offset, source.find("rustc").unwrap());
  }

  #[test]
  fn unexpected_command_attribute_is_forwarded_and_reported() {
    let source = "\
client:
  name: kiln
commands:
  copy:
    tool: shell
    args: cp a b
    bogus: nope
";
    let mut delegate = TestDelegate::default();
    let err = load_build_description(source, "test.kiln", &mut delegate).unwrap_err();
    assert_eq!(err.num_errors, 1);
    let (offset, message) = &delegate.errors[0];
    assert!(message.contains("unexpected attribute: 'bogus'"));
    assert_eq!(*offset, source.find("bogus").unwrap());
  }

  #[test]
  fn parse_errors_surface_through_the_delegate() {
    let mut delegate = TestDelegate::default();
    let err = load_build_description("client\n", "test.kiln", &mut delegate).unwrap_err();
    assert_eq!(err.num_errors, 1);
    assert!(delegate.errors[0].1.contains("expected ':'"));
  }
}
