//! Nodes: the named artifacts commands connect to each other.

use std::cell::RefCell;
use std::path::Path;
use std::rc::Rc;

use crate::fileinfo::FileInfo;

/// A file (or virtual marker) referenced by the build description.
///
/// Names of the form `<...>` denote virtual nodes: ordering-only artifacts
/// with no file behind them, stamped with the missing sentinel.
#[derive(Debug)]
pub struct BuildNode {
  name: String,
  is_virtual: bool,
  /// Names of the commands that produce this node. More than one producer
  /// is a configuration error, surfaced when the node is demanded.
  producers: RefCell<Vec<String>>,
}

impl BuildNode {
  pub fn new(name: impl Into<String>) -> Rc<BuildNode> {
    let name = name.into();
    let is_virtual = name.starts_with('<') && name.ends_with('>') && name.len() > 1;
    Rc::new(BuildNode {
      name,
      is_virtual,
      producers: RefCell::new(Vec::new()),
    })
  }

  pub fn name(&self) -> &str {
    &self.name
  }

  pub fn is_virtual(&self) -> bool {
    self.is_virtual
  }

  /// Stamp the file currently behind this node.
  pub fn file_info(&self) -> FileInfo {
    if self.is_virtual {
      return FileInfo::default();
    }
    FileInfo::for_path(Path::new(&self.name))
  }

  pub fn add_producer(&self, command_name: &str) {
    self.producers.borrow_mut().push(command_name.to_string());
  }

  pub fn producers(&self) -> Vec<String> {
    self.producers.borrow().clone()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn angle_bracketed_names_are_virtual() {
    assert!(BuildNode::new("<all>").is_virtual());
    assert!(!BuildNode::new("main.o").is_virtual());
    assert!(!BuildNode::new("a<b>").is_virtual());
    assert!(BuildNode::new("<>").is_virtual());
  }

  #[test]
  fn virtual_nodes_stamp_as_missing() {
    assert!(BuildNode::new("<group>").file_info().is_missing());
  }

  #[test]
  fn producers_accumulate() {
    let node = BuildNode::new("out.txt");
    assert!(node.producers().is_empty());
    node.add_producer("compile");
    node.add_producer("copy");
    assert_eq!(node.producers(), ["compile", "copy"]);
  }
}
