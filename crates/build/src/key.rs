//! The build system's key space over the engine's opaque keys.
//!
//! Every engine key carries a one-byte kind prefix so the engine delegate
//! can synthesise the right rule for keys it has never seen (for example a
//! node name that only appears in a stored dependency list).

use kiln_engine::Key;

const COMMAND_PREFIX: u8 = b'C';
const NODE_PREFIX: u8 = b'N';
const TARGET_PREFIX: u8 = b'T';

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum BuildKey {
  /// A command in the build description, by name.
  Command(String),
  /// A file (or virtual) node, by name.
  Node(String),
  /// A named top-level target.
  Target(String),
}

impl BuildKey {
  pub fn command(name: impl Into<String>) -> BuildKey {
    BuildKey::Command(name.into())
  }

  pub fn node(name: impl Into<String>) -> BuildKey {
    BuildKey::Node(name.into())
  }

  pub fn target(name: impl Into<String>) -> BuildKey {
    BuildKey::Target(name.into())
  }

  pub fn to_key(&self) -> Key {
    let (prefix, name) = match self {
      BuildKey::Command(name) => (COMMAND_PREFIX, name),
      BuildKey::Node(name) => (NODE_PREFIX, name),
      BuildKey::Target(name) => (TARGET_PREFIX, name),
    };
    let mut bytes = Vec::with_capacity(1 + name.len());
    bytes.push(prefix);
    bytes.extend_from_slice(name.as_bytes());
    Key::new(bytes)
  }

  pub fn from_key(key: &Key) -> Option<BuildKey> {
    let (&prefix, name) = key.as_bytes().split_first()?;
    let name = String::from_utf8(name.to_vec()).ok()?;
    match prefix {
      COMMAND_PREFIX => Some(BuildKey::Command(name)),
      NODE_PREFIX => Some(BuildKey::Node(name)),
      TARGET_PREFIX => Some(BuildKey::Target(name)),
      _ => None,
    }
  }

  /// Human-readable form for diagnostics.
  pub fn describe(&self) -> String {
    match self {
      BuildKey::Command(name) => format!("command '{name}'"),
      BuildKey::Node(name) => format!("node '{name}'"),
      BuildKey::Target(name) => format!("target '{name}'"),
    }
  }
}
