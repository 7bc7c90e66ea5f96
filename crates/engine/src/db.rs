//! Persistent storage for rule results.
//!
//! The database is a cache, never a source of truth: anything it cannot
//! return simply forces the affected rule to rebuild. Mutations made during
//! a build become durable no later than [`Database::build_complete`].
//!
//! # On-disk layout
//!
//! ```text
//! magic (8) | format version u32 | client version u32 | iteration u64
//! record count u32
//! per record: key_len u32 | key | payload_len u32 | payload
//! ```
//!
//! A record payload serialises, little-endian:
//!
//! ```text
//! value_len u32 | value | built_iter u64 | checked_iter u64
//! declared_dep_count u32 | [key_len u32 | key]*
//! discovered_dep_count u32 | [key_len u32 | key]*
//! ```

use std::collections::HashMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, warn};

use crate::types::{Key, RuleResult, Value};

const MAGIC: &[u8; 8] = b"KILN-DB\0";
const FORMAT_VERSION: u32 = 1;

pub type DbResult<T> = Result<T, DatabaseError>;

#[derive(Debug, Error)]
pub enum DatabaseError {
  #[error("database io error: {0}")]
  Io(#[from] std::io::Error),

  #[error("database corrupt: {0}")]
  Corrupt(String),
}

/// Storage interface consumed by the engine.
///
/// Implementations are called only from the engine thread and may buffer
/// mutations between `build_started` and `build_complete`.
pub trait Database {
  /// The iteration counter persisted by the last completed build.
  fn current_iteration(&self) -> DbResult<u64>;

  fn set_current_iteration(&mut self, value: u64) -> DbResult<()>;

  fn lookup_rule_result(&mut self, key: &Key) -> DbResult<Option<RuleResult>>;

  fn set_rule_result(&mut self, key: &Key, result: &RuleResult) -> DbResult<()>;

  fn build_started(&mut self) -> DbResult<()>;

  /// Results stored during the build must be durable once this returns.
  fn build_complete(&mut self) -> DbResult<()>;
}

/// Reference implementation holding everything in memory; used by tests and
/// by builds run with persistence disabled.
#[derive(Debug, Default)]
pub struct MemoryDatabase {
  iteration: u64,
  results: HashMap<Key, RuleResult>,
}

impl MemoryDatabase {
  pub fn new() -> Self {
    Self::default()
  }
}

impl Database for MemoryDatabase {
  fn current_iteration(&self) -> DbResult<u64> {
    Ok(self.iteration)
  }

  fn set_current_iteration(&mut self, value: u64) -> DbResult<()> {
    self.iteration = value;
    Ok(())
  }

  fn lookup_rule_result(&mut self, key: &Key) -> DbResult<Option<RuleResult>> {
    Ok(self.results.get(key).cloned())
  }

  fn set_rule_result(&mut self, key: &Key, result: &RuleResult) -> DbResult<()> {
    self.results.insert(key.clone(), result.clone());
    Ok(())
  }

  fn build_started(&mut self) -> DbResult<()> {
    Ok(())
  }

  fn build_complete(&mut self) -> DbResult<()> {
    Ok(())
  }
}

/// Durable database keeping the whole keyed table in one file.
///
/// The table is loaded at open, mutated in memory during the build, and
/// rewritten atomically (temp file + rename) when the build completes. A
/// record that fails to decode is dropped, which forces its rule to rebuild.
pub struct FileDatabase {
  path: PathBuf,
  client_version: u32,
  iteration: u64,
  records: HashMap<Key, RuleResult>,
  dirty: bool,
}

impl FileDatabase {
  /// Open (or create) the database at `path`.
  ///
  /// `client_version` is an uninterpreted number owned by the client; if the
  /// stored one differs, the stored state is discarded wholesale.
  pub fn open(path: impl Into<PathBuf>, client_version: u32) -> DbResult<Self> {
    let path = path.into();
    let mut db = FileDatabase {
      path,
      client_version,
      iteration: 0,
      records: HashMap::new(),
      dirty: false,
    };

    match fs::read(&db.path) {
      Ok(bytes) => db.load(&bytes),
      Err(err) if err.kind() == ErrorKind::NotFound => {}
      Err(err) => return Err(err.into()),
    }

    Ok(db)
  }

  fn load(&mut self, bytes: &[u8]) {
    let mut r = Reader::new(bytes);

    let header_ok = r.take(MAGIC.len()).map(|m| m == MAGIC).unwrap_or(false)
      && r.take_u32() == Some(FORMAT_VERSION)
      && r.take_u32() == Some(self.client_version);
    if !header_ok {
      debug!(path = %self.path.display(), "stale or foreign database, starting fresh");
      return;
    }

    let Some(iteration) = r.take_u64() else {
      return;
    };
    self.iteration = iteration;

    let Some(count) = r.take_u32() else {
      return;
    };
    for _ in 0..count {
      let Some(key) = r.take_u32().and_then(|n| r.take(n as usize)) else {
        warn!(path = %self.path.display(), "truncated database record table");
        return;
      };
      let key = Key::new(key.to_vec());
      let Some(payload) = r.take_u32().and_then(|n| r.take(n as usize)) else {
        warn!(path = %self.path.display(), "truncated database record table");
        return;
      };
      match decode_result(payload) {
        Some(result) => {
          self.records.insert(key, result);
        }
        None => {
          warn!(key = %key, "dropping corrupt database record");
        }
      }
    }
  }

  /// Write the current state out, replacing the file atomically.
  pub fn flush(&mut self) -> DbResult<()> {
    let mut buf = Vec::new();
    buf.extend_from_slice(MAGIC);
    buf.extend_from_slice(&FORMAT_VERSION.to_le_bytes());
    buf.extend_from_slice(&self.client_version.to_le_bytes());
    buf.extend_from_slice(&self.iteration.to_le_bytes());
    buf.extend_from_slice(&(self.records.len() as u32).to_le_bytes());
    for (key, result) in &self.records {
      write_bytes(&mut buf, key.as_bytes());
      let payload = encode_result(result);
      write_bytes(&mut buf, &payload);
    }

    let tmp = self.path.with_extension("tmp");
    fs::write(&tmp, &buf)?;
    fs::rename(&tmp, &self.path)?;
    self.dirty = false;
    debug!(path = %self.path.display(), records = self.records.len(), "flushed database");
    Ok(())
  }

  pub fn path(&self) -> &Path {
    &self.path
  }
}

impl Database for FileDatabase {
  fn current_iteration(&self) -> DbResult<u64> {
    Ok(self.iteration)
  }

  fn set_current_iteration(&mut self, value: u64) -> DbResult<()> {
    self.iteration = value;
    self.dirty = true;
    Ok(())
  }

  fn lookup_rule_result(&mut self, key: &Key) -> DbResult<Option<RuleResult>> {
    Ok(self.records.get(key).cloned())
  }

  fn set_rule_result(&mut self, key: &Key, result: &RuleResult) -> DbResult<()> {
    self.records.insert(key.clone(), result.clone());
    self.dirty = true;
    Ok(())
  }

  fn build_started(&mut self) -> DbResult<()> {
    Ok(())
  }

  fn build_complete(&mut self) -> DbResult<()> {
    if self.dirty {
      self.flush()?;
    }
    Ok(())
  }
}

/// Serialise one result record to the wire layout.
pub fn encode_result(result: &RuleResult) -> Vec<u8> {
  let mut buf = Vec::new();
  write_bytes(&mut buf, result.value.as_bytes());
  buf.extend_from_slice(&result.built_at.to_le_bytes());
  buf.extend_from_slice(&result.checked_at.to_le_bytes());
  buf.extend_from_slice(&(result.declared_deps.len() as u32).to_le_bytes());
  for dep in &result.declared_deps {
    write_bytes(&mut buf, dep.as_bytes());
  }
  buf.extend_from_slice(&(result.discovered_deps.len() as u32).to_le_bytes());
  for dep in &result.discovered_deps {
    write_bytes(&mut buf, dep.as_bytes());
  }
  buf
}

/// Decode one result record; `None` means the bytes are not a valid record.
pub fn decode_result(bytes: &[u8]) -> Option<RuleResult> {
  let mut r = Reader::new(bytes);

  let value = Value::new(r.take_u32().and_then(|n| r.take(n as usize))?.to_vec());
  let built_at = r.take_u64()?;
  let checked_at = r.take_u64()?;

  let mut declared_deps = Vec::new();
  for _ in 0..r.take_u32()? {
    declared_deps.push(Key::new(r.take_u32().and_then(|n| r.take(n as usize))?.to_vec()));
  }
  let mut discovered_deps = Vec::new();
  for _ in 0..r.take_u32()? {
    discovered_deps.push(Key::new(r.take_u32().and_then(|n| r.take(n as usize))?.to_vec()));
  }

  if !r.is_empty() {
    return None;
  }

  Some(RuleResult {
    value,
    built_at,
    checked_at,
    declared_deps,
    discovered_deps,
  })
}

fn write_bytes(buf: &mut Vec<u8>, bytes: &[u8]) {
  buf.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
  buf.extend_from_slice(bytes);
}

/// Cursor over a byte slice; every take returns `None` past the end.
struct Reader<'a> {
  bytes: &'a [u8],
  pos: usize,
}

impl<'a> Reader<'a> {
  fn new(bytes: &'a [u8]) -> Self {
    Reader { bytes, pos: 0 }
  }

  fn take(&mut self, n: usize) -> Option<&'a [u8]> {
    let end = self.pos.checked_add(n)?;
    if end > self.bytes.len() {
      return None;
    }
    let slice = &self.bytes[self.pos..end];
    self.pos = end;
    Some(slice)
  }

  fn take_u32(&mut self) -> Option<u32> {
    self.take(4).map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
  }

  fn take_u64(&mut self) -> Option<u64> {
    self
      .take(8)
      .map(|b| u64::from_le_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]]))
  }

  fn is_empty(&self) -> bool {
    self.pos == self.bytes.len()
  }
}
