//! File stamps used to decide whether an input or output changed.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

/// Identity and freshness proxy for a file.
///
/// The all-zero value is the sentinel for a missing file; no real file can
/// stat to it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileInfo {
  pub device: u64,
  pub inode: u64,
  pub size: u64,
  pub mtime_sec: i64,
  pub mtime_nsec: i64,
}

impl FileInfo {
  /// Stamp the file at `path`; missing (or unreadable) paths yield the
  /// missing sentinel.
  pub fn for_path(path: &Path) -> FileInfo {
    use std::os::unix::fs::MetadataExt;

    match fs::metadata(path) {
      Ok(meta) => FileInfo {
        device: meta.dev(),
        inode: meta.ino(),
        size: meta.size(),
        mtime_sec: meta.mtime(),
        mtime_nsec: meta.mtime_nsec(),
      },
      Err(_) => FileInfo::default(),
    }
  }

  pub fn is_missing(&self) -> bool {
    *self == FileInfo::default()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use tempfile::TempDir;

  #[test]
  fn missing_path_stamps_as_missing() {
    let temp = TempDir::new().unwrap();
    let info = FileInfo::for_path(&temp.path().join("nope"));
    assert!(info.is_missing());
  }

  #[test]
  fn existing_file_has_identity() {
    let temp = TempDir::new().unwrap();
    let path = temp.path().join("file.txt");
    fs::write(&path, b"contents").unwrap();

    let info = FileInfo::for_path(&path);
    assert!(!info.is_missing());
    assert_eq!(info.size, 8);
    assert_ne!(info.inode, 0);
    assert_eq!(info, FileInfo::for_path(&path));
  }

  #[test]
  fn content_change_changes_the_stamp() {
    let temp = TempDir::new().unwrap();
    let path = temp.path().join("file.txt");
    fs::write(&path, b"one").unwrap();
    let before = FileInfo::for_path(&path);

    fs::write(&path, b"longer than before").unwrap();
    let after = FileInfo::for_path(&path);
    assert_ne!(before, after);
  }
}
