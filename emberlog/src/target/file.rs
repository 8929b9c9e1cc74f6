//! Plain file sink (§4.3 concrete backends).
//!
//! Grounded on the teacher's `file_listener::FileListener`: open once at
//! `start`, append under a mutex, `sync_all` on an explicit flush. The
//! teacher always emitted NDJSON internally; here the shape (JSON, plain
//! text, CSV, …) is the caller's `Target::with_formatter` choice, so this
//! backend only owns the file handle.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::error::{Error, ErrorKind, Result};

use super::{LockClass, SinkBackend};

fn io_error(path: &Path, err: std::io::Error) -> Error {
  let kind = match err.kind() {
    std::io::ErrorKind::PermissionDenied | std::io::ErrorKind::NotFound => ErrorKind::IoPermanent,
    _ => ErrorKind::IoTransient,
  };
  Error::with_source(kind, format!("{}: {}", path.display(), err), err)
}

/// A sink backend that appends rendered records to a single file.
pub struct FileBackend {
  path: PathBuf,
  file: Mutex<Option<File>>,
}

impl FileBackend {
  pub fn new(path: impl Into<PathBuf>) -> Self {
    Self {
      path: path.into(),
      file: Mutex::new(None),
    }
  }
}

impl SinkBackend for FileBackend {
  fn start(&self) -> Result<()> {
    if let Some(parent) = self.path.parent() {
      if !parent.as_os_str().is_empty() {
        fs::create_dir_all(parent).map_err(|e| io_error(&self.path, e))?;
      }
    }
    let file = OpenOptions::new()
      .create(true)
      .append(true)
      .open(&self.path)
      .map_err(|e| io_error(&self.path, e))?;
    *self.file.lock().unwrap() = Some(file);
    Ok(())
  }

  fn write(&self, bytes: &[u8]) -> Result<usize> {
    let mut guard = self.file.lock().unwrap();
    let file = guard.as_mut().ok_or_else(|| Error::new(ErrorKind::Lifecycle, "file target not started"))?;
    file.write_all(bytes).map_err(|e| io_error(&self.path, e))?;
    Ok(bytes.len())
  }

  fn flush_impl(&self) -> Result<()> {
    let mut guard = self.file.lock().unwrap();
    if let Some(file) = guard.as_mut() {
      file.sync_all().map_err(|e| io_error(&self.path, e))?;
    }
    Ok(())
  }

  fn stop(&self) -> Result<()> {
    self.flush_impl()?;
    *self.file.lock().unwrap() = None;
    Ok(())
  }

  fn lock_class(&self) -> LockClass {
    LockClass::NativelyThreadSafe
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn writes_appended_bytes_and_flushes() {
    let dir = std::env::temp_dir().join(format!("emberlog-file-test-{}", crate::time::now_nanos()));
    let path = dir.join("out.log");
    let backend = FileBackend::new(&path);
    backend.start().unwrap();
    backend.write(b"line-one\n").unwrap();
    backend.write(b"line-two\n").unwrap();
    backend.flush_impl().unwrap();
    backend.stop().unwrap();
    let contents = std::fs::read_to_string(&path).unwrap();
    assert_eq!(contents, "line-one\nline-two\n");
    let _ = std::fs::remove_dir_all(&dir);
  }

  #[test]
  fn write_before_start_is_a_lifecycle_error() {
    let backend = FileBackend::new("/tmp/does-not-matter.log");
    assert!(backend.write(b"x").is_err());
  }
}
