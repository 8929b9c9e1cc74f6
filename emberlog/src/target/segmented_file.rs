//! Segmented, rotating file sink (§4.3 concrete backends, §9
//! supplement).
//!
//! Grounded on the teacher's `snapshot::SnapshotWriter::write_snapshot`:
//! same in-memory `lz4::block::compress` call, same "write to a
//! temporary name, then place it at its final name" pattern — applied
//! here to rotated-out segments instead of one-shot crash snapshots. The
//! active segment (`base_name`) is always plain, uncompressed text so a
//! `tail -f` keeps working; only segments rotated out of active duty are
//! compressed, to `base_name.N.lz4`.

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use lz4::block::{compress, CompressionMode};

use crate::error::{Error, ErrorKind, Result};

use super::{LockClass, SinkBackend};

fn io_error(path: &Path, err: std::io::Error) -> Error {
  Error::with_source(ErrorKind::IoTransient, format!("{}: {}", path.display(), err), err)
}

struct Active {
  file: File,
  bytes_written: u64,
  next_segment: u32,
}

/// A sink backend that rotates the active segment once it exceeds
/// `segment_limit_bytes`, compressing the rotated-out segment with LZ4.
pub struct SegmentedFileBackend {
  base_path: PathBuf,
  segment_limit_bytes: u64,
  active: Mutex<Option<Active>>,
}

impl SegmentedFileBackend {
  pub fn new(base_path: impl Into<PathBuf>, segment_limit_mb: u64) -> Self {
    Self {
      base_path: base_path.into(),
      segment_limit_bytes: segment_limit_mb.max(1) * 1024 * 1024,
      active: Mutex::new(None),
    }
  }

  fn rotated_path(&self, index: u32) -> PathBuf {
    let mut name = self.base_path.clone();
    let stem = self.base_path.file_stem().and_then(|s| s.to_str()).unwrap_or("log");
    name.set_file_name(format!("{stem}.{index}.lz4"));
    name
  }

  fn compress_and_remove(&self, path: &Path, index: u32) -> Result<()> {
    let mut raw = Vec::new();
    File::open(path)
      .and_then(|mut f| f.read_to_end(&mut raw))
      .map_err(|e| io_error(path, e))?;
    let compressed = compress(&raw, Some(CompressionMode::DEFAULT), true)
      .map_err(|e| Error::with_source(ErrorKind::IoTransient, "lz4 compression failed", e))?;
    let dest = self.rotated_path(index);
    fs::write(&dest, compressed).map_err(|e| io_error(&dest, e))?;
    fs::remove_file(path).map_err(|e| io_error(path, e))?;
    Ok(())
  }

  fn rotate(&self, active: &mut Active) -> Result<()> {
    let index = active.next_segment;
    active.next_segment += 1;
    self.compress_and_remove(&self.base_path, index)?;
    // The old handle (now pointing at an unlinked inode) is dropped here
    // in favor of a handle on the freshly created active segment.
    active.file = OpenOptions::new()
      .create(true)
      .write(true)
      .truncate(true)
      .open(&self.base_path)
      .map_err(|e| io_error(&self.base_path, e))?;
    active.bytes_written = 0;
    Ok(())
  }
}

impl SinkBackend for SegmentedFileBackend {
  fn start(&self) -> Result<()> {
    if let Some(parent) = self.base_path.parent() {
      if !parent.as_os_str().is_empty() {
        fs::create_dir_all(parent).map_err(|e| io_error(&self.base_path, e))?;
      }
    }
    let existing_len = fs::metadata(&self.base_path).map(|m| m.len()).unwrap_or(0);
    let file = OpenOptions::new()
      .create(true)
      .append(true)
      .open(&self.base_path)
      .map_err(|e| io_error(&self.base_path, e))?;
    *self.active.lock().unwrap() = Some(Active {
      file,
      bytes_written: existing_len,
      next_segment: 0,
    });
    Ok(())
  }

  fn write(&self, bytes: &[u8]) -> Result<usize> {
    let mut guard = self.active.lock().unwrap();
    let active = guard.as_mut().ok_or_else(|| Error::new(ErrorKind::Lifecycle, "segmented file target not started"))?;
    active.file.write_all(bytes).map_err(|e| io_error(&self.base_path, e))?;
    active.bytes_written += bytes.len() as u64;
    if active.bytes_written >= self.segment_limit_bytes {
      self.rotate(active)?;
    }
    Ok(bytes.len())
  }

  fn flush_impl(&self) -> Result<()> {
    let mut guard = self.active.lock().unwrap();
    if let Some(active) = guard.as_mut() {
      active.file.sync_all().map_err(|e| io_error(&self.base_path, e))?;
    }
    Ok(())
  }

  fn stop(&self) -> Result<()> {
    self.flush_impl()?;
    *self.active.lock().unwrap() = None;
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
  fn rotates_and_compresses_once_over_the_limit() {
    let dir = std::env::temp_dir().join(format!("emberlog-segmented-test-{}", crate::time::now_nanos()));
    let path = dir.join("app.log");
    // 1 MB segment limit would be slow to exercise in a unit test; drive
    // the limit down directly instead of waiting for real megabytes.
    let backend = SegmentedFileBackend {
      base_path: path.clone(),
      segment_limit_bytes: 16,
      active: Mutex::new(None),
    };
    backend.start().unwrap();
    backend.write(b"0123456789abcdef").unwrap();
    backend.write(b"more-data-after-rotation").unwrap();
    backend.stop().unwrap();

    assert!(dir.join("app.0.lz4").exists());
    let remaining = std::fs::read_to_string(&path).unwrap();
    assert_eq!(remaining, "more-data-after-rotation");
    let _ = std::fs::remove_dir_all(&dir);
  }
}
