//! Stdout sink (§4.3 concrete backends).
//!
//! Grounded on the teacher's `stdout_listener::StdoutListener`: a single
//! locked buffer, one `write_all` per record. The teacher's hard-coded
//! ANSI color table (`RED`/`GREEN`/…, `color_level`) now lives in
//! [`crate::field_spec`]'s `Color`/`NamedColor` and is reachable from any
//! format template via `${level:color=red}`, rather than being wired
//! directly into this backend — this module only owns the file
//! descriptor.

use std::io::{self, Write};
use std::sync::Mutex;

use crate::error::{Error, ErrorKind, Result};

use super::{LockClass, SinkBackend};

/// A sink backend that writes rendered records to the process's stdout.
pub struct StdoutBackend {
  buffer: Mutex<Vec<u8>>,
}

impl StdoutBackend {
  pub fn new() -> Self {
    Self {
      buffer: Mutex::new(Vec::with_capacity(256)),
    }
  }
}

impl Default for StdoutBackend {
  fn default() -> Self {
    Self::new()
  }
}

impl SinkBackend for StdoutBackend {
  fn write(&self, bytes: &[u8]) -> Result<usize> {
    let mut buf = self.buffer.lock().unwrap();
    buf.clear();
    buf.extend_from_slice(bytes);
    io::stdout()
      .write_all(&buf)
      .map_err(|e| Error::with_source(ErrorKind::IoTransient, "stdout write failed", e))?;
    Ok(bytes.len())
  }

  fn flush_impl(&self) -> Result<()> {
    io::stdout()
      .flush()
      .map_err(|e| Error::with_source(ErrorKind::IoTransient, "stdout flush failed", e))
  }

  fn lock_class(&self) -> LockClass {
    LockClass::NativelyThreadSafe
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn write_reports_full_length_written() {
    let backend = StdoutBackend::new();
    let written = backend.write(b"hello\n").unwrap();
    assert_eq!(written, 6);
  }
}
