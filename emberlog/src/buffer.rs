//! Growable, small-buffer-optimized byte buffer for formatted output.
//!
//! Built on the teacher's `kv::KvTransformer` (a `SmallVec<[u8; 128]>`
//! wrapped in `std::io::Write`), generalized to §3's full contract: an
//! inline region that spills to the heap on first overflow, a capped
//! maximum, and a `full` flag that latches once truncation has occurred.

use smallvec::SmallVec;
use std::io::{self, Write};

/// Typical log-line length the inline region is sized for.
pub const INLINE_CAPACITY: usize = 256;

/// A buffer that starts on the stack and only allocates once a single
/// formatted record exceeds [`INLINE_CAPACITY`] bytes.
pub struct LogBuffer {
  bytes: SmallVec<[u8; INLINE_CAPACITY]>,
  max_capacity: usize,
  full: bool,
}

impl LogBuffer {
  /// `max_capacity` bounds the buffer; it must be at least
  /// [`INLINE_CAPACITY`] or every overflowing write truncates immediately.
  pub fn new(max_capacity: usize) -> Self {
    Self {
      bytes: SmallVec::new(),
      max_capacity: max_capacity.max(INLINE_CAPACITY),
      full: false,
    }
  }

  #[inline]
  pub fn len(&self) -> usize {
    self.bytes.len()
  }

  #[inline]
  pub fn is_empty(&self) -> bool {
    self.bytes.is_empty()
  }

  #[inline]
  pub fn is_full(&self) -> bool {
    self.full
  }

  pub fn as_bytes(&self) -> &[u8] {
    &self.bytes
  }

  pub fn as_str(&self) -> &str {
    std::str::from_utf8(&self.bytes).unwrap_or("")
  }

  pub fn clear(&mut self) {
    self.bytes.clear();
    self.full = false;
  }

  /// Append `bytes`. Returns `false` (and sets [`is_full`]) if the
  /// configured maximum was reached and the write was truncated; once
  /// `full`, subsequent appends are no-ops that also return `false`.
  pub fn append(&mut self, bytes: &[u8]) -> bool {
    if self.full {
      return false;
    }
    if bytes.is_empty() {
      return true;
    }

    let room = self.max_capacity.saturating_sub(self.bytes.len());
    if bytes.len() <= room {
      self.bytes.extend_from_slice(bytes);
      true
    } else {
      self.bytes.extend_from_slice(&bytes[..room]);
      self.full = true;
      false
    }
  }

  pub fn append_str(&mut self, s: &str) -> bool {
    self.append(s.as_bytes())
  }
}

impl Write for LogBuffer {
  fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
    self.append(buf);
    Ok(buf.len())
  }

  fn flush(&mut self) -> io::Result<()> {
    Ok(())
  }
}

/// Lets `std::fmt::write`/`write!` target a `LogBuffer` directly, the
/// path [`crate::logger`] uses to format `format_args!` output into the
/// thread-local reusable buffer §4.8 step 3 calls for.
impl std::fmt::Write for LogBuffer {
  fn write_str(&mut self, s: &str) -> std::fmt::Result {
    self.append_str(s);
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn uses_inline_region_first() {
    let mut buf = LogBuffer::new(1024);
    buf.append_str("hello");
    assert_eq!(buf.as_str(), "hello");
    assert!(!buf.bytes.spilled());
  }

  #[test]
  fn migrates_to_dynamic_on_overflow() {
    let mut buf = LogBuffer::new(4096);
    let chunk = "x".repeat(INLINE_CAPACITY - 4);
    buf.append_str(&chunk);
    assert!(!buf.bytes.spilled());
    buf.append_str("overflow-me");
    assert!(buf.bytes.spilled());
    assert_eq!(buf.len(), chunk.len() + "overflow-me".len());
  }

  #[test]
  fn truncates_and_sets_full_past_cap() {
    let mut buf = LogBuffer::new(INLINE_CAPACITY + 8);
    let chunk = "x".repeat(INLINE_CAPACITY + 4);
    buf.append_str(&chunk);
    assert!(!buf.is_full());
    let ok = buf.append_str("1234567890");
    assert!(!ok);
    assert!(buf.is_full());
    assert_eq!(buf.len(), INLINE_CAPACITY + 8);

    // Further appends are no-ops.
    let before = buf.len();
    assert!(!buf.append_str("more"));
    assert_eq!(buf.len(), before);
  }

  #[test]
  fn clear_resets_everything() {
    let mut buf = LogBuffer::new(64);
    buf.append_str(&"y".repeat(200));
    assert!(buf.bytes.spilled());
    buf.clear();
    assert_eq!(buf.len(), 0);
    assert!(!buf.is_full());
  }
}
