//! Immutable log records.
//!
//! A [`Record`] is built once at the call site and never mutated again
//! (§3 invariant). Async sinks that need to hold on to a record past the
//! caller's return duplicate its message text into their own storage via
//! `Clone`, rather than sharing a reference back into caller-owned memory.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::level::LogLevel;
use crate::source::SourceId;

static RECORD_ID: AtomicU64 = AtomicU64::new(1);

/// Allocate the next process-wide record id.
///
/// Record ids are strictly increasing and never reused or duplicated for
/// the lifetime of the process (§8 invariant 2).
#[inline]
pub fn next_record_id() -> u64 {
  RECORD_ID.fetch_add(1, Ordering::Relaxed)
}

/// Distinguishes a normal record payload from the flush/stop markers
/// async sinks thread through their rings and queues alongside the
/// record's bytes (§3, §4.6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Control {
  Normal,
  /// Instructs the consumer to call `inner.flush()` once reached.
  Flush,
  /// Instructs the consumer to flush, then terminate after processing.
  Stop,
}

/// A single, immutable log record.
///
/// `file`/`function` are `'static` string slices (`file!()`/
/// `module_path!()` at the call site live for the process lifetime, per
/// Design Note §9's callsite-info contract) so `Record` itself never
/// allocates for source-location metadata.
#[derive(Debug, Clone)]
pub struct Record {
  pub record_id: u64,
  pub timestamp_nanos: u64,
  pub level: LogLevel,
  pub thread_id: u64,
  pub source_id: SourceId,
  pub file: &'static str,
  pub line: u32,
  pub function: &'static str,
  pub message: String,
  pub control: Control,
}

impl Record {
  /// Build a normal record, stamping a fresh record id.
  #[allow(clippy::too_many_arguments)]
  pub fn new(
    timestamp_nanos: u64,
    level: LogLevel,
    thread_id: u64,
    source_id: SourceId,
    file: &'static str,
    line: u32,
    function: &'static str,
    message: String,
  ) -> Self {
    Self {
      record_id: next_record_id(),
      timestamp_nanos,
      level,
      thread_id,
      source_id,
      file,
      line,
      function,
      message,
      control: Control::Normal,
    }
  }
}

/// Returns a stable numeric id for the calling thread.
///
/// `std::thread::ThreadId` does not expose its internal integer, so we
/// hash it the way the teacher's `utils::current_thread_id_u32` did,
/// widened to 64 bits to match §3's "thread-id" field.
#[inline]
pub fn current_thread_id() -> u64 {
  use std::collections::hash_map::DefaultHasher;
  use std::hash::{Hash, Hasher};

  let mut hasher = DefaultHasher::new();
  std::thread::current().id().hash(&mut hasher);
  hasher.finish()
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn record_ids_are_strictly_increasing() {
    let a = next_record_id();
    let b = next_record_id();
    let c = next_record_id();
    assert!(a < b);
    assert!(b < c);
  }

  #[test]
  fn clone_duplicates_message_storage() {
    let record = Record::new(0, LogLevel::Info, 0, SourceId(0), "f.rs", 1, "f", "hello".into());
    let cloned = record.clone();
    assert_eq!(record.message, cloned.message);
    assert_ne!(record.message.as_ptr(), cloned.message.as_ptr());
  }
}
