//! Loggers: a source bound to a thread-mode, exposing the user-facing
//! log calls (§4.8 record pipeline).
//!
//! Grounded on the teacher's `logger::Logger` trait plus its global
//! `AtomicPtr`-backed singleton, but the singleton slot moves out of
//! this module entirely — `emberlog::lib` owns one `Arc<Logger>` per
//! qualified source name rather than a single process-wide logger, so a
//! `Private`/`Shared` distinction and per-source dispatch are possible.

use std::cell::RefCell;
use std::fmt;
use std::sync::Arc;

use crate::buffer::LogBuffer;
use crate::level::LogLevel;
use crate::record::Record;
use crate::source::{SourceId, SourceTree};
use crate::target::Registry;
use crate::time::ClockHandle;

/// Cap on a single record's formatted message, inline region plus
/// dynamic overflow (§3 buffer contract).
const MAX_MESSAGE_CAPACITY: usize = 64 * 1024;

/// Whether a logger may be used by more than one thread at a time (§3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ThreadMode {
  /// Used by at most one thread at a time; its thread-local buffers are
  /// never contended.
  Private,
  /// Safe for concurrent use from any number of threads.
  Shared,
}

struct PartialRecord {
  level: LogLevel,
  source_id: SourceId,
  file: &'static str,
  line: u32,
  function: &'static str,
  message: LogBuffer,
}

thread_local! {
  static PARTIAL: RefCell<Option<PartialRecord>> = const { RefCell::new(None) };
  static MESSAGE_BUF: RefCell<LogBuffer> = RefCell::new(LogBuffer::new(MAX_MESSAGE_CAPACITY));
}

/// A handle bound to one log source (§3 `Logger`).
pub struct Logger {
  source_id: SourceId,
  thread_mode: ThreadMode,
  tree: Arc<SourceTree>,
  registry: Arc<Registry>,
  clock: ClockHandle,
}

impl Logger {
  pub fn new(source_id: SourceId, thread_mode: ThreadMode, tree: Arc<SourceTree>, registry: Arc<Registry>, clock: ClockHandle) -> Self {
    Self {
      source_id,
      thread_mode,
      tree,
      registry,
      clock,
    }
  }

  pub fn source_id(&self) -> SourceId {
    self.source_id
  }

  pub fn thread_mode(&self) -> ThreadMode {
    self.thread_mode
  }

  /// Effective level of the bound source, read lock-free off the atomic
  /// the source tree keeps current (§4.8 step 1).
  #[inline]
  pub fn effective_level(&self) -> LogLevel {
    self
      .tree
      .get(self.source_id)
      .map(|node| node.effective_level())
      .unwrap_or(LogLevel::Info)
  }

  #[inline]
  pub fn is_level_enabled(&self, level: LogLevel) -> bool {
    level <= self.effective_level()
  }

  fn qualified_name(&self) -> String {
    self
      .tree
      .get(self.source_id)
      .map(|node| node.qualified_name(&self.tree))
      .unwrap_or_default()
  }

  fn dispatch(&self, record: &Record) {
    let source_name = self.qualified_name();
    let node = self.tree.get(self.source_id);
    for target in self.registry.all() {
      let selected = node.as_ref().map(|n| n.targets(target.id())).unwrap_or(true);
      if selected {
        target.submit(record, &source_name);
      }
    }
  }

  /// The full gated call: early-out before `args` is ever formatted
  /// (§4.8 step 1, §8 invariant 1).
  pub fn log_at(&self, level: LogLevel, file: &'static str, line: u32, function: &'static str, args: fmt::Arguments<'_>) {
    if !self.is_level_enabled(level) {
      return;
    }
    let message = MESSAGE_BUF.with(|buf| {
      let mut buf = buf.borrow_mut();
      buf.clear();
      fmt::write(&mut *buf, args).ok();
      buf.as_str().to_string()
    });
    let record = Record::new(self.clock.now_nanos(), level, crate::record::current_thread_id(), self.source_id, file, line, function, message);
    self.dispatch(&record);
  }

  /// `BEGIN`: opens this thread's partial-record builder for this
  /// logger's source (§4.8 step 6).
  pub fn log_begin(&self, level: LogLevel, file: &'static str, line: u32, function: &'static str, args: fmt::Arguments<'_>) {
    if !self.is_level_enabled(level) {
      return;
    }
    let mut message = LogBuffer::new(MAX_MESSAGE_CAPACITY);
    fmt::write(&mut message, args).ok();
    PARTIAL.with(|cell| {
      *cell.borrow_mut() = Some(PartialRecord {
        level,
        source_id: self.source_id,
        file,
        line,
        function,
        message,
      });
    });
  }

  /// `APPEND`: formats `args` into the open partial record.
  pub fn log_append(&self, args: fmt::Arguments<'_>) {
    PARTIAL.with(|cell| {
      if let Some(partial) = cell.borrow_mut().as_mut() {
        fmt::write(&mut partial.message, args).ok();
      }
    });
  }

  /// `APPEND_NF` ("no format"): appends `text` verbatim, skipping
  /// `format_args!` machinery for call sites with nothing to interpolate.
  pub fn log_append_nf(&self, text: &str) {
    PARTIAL.with(|cell| {
      if let Some(partial) = cell.borrow_mut().as_mut() {
        partial.message.append_str(text);
      }
    });
  }

  /// `END`: promotes the open partial record to a normal submit and
  /// clears the thread-local builder.
  pub fn log_end(&self) {
    let partial = PARTIAL.with(|cell| cell.borrow_mut().take());
    let Some(partial) = partial else { return };
    let record = Record::new(
      self.clock.now_nanos(),
      partial.level,
      crate::record::current_thread_id(),
      partial.source_id,
      partial.file,
      partial.line,
      partial.function,
      partial.message.as_str().to_string(),
    );
    self.dispatch(&record);
  }

  /// Requests a flush on every target selected by this logger's source.
  pub fn flush(&self) {
    let node = self.tree.get(self.source_id);
    for target in self.registry.all() {
      let selected = node.as_ref().map(|n| n.targets(target.id())).unwrap_or(true);
      if selected {
        target.flush();
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::error::ErrorSink;
  use crate::target::{LockClass, SinkBackend, Target};
  use std::sync::atomic::{AtomicUsize, Ordering};
  use std::sync::Mutex as StdMutex;
  use std::time::Duration;

  struct RecordingBackend {
    lines: StdMutex<Vec<String>>,
  }

  impl SinkBackend for RecordingBackend {
    fn write(&self, bytes: &[u8]) -> crate::error::Result<usize> {
      self.lines.lock().unwrap().push(String::from_utf8_lossy(bytes).into_owned());
      Ok(bytes.len())
    }

    fn lock_class(&self) -> LockClass {
      LockClass::NativelyThreadSafe
    }
  }

  fn build() -> (Logger, Arc<SourceTree>) {
    let tree = Arc::new(SourceTree::new());
    let registry = Arc::new(Registry::new());
    let backend = Box::new(RecordingBackend { lines: StdMutex::new(Vec::new()) });
    let target = Arc::new(Target::new("t", backend, Arc::new(ErrorSink::stderr(Duration::from_secs(1)))));
    target.start().unwrap();
    registry.add(target);
    let clock = crate::time::CoarseClock::spawn(Duration::from_millis(1)).handle();
    (Logger::new(tree.root(), ThreadMode::Shared, Arc::clone(&tree), registry, clock), tree)
  }

  #[test]
  fn disabled_level_skips_argument_formatting() {
    let counter = Arc::new(AtomicUsize::new(0));
    let (logger, tree) = build();
    tree.set_level(logger.source_id(), LogLevel::Error);
    let counter2 = Arc::clone(&counter);
    logger.log_at(LogLevel::Diag, "f.rs", 1, "f", format_args!("{}", {
      counter2.fetch_add(1, Ordering::SeqCst);
      "expensive"
    }));
    assert_eq!(counter.load(Ordering::SeqCst), 0);
  }

  #[test]
  fn multi_part_log_builds_one_record() {
    let (logger, _tree) = build();
    logger.log_begin(LogLevel::Info, "f.rs", 1, "f", format_args!("start"));
    logger.log_append(format_args!("-mid-{}", 7));
    logger.log_append_nf("-tail");
    logger.log_end();
    // No assertion on backend contents here (covered at the Target
    // layer); this exercises that END clears the thread-local builder.
    logger.log_end();
  }
}
