//! Log targets: the sink polymorphism root (§4.3).
//!
//! [`Target`] is the common, non-generic machinery every concrete sink
//! shares (lifecycle state, filter/formatter/flush-policy application,
//! counters, lock-class-driven locking) — generalized from the teacher's
//! `listener::LogListener` trait, which bundled "format + write" into one
//! method per listener. Here the shared `submit` algorithm lives once on
//! `Target`, and a concrete backend only implements the raw
//! [`SinkBackend::write`] byte sink, matching the "thin backend, shared
//! base does the bookkeeping" split the teacher's `file_listener` /
//! `stdout_listener` pair already approximates (both only really differ
//! in `write`, while duplicating flush/open logic).

pub mod deferred;
pub mod file;
pub mod multi_quantum;
pub mod quantum;
pub mod segmented_file;
pub mod stdout;

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{ErrorKind, ErrorSink, Result};
use crate::filter::Filter;
use crate::flush_policy::FlushPolicy;
use crate::formatter::{RenderContext, RenderedOutput, StructuredFormatter};
use crate::level::LogLevel;
use crate::record::Record;

pub type TargetId = u32;

static NEXT_TARGET_ID: AtomicU32 = AtomicU32::new(1);

pub fn next_target_id() -> TargetId {
  NEXT_TARGET_ID.fetch_add(1, Ordering::Relaxed)
}

/// Who is responsible for serializing concurrent access to a target
/// (§4.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockClass {
  /// The backend itself serializes shared state; the base takes no lock.
  NativelyThreadSafe,
  /// The caller guarantees serialized access; the base takes no lock.
  ExternallyThreadSafe,
  /// The base wraps `start/stop/submit/flush` in a per-target lock.
  RequiresLock,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
  NotStarted,
  Running,
  Stopped,
}

/// The raw backend a concrete sink implements: write already-rendered
/// bytes, and report whether it has drained everything handed to it.
pub trait SinkBackend: Send + Sync {
  fn start(&self) -> Result<()> {
    Ok(())
  }

  fn stop(&self) -> Result<()> {
    Ok(())
  }

  /// Write one rendered record. Returns the number of bytes written.
  fn write(&self, bytes: &[u8]) -> Result<usize>;

  fn flush_impl(&self) -> Result<()> {
    Ok(())
  }

  fn lock_class(&self) -> LockClass {
    LockClass::RequiresLock
  }

  /// `true` iff every record previously handed to `write` has reached
  /// its final destination. Async backends (deferred/quantum/multi-
  /// quantum) override this; synchronous backends are always caught up.
  fn is_caught_up(&self) -> bool {
    true
  }
}

fn render_to_bytes(output: &RenderedOutput, add_newline: bool) -> Vec<u8> {
  let mut text = match output {
    RenderedOutput::Text(s) => s.clone(),
    RenderedOutput::Json(v) => serde_json::to_string(v).unwrap_or_default(),
    RenderedOutput::Row(values) => values.join("\t"),
    RenderedOutput::Headers(pairs) => pairs
      .iter()
      .map(|(k, v)| format!("{}={}", k, v))
      .collect::<Vec<_>>()
      .join(";"),
  };
  if add_newline {
    text.push('\n');
  }
  text.into_bytes()
}

/// A single configured sink: backend plus the shared per-target policy
/// (§3 `Target`, §4.3 public operations).
pub struct Target {
  name: String,
  id: TargetId,
  backend: Box<dyn SinkBackend>,
  filter: Option<Arc<dyn Filter>>,
  formatter: Option<Arc<StructuredFormatter>>,
  flush_policy: Option<Arc<dyn FlushPolicy>>,
  add_newline: bool,
  level: AtomicU8,
  state: Mutex<State>,
  lock: Option<Mutex<()>>,
  flush_gate: AtomicBool,
  degraded: AtomicBool,
  bytes_written: AtomicU64,
  records_written: AtomicU64,
  error_sink: Arc<ErrorSink>,
  utc: bool,
}

impl fmt::Debug for Target {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Target")
      .field("name", &self.name)
      .field("id", &self.id)
      .field("backend", &"..")
      .field("filter", &self.filter.as_ref().map(|_| ".."))
      .field("formatter", &self.formatter)
      .field("flush_policy", &self.flush_policy.as_ref().map(|_| ".."))
      .field("add_newline", &self.add_newline)
      .field("level", &self.level)
      .field("state", &self.state)
      .field("lock", &self.lock.is_some())
      .field("flush_gate", &self.flush_gate)
      .field("degraded", &self.degraded)
      .field("bytes_written", &self.bytes_written)
      .field("records_written", &self.records_written)
      .field("error_sink", &self.error_sink)
      .field("utc", &self.utc)
      .finish()
  }
}

impl Target {
  pub fn new(name: impl Into<String>, backend: Box<dyn SinkBackend>, error_sink: Arc<ErrorSink>) -> Self {
    let lock_class = backend.lock_class();
    Self {
      name: name.into(),
      id: next_target_id(),
      backend,
      filter: None,
      formatter: None,
      flush_policy: None,
      add_newline: true,
      level: AtomicU8::new(LogLevel::Diag as u8),
      state: Mutex::new(State::NotStarted),
      lock: matches!(lock_class, LockClass::RequiresLock).then(|| Mutex::new(())),
      flush_gate: AtomicBool::new(false),
      degraded: AtomicBool::new(false),
      bytes_written: AtomicU64::new(0),
      records_written: AtomicU64::new(0),
      error_sink,
      utc: true,
    }
  }

  pub fn with_filter(mut self, filter: Arc<dyn Filter>) -> Self {
    self.filter = Some(filter);
    self
  }

  pub fn with_formatter(mut self, formatter: Arc<StructuredFormatter>) -> Self {
    self.formatter = Some(formatter);
    self
  }

  pub fn with_flush_policy(mut self, policy: Arc<dyn FlushPolicy>) -> Self {
    self.flush_policy = Some(policy);
    self
  }

  pub fn with_add_newline(mut self, add_newline: bool) -> Self {
    self.add_newline = add_newline;
    self
  }

  pub fn with_level(mut self, level: LogLevel) -> Self {
    self.level = AtomicU8::new(level as u8);
    self
  }

  pub fn name(&self) -> &str {
    &self.name
  }

  pub fn id(&self) -> TargetId {
    self.id
  }

  pub fn is_degraded(&self) -> bool {
    self.degraded.load(Ordering::Acquire)
  }

  pub fn bytes_written(&self) -> u64 {
    self.bytes_written.load(Ordering::Relaxed)
  }

  pub fn records_written(&self) -> u64 {
    self.records_written.load(Ordering::Relaxed)
  }

  pub fn is_caught_up(&self) -> bool {
    self.backend.is_caught_up()
  }

  /// `start` must be called exactly once before `submit` (§4.3
  /// invariant). Takes `Arc<Self>` so a timer flush policy can hold a
  /// closure back into this target without a cyclic owned reference.
  pub fn start(self: &Arc<Self>) -> Result<()> {
    let mut state = self.state.lock();
    if *state != State::NotStarted {
      return Err(crate::error::Error::new(
        ErrorKind::Lifecycle,
        format!("target {:?} started more than once", self.name),
      ));
    }
    self.backend.start()?;
    if let Some(policy) = &self.flush_policy {
      let weak = Arc::downgrade(self);
      policy.start(Arc::new(move || {
        if let Some(target) = weak.upgrade() {
          target.flush();
        }
      }));
    }
    *state = State::Running;
    Ok(())
  }

  /// `stop` must be called exactly once after the last `submit` returns;
  /// best-effort flush is still attempted even if the backend errors
  /// (§4.3 invariant).
  pub fn stop(&self) -> Result<()> {
    let mut state = self.state.lock();
    if *state != State::Running {
      return Err(crate::error::Error::new(
        ErrorKind::Lifecycle,
        format!("target {:?} stopped without having started", self.name),
      ));
    }
    if let Some(policy) = &self.flush_policy {
      policy.stop();
    }
    let flush_result = self.backend.flush_impl();
    let stop_result = self.backend.stop();
    *state = State::Stopped;
    stop_result.or(flush_result)
  }

  #[inline]
  fn is_running(&self) -> bool {
    *self.state.lock() == State::Running
  }

  /// Submit never throws; internal errors are rate-limited and reported
  /// through the error channel (§4.3).
  pub fn submit(&self, record: &Record, source_name: &str) {
    if !self.is_running() || self.degraded.load(Ordering::Acquire) {
      return;
    }
    if record.level > LogLevel::from_u8(self.level.load(Ordering::Relaxed)) {
      return;
    }
    if let Some(filter) = &self.filter {
      if !filter.matches(record) {
        return;
      }
    }

    let ctx = RenderContext::new(record, source_name, self.utc);
    let output = match &self.formatter {
      Some(formatter) => formatter.render(&ctx),
      None => RenderedOutput::Text(record.message.clone()),
    };
    let bytes = render_to_bytes(&output, self.add_newline);
    let len = bytes.len() as u64;

    let guard = self.lock.as_ref().map(|m| m.lock());
    let result = self.backend.write(&bytes);
    drop(guard);

    match result {
      Ok(written) => {
        self.bytes_written.fetch_add(written as u64, Ordering::Relaxed);
        self.records_written.fetch_add(1, Ordering::Relaxed);
        self.maybe_flush(len);
      },
      Err(e) => {
        self.error_sink.report(&self.name, e.kind, e.message.clone());
        if matches!(e.kind, ErrorKind::IoPermanent) {
          self.degraded.store(true, Ordering::Release);
        }
      },
    }
  }

  fn maybe_flush(&self, bytes_just_written: u64) {
    let Some(policy) = &self.flush_policy else { return };
    if !policy.should_flush(bytes_just_written) {
      return;
    }
    match self.backend.lock_class() {
      LockClass::NativelyThreadSafe => {
        // Coalesce concurrent flush requests: only the thread that wins
        // the gate actually flushes; the rest observe its result.
        if self
          .flush_gate
          .compare_exchange(false, true, Ordering::AcqRel, Ordering::Relaxed)
          .is_ok()
        {
          self.flush();
          self.flush_gate.store(false, Ordering::Release);
        }
      },
      _ => self.flush(),
    }
  }

  /// `flush` is idempotent and never blocks on a stopped target (§3
  /// invariant).
  pub fn flush(&self) {
    if !self.is_running() {
      return;
    }
    if let Err(e) = self.backend.flush_impl() {
      self.error_sink.report(&self.name, e.kind, e.message);
    }
  }
}

/// A flat map of configured targets, looked up by id during `Logger`
/// dispatch (§4.2's target affinity mask is a bitmap over these ids).
#[derive(Default)]
pub struct Registry {
  targets: Mutex<HashMap<TargetId, Arc<Target>>>,
}

impl Registry {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn add(&self, target: Arc<Target>) {
    self.targets.lock().insert(target.id(), target);
  }

  pub fn remove(&self, id: TargetId) -> Option<Arc<Target>> {
    self.targets.lock().remove(&id)
  }

  pub fn get(&self, id: TargetId) -> Option<Arc<Target>> {
    self.targets.lock().get(&id).cloned()
  }

  pub fn all(&self) -> Vec<Arc<Target>> {
    self.targets.lock().values().cloned().collect()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::source::SourceId;
  use std::sync::Mutex as StdMutex;
  use std::time::Duration;

  struct RecordingBackend {
    lines: StdMutex<Vec<String>>,
  }

  impl SinkBackend for RecordingBackend {
    fn write(&self, bytes: &[u8]) -> Result<usize> {
      self.lines.lock().unwrap().push(String::from_utf8_lossy(bytes).into_owned());
      Ok(bytes.len())
    }

    fn lock_class(&self) -> LockClass {
      LockClass::RequiresLock
    }
  }

  fn sample_record() -> Record {
    Record::new(0, LogLevel::Error, 1, SourceId(0), "f.rs", 1, "f", "boom".to_string())
  }

  #[test]
  fn submit_before_start_is_a_no_op() {
    let error_sink = Arc::new(ErrorSink::stderr(Duration::from_secs(1)));
    let backend = Box::new(RecordingBackend {
      lines: StdMutex::new(Vec::new()),
    });
    let target = Target::new("t", backend, error_sink);
    target.submit(&sample_record(), "app");
    assert_eq!(target.records_written(), 0);
  }

  #[test]
  fn submit_after_start_writes_and_counts() {
    let error_sink = Arc::new(ErrorSink::stderr(Duration::from_secs(1)));
    let backend = Box::new(RecordingBackend {
      lines: StdMutex::new(Vec::new()),
    });
    let target = Arc::new(Target::new("t", backend, error_sink));
    target.start().unwrap();
    target.submit(&sample_record(), "app");
    assert_eq!(target.records_written(), 1);
    assert!(target.bytes_written() > 0);
  }

  #[test]
  fn level_gate_drops_quieter_records() {
    let error_sink = Arc::new(ErrorSink::stderr(Duration::from_secs(1)));
    let backend = Box::new(RecordingBackend {
      lines: StdMutex::new(Vec::new()),
    });
    let target = Arc::new(Target::new("t", backend, error_sink).with_level(LogLevel::Warn));
    target.start().unwrap();
    let quiet = Record::new(0, LogLevel::Diag, 1, SourceId(0), "f.rs", 1, "f", "noise".to_string());
    target.submit(&quiet, "app");
    assert_eq!(target.records_written(), 0);
  }

  #[test]
  fn double_start_is_a_lifecycle_error() {
    let error_sink = Arc::new(ErrorSink::stderr(Duration::from_secs(1)));
    let backend = Box::new(RecordingBackend {
      lines: StdMutex::new(Vec::new()),
    });
    let target = Arc::new(Target::new("t", backend, error_sink));
    target.start().unwrap();
    assert!(target.start().is_err());
  }
}
