//! A high-throughput structured logging core: format engine, hierarchical
//! log sources, pluggable sync/async targets, and the `Logger` handles
//! user code calls into (see the module docs for the pipeline each piece
//! plays in).
//!
//! This module owns the one thing none of the others do: the process-
//! wide singleton the teacher's `logger::{LOGGER_PTR, LOG_LEVEL}` used to
//! hold directly. Here that slot is a [`State`] behind a `OnceLock`,
//! holding the source tree, target registry, and a name-keyed cache of
//! already-built [`Logger`] handles, rather than one bare logger pointer
//! — the `AtomicPtr<LoggerHolder>` swap the teacher used doesn't
//! generalize to "one logger per qualified source name".

pub mod buffer;
pub mod config;
pub mod error;
pub mod field_spec;
pub mod filter;
pub mod flush_policy;
pub mod formatter;
pub mod level;
pub mod logger;
pub mod receptor;
pub mod record;
pub mod source;
pub mod target;
pub mod time;

pub extern crate emberlog_macros;

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use parking_lot::Mutex as PLMutex;

pub use config::{ConfigValue, Configurator};
pub use error::{Error, ErrorHandler, ErrorKind, ErrorSink, Result, TargetError};
pub use level::LogLevel;
pub use logger::{Logger, ThreadMode};
pub use source::{PropagationMode, SourceId};
pub use target::{LockClass, Registry, SinkBackend, Target, TargetId};

use flush_policy::FlushPolicy;
use filter::Filter;
use target::deferred::DeferredBackend;
use target::file::FileBackend;
use target::segmented_file::SegmentedFileBackend;

const DEFAULT_CLOCK_RESOLUTION: Duration = Duration::from_micros(100);
const DEFAULT_ERROR_WINDOW: Duration = Duration::from_secs(5);

struct State {
  tree: Arc<source::SourceTree>,
  registry: Arc<Registry>,
  error_sink: Arc<ErrorSink>,
  clock: time::CoarseClock,
  loggers: PLMutex<HashMap<(SourceId, ThreadMode), Arc<Logger>>>,
}

static STATE: OnceLock<State> = OnceLock::new();

fn state() -> Result<&'static State> {
  STATE.get().ok_or_else(|| Error::new(ErrorKind::Lifecycle, "emberlog not initialized"))
}

/// Brings up the global source tree, target registry, and clock. Must be
/// called exactly once before any other entry point in this module
/// (§4.8/§6 lifecycle); a second call is a lifecycle error rather than a
/// silent no-op, since a second `initialize` would orphan the first
/// registry's targets without stopping them.
pub fn initialize(error_handler: Option<ErrorHandler>) -> Result<()> {
  let error_sink = Arc::new(match error_handler {
    Some(handler) => ErrorSink::new(handler, DEFAULT_ERROR_WINDOW),
    None => ErrorSink::stderr(DEFAULT_ERROR_WINDOW),
  });
  let state = State {
    tree: Arc::new(source::SourceTree::new()),
    registry: Arc::new(Registry::new()),
    error_sink,
    clock: time::CoarseClock::spawn(DEFAULT_CLOCK_RESOLUTION),
    loggers: PLMutex::new(HashMap::new()),
  };
  STATE
    .set(state)
    .map_err(|_| Error::new(ErrorKind::Lifecycle, "emberlog already initialized"))
}

/// A small [`SinkBackend`] wrapper that upgrades a backend's lock class
/// to [`LockClass::RequiresLock`], for callers of [`initialize_log_file`]
/// who want the base `Target`'s own mutex around every `submit` even
/// though [`FileBackend`] already self-serializes (§6's `use_lock` knob).
struct ForceLockBackend(Box<dyn SinkBackend>);

impl SinkBackend for ForceLockBackend {
  fn start(&self) -> Result<()> {
    self.0.start()
  }

  fn stop(&self) -> Result<()> {
    self.0.stop()
  }

  fn write(&self, bytes: &[u8]) -> Result<usize> {
    self.0.write(bytes)
  }

  fn flush_impl(&self) -> Result<()> {
    self.0.flush_impl()
  }

  fn lock_class(&self) -> LockClass {
    LockClass::RequiresLock
  }

  fn is_caught_up(&self) -> bool {
    self.0.is_caught_up()
  }
}

fn maybe_defer(backend: Box<dyn SinkBackend>, buffer_size: Option<usize>) -> Box<dyn SinkBackend> {
  match buffer_size {
    Some(capacity) => Box::new(DeferredBackend::new(backend, capacity, Duration::from_millis(100))),
    None => backend,
  }
}

fn start_and_register(
  name: impl Into<String>,
  mut backend: Box<dyn SinkBackend>,
  use_lock: bool,
  filter: Option<Arc<dyn Filter>>,
  flush_policy: Option<Arc<dyn FlushPolicy>>,
  formatter: Option<Arc<formatter::StructuredFormatter>>,
) -> Result<TargetId> {
  let state = state()?;
  if use_lock {
    backend = Box::new(ForceLockBackend(backend));
  }
  let mut target = Target::new(name, backend, Arc::clone(&state.error_sink));
  if let Some(filter) = filter {
    target = target.with_filter(filter);
  }
  if let Some(policy) = flush_policy {
    target = target.with_flush_policy(policy);
  }
  if let Some(formatter) = formatter {
    target = target.with_formatter(formatter);
  }
  let target = Arc::new(target);
  target.start()?;
  let id = target.id();
  state.registry.add(target);
  Ok(id)
}

/// Convenience initializer for a single plain-file target (§6
/// `initialize_log_file`). `buffer_size`, when set, wraps the file
/// backend in [`DeferredBackend`] with that many records of slack.
pub fn initialize_log_file(
  path: impl AsRef<Path>,
  buffer_size: Option<usize>,
  use_lock: bool,
  flush_policy: Option<Arc<dyn FlushPolicy>>,
  filter: Option<Arc<dyn Filter>>,
  formatter: Option<Arc<formatter::StructuredFormatter>>,
) -> Result<TargetId> {
  let backend: Box<dyn SinkBackend> = Box::new(FileBackend::new(path.as_ref().to_path_buf()));
  let backend = maybe_defer(backend, buffer_size);
  start_and_register("file", backend, use_lock, filter, flush_policy, formatter)
}

/// Convenience initializer for a rotating, LZ4-compressing file target
/// (§6 `initialize_segmented_log_file`).
pub fn initialize_segmented_log_file(
  dir: impl AsRef<Path>,
  base_name: &str,
  segment_limit_mb: u64,
  buffer_size: Option<usize>,
  use_lock: bool,
  flush_policy: Option<Arc<dyn FlushPolicy>>,
  filter: Option<Arc<dyn Filter>>,
  formatter: Option<Arc<formatter::StructuredFormatter>>,
) -> Result<TargetId> {
  let path = dir.as_ref().join(base_name);
  let backend: Box<dyn SinkBackend> = Box::new(SegmentedFileBackend::new(path, segment_limit_mb));
  let backend = maybe_defer(backend, buffer_size);
  start_and_register("segmented-file", backend, use_lock, filter, flush_policy, formatter)
}

/// Stops every registered target. Cooperative: each async target's
/// `stop` blocks until its final flush has been attempted (§5
/// cancellation policy). Loggers obtained before this call keep working
/// afterward — `Target::submit` treats a stopped target as a silent
/// no-op rather than an error — but nothing reaches a sink again until
/// fresh targets are registered.
pub fn terminate() -> Result<()> {
  let state = state()?;
  let mut first_error = None;
  for target in state.registry.all() {
    if let Err(e) = target.stop() {
      first_error.get_or_insert(e);
    }
  }
  match first_error {
    Some(e) => Err(e),
    None => Ok(()),
  }
}

fn logger_for(source_id: SourceId, thread_mode: ThreadMode) -> Result<Arc<Logger>> {
  let state = state()?;
  let mut loggers = state.loggers.lock();
  if let Some(logger) = loggers.get(&(source_id, thread_mode)) {
    return Ok(Arc::clone(logger));
  }
  let logger = Arc::new(Logger::new(
    source_id,
    thread_mode,
    Arc::clone(&state.tree),
    Arc::clone(&state.registry),
    state.clock.handle(),
  ));
  loggers.insert((source_id, thread_mode), Arc::clone(&logger));
  Ok(logger)
}

/// The logger bound to the root source, usable from any number of
/// threads concurrently (§6 `get_default_logger`).
pub fn get_default_logger() -> Result<Arc<Logger>> {
  let root = state()?.tree.root();
  logger_for(root, ThreadMode::Shared)
}

/// A logger bound to `qname`, defining the path if missing, for
/// single-thread-owned use (§6 `get_private_logger`).
pub fn get_private_logger(qname: &str) -> Result<Arc<Logger>> {
  let state = state()?;
  let source_id = state.tree.define(qname, true).map_err(|e| Error::new(ErrorKind::ConfigSemantics, e))?;
  logger_for(source_id, ThreadMode::Private)
}

/// A logger bound to `qname`, safe for concurrent use from any number of
/// threads (§6 `get_shared_logger`).
pub fn get_shared_logger(qname: &str) -> Result<Arc<Logger>> {
  let state = state()?;
  let source_id = state.tree.define(qname, true).map_err(|e| Error::new(ErrorKind::ConfigSemantics, e))?;
  logger_for(source_id, ThreadMode::Shared)
}

/// Registers `target`, optionally printing a one-line startup banner the
/// way the teacher's listeners announce themselves on `start` (§6
/// `set_log_target`). `target` must not already be started; this calls
/// `start` on it.
pub fn set_log_target(target: Target, print_banner: bool) -> Result<TargetId> {
  let state = state()?;
  let target = Arc::new(target);
  target.start()?;
  let id = target.id();
  if print_banner {
    eprintln!("emberlog: target {:?} (id={}) started", target.name(), id);
  }
  state.registry.add(target);
  Ok(id)
}

/// Registers an already-started `target` without a banner (§6
/// `add_log_target`).
pub fn add_log_target(target: Arc<Target>) -> Result<TargetId> {
  let state = state()?;
  let id = target.id();
  state.registry.add(target);
  Ok(id)
}

/// Stops and removes the target with the given id, if present (§6
/// `remove_log_target`).
pub fn remove_log_target(id: TargetId) -> Result<()> {
  let state = state()?;
  if let Some(target) = state.registry.remove(id) {
    target.stop()?;
  }
  Ok(())
}

/// Looks up a registered target by id (§6 `get_log_target`).
pub fn get_log_target(id: TargetId) -> Result<Option<Arc<Target>>> {
  Ok(state()?.registry.get(id))
}

/// Applies a parsed configuration tree (§6 configuration ingestion) to
/// the global source tree and target registry.
pub fn configure(config: &ConfigValue) -> Result<()> {
  let state = state()?;
  let configurator = Configurator::new(Arc::clone(&state.tree), Arc::clone(&state.error_sink));
  let registry = configurator.configure(config)?;
  for target in registry.all() {
    state.registry.add(target);
  }
  Ok(())
}

#[cfg(test)]
mod tests {
  // `STATE` is a process-wide `OnceLock`; these tests share one process
  // and must not call `initialize` more than once or race each other's
  // global state, so everything here runs in a single test that chains
  // the lifecycle end to end.
  use super::*;

  #[test]
  fn lifecycle_end_to_end() {
    assert!(get_default_logger().is_err());
    initialize(None).unwrap();
    assert!(initialize(None).is_err());

    let logger = get_default_logger().unwrap();
    logger.log_at(LogLevel::Info, "f.rs", 1, "f", format_args!("hello"));

    let child = get_shared_logger("app.db").unwrap();
    assert_eq!(child.thread_mode(), ThreadMode::Shared);

    let private = get_private_logger("app.worker").unwrap();
    assert_eq!(private.thread_mode(), ThreadMode::Private);

    assert!(get_log_target(999).unwrap().is_none());
    terminate().unwrap();
  }
}
