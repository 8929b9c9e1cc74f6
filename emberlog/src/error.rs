//! Structured errors (§7) plus a rate-limited runtime error channel.
//!
//! `ErrorSink` generalizes the teacher's `panic_hook::PanicHook` /
//! `signal_hook::SignalHook` — both "install a handler, never block,
//! never propagate" — from an unconditional `eprintln!` into a
//! pluggable handler with a per-`(target, message)` suppression window,
//! since §7 calls for rate-limited reporting rather than an
//! unconditional write on every occurrence.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use thiserror::Error as ThisError;

/// The abstract error kinds §7 defines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
  /// Malformed format, property, or target spec.
  ConfigParse,
  /// Unknown field name, duplicate source, unknown scheme.
  ConfigSemantics,
  /// Out-of-memory, no free producer slot, ring full under a discard
  /// congestion policy.
  ResourceExhausted,
  /// Downstream transport temporarily unavailable.
  IoTransient,
  /// Downstream transport refuses permanently.
  IoPermanent,
  /// `submit` before `start` or after `stop`.
  Lifecycle,
}

impl fmt::Display for ErrorKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let name = match self {
      ErrorKind::ConfigParse => "config-parse",
      ErrorKind::ConfigSemantics => "config-semantics",
      ErrorKind::ResourceExhausted => "resource-exhausted",
      ErrorKind::IoTransient => "io-transient",
      ErrorKind::IoPermanent => "io-permanent",
      ErrorKind::Lifecycle => "lifecycle",
    };
    f.write_str(name)
  }
}

/// The crate's fallible-API error type. Parse-time errors from
/// `initialize`/`configure_*` are returned via this type and leave no
/// side effects (§7 propagation policy); runtime errors never surface
/// here — they go through [`ErrorSink`] instead.
#[derive(Debug, ThisError)]
#[error("{kind}: {message}")]
pub struct Error {
  pub kind: ErrorKind,
  pub message: String,
  #[source]
  pub source: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
}

impl Error {
  pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
    Self {
      kind,
      message: message.into(),
      source: None,
    }
  }

  pub fn with_source(
    kind: ErrorKind,
    message: impl Into<String>,
    source: impl std::error::Error + Send + Sync + 'static,
  ) -> Self {
    Self {
      kind,
      message: message.into(),
      source: Some(Box::new(source)),
    }
  }
}

pub type Result<T> = std::result::Result<T, Error>;

/// A single runtime error occurrence, as delivered to an
/// [`ErrorHandler`].
#[derive(Debug, Clone)]
pub struct TargetError {
  pub target_name: String,
  pub kind: ErrorKind,
  pub message: String,
}

pub type ErrorHandler = Arc<dyn Fn(&TargetError) + Send + Sync>;

/// Routes runtime errors (inside `submit`/`flush`, or from a caught
/// async-worker panic) to a pluggable handler, suppressing an identical
/// `(target, message)` pair reported again within `window` (§7: "rate-
/// limited per target (identical message suppressed within a window)").
pub struct ErrorSink {
  handler: ErrorHandler,
  window_nanos: u64,
  last_reported: Mutex<HashMap<(String, String), u64>>,
}

impl fmt::Debug for ErrorSink {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("ErrorSink")
      .field("handler", &"..")
      .field("window_nanos", &self.window_nanos)
      .field("last_reported", &self.last_reported)
      .finish()
  }
}

impl ErrorSink {
  pub fn new(handler: ErrorHandler, window: Duration) -> Self {
    Self {
      handler,
      window_nanos: window.as_nanos() as u64,
      last_reported: Mutex::new(HashMap::new()),
    }
  }

  /// An `ErrorSink` that writes unsuppressed occurrences to stderr,
  /// matching the teacher's hooks' default behavior.
  pub fn stderr(window: Duration) -> Self {
    Self::new(
      Arc::new(|err: &TargetError| {
        eprintln!("emberlog: [{}] {}: {}", err.target_name, err.kind, err.message);
      }),
      window,
    )
  }

  pub fn report(&self, target_name: &str, kind: ErrorKind, message: impl Into<String>) {
    let message = message.into();
    let key = (target_name.to_string(), message.clone());
    let now = crate::time::now_nanos();

    let mut last_reported = self.last_reported.lock();
    if let Some(&previous) = last_reported.get(&key) {
      if now.saturating_sub(previous) < self.window_nanos {
        return;
      }
    }
    last_reported.insert(key, now);
    drop(last_reported);

    (self.handler)(&TargetError {
      target_name: target_name.to_string(),
      kind,
      message,
    });
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::atomic::{AtomicUsize, Ordering};

  #[test]
  fn duplicate_message_is_suppressed_within_window() {
    let count = Arc::new(AtomicUsize::new(0));
    let handle = Arc::clone(&count);
    let sink = ErrorSink::new(
      Arc::new(move |_: &TargetError| {
        handle.fetch_add(1, Ordering::SeqCst);
      }),
      Duration::from_secs(60),
    );
    sink.report("file-target", ErrorKind::IoTransient, "disk full");
    sink.report("file-target", ErrorKind::IoTransient, "disk full");
    assert_eq!(count.load(Ordering::SeqCst), 1);
  }

  #[test]
  fn distinct_messages_both_reported() {
    let count = Arc::new(AtomicUsize::new(0));
    let handle = Arc::clone(&count);
    let sink = ErrorSink::new(
      Arc::new(move |_: &TargetError| {
        handle.fetch_add(1, Ordering::SeqCst);
      }),
      Duration::from_secs(60),
    );
    sink.report("file-target", ErrorKind::IoTransient, "disk full");
    sink.report("file-target", ErrorKind::IoPermanent, "connection refused");
    assert_eq!(count.load(Ordering::SeqCst), 2);
  }

  #[test]
  fn report_after_window_elapses_is_not_suppressed() {
    let count = Arc::new(AtomicUsize::new(0));
    let handle = Arc::clone(&count);
    let sink = ErrorSink::new(
      Arc::new(move |_: &TargetError| {
        handle.fetch_add(1, Ordering::SeqCst);
      }),
      Duration::from_millis(1),
    );
    sink.report("file-target", ErrorKind::IoTransient, "disk full");
    std::thread::sleep(Duration::from_millis(10));
    sink.report("file-target", ErrorKind::IoTransient, "disk full");
    assert_eq!(count.load(Ordering::SeqCst), 2);
  }
}
