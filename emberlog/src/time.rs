//! Cheap, cached wall-clock time.
//!
//! Taking a real timestamp on every log call is one of the more expensive
//! parts of the hot path once allocation is out of the way. [`CoarseClock`]
//! amortizes that cost with a dedicated background thread that refreshes a
//! shared atomic at a configurable resolution (default 100µs, i.e. well
//! under the ≥100ns resolution §3 requires of a `Record`'s timestamp), the
//! same "one background thread feeding a shared atomic" shape the teacher
//! uses in `trace::Trace::writer_loop` for its periodic-flush timer.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// External boundary time format from §6: `YYYY-MM-DD HH:MM:SS.mmm`.
pub fn format_epoch_nanos(nanos: u64, utc: bool) -> String {
  let datetime = chrono::DateTime::<chrono::Utc>::from_timestamp(
    (nanos / 1_000_000_000) as i64,
    (nanos % 1_000_000_000) as u32,
  )
  .unwrap_or_else(|| chrono::DateTime::<chrono::Utc>::from_timestamp(0, 0).unwrap());

  if utc {
    datetime.format("%Y-%m-%d %H:%M:%S%.3f").to_string()
  } else {
    let local: chrono::DateTime<chrono::Local> = datetime.into();
    local.format("%Y-%m-%d %H:%M:%S%.3f").to_string()
  }
}

#[inline]
pub fn now_nanos() -> u64 {
  SystemTime::now()
    .duration_since(UNIX_EPOCH)
    .unwrap_or_default()
    .as_nanos() as u64
}

struct Inner {
  nanos: AtomicU64,
  stop: AtomicBool,
}

/// A shared, background-refreshed timestamp source.
///
/// Cloning a `CoarseClock` clones the `Arc` handle; only the original
/// owner's `Drop` stops the refresh thread (mirrors the teacher's
/// `TimerEvery`-style "owns a background thread, cooperative stop" shape
/// reused here for `FlushPolicy::TimerEvery`, see `flush_policy`).
pub struct CoarseClock {
  inner: Arc<Inner>,
  handle: Option<JoinHandle<()>>,
}

impl CoarseClock {
  /// Spawn the refresh thread, ticking every `resolution`.
  pub fn spawn(resolution: Duration) -> Self {
    let inner = Arc::new(Inner {
      nanos: AtomicU64::new(now_nanos()),
      stop: AtomicBool::new(false),
    });
    let worker = Arc::clone(&inner);
    let handle = std::thread::Builder::new()
      .name("emberlog-clock".into())
      .spawn(move || {
        while !worker.stop.load(Ordering::Relaxed) {
          worker.nanos.store(now_nanos(), Ordering::Relaxed);
          std::thread::sleep(resolution);
        }
      })
      .expect("failed to spawn emberlog-clock thread");

    Self {
      inner,
      handle: Some(handle),
    }
  }

  /// Handle usable from other threads without keeping the join handle
  /// (and therefore without stopping the clock on drop).
  pub fn handle(&self) -> ClockHandle {
    ClockHandle {
      inner: Arc::clone(&self.inner),
    }
  }

  #[inline]
  pub fn now_nanos(&self) -> u64 {
    self.inner.nanos.load(Ordering::Relaxed)
  }
}

impl Drop for CoarseClock {
  fn drop(&mut self) {
    self.inner.stop.store(true, Ordering::Relaxed);
    if let Some(handle) = self.handle.take() {
      let _ = handle.join();
    }
  }
}

/// A cheap, `Clone`-able read handle into a [`CoarseClock`].
#[derive(Clone)]
pub struct ClockHandle {
  inner: Arc<Inner>,
}

impl ClockHandle {
  #[inline]
  pub fn now_nanos(&self) -> u64 {
    self.inner.nanos.load(Ordering::Relaxed)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn clock_advances() {
    let clock = CoarseClock::spawn(Duration::from_millis(1));
    let first = clock.now_nanos();
    std::thread::sleep(Duration::from_millis(20));
    let second = clock.now_nanos();
    assert!(second >= first);
  }

  #[test]
  fn formats_with_millisecond_precision() {
    // 2024-01-02 03:04:05.678 UTC
    let nanos: u64 = 1_704_171_845_678_000_000;
    let formatted = format_epoch_nanos(nanos, true);
    assert_eq!(formatted, "2024-01-02 03:04:05.678");
  }
}
