//! Quantum sink (§4.6): a single MPSC ring of cache-aligned cells with an
//! explicit `Vacant → Writing → Ready → Reading → Vacant` state machine,
//! drained by one background reader.
//!
//! Has no teacher analogue — `lf_buffer::LockFreeRingBuffer` just wraps
//! `crossbeam_queue::ArrayQueue`, which has no per-cell state a writer
//! can expose to a reader, so it can't express the FSM §3's "async cell
//! state" invariant requires. This module keeps the teacher's
//! cache-aligned-cell habit (`crossbeam_utils::CachePadded`) but
//! implements the ring from atomics directly.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_utils::CachePadded;

use crate::error::{Error, ErrorKind, Result};
use crate::record::Control;

use super::{LockClass, SinkBackend};

/// Behavior when a writer's reserved slot isn't free yet (§4.6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CongestionPolicy {
  Wait,
  DiscardLog,
  DiscardAll,
}

const VACANT: u8 = 0;
const WRITING: u8 = 1;
const READY: u8 = 2;

struct Cell {
  state: CachePadded<AtomicU8>,
  payload: Mutex<Option<(Vec<u8>, Control)>>,
}

impl Cell {
  fn new() -> Self {
    Self {
      state: CachePadded::new(AtomicU8::new(VACANT)),
      payload: Mutex::new(None),
    }
  }
}

struct Inner {
  inner: Box<dyn SinkBackend>,
  cells: Vec<Cell>,
  ring_size: u64,
  write_pos: CachePadded<AtomicU64>,
  read_pos: CachePadded<AtomicU64>,
  congestion: CongestionPolicy,
  discarding: AtomicBool,
  collect_period: Duration,
  stop: AtomicBool,
  /// Set if `reader_loop` unwinds from a panic; §7's "async-worker
  /// panics terminate the worker, mark the target degraded" — checked by
  /// `push` so the next submit reports an `IoPermanent` error instead of
  /// silently spinning against a ring nothing drains anymore.
  panicked: AtomicBool,
}

impl Inner {
  fn push(&self, bytes: Vec<u8>, control: Control) -> usize {
    let len = bytes.len();

    if self.congestion == CongestionPolicy::DiscardAll && self.discarding.load(Ordering::Acquire) {
      let r = self.read_pos.load(Ordering::Acquire);
      let w = self.write_pos.load(Ordering::Acquire);
      if w.saturating_sub(r) >= self.ring_size {
        return 0;
      }
      self.discarding.store(false, Ordering::Release);
    }

    // Test fullness *before* reserving a slot: a writer must never advance
    // `write_pos` past a slot it then refuses to publish, or the reader's
    // `for i in r..w` loop spins forever on a cell stuck at `VACANT`.
    let w = loop {
      let w = self.write_pos.load(Ordering::Acquire);
      let r = self.read_pos.load(Ordering::Acquire);
      if w.saturating_sub(r) >= self.ring_size {
        match self.congestion {
          CongestionPolicy::Wait => {
            std::hint::spin_loop();
            continue;
          },
          CongestionPolicy::DiscardLog => return 0,
          CongestionPolicy::DiscardAll => {
            self.discarding.store(true, Ordering::Release);
            return 0;
          },
        }
      }
      if self
        .write_pos
        .compare_exchange_weak(w, w + 1, Ordering::SeqCst, Ordering::Relaxed)
        .is_ok()
      {
        break w;
      }
      std::hint::spin_loop();
    };

    let cell = &self.cells[(w % self.ring_size) as usize];
    while cell
      .state
      .compare_exchange(VACANT, WRITING, Ordering::SeqCst, Ordering::SeqCst)
      .is_err()
    {
      std::hint::spin_loop();
    }
    *cell.payload.lock().unwrap() = Some((bytes, control));
    cell.state.store(READY, Ordering::SeqCst);
    len
  }

  fn reader_loop(self: Arc<Self>) {
    loop {
      let w_raw = self.write_pos.load(Ordering::Acquire);
      let r = self.read_pos.load(Ordering::Acquire);
      if w_raw == r {
        if self.stop.load(Ordering::Relaxed) {
          return;
        }
        std::thread::sleep(self.collect_period);
        continue;
      }
      let w = w_raw.min(r + self.ring_size);
      for i in r..w {
        let cell = &self.cells[(i % self.ring_size) as usize];
        while cell.state.load(Ordering::Acquire) != READY {
          std::hint::spin_loop();
        }
        let payload = cell.payload.lock().unwrap().take();
        cell.state.store(VACANT, Ordering::SeqCst);
        self.read_pos.fetch_add(1, Ordering::Release);

        match payload {
          Some((bytes, Control::Normal)) => {
            let _ = self.inner.write(&bytes);
          },
          Some((_, Control::Flush)) => {
            let _ = self.inner.flush_impl();
          },
          Some((_, Control::Stop)) | None => {
            let _ = self.inner.flush_impl();
            return;
          },
        }
      }
    }
  }
}

/// A sink backend fronted by a single-reader, multi-writer ring.
pub struct QuantumBackend {
  inner: Arc<Inner>,
  handle: Mutex<Option<JoinHandle<()>>>,
}

impl QuantumBackend {
  pub fn new(inner: Box<dyn SinkBackend>, ring_size: usize, congestion: CongestionPolicy) -> Self {
    let ring_size = ring_size.max(2);
    let cells = (0..ring_size).map(|_| Cell::new()).collect();
    Self {
      inner: Arc::new(Inner {
        inner,
        cells,
        ring_size: ring_size as u64,
        write_pos: CachePadded::new(AtomicU64::new(0)),
        read_pos: CachePadded::new(AtomicU64::new(0)),
        congestion,
        discarding: AtomicBool::new(false),
        collect_period: Duration::from_micros(200),
        stop: AtomicBool::new(false),
        panicked: AtomicBool::new(false),
      }),
      handle: Mutex::new(None),
    }
  }
}

impl SinkBackend for QuantumBackend {
  fn start(&self) -> Result<()> {
    self.inner.inner.start()?;
    let worker = Arc::clone(&self.inner);
    let handle = std::thread::Builder::new()
      .name("emberlog-quantum".into())
      .spawn(move || {
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| Arc::clone(&worker).reader_loop()));
        if result.is_err() {
          worker.panicked.store(true, Ordering::Release);
        }
      })
      .expect("failed to spawn emberlog-quantum thread");
    *self.handle.lock().unwrap() = Some(handle);
    Ok(())
  }

  fn write(&self, bytes: &[u8]) -> Result<usize> {
    if self.inner.panicked.load(Ordering::Acquire) {
      return Err(Error::new(ErrorKind::IoPermanent, "emberlog-quantum reader thread panicked"));
    }
    Ok(self.inner.push(bytes.to_vec(), Control::Normal))
  }

  fn flush_impl(&self) -> Result<()> {
    if self.inner.panicked.load(Ordering::Acquire) {
      return Err(Error::new(ErrorKind::IoPermanent, "emberlog-quantum reader thread panicked"));
    }
    self.inner.push(Vec::new(), Control::Flush);
    Ok(())
  }

  fn stop(&self) -> Result<()> {
    self.inner.push(Vec::new(), Control::Stop);
    self.inner.stop.store(true, Ordering::Relaxed);
    if let Some(handle) = self.handle.lock().unwrap().take() {
      let _ = handle.join();
    }
    self.inner.inner.stop()
  }

  fn lock_class(&self) -> LockClass {
    LockClass::NativelyThreadSafe
  }

  fn is_caught_up(&self) -> bool {
    self.inner.write_pos.load(Ordering::Relaxed) == self.inner.read_pos.load(Ordering::Relaxed)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::Mutex as StdMutex;

  struct RecordingBackend(StdMutex<Vec<String>>);

  impl SinkBackend for RecordingBackend {
    fn write(&self, bytes: &[u8]) -> Result<usize> {
      self.0.lock().unwrap().push(String::from_utf8_lossy(bytes).into_owned());
      Ok(bytes.len())
    }
  }

  #[test]
  fn writer_records_reach_inner_backend_in_order() {
    let recorder = Arc::new(StdMutex::new(Vec::new()));
    struct Shared(Arc<StdMutex<Vec<String>>>);
    impl SinkBackend for Shared {
      fn write(&self, bytes: &[u8]) -> Result<usize> {
        self.0.lock().unwrap().push(String::from_utf8_lossy(bytes).into_owned());
        Ok(bytes.len())
      }
    }
    let backend = QuantumBackend::new(Box::new(Shared(Arc::clone(&recorder))), 8, CongestionPolicy::Wait);
    backend.start().unwrap();
    for i in 0..5 {
      backend.write(format!("msg-{i}").as_bytes()).unwrap();
    }
    std::thread::sleep(Duration::from_millis(50));
    backend.stop().unwrap();
    let got = recorder.lock().unwrap();
    assert_eq!(got.len(), 5);
    assert_eq!(got[0], "msg-0");
    assert_eq!(got[4], "msg-4");
  }

  #[test]
  fn panicking_reader_degrades_future_writes() {
    struct PanicOnWrite;
    impl SinkBackend for PanicOnWrite {
      fn write(&self, _bytes: &[u8]) -> Result<usize> {
        panic!("boom");
      }
    }
    let backend = QuantumBackend::new(Box::new(PanicOnWrite), 4, CongestionPolicy::Wait);
    backend.start().unwrap();
    backend.write(b"trigger").unwrap();
    std::thread::sleep(Duration::from_millis(50));
    assert!(backend.write(b"after").is_err());
    let _ = backend.stop();
  }

  #[test]
  fn discard_log_drops_when_ring_full_under_wait() {
    let backend = QuantumBackend::new(
      Box::new(RecordingBackend(StdMutex::new(Vec::new()))),
      2,
      CongestionPolicy::DiscardLog,
    );
    // No reader started: every slot beyond ring_size is immediately full.
    let first = backend.write(b"a").unwrap();
    let second = backend.write(b"b").unwrap();
    let third = backend.write(b"c").unwrap();
    assert_eq!(first, 1);
    assert_eq!(second, 1);
    assert_eq!(third, 0);
  }

  #[test]
  fn wait_policy_with_full_ring_and_running_reader_does_not_hang() {
    let recorder = Arc::new(StdMutex::new(Vec::new()));
    struct Shared(Arc<StdMutex<Vec<String>>>);
    impl SinkBackend for Shared {
      fn write(&self, bytes: &[u8]) -> Result<usize> {
        self.0.lock().unwrap().push(String::from_utf8_lossy(bytes).into_owned());
        Ok(bytes.len())
      }
    }
    // ring_size smaller than the number of writes: a writer must block
    // (not reserve-and-abandon a slot) once the ring is full, or the
    // reader spins forever on a cell that is never published to READY.
    let backend = QuantumBackend::new(Box::new(Shared(Arc::clone(&recorder))), 2, CongestionPolicy::Wait);
    backend.start().unwrap();
    for i in 0..10 {
      backend.write(format!("msg-{i}").as_bytes()).unwrap();
    }
    std::thread::sleep(Duration::from_millis(100));
    backend.stop().unwrap();
    assert_eq!(recorder.lock().unwrap().len(), 10);
  }
}
