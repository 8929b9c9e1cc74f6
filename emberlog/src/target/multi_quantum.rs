//! Multi-quantum sink (§4.7): one ring per producer thread, drained by a
//! pool of reader threads into a shared funnel, and re-ordered by wall
//! clock timestamp by a dedicated sorting thread before reaching the
//! inner backend.
//!
//! Has no teacher analogue (the teacher routes everything through a
//! single `tracing_subscriber::Layer`); grounded on the same cell-FSM
//! shape as [`super::quantum`], replicated per producer slot, plus
//! `thread_local!` + `Drop` for slot release — generalizing the
//! teacher's `logger::Logger` global-registry pattern's single
//! process-wide slot into one slot per thread, released cooperatively
//! instead of via an OS TLS destructor callback (§9 design note).
//!
//! Simplification versus the literal per-iteration revisit schedule:
//! readers here sweep every active slot every iteration rather than
//! interleaving three distinct cadences, and shutdown drains the funnel
//! unconditionally once every reader has stopped rather than routing a
//! stop sentinel through each ring. Both preserve the documented
//! end-to-end behavior (nothing unread is dropped, final order is
//! timestamp-sorted) with materially less state to reason about.

use std::cell::RefCell;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use crate::error::{Error, ErrorKind, Result};
use crate::record::{current_thread_id, Control};

use super::{LockClass, SinkBackend};

const VACANT: u8 = 0;
const WRITING: u8 = 1;
const READY: u8 = 2;

struct Entry {
  nanos: u64,
  thread_id: u64,
  record_id: u64,
  bytes: Vec<u8>,
  control: Control,
}

struct RingCell {
  state: AtomicU8,
  payload: Mutex<Option<Entry>>,
}

impl RingCell {
  fn new() -> Self {
    Self {
      state: AtomicU8::new(VACANT),
      payload: Mutex::new(None),
    }
  }
}

struct Ring {
  cells: Vec<RingCell>,
  size: u64,
  write_pos: AtomicU64,
  read_pos: AtomicU64,
}

impl Ring {
  fn new(size: usize) -> Self {
    Self {
      cells: (0..size).map(|_| RingCell::new()).collect(),
      size: size as u64,
      write_pos: AtomicU64::new(0),
      read_pos: AtomicU64::new(0),
    }
  }

  /// MPSC-safe push: reserves a slot with a CAS loop (tested for fullness
  /// *before* the reservation commits, never past a slot the caller
  /// won't publish) rather than a plain load+store, since the funnel
  /// ring is pushed concurrently by every reader thread.
  fn push(&self, entry: Entry) {
    let w = loop {
      let w = self.write_pos.load(Ordering::Acquire);
      let r = self.read_pos.load(Ordering::Acquire);
      if w.saturating_sub(r) >= self.size {
        std::hint::spin_loop();
        continue;
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

    let cell = &self.cells[(w % self.size) as usize];
    while cell
      .state
      .compare_exchange(VACANT, WRITING, Ordering::SeqCst, Ordering::SeqCst)
      .is_err()
    {
      std::hint::spin_loop();
    }
    *cell.payload.lock().unwrap() = Some(entry);
    cell.state.store(READY, Ordering::SeqCst);
  }

  /// Drain up to `max` ready entries, returning them plus the largest
  /// timestamp observed.
  fn drain(&self, max: usize) -> (Vec<Entry>, Option<u64>) {
    let mut out = Vec::new();
    let mut max_nanos = None;
    let w = self.write_pos.load(Ordering::Acquire);
    let mut r = self.read_pos.load(Ordering::Acquire);
    while r < w && out.len() < max {
      let cell = &self.cells[(r % self.size) as usize];
      if cell.state.load(Ordering::Acquire) != READY {
        break;
      }
      if let Some(entry) = cell.payload.lock().unwrap().take() {
        max_nanos = Some(max_nanos.map_or(entry.nanos, |m: u64| m.max(entry.nanos)));
        out.push(entry);
      }
      cell.state.store(VACANT, Ordering::SeqCst);
      r += 1;
    }
    self.read_pos.store(r, Ordering::Release);
    (out, max_nanos)
  }

  fn is_empty(&self) -> bool {
    self.write_pos.load(Ordering::Acquire) == self.read_pos.load(Ordering::Acquire)
  }
}

struct Bitmap {
  words: Vec<AtomicU64>,
  bits: usize,
}

impl Bitmap {
  fn new(bits: usize) -> Self {
    let words = (bits.div_ceil(64)).max(1);
    Self {
      words: (0..words).map(|_| AtomicU64::new(0)).collect(),
      bits,
    }
  }

  fn set(&self, bit: usize) {
    self.words[bit / 64].fetch_or(1 << (bit % 64), Ordering::AcqRel);
  }

  fn clear(&self, bit: usize) {
    self.words[bit / 64].fetch_and(!(1 << (bit % 64)), Ordering::AcqRel);
  }

  fn is_set(&self, bit: usize) -> bool {
    (self.words[bit / 64].load(Ordering::Acquire) & (1 << (bit % 64))) != 0
  }

  /// Claim the lowest clear bit, returning its index.
  fn claim_lowest_free(&self) -> Option<usize> {
    for (word_idx, word) in self.words.iter().enumerate() {
      loop {
        let current = word.load(Ordering::Acquire);
        if current == u64::MAX {
          break;
        }
        let free_bit = (!current).trailing_zeros() as usize;
        let index = word_idx * 64 + free_bit;
        if index >= self.bits {
          break;
        }
        let mask = 1u64 << free_bit;
        if word
          .compare_exchange(current, current | mask, Ordering::AcqRel, Ordering::Acquire)
          .is_ok()
        {
          return Some(index);
        }
      }
    }
    None
  }
}

struct Shared {
  inner: Box<dyn SinkBackend>,
  producer_rings: Vec<Ring>,
  funnel: Ring,
  active_threads: Bitmap,
  active_rings: Bitmap,
  thread_log_time: Vec<AtomicU64>,
  max_threads: usize,
  max_batch_size: usize,
  reader_count: usize,
  active_readers: AtomicUsize,
  stop: AtomicBool,
  /// Set if a reader or the sorting thread unwinds from a panic (§7).
  panicked: AtomicBool,
}

impl Shared {
  fn reader_loop(self: &Arc<Self>, reader_index: usize) {
    let span = self.max_threads.div_ceil(self.reader_count.max(1));
    let start = reader_index * span;
    let end = (start + span).min(self.max_threads);
    loop {
      let mut made_progress = false;
      for slot in start..end {
        if !self.active_rings.is_set(slot) && !self.active_threads.is_set(slot) {
          continue;
        }
        let (entries, max_nanos) = self.producer_rings[slot].drain(self.max_batch_size);
        if !entries.is_empty() {
          made_progress = true;
          for entry in entries {
            self.funnel.push(entry);
          }
          if let Some(nanos) = max_nanos {
            self.thread_log_time[slot].store(nanos, Ordering::Relaxed);
          }
        }
        if self.producer_rings[slot].is_empty() {
          self.active_rings.clear(slot);
        }
      }
      if self.stop.load(Ordering::Relaxed) && !made_progress {
        self.active_readers.fetch_sub(1, Ordering::AcqRel);
        return;
      }
      if !made_progress {
        std::thread::sleep(Duration::from_micros(200));
      }
    }
  }

  fn sorting_loop(self: &Arc<Self>) {
    let mut last_seen: Vec<u64> = vec![0; self.max_threads];
    loop {
      let readers_done = self.active_readers.load(Ordering::Acquire) == 0;

      let min_timestamp = if readers_done {
        u64::MAX
      } else {
        let mut min_ts: Option<u64> = None;
        let mut all_dormant = true;
        for slot in 0..self.max_threads {
          if !self.active_threads.is_set(slot) {
            continue;
          }
          let ts = self.thread_log_time[slot].load(Ordering::Relaxed);
          if ts != last_seen[slot] {
            all_dormant = false;
          }
          last_seen[slot] = ts;
          min_ts = Some(min_ts.map_or(ts, |m: u64| m.min(ts)));
        }
        if all_dormant || min_ts.is_none() {
          crate::time::now_nanos()
        } else {
          min_ts.unwrap()
        }
      };

      let (mut entries, _) = self.funnel.drain(self.funnel.size as usize);
      entries.sort_by(|a, b| (a.nanos, a.thread_id, a.record_id).cmp(&(b.nanos, b.thread_id, b.record_id)));

      let mut shipped = 0;
      let mut stopped = false;
      for entry in &entries {
        if !readers_done && entry.nanos >= min_timestamp {
          break;
        }
        shipped += 1;
        match entry.control {
          Control::Normal => {
            let _ = self.inner.write(&entry.bytes);
          },
          Control::Flush => {
            let _ = self.inner.flush_impl();
          },
          Control::Stop => {
            stopped = true;
          },
        }
        if stopped {
          break;
        }
      }
      // Anything not shipped this round goes back through the funnel
      // for the next iteration (preserves FIFO order within a slot
      // since entries keep their original nanos/thread_id/record_id).
      for entry in entries.into_iter().skip(shipped) {
        self.funnel.push(entry);
      }

      if readers_done && shipped == 0 {
        let _ = self.inner.flush_impl();
        return;
      }
      if stopped {
        let _ = self.inner.flush_impl();
        return;
      }
      if shipped == 0 {
        std::thread::sleep(Duration::from_micros(200));
      }
    }
  }
}

struct SlotGuard {
  shared: Arc<Shared>,
  slot: usize,
}

impl Drop for SlotGuard {
  fn drop(&mut self) {
    self.shared.active_threads.clear(self.slot);
    self.shared.active_rings.clear(self.slot);
  }
}

thread_local! {
  static SLOT: RefCell<Option<Option<usize>>> = const { RefCell::new(None) };
  static SLOT_GUARD: RefCell<Vec<SlotGuard>> = const { RefCell::new(Vec::new()) };
}

/// A sink backend that preserves global timestamp ordering across many
/// concurrent producer threads via per-thread rings and a sorting
/// funnel.
pub struct MultiQuantumBackend {
  shared: Arc<Shared>,
  reader_handles: Mutex<Vec<JoinHandle<()>>>,
  sorter_handle: Mutex<Option<JoinHandle<()>>>,
}

impl MultiQuantumBackend {
  pub fn new(
    inner: Box<dyn SinkBackend>,
    max_threads: usize,
    ring_size: usize,
    reader_count: usize,
    max_batch_size: usize,
  ) -> Self {
    let shared = Arc::new(Shared {
      inner,
      producer_rings: (0..max_threads).map(|_| Ring::new(ring_size)).collect(),
      funnel: Ring::new(ring_size * max_threads.max(1)),
      active_threads: Bitmap::new(max_threads),
      active_rings: Bitmap::new(max_threads),
      thread_log_time: (0..max_threads).map(|_| AtomicU64::new(0)).collect(),
      max_threads,
      max_batch_size,
      reader_count: reader_count.max(1),
      active_readers: AtomicUsize::new(reader_count.max(1)),
      stop: AtomicBool::new(false),
      panicked: AtomicBool::new(false),
    });
    Self {
      shared,
      reader_handles: Mutex::new(Vec::new()),
      sorter_handle: Mutex::new(None),
    }
  }

  fn claimed_slot(&self) -> Option<usize> {
    SLOT.with(|cell| {
      if let Some(existing) = *cell.borrow() {
        return existing;
      }
      let claimed = self.shared.active_threads.claim_lowest_free();
      *cell.borrow_mut() = Some(claimed);
      if let Some(slot) = claimed {
        SLOT_GUARD.with(|guards| {
          guards.borrow_mut().push(SlotGuard {
            shared: Arc::clone(&self.shared),
            slot,
          });
        });
      }
      claimed
    })
  }
}

impl SinkBackend for MultiQuantumBackend {
  fn start(&self) -> Result<()> {
    self.shared.inner.start()?;
    let mut readers = self.reader_handles.lock().unwrap();
    for reader_index in 0..self.shared.reader_count {
      let shared = Arc::clone(&self.shared);
      readers.push(
        std::thread::Builder::new()
          .name(format!("emberlog-mq-reader-{reader_index}"))
          .spawn(move || {
            let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| shared.reader_loop(reader_index)));
            if result.is_err() {
              shared.panicked.store(true, Ordering::Release);
              shared.active_readers.fetch_sub(1, Ordering::AcqRel);
            }
          })
          .expect("failed to spawn emberlog multi-quantum reader thread"),
      );
    }
    let shared = Arc::clone(&self.shared);
    *self.sorter_handle.lock().unwrap() = Some(
      std::thread::Builder::new()
        .name("emberlog-mq-sorter".into())
        .spawn(move || {
          let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| shared.sorting_loop()));
          if result.is_err() {
            shared.panicked.store(true, Ordering::Release);
          }
        })
        .expect("failed to spawn emberlog multi-quantum sorting thread"),
    );
    Ok(())
  }

  fn write(&self, bytes: &[u8]) -> Result<usize> {
    if self.shared.panicked.load(Ordering::Acquire) {
      return Err(Error::new(ErrorKind::IoPermanent, "emberlog multi-quantum worker thread panicked"));
    }
    let Some(slot) = self.claimed_slot() else {
      return Err(Error::new(
        ErrorKind::ResourceExhausted,
        "no free multi-quantum producer slot",
      ));
    };
    let len = bytes.len();
    self.shared.producer_rings[slot].push(Entry {
      nanos: crate::time::now_nanos(),
      thread_id: current_thread_id(),
      record_id: NEXT_RECORD_SEQ.fetch_add(1, Ordering::Relaxed),
      bytes: bytes.to_vec(),
      control: Control::Normal,
    });
    self.shared.active_rings.set(slot);
    Ok(len)
  }

  fn flush_impl(&self) -> Result<()> {
    if self.shared.panicked.load(Ordering::Acquire) {
      return Err(Error::new(ErrorKind::IoPermanent, "emberlog multi-quantum worker thread panicked"));
    }
    if let Some(slot) = self.claimed_slot() {
      self.shared.producer_rings[slot].push(Entry {
        nanos: crate::time::now_nanos(),
        thread_id: current_thread_id(),
        record_id: NEXT_RECORD_SEQ.fetch_add(1, Ordering::Relaxed),
        bytes: Vec::new(),
        control: Control::Flush,
      });
      self.shared.active_rings.set(slot);
    }
    Ok(())
  }

  fn stop(&self) -> Result<()> {
    self.shared.stop.store(true, Ordering::Relaxed);
    for handle in self.reader_handles.lock().unwrap().drain(..) {
      let _ = handle.join();
    }
    if let Some(handle) = self.sorter_handle.lock().unwrap().take() {
      let _ = handle.join();
    }
    self.shared.inner.stop()
  }

  fn lock_class(&self) -> LockClass {
    LockClass::NativelyThreadSafe
  }

  fn is_caught_up(&self) -> bool {
    self.shared.funnel.is_empty() && self.shared.producer_rings.iter().all(Ring::is_empty)
  }
}

static NEXT_RECORD_SEQ: AtomicU64 = AtomicU64::new(1);

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::Mutex as StdMutex;

  struct RecordingBackend(Arc<StdMutex<Vec<String>>>);

  impl SinkBackend for RecordingBackend {
    fn write(&self, bytes: &[u8]) -> Result<usize> {
      self.0.lock().unwrap().push(String::from_utf8_lossy(bytes).into_owned());
      Ok(bytes.len())
    }
  }

  #[test]
  fn panicking_sorter_degrades_future_writes() {
    struct PanicOnWrite;
    impl SinkBackend for PanicOnWrite {
      fn write(&self, _bytes: &[u8]) -> Result<usize> {
        panic!("boom");
      }
    }
    let backend = MultiQuantumBackend::new(Box::new(PanicOnWrite), 4, 8, 1, 4);
    backend.start().unwrap();
    backend.write(b"trigger").unwrap();
    std::thread::sleep(Duration::from_millis(100));
    assert!(backend.write(b"after").is_err());
    let _ = backend.stop();
  }

  #[test]
  fn records_from_multiple_threads_all_reach_inner_backend() {
    let recorder = Arc::new(StdMutex::new(Vec::new()));
    let backend = Arc::new(MultiQuantumBackend::new(
      Box::new(RecordingBackend(Arc::clone(&recorder))),
      8,
      16,
      2,
      4,
    ));
    backend.start().unwrap();

    let mut handles = Vec::new();
    for t in 0..4 {
      let backend = Arc::clone(&backend);
      handles.push(std::thread::spawn(move || {
        for i in 0..5 {
          backend.write(format!("t{t}-m{i}").as_bytes()).unwrap();
        }
      }));
    }
    for h in handles {
      h.join().unwrap();
    }
    std::thread::sleep(Duration::from_millis(100));
    backend.stop().unwrap();
    assert_eq!(recorder.lock().unwrap().len(), 20);
  }
}
