//! Deferred / Queued sink (§4.5): a single background consumer draining
//! a channel.
//!
//! Grounded on the teacher's `trace::Trace` consumer-thread shape (a
//! dedicated thread draining a `crossbeam_channel`), generalized to the
//! "wake on batch size or timeout, whichever first" predicate §4.5 calls
//! the `Queued` variant.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};

use crate::error::{Error, ErrorKind, Result};

use super::{LockClass, SinkBackend};

enum Item {
  Record(Vec<u8>),
  Flush,
  Stop,
}

struct Shared {
  inner: Box<dyn SinkBackend>,
  submitted: AtomicU64,
  processed: AtomicU64,
  /// Set if the consumer thread unwinds from a panic (§7).
  panicked: AtomicBool,
}

impl Shared {
  /// Blocks for the first item (so the thread never busy-spins while
  /// idle), then drains up to `batch` more without waiting. Returns
  /// `true` once a [`Item::Stop`] has been processed.
  fn drain_and_process(&self, receiver: &Receiver<Item>, batch: usize, timeout: Duration) -> bool {
    let mut items = match receiver.recv_timeout(timeout) {
      Ok(item) => vec![item],
      Err(RecvTimeoutError::Timeout) => return false,
      Err(RecvTimeoutError::Disconnected) => return true,
    };
    while items.len() < batch.max(1) {
      match receiver.try_recv() {
        Ok(item) => items.push(item),
        Err(_) => break,
      }
    }

    let mut stop = false;
    for item in items {
      match item {
        Item::Record(bytes) => {
          let _ = self.inner.write(&bytes);
          self.processed.fetch_add(1, Ordering::Relaxed);
        },
        Item::Flush => {
          let _ = self.inner.flush_impl();
        },
        Item::Stop => {
          stop = true;
        },
      }
    }
    stop
  }
}

/// A sink backend that hands every record to a single background thread,
/// which drains a channel (batch size or timeout, whichever comes first)
/// and writes into an inner backend.
pub struct DeferredBackend {
  shared: Arc<Shared>,
  sender: Sender<Item>,
  receiver: Receiver<Item>,
  batch: usize,
  timeout: Duration,
  handle: Mutex<Option<JoinHandle<()>>>,
}

impl DeferredBackend {
  pub fn new(inner: Box<dyn SinkBackend>, batch: usize, timeout: Duration) -> Self {
    let (sender, receiver) = crossbeam_channel::unbounded();
    Self {
      shared: Arc::new(Shared {
        inner,
        submitted: AtomicU64::new(0),
        processed: AtomicU64::new(0),
        panicked: AtomicBool::new(false),
      }),
      sender,
      receiver,
      batch,
      timeout,
      handle: Mutex::new(None),
    }
  }
}

impl SinkBackend for DeferredBackend {
  fn start(&self) -> Result<()> {
    self.shared.inner.start()?;
    let shared = Arc::clone(&self.shared);
    let receiver = self.receiver.clone();
    let batch = self.batch;
    let timeout = self.timeout;
    let handle = std::thread::Builder::new()
      .name("emberlog-deferred".into())
      .spawn(move || {
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| loop {
          let should_stop = shared.drain_and_process(&receiver, batch, timeout);
          if should_stop {
            let _ = shared.inner.flush_impl();
            break;
          }
        }));
        if result.is_err() {
          shared.panicked.store(true, Ordering::Release);
        }
      })
      .expect("failed to spawn emberlog-deferred thread");
    *self.handle.lock().unwrap() = Some(handle);
    Ok(())
  }

  fn write(&self, bytes: &[u8]) -> Result<usize> {
    if self.shared.panicked.load(Ordering::Acquire) {
      return Err(Error::new(ErrorKind::IoPermanent, "emberlog-deferred worker panicked"));
    }
    let len = bytes.len();
    let _ = self.sender.send(Item::Record(bytes.to_vec()));
    self.shared.submitted.fetch_add(1, Ordering::Relaxed);
    Ok(len)
  }

  fn flush_impl(&self) -> Result<()> {
    if self.shared.panicked.load(Ordering::Acquire) {
      return Err(Error::new(ErrorKind::IoPermanent, "emberlog-deferred worker panicked"));
    }
    let _ = self.sender.send(Item::Flush);
    Ok(())
  }

  fn stop(&self) -> Result<()> {
    let _ = self.sender.send(Item::Stop);
    if let Some(handle) = self.handle.lock().unwrap().take() {
      let _ = handle.join();
    }
    self.shared.inner.stop()
  }

  fn lock_class(&self) -> LockClass {
    LockClass::NativelyThreadSafe
  }

  fn is_caught_up(&self) -> bool {
    self.shared.processed.load(Ordering::Relaxed) >= self.shared.submitted.load(Ordering::Relaxed)
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
  fn panicking_worker_degrades_future_writes() {
    struct PanicOnWrite;
    impl SinkBackend for PanicOnWrite {
      fn write(&self, _bytes: &[u8]) -> Result<usize> {
        panic!("boom");
      }
    }
    let backend = DeferredBackend::new(Box::new(PanicOnWrite), 1, Duration::from_millis(5));
    backend.start().unwrap();
    backend.write(b"trigger").unwrap();
    std::thread::sleep(Duration::from_millis(50));
    assert!(backend.write(b"after").is_err());
    let _ = backend.stop();
  }

  #[test]
  fn drains_queued_records_to_inner_backend() {
    let inner = Box::new(RecordingBackend(StdMutex::new(Vec::new())));
    let backend = DeferredBackend::new(inner, 4, Duration::from_millis(10));
    backend.start().unwrap();
    backend.write(b"one").unwrap();
    backend.write(b"two").unwrap();
    std::thread::sleep(Duration::from_millis(50));
    backend.stop().unwrap();
    assert!(backend.is_caught_up());
  }
}
