//! Batching queue
//!
//! Groups enqueued elements into batches. A batch is emitted on the returned
//! receiver when either:
//! - the number of pending elements reaches `batch_size` (0 disables this trigger), or
//! - the `timeout` ticker fires and at least one element is pending (zero disables it).
//!
//! The sender lives next to the pending buffer and the ticker task holds only a weak
//! reference to both. Closing or dropping the queue releases the sender, so the
//! receiver yields `None` right after the last emitted batch.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::debug;

use crate::utils::error::{Error, Result};

struct Shared<T> {
    pending: Vec<T>,
    out: Option<mpsc::UnboundedSender<Vec<T>>>,
}

impl<T> Shared<T> {
    fn emit(&mut self) {
        if self.pending.is_empty() {
            return;
        }
        let batch = std::mem::take(&mut self.pending);
        if let Some(out) = &self.out {
            if out.send(batch).is_err() {
                debug!("Batch receiver dropped, discarding batch");
            }
        }
    }
}

pub struct BatchingQueue<T> {
    batch_size: usize,
    shared: Arc<Mutex<Shared<T>>>,
}

impl<T: Send + 'static> BatchingQueue<T> {
    /// Creates the queue and the receiver batches are emitted on.
    ///
    /// Must be called from within a tokio runtime when `timeout` is non-zero.
    pub fn new(batch_size: usize, timeout: Duration) -> (Self, mpsc::UnboundedReceiver<Vec<T>>) {
        let (out, batches) = mpsc::unbounded_channel();
        let shared = Arc::new(Mutex::new(Shared {
            pending: Vec::new(),
            out: Some(out),
        }));
        if !timeout.is_zero() {
            tokio::spawn(timeout_ticker(Arc::downgrade(&shared), timeout));
        }
        let queue = Self { batch_size, shared };
        (queue, batches)
    }

    fn lock(&self) -> MutexGuard<'_, Shared<T>> {
        self.shared.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Enqueues an element. Emits the pending batch immediately if it reached the batch size.
    ///
    /// Fails once the queue has been closed.
    pub fn enqueue(&self, element: T) -> Result<()> {
        let mut shared = self.lock();
        if shared.out.is_none() {
            return Err(Error::Storage("batching queue is closed".to_string()));
        }
        shared.pending.push(element);
        if self.batch_size > 0 && shared.pending.len() >= self.batch_size {
            shared.emit();
        }
        Ok(())
    }

    /// Takes every pending element without emitting it.
    pub fn drain(&self) -> Vec<T> {
        std::mem::take(&mut self.lock().pending)
    }

    /// Stops emitting and returns what was still pending.
    ///
    /// Batches emitted before the call stay in the receiver, which ends after them.
    pub fn close(&self) -> Vec<T> {
        let mut shared = self.lock();
        shared.out = None;
        std::mem::take(&mut shared.pending)
    }

    pub fn len(&self) -> usize {
        self.lock().pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

async fn timeout_ticker<T>(shared: Weak<Mutex<Shared<T>>>, timeout: Duration) {
    let mut ticker = tokio::time::interval(timeout);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        let Some(strong) = shared.upgrade() else {
            break;
        };
        let mut state = strong.lock().unwrap_or_else(PoisonError::into_inner);
        if state.out.is_none() {
            break;
        }
        state.emit();
    }
}
