//! Write Coalescing Queue
//!
//! Buffers merge-patch writes and flushes them as one `batch_write`:
//!
//! - the latest payload per path wins; earlier ones are `Superseded`
//! - one debounce timer is shared by all pending paths and every enqueue
//!   pushes it out by `debounce`
//! - `max_delay` caps how long the oldest pending write can wait, so a steady
//!   stream of enqueues cannot starve the flush
//!
//! Delivery is at-most-once: a failed batch is logged and dropped. Callers
//! needing durability write directly to the store.

use parking_lot::Mutex;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{Notify, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info};

use crate::config::BatchConfig;
use crate::error::{LayerError, Result};
use crate::invalidation::FlushObserver;
use crate::store::{DocumentStore, WriteOp};

/// Lifecycle of one enqueued write
///
/// `Queued → Flushing → Acknowledged | Failed`, or `Queued → Superseded` when a
/// later enqueue to the same path replaced the payload before the flush.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteState {
    Queued,
    Flushing,
    Acknowledged,
    Failed(String),
    Superseded,
}

impl WriteState {
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Acknowledged | Self::Failed(_) | Self::Superseded)
    }
}

/// Observes the state of one enqueued write
#[derive(Debug, Clone)]
pub struct WriteTicket {
    path: String,
    state: watch::Receiver<WriteState>,
}

impl WriteTicket {
    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Current state without waiting
    #[must_use]
    pub fn state(&self) -> WriteState {
        self.state.borrow().clone()
    }

    /// Wait until the write reached a terminal state
    pub async fn settled(mut self) -> WriteState {
        let settled = self
            .state
            .wait_for(WriteState::is_terminal)
            .await
            .map(|state| state.clone());
        // Queue dropped mid-flight: report where it stopped
        settled.unwrap_or_else(|_| self.state.borrow().clone())
    }
}

/// Write queue statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchStats {
    pub enqueued: u64,
    pub coalesced: u64,
    pub flushes: u64,
    pub writes_flushed: u64,
    pub failed_batches: u64,
    pub dropped_writes: u64,
}

struct PendingWrite {
    payload: Value,
    state: watch::Sender<WriteState>,
}

#[derive(Default)]
struct QueueState {
    pending: BTreeMap<String, PendingWrite>,
    /// When the shared timer fires
    deadline: Option<Instant>,
    /// Enqueue time of the oldest pending write
    oldest: Option<Instant>,
    closed: bool,
}

struct Inner {
    store: Arc<dyn DocumentStore>,
    config: BatchConfig,
    state: Mutex<QueueState>,
    wake: Notify,
    /// Serializes flushes so batches reach the store in order
    flush_lock: tokio::sync::Mutex<()>,
    observer: Option<Arc<dyn FlushObserver>>,
    enqueued: AtomicU64,
    coalesced: AtomicU64,
    flushes: AtomicU64,
    writes_flushed: AtomicU64,
    failed_batches: AtomicU64,
    dropped_writes: AtomicU64,
}

/// Write Coalescing Queue
///
/// Must be created inside a tokio runtime; the timer runs as a spawned task
/// until [`WriteQueue::shutdown`] or drop.
pub struct WriteQueue {
    inner: Arc<Inner>,
    timer: Mutex<Option<JoinHandle<()>>>,
}

impl WriteQueue {
    #[must_use]
    pub fn new(
        store: Arc<dyn DocumentStore>,
        config: BatchConfig,
        observer: Option<Arc<dyn FlushObserver>>,
    ) -> Self {
        info!(
            store = store.name(),
            debounce_ms = %config.debounce.as_millis(),
            max_delay_ms = %config.max_delay.as_millis(),
            "Initializing write coalescing queue"
        );
        let inner = Arc::new(Inner {
            store,
            config,
            state: Mutex::new(QueueState::default()),
            wake: Notify::new(),
            flush_lock: tokio::sync::Mutex::new(()),
            observer,
            enqueued: AtomicU64::new(0),
            coalesced: AtomicU64::new(0),
            flushes: AtomicU64::new(0),
            writes_flushed: AtomicU64::new(0),
            failed_batches: AtomicU64::new(0),
            dropped_writes: AtomicU64::new(0),
        });
        let timer = tokio::spawn(run_timer(Arc::clone(&inner)));
        Self {
            inner,
            timer: Mutex::new(Some(timer)),
        }
    }

    /// Queue a merge-patch for `path`, replacing any pending payload for it
    ///
    /// # Errors
    ///
    /// Returns [`LayerError::Rejected`] for a payload that is not a JSON
    /// object or once the queue is shut down.
    pub fn enqueue(&self, path: impl Into<String>, payload: Value) -> Result<WriteTicket> {
        let path = path.into();
        if !payload.is_object() {
            return Err(LayerError::Rejected(format!(
                "batched write to '{path}' must be a JSON object"
            )));
        }

        let (sender, receiver) = watch::channel(WriteState::Queued);
        {
            let mut state = self.inner.state.lock();
            if state.closed {
                return Err(LayerError::Rejected("write queue is shut down".to_string()));
            }

            let now = Instant::now();
            let oldest = *state.oldest.get_or_insert(now);
            let deadline = (now + self.inner.config.debounce).min(oldest + self.inner.config.max_delay);
            state.deadline = Some(deadline);

            let replaced = state.pending.insert(
                path.clone(),
                PendingWrite {
                    payload,
                    state: sender,
                },
            );
            if let Some(previous) = replaced {
                previous.state.send_replace(WriteState::Superseded);
                self.inner.coalesced.fetch_add(1, Ordering::Relaxed);
            }
        }
        self.inner.enqueued.fetch_add(1, Ordering::Relaxed);
        self.inner.wake.notify_one();
        debug!(path = %path, "Write enqueued");

        Ok(WriteTicket {
            path,
            state: receiver,
        })
    }

    /// Flush everything pending now, bypassing the timer
    ///
    /// # Returns
    ///
    /// Number of paths written.
    ///
    /// # Errors
    ///
    /// Returns [`LayerError::BatchFailure`] when the store rejected the batch;
    /// the batch is dropped either way.
    pub async fn flush_now(&self) -> Result<usize> {
        self.inner.flush().await
    }

    /// Number of distinct paths waiting for a flush
    #[must_use]
    pub fn pending_len(&self) -> usize {
        self.inner.state.lock().pending.len()
    }

    /// Stop accepting writes, flush what is pending and stop the timer
    ///
    /// # Errors
    ///
    /// Returns the failure of the final flush.
    pub async fn shutdown(&self) -> Result<usize> {
        self.inner.state.lock().closed = true;
        let flushed = self.inner.flush().await;
        self.inner.wake.notify_one();

        let timer = self.timer.lock().take();
        if let Some(timer) = timer {
            let _ = timer.await;
        }
        info!("Write coalescing queue shut down");
        flushed
    }

    #[must_use]
    pub fn stats(&self) -> BatchStats {
        let inner = &self.inner;
        BatchStats {
            enqueued: inner.enqueued.load(Ordering::Relaxed),
            coalesced: inner.coalesced.load(Ordering::Relaxed),
            flushes: inner.flushes.load(Ordering::Relaxed),
            writes_flushed: inner.writes_flushed.load(Ordering::Relaxed),
            failed_batches: inner.failed_batches.load(Ordering::Relaxed),
            dropped_writes: inner.dropped_writes.load(Ordering::Relaxed),
        }
    }
}

impl Drop for WriteQueue {
    fn drop(&mut self) {
        // The timer task flushes the remainder and exits
        self.inner.state.lock().closed = true;
        self.inner.wake.notify_one();
    }
}

impl Inner {
    async fn flush(&self) -> Result<usize> {
        let _serial = self.flush_lock.lock().await;

        let batch = {
            let mut state = self.state.lock();
            state.deadline = None;
            state.oldest = None;
            std::mem::take(&mut state.pending)
        };
        if batch.is_empty() {
            return Ok(0);
        }

        let count = batch.len();
        let mut paths = Vec::with_capacity(count);
        let mut operations = Vec::with_capacity(count);
        let mut tickets = Vec::with_capacity(count);
        for (path, write) in batch {
            write.state.send_replace(WriteState::Flushing);
            operations.push(WriteOp::Set {
                path: path.clone(),
                value: write.payload,
                merge: true,
            });
            paths.push(path);
            tickets.push(write.state);
        }

        self.flushes.fetch_add(1, Ordering::Relaxed);
        match self.store.batch_write(operations).await {
            Ok(()) => {
                for ticket in &tickets {
                    ticket.send_replace(WriteState::Acknowledged);
                }
                self.writes_flushed
                    .fetch_add(count as u64, Ordering::Relaxed);
                debug!(count, "Flushed batched writes");
                if let Some(observer) = &self.observer {
                    observer.on_flushed(&paths).await;
                }
                Ok(count)
            }
            Err(e) => {
                let reason = e.to_string();
                error!(count, paths = ?paths, error = %reason, "Batch write failed, dropping batch");
                for ticket in &tickets {
                    ticket.send_replace(WriteState::Failed(reason.clone()));
                }
                self.failed_batches.fetch_add(1, Ordering::Relaxed);
                self.dropped_writes
                    .fetch_add(count as u64, Ordering::Relaxed);
                Err(LayerError::BatchFailure {
                    paths: count,
                    reason,
                })
            }
        }
    }
}

/// Shared debounce timer
async fn run_timer(inner: Arc<Inner>) {
    loop {
        let (deadline, closed) = {
            let state = inner.state.lock();
            (state.deadline, state.closed)
        };

        if closed {
            // Failures are logged inside flush
            let _ = inner.flush().await;
            break;
        }

        match deadline {
            None => inner.wake.notified().await,
            Some(at) => {
                tokio::select! {
                    () = tokio::time::sleep_until(at) => {
                        let due = inner
                            .state
                            .lock()
                            .deadline
                            .is_some_and(|d| d <= Instant::now());
                        if due {
                            let _ = inner.flush().await;
                        }
                    }
                    () = inner.wake.notified() => {}
                }
            }
        }
    }
    debug!("Write queue timer stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use serde_json::json;
    use std::time::Duration;

    fn config(debounce_ms: u64, max_delay_ms: u64) -> BatchConfig {
        BatchConfig {
            debounce: Duration::from_millis(debounce_ms),
            max_delay: Duration::from_millis(max_delay_ms),
        }
    }

    #[tokio::test]
    async fn later_enqueue_supersedes_earlier_one() {
        let store = Arc::new(MemoryStore::new());
        let queue = WriteQueue::new(store.clone(), config(20, 1000), None);

        let first = queue.enqueue("pages/p1", json!({"title": "a"})).expect("enqueue failed");
        let second = queue.enqueue("pages/p1", json!({"title": "b"})).expect("enqueue failed");
        assert_eq!(first.state(), WriteState::Superseded);
        assert_eq!(queue.pending_len(), 1);

        assert_eq!(second.settled().await, WriteState::Acknowledged);
        assert_eq!(store.document("pages/p1"), Some(json!({"title": "b"})));
        assert_eq!(store.stats().batch_writes, 1);
    }

    #[tokio::test]
    async fn steady_enqueues_flush_at_max_delay() {
        let store = Arc::new(MemoryStore::new());
        let queue = WriteQueue::new(store.clone(), config(50, 120), None);

        let started = Instant::now();
        let mut last = None;
        for i in 0..12 {
            last = Some(queue.enqueue(format!("drafts/d{i}"), json!({"n": i})).expect("enqueue failed"));
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        // Never quiet for 50ms, yet something was flushed within the cap
        assert!(store.stats().batch_writes >= 1);
        assert!(started.elapsed() >= Duration::from_millis(120));
        if let Some(ticket) = last {
            assert_eq!(ticket.settled().await, WriteState::Acknowledged);
        }
    }

    #[tokio::test]
    async fn rejected_batch_is_dropped() {
        let store = Arc::new(MemoryStore::new());
        store.reject_batches(true);
        let queue = WriteQueue::new(store.clone(), config(1000, 5000), None);

        let ticket = queue.enqueue("pages/p1", json!({"title": "a"})).expect("enqueue failed");
        let result = queue.flush_now().await;

        assert!(matches!(result, Err(LayerError::BatchFailure { paths: 1, .. })));
        assert!(matches!(ticket.state(), WriteState::Failed(_)));
        assert_eq!(queue.pending_len(), 0);
        assert_eq!(queue.stats().dropped_writes, 1);
    }

    #[tokio::test]
    async fn non_object_payloads_and_closed_queue_are_rejected() {
        let queue = WriteQueue::new(Arc::new(MemoryStore::new()), config(10, 100), None);
        assert!(queue.enqueue("pages/p1", json!(3)).is_err());

        let flushed = queue.shutdown().await;
        assert!(matches!(flushed, Ok(0)));
        assert!(queue.enqueue("pages/p1", json!({"a": 1})).is_err());
    }
}
