//! Per-connection outbound queue.
//!
//! Producers drain on their own thread (immediate mode, size trigger,
//! re-enabled auto-flush). Delayed flushes run on the connection's flush
//! thread: the shared scheduler only wakes it, so a slow peer stalls nobody
//! else.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};

use crossbeam_channel::{bounded, unbounded, Receiver, Sender, TrySendError};
use parking_lot::Mutex;

use super::completion::{CompletionSignal, SendHandle, SendOutcome};
use super::scheduler::{FlushScheduler, FlushTarget};
use super::BatchPolicy;
use crate::stats::BatchStats;
use crate::transport::{ConnectionId, Direction, Transport};

/// Prefix of each connection's flush thread name; the connection id follows.
pub const FLUSH_THREAD_PREFIX: &str = "tickwire-flush-";

struct Pending {
    payload: Vec<u8>,
    signal: Arc<CompletionSignal>,
}

/// Queue, transport and flush state of one connection.
///
/// The transport mutex is also the drain lock: whoever holds it owns the
/// write-then-flush sequence, so batches never interleave.
pub(crate) struct ConnectionQueue {
    id: ConnectionId,
    direction: Direction,
    policy: BatchPolicy,
    sender: Sender<Pending>,
    receiver: Receiver<Pending>,
    transport: Mutex<Box<dyn Transport>>,
    auto_flush: AtomicBool,
    flush_scheduled: AtomicBool,
    closed: AtomicBool,
    stats: Arc<BatchStats>,
    // Wakes the flush thread. Taken on teardown, which stops the thread.
    flush_due: Mutex<Option<Sender<()>>>,
    flush_thread: Mutex<Option<JoinHandle<()>>>,
}

impl ConnectionQueue {
    /// Creates the queue and starts its flush thread.
    ///
    /// # Errors
    ///
    /// If the flush thread cannot be spawned.
    pub(crate) fn spawn(
        id: ConnectionId,
        direction: Direction,
        policy: BatchPolicy,
        transport: Box<dyn Transport>,
        stats: Arc<BatchStats>,
    ) -> io::Result<Arc<Self>> {
        let (sender, receiver) = unbounded();
        let (due_tx, due_rx) = bounded(1);
        let queue = Arc::new(Self {
            id,
            direction,
            policy,
            sender,
            receiver,
            transport: Mutex::new(transport),
            auto_flush: AtomicBool::new(true),
            flush_scheduled: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            stats,
            flush_due: Mutex::new(Some(due_tx)),
            flush_thread: Mutex::new(None),
        });

        let weak = Arc::downgrade(&queue);
        let handle = thread::Builder::new()
            .name(format!("{FLUSH_THREAD_PREFIX}{}", id.0))
            .spawn(move || Self::flush_loop(&weak, &due_rx))?;
        *queue.flush_thread.lock() = Some(handle);
        Ok(queue)
    }

    fn flush_loop(queue: &Weak<Self>, due: &Receiver<()>) {
        // Ends once the wake sender is gone: teardown or drop.
        while due.recv().is_ok() {
            let Some(queue) = queue.upgrade() else {
                break;
            };
            queue.flush_if_due();
        }
    }

    fn flush_if_due(&self) {
        // While auto-flush is off only an explicit flush or re-enable drains.
        if self.is_auto_flush() {
            self.drain();
        } else {
            self.flush_scheduled.store(false, Ordering::Release);
        }
    }

    pub(crate) const fn direction(&self) -> Direction {
        self.direction
    }

    pub(crate) fn pending(&self) -> usize {
        self.receiver.len()
    }

    pub(crate) fn is_auto_flush(&self) -> bool {
        self.auto_flush.load(Ordering::Acquire)
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Queues `payload` and applies the flush policy.
    pub(crate) fn enqueue(
        self: &Arc<Self>,
        payload: Vec<u8>,
        scheduler: &FlushScheduler,
    ) -> SendHandle {
        if self.is_closed() {
            return SendHandle::completed(SendOutcome::Closed);
        }

        let signal = Arc::new(CompletionSignal::new());
        let handle = SendHandle::new(Arc::clone(&signal));
        if self.sender.send(Pending { payload, signal }).is_err() {
            return SendHandle::completed(SendOutcome::Closed);
        }

        // Teardown raced us; its drain may already have run.
        if self.is_closed() {
            self.drain();
            return handle;
        }

        if !self.is_auto_flush() {
            self.stats.record_batched();
        } else if !self.policy.enabled {
            self.drain();
        } else if self.pending() >= self.policy.batch_size {
            self.drain();
        } else {
            self.stats.record_batched();
            if !self.flush_scheduled.swap(true, Ordering::AcqRel) {
                let weak: Weak<dyn FlushTarget> = {
                    let target: Arc<dyn FlushTarget> = Arc::clone(self) as Arc<dyn FlushTarget>;
                    Arc::downgrade(&target)
                };
                scheduler.schedule(self.policy.delay, weak);
            }
        }
        handle
    }

    /// Switches auto-flush. Turning it back on drains what accumulated.
    pub(crate) fn set_auto_flush(&self, enabled: bool) {
        let was = self.auto_flush.swap(enabled, Ordering::AcqRel);
        tracing::trace!(connection = %self.id, enabled, "auto-flush toggled");
        if enabled && !was {
            self.drain();
        }
    }

    /// Writes every queued payload in order, then flushes once.
    ///
    /// Returns how many payloads were taken off the queue.
    pub(crate) fn drain(&self) -> usize {
        let mut transport = self.transport.lock();
        self.flush_scheduled.store(false, Ordering::Release);

        let batch: Vec<Pending> = self.receiver.try_iter().collect();
        if batch.is_empty() {
            return 0;
        }

        if !transport.is_active() {
            tracing::debug!(connection = %self.id, dropped = batch.len(), "transport inactive");
            for pending in batch {
                pending.signal.signal(SendOutcome::Closed);
            }
            return 0;
        }

        let mut failure = None;
        for pending in &batch {
            match transport.write(&pending.payload) {
                Ok(()) => self.stats.record_sent(pending.payload.len()),
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            }
        }
        if failure.is_none() {
            match transport.flush() {
                Ok(()) => self.stats.record_flush(),
                Err(e) => failure = Some(e),
            }
        }
        drop(transport);

        let outcome = match failure {
            None => SendOutcome::Sent,
            Some(e) => {
                tracing::warn!(connection = %self.id, error = %e, "batch write failed");
                self.stats.record_write_error();
                SendOutcome::Failed(e.kind())
            }
        };

        let size = batch.len();
        self.stats.record_batch(size);
        for pending in batch {
            pending.signal.signal(outcome);
        }
        tracing::trace!(connection = %self.id, size, "batch drained");
        size
    }

    /// Drains, then closes the transport. Later enqueues complete as closed.
    pub(crate) fn teardown(&self) {
        self.closed.store(true, Ordering::Release);
        self.stop_flush_thread();
        self.drain();
        self.transport.lock().close();
        // Anything that slipped in between the drain and the close.
        self.drain();
    }

    fn stop_flush_thread(&self) {
        drop(self.flush_due.lock().take());
        let Some(handle) = self.flush_thread.lock().take() else {
            return;
        };
        if handle.thread().id() != thread::current().id() && handle.join().is_err() {
            tracing::warn!(connection = %self.id, "flush thread panicked");
        }
    }
}

impl FlushTarget for ConnectionQueue {
    fn on_timer(&self) {
        let due = self.flush_due.lock();
        match due.as_ref().map(|wake| wake.try_send(())) {
            // A wake already pending covers this one.
            Some(Ok(()) | Err(TrySendError::Full(()))) => {}
            // Torn down; teardown drains on its own.
            None | Some(Err(TrySendError::Disconnected(()))) => {
                self.flush_scheduled.store(false, Ordering::Release);
            }
        }
    }
}

impl Drop for ConnectionQueue {
    fn drop(&mut self) {
        for pending in self.receiver.try_iter() {
            pending.signal.signal(SendOutcome::Closed);
        }
    }
}

impl std::fmt::Debug for ConnectionQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionQueue")
            .field("id", &self.id)
            .field("direction", &self.direction)
            .field("pending", &self.pending())
            .field("auto_flush", &self.is_auto_flush())
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}
