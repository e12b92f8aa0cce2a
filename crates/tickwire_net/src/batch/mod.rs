//! # Outbound Batching
//!
//! Coalesces outbound payloads per connection into batches: many writes,
//! one flush.
//!
//! ## Flush triggers
//!
//! | Auto-flush | Batching | Behavior |
//! |------------|----------|----------|
//! | on | off | write and flush right away |
//! | on | on | flush at `batch_size` queued, or `delay` after the first |
//! | off | any | accumulate until re-enabled or [`OutboundBatcher::flush_now`] |
//!
//! Delayed flushes run on a flush thread owned by each connection; the one
//! shared scheduler thread only wakes it.
//!
//! Order is FIFO per connection. Nothing queued is dropped silently: every
//! payload's [`SendHandle`] ends as sent, failed, or closed.

mod completion;
mod queue;
mod scheduler;

pub use completion::{SendHandle, SendOutcome};
pub use queue::FLUSH_THREAD_PREFIX;
pub use scheduler::{FlushScheduler, FlushTarget, SCHEDULER_THREAD_NAME};

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;

use crate::config::TickwireConfig;
use crate::error::{TickwireError, TickwireResult};
use crate::stats::BatchStats;
use crate::transport::{ConnectionId, Direction, Transport};
use queue::ConnectionQueue;

/// Batching parameters for one direction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BatchPolicy {
    /// Batch at all. When false every payload is flushed on its own.
    pub enabled: bool,
    /// Longest a payload waits for company.
    pub delay: Duration,
    /// Queued payloads that force a flush.
    pub batch_size: usize,
}

/// Outbound batcher for every connection of a process.
pub struct OutboundBatcher {
    client: BatchPolicy,
    server: BatchPolicy,
    connections: DashMap<ConnectionId, Arc<ConnectionQueue>>,
    stats: Arc<BatchStats>,
    // Declared last: joined after every queue is gone.
    scheduler: FlushScheduler,
}

impl OutboundBatcher {
    /// Creates a batcher with the per-direction policies from `config`.
    ///
    /// # Errors
    ///
    /// If the scheduler thread cannot be started.
    pub fn new(config: &TickwireConfig) -> TickwireResult<Self> {
        Self::with_stats(config, Arc::new(BatchStats::new()))
    }

    /// Same as [`OutboundBatcher::new`] with caller-owned counters.
    ///
    /// # Errors
    ///
    /// If the scheduler thread cannot be started.
    pub fn with_stats(config: &TickwireConfig, stats: Arc<BatchStats>) -> TickwireResult<Self> {
        Ok(Self {
            client: config.batch_policy(Direction::Client),
            server: config.batch_policy(Direction::Server),
            connections: DashMap::new(),
            stats,
            scheduler: FlushScheduler::start()?,
        })
    }

    /// Policy applied to connections in `direction`.
    #[must_use]
    pub const fn policy(&self, direction: Direction) -> BatchPolicy {
        match direction {
            Direction::Client => self.client,
            Direction::Server => self.server,
        }
    }

    /// Registers a connection and starts its flush thread. Replacing an
    /// existing id tears the old one down.
    ///
    /// # Errors
    ///
    /// If the flush thread cannot be spawned.
    pub fn register(
        &self,
        id: ConnectionId,
        transport: Box<dyn Transport>,
        direction: Direction,
    ) -> TickwireResult<()> {
        let queue = ConnectionQueue::spawn(
            id,
            direction,
            self.policy(direction),
            transport,
            Arc::clone(&self.stats),
        )?;
        if let Some(previous) = self.connections.insert(id, queue) {
            tracing::warn!(connection = %id, "connection re-registered, tearing down previous");
            previous.teardown();
        }
        tracing::debug!(connection = %id, ?direction, "connection registered");
        Ok(())
    }

    /// Queues `payload` for `id`.
    ///
    /// # Errors
    ///
    /// [`TickwireError::UnknownConnection`] if `id` is not registered.
    pub fn enqueue(&self, id: ConnectionId, payload: Vec<u8>) -> TickwireResult<SendHandle> {
        let queue = self.queue(id)?;
        Ok(queue.enqueue(payload, &self.scheduler))
    }

    /// Turns auto-flush on or off for `id`.
    ///
    /// # Errors
    ///
    /// [`TickwireError::UnknownConnection`] if `id` is not registered.
    pub fn set_auto_flush(&self, id: ConnectionId, enabled: bool) -> TickwireResult<()> {
        self.queue(id)?.set_auto_flush(enabled);
        Ok(())
    }

    /// Disables auto-flush for `id` until the returned guard drops.
    ///
    /// Use around bulk sends (a burst of chunk data) so they leave as one
    /// batch.
    ///
    /// # Errors
    ///
    /// [`TickwireError::UnknownConnection`] if `id` is not registered.
    pub fn bulk(&self, id: ConnectionId) -> TickwireResult<BulkScope> {
        let queue = self.queue(id)?;
        let restore = queue.is_auto_flush();
        queue.set_auto_flush(false);
        Ok(BulkScope { queue, restore })
    }

    /// Drains `id` now, whatever the auto-flush state.
    ///
    /// # Errors
    ///
    /// [`TickwireError::UnknownConnection`] if `id` is not registered.
    pub fn flush_now(&self, id: ConnectionId) -> TickwireResult<usize> {
        Ok(self.queue(id)?.drain())
    }

    /// Flushes what is queued for `id`, closes its transport, and forgets it.
    ///
    /// # Errors
    ///
    /// [`TickwireError::UnknownConnection`] if `id` is not registered.
    pub fn teardown(&self, id: ConnectionId) -> TickwireResult<()> {
        let (_, queue) = self
            .connections
            .remove(&id)
            .ok_or(TickwireError::UnknownConnection(id.0))?;
        queue.teardown();
        tracing::debug!(connection = %id, direction = ?queue.direction(), "connection torn down");
        Ok(())
    }

    /// Payloads waiting on `id`.
    #[must_use]
    pub fn pending(&self, id: ConnectionId) -> Option<usize> {
        self.connections.get(&id).map(|queue| queue.pending())
    }

    /// Auto-flush state of `id`.
    #[must_use]
    pub fn is_auto_flush(&self, id: ConnectionId) -> Option<bool> {
        self.connections.get(&id).map(|queue| queue.is_auto_flush())
    }

    /// Registered connections.
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Shared counters.
    #[must_use]
    pub fn stats(&self) -> &Arc<BatchStats> {
        &self.stats
    }

    fn queue(&self, id: ConnectionId) -> TickwireResult<Arc<ConnectionQueue>> {
        // Clone out so no map shard lock is held during I/O.
        self.connections
            .get(&id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or(TickwireError::UnknownConnection(id.0))
    }
}

impl Drop for OutboundBatcher {
    fn drop(&mut self) {
        let ids: Vec<ConnectionId> = self.connections.iter().map(|entry| *entry.key()).collect();
        for id in ids {
            let _ = self.teardown(id);
        }
    }
}

impl std::fmt::Debug for OutboundBatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutboundBatcher")
            .field("client", &self.client)
            .field("server", &self.server)
            .field("connections", &self.connections.len())
            .field("scheduler", &self.scheduler)
            .finish()
    }
}

/// Auto-flush suspension; restores the previous state on drop.
#[must_use = "auto-flush is restored as soon as the scope drops"]
pub struct BulkScope {
    queue: Arc<ConnectionQueue>,
    restore: bool,
}

impl Drop for BulkScope {
    fn drop(&mut self) {
        if !self.queue.is_closed() {
            self.queue.set_auto_flush(self.restore);
        }
    }
}

impl std::fmt::Debug for BulkScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BulkScope").field("restore", &self.restore).finish()
    }
}
