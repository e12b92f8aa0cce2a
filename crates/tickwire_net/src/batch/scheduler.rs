//! Shared delayed-flush timer.
//!
//! One thread for the whole process serves every connection. It sleeps until
//! the earliest deadline, fires that target, and goes back to sleep. Firing
//! must not block: targets hand the real work to their own thread. Targets
//! are held weakly: a connection torn down before its timer fires simply
//! drops out.

use std::cmp::{Ordering as CmpOrdering, Reverse};
use std::collections::BinaryHeap;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, MutexGuard};

/// Name of the scheduler thread.
pub const SCHEDULER_THREAD_NAME: &str = "tickwire-batch-scheduler";

/// Something the scheduler can fire.
pub trait FlushTarget: Send + Sync {
    /// Called on the scheduler thread when the deadline passes.
    ///
    /// Every other timer waits behind this call, so it must not do I/O.
    fn on_timer(&self);
}

struct Scheduled {
    deadline: Instant,
    seq: u64,
    target: Weak<dyn FlushTarget>,
}

impl PartialEq for Scheduled {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}

impl Eq for Scheduled {}

impl PartialOrd for Scheduled {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for Scheduled {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        (self.deadline, self.seq).cmp(&(other.deadline, other.seq))
    }
}

struct Shared {
    heap: Mutex<BinaryHeap<Reverse<Scheduled>>>,
    wake: Condvar,
    shutdown: AtomicBool,
    seq: AtomicU64,
    fired: AtomicU64,
}

/// Single-threaded delayed-flush scheduler.
pub struct FlushScheduler {
    shared: Arc<Shared>,
    handle: Option<JoinHandle<()>>,
}

impl FlushScheduler {
    /// Starts the scheduler thread.
    ///
    /// # Errors
    ///
    /// If the thread cannot be spawned.
    pub fn start() -> io::Result<Self> {
        let shared = Arc::new(Shared {
            heap: Mutex::new(BinaryHeap::new()),
            wake: Condvar::new(),
            shutdown: AtomicBool::new(false),
            seq: AtomicU64::new(0),
            fired: AtomicU64::new(0),
        });

        let worker = Arc::clone(&shared);
        let handle = thread::Builder::new()
            .name(SCHEDULER_THREAD_NAME.to_string())
            .spawn(move || Self::run(&worker))?;

        tracing::debug!("flush scheduler started");
        Ok(Self {
            shared,
            handle: Some(handle),
        })
    }

    /// Fires `target` after `delay`.
    pub fn schedule(&self, delay: Duration, target: Weak<dyn FlushTarget>) {
        let scheduled = Scheduled {
            deadline: Instant::now() + delay,
            seq: self.shared.seq.fetch_add(1, Ordering::Relaxed),
            target,
        };
        let mut heap = self.shared.heap.lock();
        let earliest = heap
            .peek()
            .map_or(true, |Reverse(next)| scheduled.deadline < next.deadline);
        heap.push(Reverse(scheduled));
        if earliest {
            self.shared.wake.notify_one();
        }
    }

    /// Timers waiting to fire.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.shared.heap.lock().len()
    }

    /// Timers fired so far (including ones whose target was gone).
    #[must_use]
    pub fn fired(&self) -> u64 {
        self.shared.fired.load(Ordering::Relaxed)
    }

    fn run(shared: &Shared) {
        let mut heap = shared.heap.lock();
        while !shared.shutdown.load(Ordering::Acquire) {
            let next_deadline = heap.peek().map(|Reverse(next)| next.deadline);
            match next_deadline {
                None => shared.wake.wait(&mut heap),
                Some(deadline) if deadline > Instant::now() => {
                    let _ = shared.wake.wait_until(&mut heap, deadline);
                }
                Some(_) => {
                    if let Some(Reverse(due)) = heap.pop() {
                        Self::fire(shared, &mut heap, &due);
                    }
                }
            }
        }

        // Nothing scheduled is left behind.
        while let Some(Reverse(due)) = heap.pop() {
            Self::fire(shared, &mut heap, &due);
        }
    }

    fn fire(
        shared: &Shared,
        heap: &mut MutexGuard<'_, BinaryHeap<Reverse<Scheduled>>>,
        due: &Scheduled,
    ) {
        shared.fired.fetch_add(1, Ordering::Relaxed);
        if let Some(target) = due.target.upgrade() {
            MutexGuard::unlocked(heap, || target.on_timer());
        }
    }
}

impl Drop for FlushScheduler {
    fn drop(&mut self) {
        self.shared.shutdown.store(true, Ordering::Release);
        {
            let _heap = self.shared.heap.lock();
            self.shared.wake.notify_all();
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
        tracing::debug!("flush scheduler stopped");
    }
}

impl std::fmt::Debug for FlushScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlushScheduler")
            .field("pending", &self.pending())
            .field("fired", &self.fired())
            .finish()
    }
}
