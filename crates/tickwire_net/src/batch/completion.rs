//! Per-payload completion signals.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

/// How a queued payload ended up.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SendOutcome {
    /// Written and flushed.
    Sent,
    /// The transport rejected the write or the flush.
    Failed(io::ErrorKind),
    /// The connection was gone before the payload could be written.
    Closed,
}

impl SendOutcome {
    /// Returns true for [`SendOutcome::Sent`].
    #[must_use]
    pub const fn is_sent(self) -> bool {
        matches!(self, Self::Sent)
    }
}

/// Signal for payload completion.
#[derive(Debug)]
pub(crate) struct CompletionSignal {
    done: AtomicBool,
    outcome: Mutex<Option<SendOutcome>>,
    condvar: Condvar,
}

impl CompletionSignal {
    pub(crate) fn new() -> Self {
        Self {
            done: AtomicBool::new(false),
            outcome: Mutex::new(None),
            condvar: Condvar::new(),
        }
    }

    /// Sets the outcome once; later calls are ignored.
    pub(crate) fn signal(&self, outcome: SendOutcome) {
        let mut slot = self.outcome.lock();
        if slot.is_none() {
            *slot = Some(outcome);
            self.done.store(true, Ordering::Release);
            self.condvar.notify_all();
        }
    }

    fn wait(&self) -> SendOutcome {
        let mut slot = self.outcome.lock();
        loop {
            if let Some(outcome) = *slot {
                return outcome;
            }
            self.condvar.wait(&mut slot);
        }
    }

    fn wait_timeout(&self, timeout: Duration) -> Option<SendOutcome> {
        let mut slot = self.outcome.lock();
        if slot.is_none() {
            let _ = self.condvar.wait_while_for(&mut slot, |outcome| outcome.is_none(), timeout);
        }
        *slot
    }
}

/// Handle to one enqueued payload.
#[derive(Clone, Debug)]
pub struct SendHandle {
    signal: Arc<CompletionSignal>,
}

impl SendHandle {
    pub(crate) fn new(signal: Arc<CompletionSignal>) -> Self {
        Self { signal }
    }

    /// A handle that is already complete.
    pub(crate) fn completed(outcome: SendOutcome) -> Self {
        let signal = Arc::new(CompletionSignal::new());
        signal.signal(outcome);
        Self { signal }
    }

    /// Blocks until the payload has been flushed or failed.
    pub fn wait(&self) -> SendOutcome {
        self.signal.wait()
    }

    /// Waits with timeout. Returns `None` if still pending.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<SendOutcome> {
        self.signal.wait_timeout(timeout)
    }

    /// Returns true if already completed.
    #[must_use]
    pub fn is_done(&self) -> bool {
        self.signal.done.load(Ordering::Acquire)
    }

    /// Outcome, if complete.
    #[must_use]
    pub fn outcome(&self) -> Option<SendOutcome> {
        *self.signal.outcome.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_signal_once() {
        let signal = Arc::new(CompletionSignal::new());
        let handle = SendHandle::new(Arc::clone(&signal));
        assert!(!handle.is_done());
        assert_eq!(handle.wait_timeout(Duration::from_millis(5)), None);

        signal.signal(SendOutcome::Sent);
        signal.signal(SendOutcome::Closed);
        assert!(handle.is_done());
        assert_eq!(handle.wait(), SendOutcome::Sent);
        assert_eq!(handle.outcome(), Some(SendOutcome::Sent));
    }

    #[test]
    fn test_wait_across_threads() {
        let signal = Arc::new(CompletionSignal::new());
        let handle = SendHandle::new(Arc::clone(&signal));

        let waiter = thread::spawn(move || handle.wait());
        thread::sleep(Duration::from_millis(10));
        signal.signal(SendOutcome::Failed(io::ErrorKind::BrokenPipe));

        assert_eq!(waiter.join().unwrap(), SendOutcome::Failed(io::ErrorKind::BrokenPipe));
    }

    #[test]
    fn test_completed_handle() {
        let handle = SendHandle::completed(SendOutcome::Closed);
        assert!(handle.is_done());
        assert!(!handle.wait().is_sent());
    }
}
