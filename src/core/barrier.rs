//! Purpose: Completion gate for asynchronous commits.
//! Exports: `SyncBarrier`, `WaitOutcome`.
//! Role: Decouples "durable by the time this signals" from the physical flush.
//! Invariants: Each `arm` is matched by exactly one `signal`; waiters wake when the count hits zero.
//! Invariants: A failed flush is sticky; every later `wait` reports it.
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::core::error::Error;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum WaitOutcome {
    Signaled,
    TimedOut,
}

#[derive(Default)]
struct Gate {
    pending: usize,
    signaled: u64,
    failure: Option<Error>,
}

#[derive(Default)]
struct Shared {
    gate: Mutex<Gate>,
    ready: Condvar,
}

/// Cloning shares the gate; all clones observe the same completions.
#[derive(Clone, Default)]
pub struct SyncBarrier {
    shared: Arc<Shared>,
}

impl SyncBarrier {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn arm(&self) {
        self.gate().pending += 1;
    }

    pub(crate) fn signal(&self, result: Result<(), &Error>) {
        let mut gate = self.gate();
        gate.pending = gate.pending.saturating_sub(1);
        gate.signaled += 1;
        if let Err(err) = result {
            if gate.failure.is_none() {
                gate.failure = Some(err.duplicate());
            }
        }
        drop(gate);
        self.shared.ready.notify_all();
    }

    pub fn pending(&self) -> usize {
        self.gate().pending
    }

    /// Number of completions observed so far.
    pub fn signaled(&self) -> u64 {
        self.gate().signaled
    }

    pub fn is_complete(&self) -> bool {
        self.gate().pending == 0
    }

    pub fn wait(&self) -> Result<(), Error> {
        let mut gate = self.gate();
        while gate.pending > 0 {
            gate = self
                .shared
                .ready
                .wait(gate)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
        }
        match &gate.failure {
            Some(err) => Err(err.duplicate()),
            None => Ok(()),
        }
    }

    pub fn wait_timeout(&self, timeout: Duration) -> Result<WaitOutcome, Error> {
        let deadline = Instant::now() + timeout;
        let mut gate = self.gate();
        while gate.pending > 0 {
            let now = Instant::now();
            if now >= deadline {
                return Ok(WaitOutcome::TimedOut);
            }
            let (next, _) = self
                .shared
                .ready
                .wait_timeout(gate, deadline - now)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            gate = next;
        }
        match &gate.failure {
            Some(err) => Err(err.duplicate()),
            None => Ok(WaitOutcome::Signaled),
        }
    }

    fn gate(&self) -> MutexGuard<'_, Gate> {
        self.shared
            .gate
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::{SyncBarrier, WaitOutcome};
    use crate::core::error::{Error, ErrorKind};
    use std::time::Duration;

    #[test]
    fn unarmed_barrier_is_complete() {
        let barrier = SyncBarrier::new();
        assert!(barrier.is_complete());
        barrier.wait().expect("wait");
    }

    #[test]
    fn wait_blocks_until_every_arm_is_signaled() {
        let barrier = SyncBarrier::new();
        barrier.arm();
        barrier.arm();
        assert_eq!(
            barrier.wait_timeout(Duration::from_millis(5)).expect("wait"),
            WaitOutcome::TimedOut
        );

        let remote = barrier.clone();
        let worker = std::thread::spawn(move || {
            remote.signal(Ok(()));
            remote.signal(Ok(()));
        });
        barrier.wait().expect("wait");
        worker.join().expect("join");
        assert_eq!(barrier.signaled(), 2);
        assert_eq!(barrier.pending(), 0);
    }

    #[test]
    fn failure_is_sticky() {
        let barrier = SyncBarrier::new();
        barrier.arm();
        let err = Error::new(ErrorKind::JournalFailed).with_message("fsync failed");
        barrier.signal(Err(&err));
        assert_eq!(barrier.wait().expect_err("failed").kind(), ErrorKind::JournalFailed);

        barrier.arm();
        barrier.signal(Ok(()));
        assert!(barrier.wait().is_err());
    }
}
