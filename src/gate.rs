//! Cancellation gate for index builds.
//!
//! Every build step runs under a [`BuildPermit`]. Any number of independent
//! callers (dropping a table, dropping an index, shutting down) can block the
//! gate with [`BuildGate::request_block`]; while at least one [`BlockToken`]
//! is alive no permit is issued, and every permit issued before the block
//! reports cancellation on its next [`BuildPermit::check`]. Dropping the last
//! token opens the gate again.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use log::debug;
use parking_lot::{Condvar, Mutex};

use crate::error::{PartIndexError, Result};

#[derive(Debug, Default)]
struct GateInner {
    /// Number of live block tokens.
    blockers: AtomicUsize,
    /// Incremented on every block request; permits remember the value they
    /// were issued under.
    epoch: AtomicU64,
    /// Number of live permits.
    permits: Mutex<usize>,
    drained: Condvar,
}

impl GateInner {
    fn is_blocked(&self) -> bool {
        self.blockers.load(Ordering::SeqCst) > 0
    }
}

/// Reference-counted gate. Clones share state.
#[derive(Debug, Clone, Default)]
pub struct BuildGate {
    inner: Arc<GateInner>,
}

impl BuildGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Block the gate until the returned token is dropped.
    pub fn request_block(&self) -> BlockToken {
        let previous = self.inner.blockers.fetch_add(1, Ordering::SeqCst);
        self.inner.epoch.fetch_add(1, Ordering::SeqCst);
        if previous == 0 {
            debug!("vector index builds blocked");
        }
        BlockToken {
            inner: self.inner.clone(),
        }
    }

    /// Release a block. Same as dropping the token.
    pub fn release(&self, token: BlockToken) {
        drop(token);
    }

    /// A permit, or `None` while the gate is blocked.
    pub fn try_acquire_permit(&self) -> Option<BuildPermit> {
        let epoch = self.inner.epoch.load(Ordering::SeqCst);
        if self.inner.is_blocked() {
            return None;
        }
        *self.inner.permits.lock() += 1;
        Some(BuildPermit {
            inner: self.inner.clone(),
            epoch,
        })
    }

    /// Like [`try_acquire_permit`](Self::try_acquire_permit), failing with a
    /// cancellation error while blocked.
    pub fn acquire_permit(&self) -> Result<BuildPermit> {
        self.try_acquire_permit()
            .ok_or_else(|| PartIndexError::cancelled("vector index builds are blocked"))
    }

    pub fn is_blocked(&self) -> bool {
        self.inner.is_blocked()
    }

    pub fn blockers(&self) -> usize {
        self.inner.blockers.load(Ordering::SeqCst)
    }

    pub fn active_permits(&self) -> usize {
        *self.inner.permits.lock()
    }

    /// Wait until no permit is alive. Returns false on timeout.
    pub fn wait_for_permits(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut permits = self.inner.permits.lock();
        while *permits > 0 {
            if self.inner.drained.wait_until(&mut permits, deadline).timed_out() {
                return *permits == 0;
            }
        }
        true
    }
}

/// Keeps the gate blocked while alive.
#[derive(Debug)]
#[must_use = "the gate opens again as soon as the token is dropped"]
pub struct BlockToken {
    inner: Arc<GateInner>,
}

impl Drop for BlockToken {
    fn drop(&mut self) {
        if self.inner.blockers.fetch_sub(1, Ordering::SeqCst) == 1 {
            debug!("vector index builds unblocked");
        }
    }
}

/// Right to perform build work. Long-running steps call [`check`](Self::check)
/// at bounded intervals.
#[derive(Debug)]
pub struct BuildPermit {
    inner: Arc<GateInner>,
    epoch: u64,
}

impl BuildPermit {
    /// True once the gate has been blocked after this permit was issued.
    pub fn is_cancelled(&self) -> bool {
        self.inner.is_blocked() || self.inner.epoch.load(Ordering::SeqCst) != self.epoch
    }

    /// Fail with a cancellation error if the permit is no longer valid.
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(PartIndexError::cancelled("vector index build cancelled"))
        } else {
            Ok(())
        }
    }
}

impl Drop for BuildPermit {
    fn drop(&mut self) {
        let mut permits = self.inner.permits.lock();
        *permits -= 1;
        if *permits == 0 {
            self.inner.drained.notify_all();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_permits_while_open() {
        let gate = BuildGate::new();
        let permit = gate.try_acquire_permit().unwrap();
        assert!(!permit.is_cancelled());
        assert!(permit.check().is_ok());
        assert_eq!(gate.active_permits(), 1);
        drop(permit);
        assert_eq!(gate.active_permits(), 0);
    }

    #[test]
    fn test_block_cancels_issued_permits() {
        let gate = BuildGate::new();
        let permit = gate.try_acquire_permit().unwrap();

        let token = gate.request_block();
        assert!(permit.is_cancelled());
        assert!(permit.check().unwrap_err().is_cancelled());
        assert!(gate.try_acquire_permit().is_none());

        gate.release(token);
        // The old permit stays cancelled even after the gate reopens.
        assert!(permit.is_cancelled());
        assert!(gate.try_acquire_permit().is_some());
    }

    #[test]
    fn test_multiple_blockers() {
        let gate = BuildGate::new();
        let a = gate.request_block();
        let b = gate.request_block();
        assert_eq!(gate.blockers(), 2);

        drop(a);
        assert!(gate.is_blocked());
        assert!(gate.acquire_permit().is_err());

        drop(b);
        assert!(!gate.is_blocked());
        assert!(gate.acquire_permit().is_ok());
    }

    #[test]
    fn test_blocked_gate_refuses_concurrent_callers() {
        let gate = BuildGate::new();
        let _token = gate.request_block();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let gate = gate.clone();
                thread::spawn(move || (0..100).all(|_| gate.try_acquire_permit().is_none()))
            })
            .collect();
        for handle in handles {
            assert!(handle.join().unwrap());
        }
    }

    #[test]
    fn test_wait_for_permits() {
        let gate = BuildGate::new();
        let permit = gate.try_acquire_permit().unwrap();
        assert!(!gate.wait_for_permits(Duration::from_millis(10)));

        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            drop(permit);
        });
        assert!(gate.wait_for_permits(Duration::from_secs(5)));
        handle.join().unwrap();
    }
}
