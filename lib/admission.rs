//! Admission control for kernel-facing operations.
//!
//! Every gated operation registers itself as in flight *before* it looks at the quiescing flag.
//! Teardown sets the flag and then waits for the in-flight count to reach zero. Between the two
//! orderings, an operation either observes the flag and backs out, or is counted and waited for.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::error::FsError;

/// Quiescing flag plus in-flight counter for one mount.
#[derive(Debug, Default)]
pub struct AdmissionGate {
    quiescing: AtomicBool,
    in_flight: AtomicUsize,
    drained_lock: Mutex<()>,
    drained: Condvar,
}

/// Proof that an operation was admitted. Dropping it ends the operation.
#[derive(Debug)]
#[must_use = "the operation is only registered while the guard is alive"]
pub struct Admitted<'a> {
    gate: &'a AdmissionGate,
}

impl AdmissionGate {
    /// A gate that admits everything.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an operation, or refuse it if the mount is quiescing.
    pub fn admit(&self) -> Result<Admitted<'_>, FsError> {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        let guard = Admitted { gate: self };
        if self.quiescing.load(Ordering::SeqCst) {
            // Dropping the guard undoes the registration and wakes a waiting teardown.
            drop(guard);
            return Err(FsError::MountClosing);
        }
        Ok(guard)
    }

    /// Set the quiescing flag. Returns `true` for the one call that flipped it.
    pub fn begin_quiesce(&self) -> bool {
        !self.quiescing.swap(true, Ordering::SeqCst)
    }

    /// Whether the flag is set.
    #[must_use]
    pub fn is_quiescing(&self) -> bool {
        self.quiescing.load(Ordering::SeqCst)
    }

    /// Operations currently registered.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Block until no operation is in flight.
    pub fn wait_drained(&self) {
        let mut lock = self.drained_lock.lock();
        while self.in_flight() > 0 {
            self.drained.wait(&mut lock);
        }
    }

    /// Block until no operation is in flight or `timeout` passes. Returns whether it drained.
    pub fn wait_drained_for(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut lock = self.drained_lock.lock();
        while self.in_flight() > 0 {
            if self.drained.wait_until(&mut lock, deadline).timed_out() {
                return self.in_flight() == 0;
            }
        }
        true
    }

    fn leave(&self) {
        if self.in_flight.fetch_sub(1, Ordering::SeqCst) == 1 {
            // Take the lock so the wakeup cannot slip between a waiter's check and its wait.
            let _lock = self.drained_lock.lock();
            self.drained.notify_all();
        }
    }
}

impl Drop for Admitted<'_> {
    fn drop(&mut self) {
        self.gate.leave();
    }
}
