//! A mutex-protected mutable cell with a contention probe.
//!
//! [`MutexCell`] is the engine's single shared-state primitive: subject
//! registries, shared buffers, and sink state all live behind one. The
//! [`is_locked`](MutexCell::is_locked) probe exists purely to diagnose
//! concurrent-access bugs in tests — it must never be used for control flow.
//!
//! The cell is **not** reentrant: calling [`mutate`](MutexCell::mutate) from
//! within a closure already holding the same cell deadlocks. Reentrancy is
//! the job of [`SerializedSubscription`](crate::subscription::SerializedSubscription).

use parking_lot::Mutex;

// ---------------------------------------------------------------------------
// MutexCell
// ---------------------------------------------------------------------------

/// A mutual-exclusion wrapper around a value `T`.
#[derive(Debug, Default)]
pub struct MutexCell<T> {
    inner: Mutex<T>,
}

impl<T> MutexCell<T> {
    /// Creates a new cell holding `value`.
    #[must_use]
    pub fn new(value: T) -> Self {
        Self {
            inner: Mutex::new(value),
        }
    }

    /// Copies the current value out under the lock.
    #[must_use]
    pub fn read(&self) -> T
    where
        T: Clone,
    {
        self.inner.lock().clone()
    }

    /// Runs `f` with exclusive access to the value.
    ///
    /// The lock is held for the closure's duration and released on every exit
    /// path, including a panic unwinding out of `f`.
    pub fn mutate<U>(&self, f: impl FnOnce(&mut T) -> U) -> U {
        f(&mut self.inner.lock())
    }

    /// Non-blocking contention probe: attempts the lock, releases it
    /// immediately if acquired, and reports whether another holder was inside.
    ///
    /// Diagnostics only — by the time the caller observes the result the lock
    /// state may already have changed.
    #[must_use]
    pub fn is_locked(&self) -> bool {
        match self.inner.try_lock() {
            Some(guard) => {
                drop(guard);
                false
            }
            None => true,
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
