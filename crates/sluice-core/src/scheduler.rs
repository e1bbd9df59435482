//! The scheduling capability consumed from the host.
//!
//! The engine never runs its own event loop; context transfer stages hand
//! work to an externally provided [`Scheduler`]. The contract is small: run
//! an action now on the scheduler's context, run it after a delay with a
//! cancellation handle, and report which context the calling thread is
//! currently on so the immediate-transfer fast path can skip a redundant
//! hop.
//!
//! Concrete schedulers are host collaborators; this crate ships only the
//! capability surface (tests provide a single-worker-thread implementation).

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

// ---------------------------------------------------------------------------
// ContextId
// ---------------------------------------------------------------------------

/// Identifies one execution context (a thread, a queue, a loop).
///
/// Equality is the only meaningful operation: two equal ids mean "already on
/// the target context, dispatch may be synchronous."
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContextId(pub u64);

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ctx-{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

/// A deferred unit of work handed to a scheduler.
pub type Action = Box<dyn FnOnce() + Send>;

/// Capability for running actions on an execution context.
pub trait Scheduler: Send + Sync + 'static {
    /// The context this scheduler dispatches onto.
    fn context(&self) -> ContextId;

    /// The context the *calling* thread is currently executing on.
    ///
    /// A thread not owned by any scheduler reports an id that equals no
    /// scheduler's [`context`](Scheduler::context).
    fn current_context(&self) -> ContextId;

    /// Runs `action` on this scheduler's context as soon as possible. The
    /// caller never blocks waiting for the action to run.
    fn schedule_now(&self, action: Action);

    /// Runs `action` on this scheduler's context after `delay`. The returned
    /// handle cancels the action if it has not started yet.
    fn schedule_after(&self, delay: Duration, action: Action) -> ScheduleHandle;
}

// ---------------------------------------------------------------------------
// ScheduleHandle
// ---------------------------------------------------------------------------

/// Cancellation handle for a delayed action.
///
/// Cloned freely; all clones observe the same flag. Cancellation is
/// idempotent and cooperative — the scheduler checks the flag immediately
/// before running the action.
#[derive(Debug, Clone, Default)]
pub struct ScheduleHandle {
    cancelled: Arc<AtomicBool>,
}

impl ScheduleHandle {
    /// Creates a live (not yet cancelled) handle.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks the action as cancelled.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    /// Returns `true` once [`cancel`](ScheduleHandle::cancel) has been called
    /// on any clone of this handle.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

// ===========================================================================
// Tests
// ===========================================================================
