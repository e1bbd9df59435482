//! Serialized subscription core — one reentrancy-safe state machine per
//! attachment.
//!
//! Every live binding between a publisher and a subscriber is a
//! [`SerializedSubscription`] wrapping a [`SubscriptionBehavior`]. The wrapper
//! guarantees that exactly one logical writer advances the behavior's state at
//! a time, *including* under recursive re-entry: a downstream callback that
//! synchronously calls back into the same subscription (a further request, a
//! re-send) must not deadlock.
//!
//! # Serialization strategy
//!
//! The wrapper is an owner-tracking serializer with a pending-operation
//! queue rather than a recursive lock:
//!
//! - A call from a thread that does **not** hold the serializer blocks on the
//!   behavior mutex, applies its operation, then drains the queue.
//! - A call from the thread that **already** holds the serializer enqueues
//!   its operation and returns immediately; the outer frame drains it before
//!   releasing.
//!
//! Re-entrant mutable access to behavior state therefore never happens, and
//! re-entrant delivery is **breadth-first**: an in-flight delivery finishes
//! before a re-sent value is processed, so a handler that re-sends `v + 1`
//! observes `[1, 2, 3]`, not `[3, 2, 1]`.
//!
//! # State machine
//!
//! `Unsubscribed -> Subscribed -> {Completed, Cancelled}`. Both transitions
//! out of `Subscribed` are terminal and mutually exclusive — the first
//! terminal event wins and every later completion or cancellation is a
//! silent no-op.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::demand::Demand;
use crate::event::Completion;
use crate::protocol::{Subscriber, Subscription};

// ---------------------------------------------------------------------------
// SubscriptionId
// ---------------------------------------------------------------------------

static NEXT_SUBSCRIPTION_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique subscription identifier.
///
/// Minted monotonically; used as the registry key inside subjects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

impl SubscriptionId {
    /// Mints the next unique identifier.
    #[must_use]
    pub fn next() -> Self {
        Self(NEXT_SUBSCRIPTION_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// SubscriptionState
// ---------------------------------------------------------------------------

/// Lifecycle state of a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionState {
    /// Created but not yet attached to an upstream.
    Unsubscribed,
    /// Attached and live: values and completion may flow.
    Subscribed,
    /// Terminal: the completion has been delivered downstream.
    Completed,
    /// Terminal: the subscriber tore the attachment down.
    Cancelled,
}

impl SubscriptionState {
    /// Returns `true` for [`Completed`](SubscriptionState::Completed) and
    /// [`Cancelled`](SubscriptionState::Cancelled).
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled)
    }
}

// ---------------------------------------------------------------------------
// SubscriptionBehavior
// ---------------------------------------------------------------------------

/// Per-subscription logic plugged into a [`SerializedSubscription`].
///
/// All methods run under the wrapper's serializer; a behavior never needs its
/// own locking. Behaviors that share the standard demand arithmetic embed a
/// [`StageCore`] and delegate to it.
pub trait SubscriptionBehavior: Send + 'static {
    /// Value type delivered into this behavior.
    type Input: Send + 'static;
    /// Failure type carried by this behavior's completion.
    type Failure: Send + 'static;

    /// Adds to outstanding demand and forwards the request upstream where an
    /// upstream exists.
    fn request(&mut self, demand: Demand);

    /// Delivers one value; returns the demand the downstream grants back.
    fn receive(&mut self, value: Self::Input) -> Demand;

    /// Delivers terminal completion. The behavior may forward it immediately
    /// or hold it until buffered values drain; it reports the former through
    /// [`is_complete`](SubscriptionBehavior::is_complete).
    fn receive_completion(&mut self, completion: Completion<Self::Failure>);

    /// Reacts to cancellation: upstream teardown, registry self-removal.
    fn cancel(&mut self);

    /// Records the upstream handle once attached.
    fn attach(&mut self, upstream: Arc<dyn Subscription>);

    /// Announces `subscription` to the downstream subscriber.
    fn announce(&mut self, subscription: Arc<dyn Subscription>);

    /// Returns `true` once the terminal completion has actually been
    /// delivered downstream.
    fn is_complete(&self) -> bool;
}

// ---------------------------------------------------------------------------
// StageCore
// ---------------------------------------------------------------------------

/// Shared plumbing embedded by concrete behaviors: outstanding demand, the
/// upstream handle, and the downstream subscriber.
///
/// [`deliver`](StageCore::deliver) implements the passthrough arithmetic all
/// stages build on: a value is delivered only while demand is available, one
/// unit is consumed per delivery, and whatever the downstream grants back is
/// added to the remainder.
pub struct StageCore<In: Send + 'static, E: Send + 'static> {
    /// Outstanding downstream demand.
    pub demand: Demand,
    upstream: Option<Arc<dyn Subscription>>,
    downstream: Arc<dyn Subscriber<Input = In, Failure = E>>,
}

impl<In: Send + 'static, E: Send + 'static> StageCore<In, E> {
    /// Creates a core with zero demand and no upstream.
    #[must_use]
    pub fn new(downstream: Arc<dyn Subscriber<Input = In, Failure = E>>) -> Self {
        Self {
            demand: Demand::NONE,
            upstream: None,
            downstream,
        }
    }

    /// Adds `demand` and forwards the request upstream if attached.
    pub fn request(&mut self, demand: Demand) {
        self.demand = self.demand.add(demand);
        if let Some(upstream) = &self.upstream {
            upstream.request(demand);
        }
    }

    /// Delivers `value` downstream if demand allows, returning the demand
    /// granted back. With zero demand the value is dropped and
    /// [`Demand::NONE`] is returned.
    pub fn deliver(&mut self, value: In) -> Demand {
        if !self.demand.available() {
            return Demand::NONE;
        }
        self.demand = self.demand.consume(1);
        let granted = self.downstream.receive(value);
        self.demand = self.demand.add(granted);
        granted
    }

    /// Forwards `completion` downstream.
    pub fn complete(&mut self, completion: Completion<E>) {
        self.downstream.receive_completion(completion);
    }

    /// Records the upstream handle.
    pub fn attach(&mut self, upstream: Arc<dyn Subscription>) {
        self.upstream = Some(upstream);
    }

    /// Cancels and drops the upstream handle, if any.
    pub fn cancel_upstream(&mut self) {
        if let Some(upstream) = self.upstream.take() {
            upstream.cancel();
        }
    }

    /// Announces `subscription` to the downstream subscriber.
    pub fn announce(&self, subscription: Arc<dyn Subscription>) {
        self.downstream.receive_subscription(subscription);
    }

    /// Returns a shared handle to the downstream subscriber.
    #[must_use]
    pub fn downstream(&self) -> Arc<dyn Subscriber<Input = In, Failure = E>> {
        Arc::clone(&self.downstream)
    }
}

// ---------------------------------------------------------------------------
// SerializedSubscription
// ---------------------------------------------------------------------------

static NEXT_THREAD_TOKEN: AtomicU64 = AtomicU64::new(1);

/// Nonzero token identifying the calling thread, for owner tracking.
fn thread_token() -> u64 {
    thread_local! {
        static TOKEN: u64 = NEXT_THREAD_TOKEN.fetch_add(1, Ordering::Relaxed);
    }
    TOKEN.with(|t| *t)
}

/// One queued operation awaiting the serializer.
enum Op<V, E> {
    Attach(Option<Arc<dyn Subscription>>),
    Request(Demand),
    Receive(V),
    Complete(Completion<E>),
    Cancel,
}

struct Guarded<B> {
    behavior: B,
    state: SubscriptionState,
}

/// The serializer wrapping a [`SubscriptionBehavior`].
///
/// This wrapper — never the bare behavior — is what publishers register and
/// subscribers hold: it implements both the [`Subscriber`] capability (so an
/// upstream can deliver into it) and the [`Subscription`] capability (so the
/// downstream can request and cancel through it).
pub struct SerializedSubscription<B: SubscriptionBehavior> {
    id: SubscriptionId,
    weak_self: Weak<Self>,
    /// Thread token of the frame currently applying operations; 0 when free.
    owner: AtomicU64,
    guarded: Mutex<Guarded<B>>,
    pending: Mutex<VecDeque<Op<B::Input, B::Failure>>>,
}

impl<B: SubscriptionBehavior> SerializedSubscription<B> {
    /// Creates a subscription around `behavior` with a freshly minted id.
    #[must_use]
    pub fn new(behavior: B) -> Arc<Self> {
        Self::with_id(SubscriptionId::next(), behavior)
    }

    /// Creates a subscription with a caller-supplied id, for behaviors that
    /// key a registry entry by the same identifier.
    #[must_use]
    pub fn with_id(id: SubscriptionId, behavior: B) -> Arc<Self> {
        Arc::new_cyclic(|weak_self| Self {
            id,
            weak_self: weak_self.clone(),
            owner: AtomicU64::new(0),
            guarded: Mutex::new(Guarded {
                behavior,
                state: SubscriptionState::Unsubscribed,
            }),
            pending: Mutex::new(VecDeque::new()),
        })
    }

    /// Returns this subscription's identifier.
    #[must_use]
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    /// Returns the current lifecycle state.
    ///
    /// Blocks on the serializer; do not call from inside a behavior callback
    /// on the same subscription.
    #[must_use]
    pub fn state(&self) -> SubscriptionState {
        self.guarded.lock().state
    }

    /// Attaches with an optional upstream and announces the subscription
    /// downstream. Subjects attach with `None`: they are the origin of the
    /// stream and have nothing to forward requests to.
    pub fn attach(&self, upstream: Option<Arc<dyn Subscription>>) {
        self.enter(Op::Attach(upstream));
    }

    /// Serializer entry point: apply `op` now, or enqueue it if this thread
    /// is already inside the serializer.
    fn enter(&self, op: Op<B::Input, B::Failure>) -> Demand {
        let me = thread_token();
        if self.owner.load(Ordering::Acquire) == me {
            // Same logical call chain re-entering: queue for the outer frame.
            self.pending.lock().push_back(op);
            return Demand::NONE;
        }

        let mut guarded = self.guarded.lock();
        self.owner.store(me, Ordering::Release);
        let granted = self.apply(&mut guarded, op);
        loop {
            // The queue lock must not be held while applying: the operation
            // may re-enter and enqueue more work.
            let next = self.pending.lock().pop_front();
            let Some(op) = next else { break };
            let _ = self.apply(&mut guarded, op);
        }
        self.owner.store(0, Ordering::Release);
        granted
    }

    fn apply(&self, g: &mut Guarded<B>, op: Op<B::Input, B::Failure>) -> Demand {
        match op {
            Op::Attach(upstream) => {
                if g.state != SubscriptionState::Unsubscribed {
                    // Already attached, or cancelled before attachment: a
                    // redundant upstream would otherwise deliver into a
                    // subscription that will never accept it.
                    if let Some(upstream) = upstream {
                        upstream.cancel();
                    }
                    return Demand::NONE;
                }
                g.state = SubscriptionState::Subscribed;
                if let Some(upstream) = upstream {
                    g.behavior.attach(upstream);
                }
                if let Some(this) = self.weak_self.upgrade() {
                    g.behavior.announce(this);
                }
                self.settle(g);
                Demand::NONE
            }
            Op::Request(demand) => {
                if g.state == SubscriptionState::Subscribed {
                    g.behavior.request(demand);
                    self.settle(g);
                }
                Demand::NONE
            }
            Op::Receive(value) => {
                if g.state == SubscriptionState::Subscribed {
                    let granted = g.behavior.receive(value);
                    self.settle(g);
                    granted
                } else {
                    Demand::NONE
                }
            }
            Op::Complete(completion) => {
                if g.state == SubscriptionState::Subscribed {
                    g.behavior.receive_completion(completion);
                    self.settle(g);
                }
                Demand::NONE
            }
            Op::Cancel => {
                if !g.state.is_terminal() {
                    g.state = SubscriptionState::Cancelled;
                    g.behavior.cancel();
                }
                Demand::NONE
            }
        }
    }

    /// Promotes to `Completed` once the behavior reports its completion has
    /// actually gone downstream (immediately for passthrough stages, after
    /// the buffer drains for buffered ones).
    fn settle(&self, g: &mut Guarded<B>) {
        if g.state == SubscriptionState::Subscribed && g.behavior.is_complete() {
            g.state = SubscriptionState::Completed;
        }
    }
}

impl<B: SubscriptionBehavior> Subscription for SerializedSubscription<B> {
    fn request(&self, demand: Demand) {
        let _ = self.enter(Op::Request(demand));
    }

    fn cancel(&self) {
        let _ = self.enter(Op::Cancel);
    }
}

impl<B: SubscriptionBehavior> Subscriber for SerializedSubscription<B> {
    type Input = B::Input;
    type Failure = B::Failure;

    fn receive_subscription(&self, subscription: Arc<dyn Subscription>) {
        self.enter(Op::Attach(Some(subscription)));
    }

    fn receive(&self, value: Self::Input) -> Demand {
        self.enter(Op::Receive(value))
    }

    fn receive_completion(&self, completion: Completion<Self::Failure>) {
        let _ = self.enter(Op::Complete(completion));
    }
}

// ===========================================================================
// Tests
// ===========================================================================
