//! Plain multicast subject — a "hot" push broadcaster.
//!
//! A [`Subject`] holds a registry of live subscriptions and broadcasts every
//! [`send`](Subject::send) to all of them. Broadcast is fire-and-forget: the
//! subject offers each value once per send, and each subscription's own
//! demand decides whether the value is actually delivered or dropped.
//!
//! # Thread safety
//!
//! Registry mutation (add on subscribe, remove on cancel, drain on
//! completion) is serialized by the registry's own lock. Broadcast takes a
//! point-in-time snapshot of the registrants before iterating, so a
//! subscriber cancelling itself mid-broadcast cannot corrupt the in-flight
//! iteration — it simply stops being observed from the next send onwards.

use std::sync::{Arc, Weak};

use fxhash::FxHashMap;
use smallvec::SmallVec;

use crate::cell::MutexCell;
use crate::demand::Demand;
use crate::event::Completion;
use crate::protocol::{Publisher, Subscriber, Subscription};
use crate::subscription::{
    SerializedSubscription, StageCore, SubscriptionBehavior, SubscriptionId,
};

// ---------------------------------------------------------------------------
// SubjectBehavior
// ---------------------------------------------------------------------------

/// Per-subscription behavior for a plain subject: passthrough demand
/// arithmetic plus registry self-removal on cancel.
struct SubjectBehavior<V, E>
where
    V: Send + 'static,
    E: Send + 'static,
{
    core: StageCore<V, E>,
    /// Registry back-reference; weak so a subscription never keeps its
    /// subject alive.
    subject: Weak<SubjectInner<V, E>>,
    id: SubscriptionId,
    done: bool,
}

impl<V, E> SubscriptionBehavior for SubjectBehavior<V, E>
where
    V: Send + 'static,
    E: Send + 'static,
{
    type Input = V;
    type Failure = E;

    fn request(&mut self, demand: Demand) {
        self.core.request(demand);
    }

    fn receive(&mut self, value: V) -> Demand {
        self.core.deliver(value)
    }

    fn receive_completion(&mut self, completion: Completion<E>) {
        self.core.complete(completion);
        self.done = true;
    }

    fn cancel(&mut self) {
        self.core.cancel_upstream();
        if let Some(inner) = self.subject.upgrade() {
            inner.state.mutate(|s| {
                s.subscribers.remove(&self.id);
            });
        }
    }

    fn attach(&mut self, upstream: Arc<dyn Subscription>) {
        self.core.attach(upstream);
    }

    fn announce(&mut self, subscription: Arc<dyn Subscription>) {
        self.core.announce(subscription);
    }

    fn is_complete(&self) -> bool {
        self.done
    }
}

// ---------------------------------------------------------------------------
// Subject
// ---------------------------------------------------------------------------

type Registry<V, E> = FxHashMap<SubscriptionId, Arc<SerializedSubscription<SubjectBehavior<V, E>>>>;

struct SubjectCore<V, E>
where
    V: Send + 'static,
    E: Send + 'static,
{
    subscribers: Registry<V, E>,
    /// Completion recorded once the subject terminates; late subscribers
    /// receive it immediately.
    terminal: Option<Completion<E>>,
}

struct SubjectInner<V, E>
where
    V: Send + 'static,
    E: Send + 'static,
{
    state: MutexCell<SubjectCore<V, E>>,
}

/// A multicast subject: values sent into it fan out to every live
/// subscription.
///
/// Cheaply cloneable; clones share the same registry. A subject cannot be
/// reused after completion — later sends are no-ops and later subscribers
/// observe the recorded completion right away.
pub struct Subject<V, E>
where
    V: Clone + Send + 'static,
    E: Clone + Send + 'static,
{
    inner: Arc<SubjectInner<V, E>>,
}

impl<V, E> Clone for Subject<V, E>
where
    V: Clone + Send + 'static,
    E: Clone + Send + 'static,
{
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<V, E> Default for Subject<V, E>
where
    V: Clone + Send + 'static,
    E: Clone + Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<V, E> Subject<V, E>
where
    V: Clone + Send + 'static,
    E: Clone + Send + 'static,
{
    /// Creates an empty subject.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(SubjectInner {
                state: MutexCell::new(SubjectCore {
                    subscribers: FxHashMap::default(),
                    terminal: None,
                }),
            }),
        }
    }

    /// Broadcasts `value` to every currently registered subscription.
    ///
    /// Delivery happens outside the registry lock, against a snapshot taken
    /// under it.
    pub fn send(&self, value: V) {
        let subscribers: SmallVec<[_; 4]> = self.inner.state.mutate(|s| {
            if s.terminal.is_some() {
                SmallVec::new()
            } else {
                s.subscribers.values().cloned().collect()
            }
        });
        for subscriber in subscribers {
            let _ = subscriber.receive(value.clone());
        }
    }

    /// Terminates the subject: delivers `completion` once to every live
    /// subscription and clears the registry.
    pub fn send_completion(&self, completion: Completion<E>) {
        let subscribers: SmallVec<[_; 4]> = self.inner.state.mutate(|s| {
            if s.terminal.is_some() {
                return SmallVec::new();
            }
            s.terminal = Some(completion.clone());
            s.subscribers.drain().map(|(_, sub)| sub).collect()
        });
        if !subscribers.is_empty() {
            tracing::debug!(count = subscribers.len(), "subject completing");
        }
        for subscriber in subscribers {
            subscriber.receive_completion(completion.clone());
        }
    }

    /// Sends every value from `values`, then the completion if one is given.
    pub fn send_all<I>(&self, values: I, completion: Option<Completion<E>>)
    where
        I: IntoIterator<Item = V>,
    {
        for value in values {
            self.send(value);
        }
        if let Some(completion) = completion {
            self.send_completion(completion);
        }
    }

    /// Number of currently registered subscriptions.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.inner.state.mutate(|s| s.subscribers.len())
    }
}

impl<V, E> Publisher for Subject<V, E>
where
    V: Clone + Send + 'static,
    E: Clone + Send + 'static,
{
    type Output = V;
    type Failure = E;

    fn subscribe<S>(&self, subscriber: S)
    where
        S: Subscriber<Input = V, Failure = E> + 'static,
    {
        let downstream: Arc<dyn Subscriber<Input = V, Failure = E>> = Arc::new(subscriber);
        let id = SubscriptionId::next();
        let behavior = SubjectBehavior {
            core: StageCore::new(downstream),
            subject: Arc::downgrade(&self.inner),
            id,
            done: false,
        };
        let subscription = SerializedSubscription::with_id(id, behavior);

        // Registration and the terminal check are one atomic step so a
        // concurrent completion cannot slip between them.
        let recorded = self.inner.state.mutate(|s| {
            if let Some(completion) = &s.terminal {
                Some(completion.clone())
            } else {
                s.subscribers.insert(id, Arc::clone(&subscription));
                None
            }
        });

        subscription.attach(None);
        if let Some(completion) = recorded {
            subscription.receive_completion(completion);
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
