//! Buffered multicast subject — replay with bounded backlog.
//!
//! A [`BufferedSubject`] records everything sent through it in a shared
//! [`Buffer`]. A new subscription is seeded with a snapshot of that backlog,
//! so late subscribers observe the same buffered values any sibling would;
//! thereafter each subscription drains its own buffer as demand arrives.
//!
//! The overflow policy is evaluated only at capacity: `DropOldest` evicts the
//! earliest pending value, `DropNewest` discards the incoming one, and
//! `FailWith` converts the subject into a terminal failure visible to current
//! and future subscribers alike.
//!
//! Completions queue behind pending values. Values are demand-gated; a
//! pending completion is not — once the values ahead of it have drained it is
//! delivered even at zero remaining demand.

use std::sync::{Arc, Weak};

use fxhash::FxHashMap;
use smallvec::SmallVec;

use crate::buffer::{Buffer, OverflowPolicy};
use crate::cell::MutexCell;
use crate::demand::Demand;
use crate::event::{Completion, Event};
use crate::protocol::{Publisher, Subscriber, Subscription};
use crate::subscription::{
    SerializedSubscription, StageCore, SubscriptionBehavior, SubscriptionId,
};

// ---------------------------------------------------------------------------
// BufferedBehavior
// ---------------------------------------------------------------------------

/// Per-subscription behavior: a private buffer seeded from the subject's
/// shared backlog, drained while demand remains.
struct BufferedBehavior<V, E>
where
    V: Send + 'static,
    E: Send + 'static,
{
    core: StageCore<V, E>,
    buffer: Buffer<V, E>,
    subject: Weak<BufferedInner<V, E>>,
    id: SubscriptionId,
    done: bool,
}

impl<V, E> BufferedBehavior<V, E>
where
    V: Send + 'static,
    E: Send + 'static,
{
    /// Delivers buffered events downstream: values while demand allows, then
    /// a pending completion once no values remain.
    fn drain(&mut self) {
        loop {
            if self.buffer.has_values() && !self.core.demand.available() {
                break;
            }
            match self.buffer.pop() {
                Some(Event::Value(value)) => {
                    let _ = self.core.deliver(value);
                }
                Some(Event::Complete(completion)) => {
                    self.core.complete(completion);
                    self.done = true;
                    break;
                }
                None => break,
            }
        }
    }
}

impl<V, E> SubscriptionBehavior for BufferedBehavior<V, E>
where
    V: Send + 'static,
    E: Send + 'static,
{
    type Input = V;
    type Failure = E;

    fn request(&mut self, demand: Demand) {
        self.core.request(demand);
        self.drain();
    }

    fn receive(&mut self, value: V) -> Demand {
        self.buffer.push(value);
        self.drain();
        // The subject may keep sending regardless of this subscriber's pace;
        // pacing happens against the buffer.
        Demand::UNBOUNDED
    }

    fn receive_completion(&mut self, completion: Completion<E>) {
        if self.buffer.is_empty() {
            self.core.complete(completion);
            self.done = true;
        } else {
            self.buffer.push_completion(completion);
            self.drain();
        }
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
// BufferedSubject
// ---------------------------------------------------------------------------

type Registry<V, E> =
    FxHashMap<SubscriptionId, Arc<SerializedSubscription<BufferedBehavior<V, E>>>>;

struct BufferedCore<V, E>
where
    V: Send + 'static,
    E: Send + 'static,
{
    subscribers: Registry<V, E>,
    /// Shared backlog used to seed new subscriptions.
    buffer: Buffer<V, E>,
}

struct BufferedInner<V, E>
where
    V: Send + 'static,
    E: Send + 'static,
{
    state: MutexCell<BufferedCore<V, E>>,
}

/// A multicast subject with a bounded replay buffer.
///
/// Cheaply cloneable; clones share the registry and the backlog.
pub struct BufferedSubject<V, E>
where
    V: Clone + Send + 'static,
    E: Clone + Send + 'static,
{
    inner: Arc<BufferedInner<V, E>>,
}

impl<V, E> Clone for BufferedSubject<V, E>
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

impl<V, E> Default for BufferedSubject<V, E>
where
    V: Clone + Send + 'static,
    E: Clone + Send + 'static,
{
    /// One-slot drop-oldest buffer, the smallest useful replay window.
    fn default() -> Self {
        Self::new(1, OverflowPolicy::DropOldest)
    }
}

impl<V, E> BufferedSubject<V, E>
where
    V: Clone + Send + 'static,
    E: Clone + Send + 'static,
{
    /// Creates a subject buffering at most `limit` pending values under
    /// `policy`.
    #[must_use]
    pub fn new(limit: usize, policy: OverflowPolicy<E>) -> Self {
        Self {
            inner: Arc::new(BufferedInner {
                state: MutexCell::new(BufferedCore {
                    subscribers: FxHashMap::default(),
                    buffer: Buffer::new(limit, policy),
                }),
            }),
        }
    }

    /// Creates a subject with no practical capacity bound.
    #[must_use]
    pub fn unbounded() -> Self {
        Self::new(usize::MAX, OverflowPolicy::DropOldest)
    }

    /// Records `value` in the shared backlog, then offers it to every live
    /// subscription.
    ///
    /// If the push exhausts capacity under a `FailWith` policy, the
    /// synthesized failure — not the value — is what reaches the live
    /// subscriptions, and the registry is drained.
    pub fn send(&self, value: V) {
        let (subscribers, failure): (SmallVec<[_; 4]>, _) = self.inner.state.mutate(|s| {
            if s.buffer.is_terminated() {
                return (SmallVec::new(), None);
            }
            s.buffer.push(value.clone());
            if s.buffer.is_terminated() {
                let completion = s.buffer.pending_completion().cloned();
                (s.subscribers.drain().map(|(_, sub)| sub).collect(), completion)
            } else {
                (s.subscribers.values().cloned().collect(), None)
            }
        });
        if let Some(completion) = failure {
            for subscriber in subscribers {
                subscriber.receive_completion(completion.clone());
            }
        } else {
            for subscriber in subscribers {
                let _ = subscriber.receive(value.clone());
            }
        }
    }

    /// Records the completion in the shared backlog and delivers it once to
    /// every live subscription, clearing the registry.
    pub fn send_completion(&self, completion: Completion<E>) {
        let subscribers: SmallVec<[_; 4]> = self.inner.state.mutate(|s| {
            if s.buffer.is_terminated() {
                return SmallVec::new();
            }
            s.buffer.push_completion(completion.clone());
            s.subscribers.drain().map(|(_, sub)| sub).collect()
        });
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

impl<V, E> Publisher for BufferedSubject<V, E>
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

        // Seeding and registration are one atomic step: a send between the
        // backlog snapshot and the registry insert could otherwise be lost
        // for this subscriber.
        let subscription = self.inner.state.mutate(|s| {
            let terminated = s.buffer.is_terminated();
            let behavior = BufferedBehavior {
                core: StageCore::new(downstream),
                buffer: s.buffer.clone(),
                subject: Arc::downgrade(&self.inner),
                id,
                done: false,
            };
            let subscription = SerializedSubscription::with_id(id, behavior);
            // A terminated subject will never send again; the seeded backlog
            // is everything this subscriber will observe.
            if !terminated {
                s.subscribers.insert(id, Arc::clone(&subscription));
            }
            subscription
        });

        subscription.attach(None);
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::convert::Infallible;

    use crate::buffer::OverflowError;
    use crate::scan::Scan;
    use crate::sink::{DemandSink, Sink};
    use crate::subject::Subject;

    type Events<E> = Arc<MutexCell<Vec<Event<i32, E>>>>;

    fn recording_sink<E: Clone + Send + 'static>() -> (Sink<i32, E>, Events<E>) {
        let events: Events<E> = Arc::new(MutexCell::new(Vec::new()));
        let log = Arc::clone(&events);
        let sink = Sink::new(move |event| log.mutate(|e| e.push(event)));
        (sink, events)
    }

    // --- Replay ---

    #[test]
    fn test_buffered_replays_backlog_to_late_subscriber() {
        let subject = BufferedSubject::<i32, Infallible>::unbounded();
        subject.send_all([1, 2], None);

        let (late, late_events) = recording_sink();
        subject.subscribe(late);
        assert_eq!(late_events.read(), Event::log([1, 2], None));

        subject.send_all([3], Some(Completion::Finished));
        assert_eq!(
            late_events.read(),
            Event::log([1, 2, 3], Some(Completion::Finished))
        );
    }

    #[test]
    fn test_buffered_early_and_late_subscribers_converge() {
        let subject = BufferedSubject::<i32, Infallible>::unbounded();

        let (early, early_events) = recording_sink();
        subject.subscribe(early);
        subject.send_all([11, 13], None);

        let (late, late_events) = recording_sink();
        subject.subscribe(late);
        subject.send_all([16, 20], Some(Completion::Finished));

        let expected = Event::log([11, 13, 16, 20], Some(Completion::Finished));
        assert_eq!(early_events.read(), expected);
        assert_eq!(late_events.read(), expected);
    }

    #[test]
    fn test_buffered_replay_through_upstream_accumulator() {
        let input = Subject::<i32, Infallible>::new();
        let totals = Scan::new(input.clone(), 10, |state, next| state + next);
        let buffered = BufferedSubject::<i32, Infallible>::unbounded();

        // Connect the accumulator's output into the buffered subject.
        let feed_values = buffered.clone();
        let feed_completion = buffered.clone();
        totals.subscribe(Sink::with_handlers(
            move |v| feed_values.send(v),
            move |c| feed_completion.send_completion(c),
        ));

        let (early, early_events) = recording_sink();
        buffered.subscribe(early);
        input.send_all(1..=2, None);

        let (late, late_events) = recording_sink();
        buffered.subscribe(late);
        input.send_all(3..=4, Some(Completion::Finished));

        // The late subscriber observes the full accumulated backlog.
        let expected = Event::log([11, 13, 16, 20], Some(Completion::Finished));
        assert_eq!(early_events.read(), expected);
        assert_eq!(late_events.read(), expected);
    }

    #[test]
    fn test_buffered_terminal_backlog_replays_completion() {
        let subject = BufferedSubject::<i32, Infallible>::unbounded();
        subject.send_all([7], Some(Completion::Finished));

        let (late, late_events) = recording_sink();
        subject.subscribe(late);
        assert_eq!(
            late_events.read(),
            Event::log([7], Some(Completion::Finished))
        );
    }

    // --- Demand interaction ---

    #[test]
    fn test_buffered_drop_oldest_keeps_most_recent_deliverable() {
        let subject = BufferedSubject::<i32, Infallible>::new(1, OverflowPolicy::DropOldest);
        let events: Events<Infallible> = Arc::new(MutexCell::new(Vec::new()));
        let log = Arc::clone(&events);
        let sink = DemandSink::new(1, move |event| log.mutate(|e| e.push(event)));
        subject.subscribe(sink.clone());

        subject.send_all([1, 2, 3], None);
        // One unit of demand consumed the first value; 2 was evicted by 3.
        assert_eq!(events.read(), Event::log([1], None));

        sink.increase_demand(10);
        assert_eq!(events.read(), Event::log([1, 3], None));
    }

    #[test]
    fn test_buffered_backlog_waits_for_demand() {
        let subject = BufferedSubject::<i32, Infallible>::unbounded();
        subject.send_all([1, 2, 3], None);

        let events: Events<Infallible> = Arc::new(MutexCell::new(Vec::new()));
        let log = Arc::clone(&events);
        let sink = DemandSink::new(0, move |event| log.mutate(|e| e.push(event)));
        subject.subscribe(sink.clone());
        assert!(events.read().is_empty());

        sink.increase_demand(2);
        assert_eq!(events.read(), Event::log([1, 2], None));

        sink.increase_demand(1);
        assert_eq!(events.read(), Event::log([1, 2, 3], None));
    }

    #[test]
    fn test_buffered_completion_delivered_after_values_drain() {
        let subject = BufferedSubject::<i32, Infallible>::unbounded();
        subject.send_all([1, 2], Some(Completion::Finished));

        let events: Events<Infallible> = Arc::new(MutexCell::new(Vec::new()));
        let log = Arc::clone(&events);
        let sink = DemandSink::new(0, move |event| log.mutate(|e| e.push(event)));
        subject.subscribe(sink.clone());
        assert!(events.read().is_empty());

        // Demand covers the values only; the completion follows on its own.
        sink.increase_demand(2);
        assert_eq!(
            events.read(),
            Event::log([1, 2], Some(Completion::Finished))
        );
    }

    // --- Overflow failure ---

    #[test]
    fn test_buffered_fail_with_reaches_current_subscriber() {
        let subject =
            BufferedSubject::<i32, OverflowError>::new(1, OverflowPolicy::fail_with(|| OverflowError));
        let (sink, events) = recording_sink();
        subject.subscribe(sink);

        subject.send(1);
        subject.send(2); // capacity exhausted: synthesized failure

        assert_eq!(
            events.read(),
            Event::log([1], Some(Completion::Failure(OverflowError)))
        );
    }

    #[test]
    fn test_buffered_fail_with_reaches_future_subscriber() {
        let subject =
            BufferedSubject::<i32, OverflowError>::new(1, OverflowPolicy::fail_with(|| OverflowError));
        subject.send(1);
        subject.send(2);

        let (late, late_events) = recording_sink();
        subject.subscribe(late);
        assert_eq!(
            late_events.read(),
            Event::log([1], Some(Completion::Failure(OverflowError)))
        );
    }

    // --- Lifecycle ---

    #[test]
    fn test_buffered_cancel_stops_replay() {
        let subject = BufferedSubject::<i32, Infallible>::unbounded();
        let (sink, events) = recording_sink();
        subject.subscribe(sink.clone());

        subject.send(1);
        sink.cancel();
        subject.send(2);

        assert_eq!(events.read(), Event::log([1], None));
        assert_eq!(subject.subscriber_count(), 0);
    }

    #[test]
    fn test_buffered_not_reusable_after_completion() {
        let subject = BufferedSubject::<i32, Infallible>::unbounded();
        let (sink, events) = recording_sink();
        subject.subscribe(sink);

        subject.send_completion(Completion::Finished);
        subject.send(1);
        subject.send_completion(Completion::Finished);

        assert_eq!(events.read(), Event::log([], Some(Completion::Finished)));
        assert_eq!(subject.subscriber_count(), 0);
    }
}
