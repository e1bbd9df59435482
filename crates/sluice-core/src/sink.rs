//! Terminal consumers driving and observing the engine.
//!
//! [`Sink`] grants unlimited demand as soon as it is attached and forwards
//! every value and the completion to caller-supplied callbacks. [`DemandSink`]
//! starts from a caller-specified demand budget instead and exposes
//! [`increase_demand`](DemandSink::increase_demand), so tests and callers can
//! steer backpressure from outside.
//!
//! Both are cheap handles over shared state: clone one, hand the clone to
//! [`Publisher::subscribe`](crate::protocol::Publisher::subscribe), and keep
//! the original around for [`cancel`](Sink::cancel).

use std::sync::Arc;

use crate::cell::MutexCell;
use crate::demand::Demand;
use crate::event::{Completion, Event};
use crate::protocol::{Subscriber, Subscription};

// ---------------------------------------------------------------------------
// Sink
// ---------------------------------------------------------------------------

struct SinkState {
    subscription: Option<Arc<dyn Subscription>>,
    terminal: bool,
}

struct SinkInner<V, E> {
    state: MutexCell<SinkState>,
    on_value: Box<dyn Fn(V) + Send + Sync>,
    on_completion: Box<dyn Fn(Completion<E>) + Send + Sync>,
}

/// A terminal subscriber with unlimited demand.
///
/// Only the first attached subscription is retained; further attachments are
/// ignored. After the completion has been observed, no callback fires again
/// — the terminal event is reported exactly once.
pub struct Sink<V, E> {
    inner: Arc<SinkInner<V, E>>,
}

impl<V, E> Clone for Sink<V, E> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<V, E> Sink<V, E>
where
    V: Send + 'static,
    E: Send + 'static,
{
    /// Creates a sink feeding every delivery into one event callback.
    #[must_use]
    pub fn new(on_event: impl Fn(Event<V, E>) + Send + Sync + 'static) -> Self {
        let on_event = Arc::new(on_event);
        let value_event = Arc::clone(&on_event);
        Self::with_handlers(
            move |value| value_event(Event::Value(value)),
            move |completion| on_event(Event::Complete(completion)),
        )
    }

    /// Creates a sink with separate value and completion callbacks.
    #[must_use]
    pub fn with_handlers(
        on_value: impl Fn(V) + Send + Sync + 'static,
        on_completion: impl Fn(Completion<E>) + Send + Sync + 'static,
    ) -> Self {
        Self {
            inner: Arc::new(SinkInner {
                state: MutexCell::new(SinkState {
                    subscription: None,
                    terminal: false,
                }),
                on_value: Box::new(on_value),
                on_completion: Box::new(on_completion),
            }),
        }
    }

    /// Releases the upstream subscription. Safe to call repeatedly.
    pub fn cancel(&self) {
        let subscription = self.inner.state.mutate(|s| s.subscription.take());
        if let Some(subscription) = subscription {
            subscription.cancel();
        }
    }
}

impl<V, E> Subscriber for Sink<V, E>
where
    V: Send + 'static,
    E: Send + 'static,
{
    type Input = V;
    type Failure = E;

    fn receive_subscription(&self, subscription: Arc<dyn Subscription>) {
        let accepted = self.inner.state.mutate(|s| {
            if s.subscription.is_none() && !s.terminal {
                s.subscription = Some(Arc::clone(&subscription));
                true
            } else {
                false
            }
        });
        // Request outside the state lock: draining may deliver synchronously
        // and re-enter this sink.
        if accepted {
            subscription.request(Demand::UNBOUNDED);
        } else {
            tracing::debug!("sink already attached, ignoring additional subscription");
        }
    }

    fn receive(&self, value: V) -> Demand {
        if self.inner.state.mutate(|s| s.terminal) {
            return Demand::NONE;
        }
        (self.inner.on_value)(value);
        Demand::UNBOUNDED
    }

    fn receive_completion(&self, completion: Completion<E>) {
        let first = self.inner.state.mutate(|s| {
            let first = !s.terminal;
            s.terminal = true;
            s.subscription = None;
            first
        });
        if first {
            (self.inner.on_completion)(completion);
        }
    }
}

// ---------------------------------------------------------------------------
// DemandSink
// ---------------------------------------------------------------------------

struct DemandSinkState {
    /// Remaining single-unit requests this sink will issue on its own.
    budget: u64,
    subscription: Option<Arc<dyn Subscription>>,
    terminal: bool,
}

struct DemandSinkInner<V, E> {
    state: MutexCell<DemandSinkState>,
    on_value: Box<dyn Fn(V) + Send + Sync>,
    on_completion: Box<dyn Fn(Completion<E>) + Send + Sync>,
}

/// A terminal subscriber with externally controlled demand.
///
/// Starts with an initial budget of single-unit requests: one is issued at
/// attach, one more after each delivered value while the budget lasts.
/// [`increase_demand`](DemandSink::increase_demand) forwards additional
/// demand directly to the subscription at any time.
pub struct DemandSink<V, E> {
    inner: Arc<DemandSinkInner<V, E>>,
}

impl<V, E> Clone for DemandSink<V, E> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<V, E> DemandSink<V, E>
where
    V: Send + 'static,
    E: Send + 'static,
{
    /// Creates a sink with `initial` demand and one event callback.
    #[must_use]
    pub fn new(initial: u64, on_event: impl Fn(Event<V, E>) + Send + Sync + 'static) -> Self {
        let on_event = Arc::new(on_event);
        let value_event = Arc::clone(&on_event);
        Self::with_handlers(
            initial,
            move |value| value_event(Event::Value(value)),
            move |completion| on_event(Event::Complete(completion)),
        )
    }

    /// Creates a sink with `initial` demand and separate callbacks.
    #[must_use]
    pub fn with_handlers(
        initial: u64,
        on_value: impl Fn(V) + Send + Sync + 'static,
        on_completion: impl Fn(Completion<E>) + Send + Sync + 'static,
    ) -> Self {
        Self {
            inner: Arc::new(DemandSinkInner {
                state: MutexCell::new(DemandSinkState {
                    budget: initial,
                    subscription: None,
                    terminal: false,
                }),
                on_value: Box::new(on_value),
                on_completion: Box::new(on_completion),
            }),
        }
    }

    /// Requests `n` more values from the upstream immediately.
    pub fn increase_demand(&self, n: u64) {
        let subscription = self.inner.state.mutate(|s| s.subscription.clone());
        if let Some(subscription) = subscription {
            subscription.request(Demand::max(n));
        }
    }

    /// Releases the upstream subscription and zeroes the remaining budget.
    /// Safe to call repeatedly.
    pub fn cancel(&self) {
        let subscription = self.inner.state.mutate(|s| {
            s.budget = 0;
            s.subscription.take()
        });
        if let Some(subscription) = subscription {
            subscription.cancel();
        }
    }
}

impl<V, E> Subscriber for DemandSink<V, E>
where
    V: Send + 'static,
    E: Send + 'static,
{
    type Input = V;
    type Failure = E;

    fn receive_subscription(&self, subscription: Arc<dyn Subscription>) {
        let request_one = self.inner.state.mutate(|s| {
            if s.subscription.is_some() || s.terminal {
                return false;
            }
            s.subscription = Some(Arc::clone(&subscription));
            if s.budget > 0 {
                s.budget -= 1;
                true
            } else {
                false
            }
        });
        if request_one {
            subscription.request(Demand::max(1));
        }
    }

    fn receive(&self, value: V) -> Demand {
        if self.inner.state.mutate(|s| s.terminal) {
            return Demand::NONE;
        }
        (self.inner.on_value)(value);
        self.inner.state.mutate(|s| {
            if s.budget > 0 {
                s.budget -= 1;
                Demand::max(1)
            } else {
                Demand::NONE
            }
        })
    }

    fn receive_completion(&self, completion: Completion<E>) {
        let first = self.inner.state.mutate(|s| {
            let first = !s.terminal;
            s.terminal = true;
            s.budget = 0;
            s.subscription = None;
            first
        });
        if first {
            (self.inner.on_completion)(completion);
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
