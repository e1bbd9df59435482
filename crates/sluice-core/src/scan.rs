//! Stateful fold stage.
//!
//! [`Scan`] wraps an upstream publisher with an accumulator: every upstream
//! value is folded into the running state and the *new* state is what flows
//! downstream. Demand is consumed 1:1 — one upstream input yields exactly one
//! downstream emission — so requests pass through unchanged.
//!
//! Each subscriber gets its own accumulator seeded at construction; two
//! subscribers to the same `Scan` fold independently.

use std::sync::Arc;

use crate::demand::Demand;
use crate::event::Completion;
use crate::protocol::{Publisher, Subscriber, Subscription};
use crate::subscription::{SerializedSubscription, StageCore, SubscriptionBehavior};

// ---------------------------------------------------------------------------
// ScanBehavior
// ---------------------------------------------------------------------------

struct ScanBehavior<In, Out, E>
where
    In: Send + 'static,
    Out: Clone + Send + 'static,
    E: Send + 'static,
{
    core: StageCore<Out, E>,
    state: Out,
    reducer: Arc<dyn Fn(Out, In) -> Out + Send + Sync>,
    done: bool,
}

impl<In, Out, E> SubscriptionBehavior for ScanBehavior<In, Out, E>
where
    In: Send + 'static,
    Out: Clone + Send + 'static,
    E: Send + 'static,
{
    type Input = In;
    type Failure = E;

    fn request(&mut self, demand: Demand) {
        self.core.request(demand);
    }

    fn receive(&mut self, input: In) -> Demand {
        self.state = (self.reducer)(self.state.clone(), input);
        self.core.deliver(self.state.clone())
    }

    fn receive_completion(&mut self, completion: Completion<E>) {
        self.core.complete(completion);
        self.done = true;
    }

    fn cancel(&mut self) {
        self.core.cancel_upstream();
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
// Scan
// ---------------------------------------------------------------------------

/// A publisher folding upstream values into a running accumulator.
pub struct Scan<P, Out>
where
    P: Publisher,
    Out: Clone + Send + 'static,
{
    upstream: P,
    seed: Out,
    reducer: Arc<dyn Fn(Out, P::Output) -> Out + Send + Sync>,
}

impl<P, Out> Scan<P, Out>
where
    P: Publisher,
    Out: Clone + Send + 'static,
{
    /// Creates a fold over `upstream` starting from `seed`.
    #[must_use]
    pub fn new(
        upstream: P,
        seed: Out,
        reducer: impl Fn(Out, P::Output) -> Out + Send + Sync + 'static,
    ) -> Self {
        Self {
            upstream,
            seed,
            reducer: Arc::new(reducer),
        }
    }
}

impl<P, Out> Publisher for Scan<P, Out>
where
    P: Publisher,
    Out: Clone + Send + 'static,
{
    type Output = Out;
    type Failure = P::Failure;

    fn subscribe<S>(&self, subscriber: S)
    where
        S: Subscriber<Input = Out, Failure = P::Failure> + 'static,
    {
        let downstream: Arc<dyn Subscriber<Input = Out, Failure = P::Failure>> =
            Arc::new(subscriber);
        let behavior = ScanBehavior {
            core: StageCore::new(downstream),
            state: self.seed.clone(),
            reducer: Arc::clone(&self.reducer),
            done: false,
        };
        let subscription = SerializedSubscription::new(behavior);
        self.upstream.subscribe(subscription);
    }
}

// ===========================================================================
// Tests
// ===========================================================================
