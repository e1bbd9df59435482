//! The in-process capability contract between publishers and subscribers.
//!
//! Control flow: a subscriber attaches via [`Publisher::subscribe`]; the
//! publisher hands back a [`Subscription`] through
//! [`Subscriber::receive_subscription`]; values and completion then flow
//! strictly in response to, and bounded by, the demand the subscriber has
//! requested.
//!
//! [`Subscriber`] and [`Subscription`] are object-safe and `Send + Sync` so
//! handles can cross threads; [`Publisher`] is generic over its subscriber
//! and is consumed at compile time.

use std::sync::Arc;

use crate::demand::Demand;
use crate::event::Completion;

// ---------------------------------------------------------------------------
// Subscription
// ---------------------------------------------------------------------------

/// The control handle a subscriber holds over one live attachment.
///
/// Both operations are safe to call from any thread and idempotent with
/// respect to terminal states: requesting on, or cancelling, an already
/// completed or cancelled subscription is a no-op.
pub trait Subscription: Send + Sync {
    /// Grants `demand` further values to be delivered.
    fn request(&self, demand: Demand);

    /// Tears the attachment down. The first terminal event wins; any later
    /// completion or cancellation is ignored.
    fn cancel(&self);
}

// ---------------------------------------------------------------------------
// Subscriber
// ---------------------------------------------------------------------------

/// The receiving side of an attachment.
///
/// Methods take `&self`: implementations guard their own state internally so
/// a subscriber handle can be shared across publisher internals.
pub trait Subscriber: Send + Sync {
    /// Value type this subscriber consumes.
    type Input: Send + 'static;
    /// Failure type carried by this subscriber's completion.
    type Failure: Send + 'static;

    /// Hands over the subscription control handle. Called exactly once per
    /// attachment, before any value or completion.
    fn receive_subscription(&self, subscription: Arc<dyn Subscription>);

    /// Delivers one value; the return value is the additional demand the
    /// subscriber grants back to the publisher.
    fn receive(&self, value: Self::Input) -> Demand;

    /// Delivers the terminal completion.
    fn receive_completion(&self, completion: Completion<Self::Failure>);
}

impl<T> Subscriber for Arc<T>
where
    T: Subscriber + ?Sized,
{
    type Input = T::Input;
    type Failure = T::Failure;

    fn receive_subscription(&self, subscription: Arc<dyn Subscription>) {
        (**self).receive_subscription(subscription);
    }

    fn receive(&self, value: Self::Input) -> Demand {
        (**self).receive(value)
    }

    fn receive_completion(&self, completion: Completion<Self::Failure>) {
        (**self).receive_completion(completion);
    }
}

// ---------------------------------------------------------------------------
// Publisher
// ---------------------------------------------------------------------------

/// A source of values that subscribers attach to.
pub trait Publisher {
    /// Value type this publisher emits.
    type Output: Send + 'static;
    /// Failure type carried by this publisher's completion.
    type Failure: Send + 'static;

    /// Attaches `subscriber`. The subscriber observes nothing beyond the
    /// [`Subscription`] handle delivered to it, followed by values and at
    /// most one completion.
    fn subscribe<S>(&self, subscriber: S)
    where
        S: Subscriber<Input = Self::Output, Failure = Self::Failure> + 'static;
}
