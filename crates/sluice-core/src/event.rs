//! Value/completion algebra consumed by every other engine component.
//!
//! A stream delivers zero or more values followed by at most one terminal
//! [`Completion`]. [`Event`] packs both into a single tagged type so tests and
//! callers can record a delivery log and compare it wholesale.

use std::fmt;

// ---------------------------------------------------------------------------
// Completion
// ---------------------------------------------------------------------------

/// Terminal outcome of a stream.
///
/// Delivered at most once per subscription; both variants are final.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion<E> {
    /// The stream ran to its natural end.
    Finished,
    /// The stream terminated with an upstream or synthesized failure.
    Failure(E),
}

impl<E> Completion<E> {
    /// Returns `true` for [`Completion::Finished`].
    #[must_use]
    pub fn is_finished(&self) -> bool {
        matches!(self, Self::Finished)
    }

    /// Returns `true` for [`Completion::Failure`].
    #[must_use]
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failure(_))
    }

    /// Returns the failure payload, if any.
    #[must_use]
    pub fn failure(&self) -> Option<&E> {
        match self {
            Self::Finished => None,
            Self::Failure(e) => Some(e),
        }
    }
}

impl<E: fmt::Display> fmt::Display for Completion<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Finished => write!(f, "finished"),
            Self::Failure(e) => write!(f, "failure({e})"),
        }
    }
}

// ---------------------------------------------------------------------------
// Event
// ---------------------------------------------------------------------------

/// A single delivery observed by a subscriber: a value or a completion.
///
/// Immutable once constructed. `Clone`/`PartialEq` are available whenever the
/// value and failure types allow, so delivery logs can be collected and
/// compared directly in assertions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event<V, E> {
    /// One emitted value.
    Value(V),
    /// The terminal completion.
    Complete(Completion<E>),
}

impl<V, E> Event<V, E> {
    /// Returns `true` for [`Event::Value`].
    #[must_use]
    pub fn is_value(&self) -> bool {
        matches!(self, Self::Value(_))
    }

    /// Returns `true` for [`Event::Complete`].
    #[must_use]
    pub fn is_complete(&self) -> bool {
        matches!(self, Self::Complete(_))
    }

    /// Returns the value payload, if any.
    #[must_use]
    pub fn value(&self) -> Option<&V> {
        match self {
            Self::Value(v) => Some(v),
            Self::Complete(_) => None,
        }
    }

    /// Builds an expected delivery log: every value wrapped in
    /// [`Event::Value`], optionally followed by a completion.
    ///
    /// ```rust,ignore
    /// let expected = Event::log(1..=3, Some(Completion::Finished));
    /// assert_eq!(received, expected);
    /// ```
    #[must_use]
    pub fn log<I>(values: I, completion: Option<Completion<E>>) -> Vec<Self>
    where
        I: IntoIterator<Item = V>,
    {
        let mut events: Vec<Self> = values.into_iter().map(Event::Value).collect();
        if let Some(completion) = completion {
            events.push(Event::Complete(completion));
        }
        events
    }
}

// ===========================================================================
// Tests
// ===========================================================================
