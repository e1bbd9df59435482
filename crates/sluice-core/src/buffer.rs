//! Bounded buffering with an overflow policy.
//!
//! A [`Buffer`] holds an ordered backlog of pending values plus an optional
//! terminal completion. Once a completion is recorded no further values are
//! accepted; draining empties values before the completion. When the buffer
//! is at capacity the [`OverflowPolicy`] decides what gives way.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use crate::event::{Completion, Event};

// ---------------------------------------------------------------------------
// OverflowError
// ---------------------------------------------------------------------------

/// Ready-made failure for [`OverflowPolicy::FailWith`] users.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("buffer capacity exhausted")]
pub struct OverflowError;

// ---------------------------------------------------------------------------
// OverflowPolicy
// ---------------------------------------------------------------------------

/// Rule applied when a full buffer is offered another value.
pub enum OverflowPolicy<E> {
    /// Evict the earliest pending value, then accept the incoming one.
    DropOldest,
    /// Discard the incoming value.
    DropNewest,
    /// Convert capacity exhaustion into a terminal failure built by the
    /// factory.
    FailWith(Arc<dyn Fn() -> E + Send + Sync>),
}

impl<E> OverflowPolicy<E> {
    /// Convenience constructor wrapping a failure factory.
    #[must_use]
    pub fn fail_with(factory: impl Fn() -> E + Send + Sync + 'static) -> Self {
        Self::FailWith(Arc::new(factory))
    }
}

impl<E> Clone for OverflowPolicy<E> {
    fn clone(&self) -> Self {
        match self {
            Self::DropOldest => Self::DropOldest,
            Self::DropNewest => Self::DropNewest,
            Self::FailWith(factory) => Self::FailWith(Arc::clone(factory)),
        }
    }
}

impl<E> fmt::Debug for OverflowPolicy<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DropOldest => write!(f, "DropOldest"),
            Self::DropNewest => write!(f, "DropNewest"),
            Self::FailWith(_) => write!(f, "FailWith(..)"),
        }
    }
}

// ---------------------------------------------------------------------------
// Buffer
// ---------------------------------------------------------------------------

/// An ordered backlog of pending values plus an optional terminal completion,
/// bounded by `limit`.
pub struct Buffer<V, E> {
    values: VecDeque<V>,
    completion: Option<Completion<E>>,
    limit: usize,
    policy: OverflowPolicy<E>,
}

impl<V, E> Buffer<V, E> {
    /// Creates an empty buffer holding at most `limit` pending values.
    #[must_use]
    pub fn new(limit: usize, policy: OverflowPolicy<E>) -> Self {
        Self {
            values: VecDeque::new(),
            completion: None,
            limit,
            policy,
        }
    }

    /// Creates a buffer with no practical capacity bound.
    #[must_use]
    pub fn unbounded(policy: OverflowPolicy<E>) -> Self {
        Self::new(usize::MAX, policy)
    }

    /// Returns `true` when neither values nor a completion are pending.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty() && self.completion.is_none()
    }

    /// Number of pending values (the completion does not count).
    #[must_use]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Returns `true` while at least one value is pending.
    #[must_use]
    pub fn has_values(&self) -> bool {
        !self.values.is_empty()
    }

    /// Returns `true` once a terminal completion has been recorded.
    #[must_use]
    pub fn is_terminated(&self) -> bool {
        self.completion.is_some()
    }

    /// The recorded terminal completion, if any, without taking it.
    #[must_use]
    pub fn pending_completion(&self) -> Option<&Completion<E>> {
        self.completion.as_ref()
    }

    /// Offers a value. A terminated buffer rejects it outright; a full buffer
    /// applies the overflow policy.
    pub fn push(&mut self, value: V) {
        if self.completion.is_some() {
            return;
        }
        if self.values.len() >= self.limit {
            match &self.policy {
                OverflowPolicy::DropOldest => {
                    // With zero capacity nothing is storable either way.
                    if self.values.pop_front().is_some() {
                        self.values.push_back(value);
                        tracing::debug!("buffer full, evicted oldest pending value");
                    }
                }
                OverflowPolicy::DropNewest => {
                    tracing::debug!("buffer full, discarded incoming value");
                }
                OverflowPolicy::FailWith(factory) => {
                    tracing::warn!("buffer capacity exhausted, terminating with failure");
                    self.completion = Some(Completion::Failure(factory()));
                }
            }
            return;
        }
        self.values.push_back(value);
    }

    /// Records the terminal completion. The first one wins.
    pub fn push_completion(&mut self, completion: Completion<E>) {
        if self.completion.is_none() {
            self.completion = Some(completion);
        }
    }

    /// Pops the next pending event: values in arrival order, then the
    /// completion, then `None`.
    pub fn pop(&mut self) -> Option<Event<V, E>> {
        if let Some(value) = self.values.pop_front() {
            return Some(Event::Value(value));
        }
        self.completion.take().map(Event::Complete)
    }
}

impl<V: Clone, E: Clone> Clone for Buffer<V, E> {
    fn clone(&self) -> Self {
        Self {
            values: self.values.clone(),
            completion: self.completion.clone(),
            limit: self.limit,
            policy: self.policy.clone(),
        }
    }
}

impl<V: fmt::Debug, E: fmt::Debug> fmt::Debug for Buffer<V, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Buffer")
            .field("values", &self.values)
            .field("completion", &self.completion)
            .field("limit", &self.limit)
            .field("policy", &self.policy)
            .finish()
    }
}

// ===========================================================================
// Tests
// ===========================================================================
