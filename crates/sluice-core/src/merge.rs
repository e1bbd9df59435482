//! Fan-in aggregation point.
//!
//! A [`MergeInput`] funnels emissions from an arbitrary number of upstream
//! sources into one output stream. Each attached source gets its own internal
//! sink; when a source completes, its tracking entry is dropped — sources
//! come and go without terminating the merge, which never completes on its
//! own. An external caller may also [`send`](MergeInput::send) directly into
//! the merge alongside its sources.
//!
//! Dropping the last handle to a merge cancels every tracked source
//! subscription, so attached upstreams are never leaked.

use std::convert::Infallible;
use std::sync::{Arc, Weak};

use fxhash::FxHashMap;

use crate::cell::MutexCell;
use crate::protocol::{Publisher, Subscriber};
use crate::sink::Sink;
use crate::subject::Subject;
use crate::subscription::SubscriptionId;

// ---------------------------------------------------------------------------
// MergeInput
// ---------------------------------------------------------------------------

struct MergeInner<V>
where
    V: Clone + Send + 'static,
{
    output: Subject<V, Infallible>,
    /// One internal sink per tracked source, keyed so a source's completion
    /// handler can delete its own entry.
    sources: MutexCell<FxHashMap<SubscriptionId, Sink<V, Infallible>>>,
}

impl<V> MergeInner<V>
where
    V: Clone + Send + 'static,
{
    fn teardown(&self) {
        let sinks: Vec<_> = self
            .sources
            .mutate(|sources| sources.drain().map(|(_, sink)| sink).collect());
        if !sinks.is_empty() {
            tracing::debug!(count = sinks.len(), "merge cancelling tracked sources");
        }
        for sink in sinks {
            sink.cancel();
        }
    }
}

impl<V> Drop for MergeInner<V>
where
    V: Clone + Send + 'static,
{
    fn drop(&mut self) {
        self.teardown();
    }
}

/// Aggregates any number of failure-free sources into one output stream.
///
/// Cheaply cloneable; clones share the same output and source tracking.
pub struct MergeInput<V>
where
    V: Clone + Send + 'static,
{
    inner: Arc<MergeInner<V>>,
}

impl<V> Clone for MergeInput<V>
where
    V: Clone + Send + 'static,
{
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<V> Default for MergeInput<V>
where
    V: Clone + Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<V> MergeInput<V>
where
    V: Clone + Send + 'static,
{
    /// Creates an empty merge.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MergeInner {
                output: Subject::new(),
                sources: MutexCell::new(FxHashMap::default()),
            }),
        }
    }

    /// Attaches `publisher` as a merged source.
    ///
    /// Every value it emits is forwarded to the output; on its completion the
    /// tracking entry is removed and the merge keeps running.
    pub fn subscribe_to<P>(&self, publisher: &P)
    where
        P: Publisher<Output = V, Failure = Infallible>,
    {
        let key = SubscriptionId::next();
        let output = self.inner.output.clone();
        let tracker: Weak<MergeInner<V>> = Arc::downgrade(&self.inner);

        let sink = Sink::with_handlers(
            move |value| output.send(value),
            move |_completion| {
                if let Some(inner) = tracker.upgrade() {
                    inner.sources.mutate(|sources| {
                        sources.remove(&key);
                    });
                }
            },
        );

        self.inner
            .sources
            .mutate(|sources| sources.insert(key, sink.clone()));
        publisher.subscribe(sink);
    }

    /// Sends `value` directly into the merged output.
    pub fn send(&self, value: V) {
        self.inner.output.send(value);
    }

    /// Cancels every currently tracked source subscription and clears the
    /// tracking table. The merge output itself stays usable.
    pub fn cancel(&self) {
        self.inner.teardown();
    }

    /// Number of sources currently tracked.
    #[must_use]
    pub fn source_count(&self) -> usize {
        self.inner.sources.mutate(|sources| sources.len())
    }
}

impl<V> Publisher for MergeInput<V>
where
    V: Clone + Send + 'static,
{
    type Output = V;
    type Failure = Infallible;

    fn subscribe<S>(&self, subscriber: S)
    where
        S: Subscriber<Input = V, Failure = Infallible> + 'static,
    {
        self.inner.output.subscribe(subscriber);
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use crate::event::{Completion, Event};
    use crate::sink::Sink;

    type Events = Arc<MutexCell<Vec<Event<i32, Infallible>>>>;

    fn recording_sink() -> (Sink<i32, Infallible>, Events) {
        let events: Events = Arc::new(MutexCell::new(Vec::new()));
        let log = Arc::clone(&events);
        let sink = Sink::new(move |event| log.mutate(|e| e.push(event)));
        (sink, events)
    }

    #[test]
    fn test_merge_interleaves_sources_in_send_order() {
        let subject_a = Subject::<i32, Infallible>::new();
        let subject_b = Subject::<i32, Infallible>::new();
        let merge = MergeInput::new();
        merge.subscribe_to(&subject_a);
        merge.subscribe_to(&subject_b);

        let (sink, events) = recording_sink();
        merge.subscribe(sink);

        subject_a.send_all(1..=2, Some(Completion::Finished));
        subject_b.send_all(3..=4, Some(Completion::Finished));

        // Source completions never complete the merge.
        assert_eq!(events.read(), Event::log(1..=4, None));
    }

    #[test]
    fn test_merge_source_completion_drops_tracking() {
        let subject_a = Subject::<i32, Infallible>::new();
        let subject_b = Subject::<i32, Infallible>::new();
        let merge = MergeInput::<i32>::new();
        merge.subscribe_to(&subject_a);
        merge.subscribe_to(&subject_b);
        assert_eq!(merge.source_count(), 2);

        subject_a.send_completion(Completion::Finished);
        assert_eq!(merge.source_count(), 1);

        subject_b.send_completion(Completion::Finished);
        assert_eq!(merge.source_count(), 0);
    }

    #[test]
    fn test_merge_direct_send_alongside_sources() {
        let subject = Subject::<i32, Infallible>::new();
        let merge = MergeInput::new();
        merge.subscribe_to(&subject);

        let (sink, events) = recording_sink();
        merge.subscribe(sink);

        subject.send(1);
        merge.send(2);
        subject.send(3);

        assert_eq!(events.read(), Event::log(1..=3, None));
    }

    #[test]
    fn test_merge_cancel_tears_down_sources() {
        let subject = Subject::<i32, Infallible>::new();
        let merge = MergeInput::new();
        merge.subscribe_to(&subject);

        let (sink, events) = recording_sink();
        merge.subscribe(sink);

        subject.send(1);
        merge.cancel();
        assert_eq!(merge.source_count(), 0);
        assert_eq!(subject.subscriber_count(), 0);

        subject.send(2);
        assert_eq!(events.read(), Event::log([1], None));

        // Idempotent.
        merge.cancel();
    }

    #[test]
    fn test_merge_drop_cancels_sources() {
        let subject = Subject::<i32, Infallible>::new();
        {
            let merge = MergeInput::new();
            merge.subscribe_to(&subject);
            assert_eq!(subject.subscriber_count(), 1);
        }
        // The merge owner is gone; its source subscription must be too.
        assert_eq!(subject.subscriber_count(), 0);
    }

    #[test]
    fn test_merge_output_still_usable_after_cancel() {
        let merge = MergeInput::new();
        let (sink, events) = recording_sink();
        merge.subscribe(sink);

        merge.cancel();
        merge.send(7);

        assert_eq!(events.read(), Event::log([7], None));
    }
}
