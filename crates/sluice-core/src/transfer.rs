//! Execution-context transfer stage.
//!
//! [`ReceiveOn`] re-homes deliveries onto a [`Scheduler`]'s context. Two
//! dispatch modes:
//!
//! - [`TransferMode::Deferred`] schedules every value and completion
//!   asynchronously; the sending thread never blocks waiting for the target
//!   context to run it.
//! - [`TransferMode::Immediate`] executes synchronously when the calling
//!   context already *is* the target context, skipping a redundant
//!   scheduling round-trip; otherwise it behaves exactly like `Deferred`.
//!
//! Because deliveries are asynchronous, downstream demand grants cannot flow
//! back to the producer synchronously; the stage requests unbounded demand
//! upstream on attach and lets the scheduler's queue absorb the difference.

use std::sync::Arc;

use crate::demand::Demand;
use crate::event::Completion;
use crate::protocol::{Publisher, Subscriber, Subscription};
use crate::scheduler::Scheduler;
use crate::subscription::{SerializedSubscription, StageCore, SubscriptionBehavior};

// ---------------------------------------------------------------------------
// TransferMode
// ---------------------------------------------------------------------------

/// Dispatch discipline for a [`ReceiveOn`] stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferMode {
    /// Always hand off to the scheduler, even from its own context.
    Deferred,
    /// Run synchronously when already on the target context.
    Immediate,
}

// ---------------------------------------------------------------------------
// TransferBehavior
// ---------------------------------------------------------------------------

struct TransferBehavior<V, E, S>
where
    V: Send + 'static,
    E: Send + 'static,
    S: Scheduler,
{
    core: StageCore<V, E>,
    scheduler: Arc<S>,
    mode: TransferMode,
    done: bool,
}

impl<V, E, S> TransferBehavior<V, E, S>
where
    V: Send + 'static,
    E: Send + 'static,
    S: Scheduler,
{
    fn on_target_context(&self) -> bool {
        self.mode == TransferMode::Immediate
            && self.scheduler.current_context() == self.scheduler.context()
    }
}

impl<V, E, S> SubscriptionBehavior for TransferBehavior<V, E, S>
where
    V: Send + 'static,
    E: Send + 'static,
    S: Scheduler,
{
    type Input = V;
    type Failure = E;

    fn request(&mut self, demand: Demand) {
        self.core.request(demand);
    }

    fn receive(&mut self, value: V) -> Demand {
        if self.on_target_context() {
            return self.core.deliver(value);
        }
        let downstream = self.core.downstream();
        self.scheduler.schedule_now(Box::new(move || {
            let _ = downstream.receive(value);
        }));
        Demand::NONE
    }

    fn receive_completion(&mut self, completion: Completion<E>) {
        if self.on_target_context() {
            self.core.complete(completion);
        } else {
            let downstream = self.core.downstream();
            tracing::trace!("handing completion to scheduler context");
            self.scheduler.schedule_now(Box::new(move || {
                downstream.receive_completion(completion);
            }));
        }
        self.done = true;
    }

    fn cancel(&mut self) {
        self.core.cancel_upstream();
    }

    fn attach(&mut self, upstream: Arc<dyn Subscription>) {
        self.core.attach(upstream);
        // Grants cannot be returned from the scheduled deliveries, so the
        // producer side runs ungated.
        self.core.request(Demand::UNBOUNDED);
    }

    fn announce(&mut self, subscription: Arc<dyn Subscription>) {
        self.core.announce(subscription);
    }

    fn is_complete(&self) -> bool {
        self.done
    }
}

// ---------------------------------------------------------------------------
// ReceiveOn
// ---------------------------------------------------------------------------

/// A publisher delivering its upstream's events on a scheduler's context.
pub struct ReceiveOn<P, S>
where
    P: Publisher,
    S: Scheduler,
{
    upstream: P,
    scheduler: Arc<S>,
    mode: TransferMode,
}

impl<P, S> ReceiveOn<P, S>
where
    P: Publisher,
    S: Scheduler,
{
    /// Deferred transfer: every delivery hops through the scheduler.
    #[must_use]
    pub fn new(upstream: P, scheduler: Arc<S>) -> Self {
        Self {
            upstream,
            scheduler,
            mode: TransferMode::Deferred,
        }
    }

    /// Immediate transfer: synchronous on the target context, deferred
    /// everywhere else.
    #[must_use]
    pub fn immediate(upstream: P, scheduler: Arc<S>) -> Self {
        Self {
            upstream,
            scheduler,
            mode: TransferMode::Immediate,
        }
    }

    /// The dispatch mode in use.
    #[must_use]
    pub fn mode(&self) -> TransferMode {
        self.mode
    }
}

impl<P, S> Publisher for ReceiveOn<P, S>
where
    P: Publisher,
    S: Scheduler,
{
    type Output = P::Output;
    type Failure = P::Failure;

    fn subscribe<Sub>(&self, subscriber: Sub)
    where
        Sub: Subscriber<Input = P::Output, Failure = P::Failure> + 'static,
    {
        let downstream: Arc<dyn Subscriber<Input = P::Output, Failure = P::Failure>> =
            Arc::new(subscriber);
        let behavior = TransferBehavior {
            core: StageCore::new(downstream),
            scheduler: Arc::clone(&self.scheduler),
            mode: self.mode,
            done: false,
        };
        let subscription = SerializedSubscription::new(behavior);
        self.upstream.subscribe(subscription);
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::convert::Infallible;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::mpsc;
    use std::thread::{self, JoinHandle};
    use std::time::{Duration, Instant};

    use parking_lot::Mutex;

    use crate::cell::MutexCell;
    use crate::event::Event;
    use crate::scheduler::{Action, ContextId, ScheduleHandle};
    use crate::sink::Sink;
    use crate::subject::Subject;

    // --- Single-worker-thread scheduler (host collaborator stand-in) ---

    static NEXT_CONTEXT: AtomicU64 = AtomicU64::new(1);

    thread_local! {
        static CURRENT_CONTEXT: std::cell::Cell<u64> = const { std::cell::Cell::new(0) };
    }

    enum Job {
        Now(Action),
        After(Duration, ScheduleHandle, Action),
    }

    struct WorkerScheduler {
        id: ContextId,
        queue: Mutex<Option<mpsc::Sender<Job>>>,
        worker: Mutex<Option<JoinHandle<()>>>,
    }

    impl WorkerScheduler {
        fn new() -> Arc<Self> {
            let id = ContextId(NEXT_CONTEXT.fetch_add(1, Ordering::Relaxed));
            let (tx, rx) = mpsc::channel::<Job>();
            let worker = thread::spawn(move || {
                CURRENT_CONTEXT.with(|c| c.set(id.0));
                for job in rx {
                    match job {
                        Job::Now(action) => action(),
                        Job::After(delay, handle, action) => {
                            thread::sleep(delay);
                            if !handle.is_cancelled() {
                                action();
                            }
                        }
                    }
                }
            });
            Arc::new(Self {
                id,
                queue: Mutex::new(Some(tx)),
                worker: Mutex::new(Some(worker)),
            })
        }

        fn shutdown(&self) {
            drop(self.queue.lock().take());
            if let Some(worker) = self.worker.lock().take() {
                worker.join().unwrap();
            }
        }

        fn submit(&self, job: Job) {
            if let Some(queue) = &*self.queue.lock() {
                queue.send(job).unwrap();
            }
        }
    }

    impl Scheduler for WorkerScheduler {
        fn context(&self) -> ContextId {
            self.id
        }

        fn current_context(&self) -> ContextId {
            ContextId(CURRENT_CONTEXT.with(std::cell::Cell::get))
        }

        fn schedule_now(&self, action: Action) {
            self.submit(Job::Now(action));
        }

        fn schedule_after(&self, delay: Duration, action: Action) -> ScheduleHandle {
            let handle = ScheduleHandle::new();
            self.submit(Job::After(delay, handle.clone(), action));
            handle
        }
    }

    type Delivery = (Event<i32, Infallible>, u64);

    /// Sink recording each event together with the context it arrived on,
    /// signalling on completion. The sender sits behind a mutex because sink
    /// callbacks must be `Sync`.
    fn context_sink(
        done: mpsc::Sender<()>,
    ) -> (Sink<i32, Infallible>, Arc<MutexCell<Vec<Delivery>>>) {
        let deliveries: Arc<MutexCell<Vec<Delivery>>> = Arc::new(MutexCell::new(Vec::new()));
        let log = Arc::clone(&deliveries);
        let done = Mutex::new(done);
        let sink = Sink::new(move |event| {
            let ctx = CURRENT_CONTEXT.with(std::cell::Cell::get);
            let complete = event.is_complete();
            log.mutate(|d| d.push((event, ctx)));
            if complete {
                done.lock().send(()).unwrap();
            }
        });
        (sink, deliveries)
    }

    // --- Deferred transfer ---

    #[test]
    fn test_transfer_deferred_delivers_on_scheduler_context() {
        let scheduler = WorkerScheduler::new();
        let subject = Subject::<i32, Infallible>::new();
        let stage = ReceiveOn::new(subject.clone(), Arc::clone(&scheduler));

        let (done_tx, done_rx) = mpsc::channel();
        let (sink, deliveries) = context_sink(done_tx);
        stage.subscribe(sink);

        subject.send_all(1..=3, Some(Completion::Finished));
        done_rx.recv_timeout(Duration::from_secs(5)).unwrap();

        let recorded = deliveries.read();
        let events: Vec<_> = recorded.iter().map(|(e, _)| e.clone()).collect();
        assert_eq!(events, Event::log(1..=3, Some(Completion::Finished)));
        // Every delivery ran on the worker context, not the sending thread.
        assert!(recorded.iter().all(|(_, ctx)| *ctx == scheduler.context().0));

        scheduler.shutdown();
    }

    #[test]
    fn test_transfer_deferred_does_not_block_sender() {
        let scheduler = WorkerScheduler::new();
        let subject = Subject::<i32, Infallible>::new();
        let stage = ReceiveOn::new(subject.clone(), Arc::clone(&scheduler));

        let (done_tx, done_rx) = mpsc::channel();
        let slow_done = Mutex::new(done_tx);
        let sink = Sink::new(move |event: Event<i32, Infallible>| {
            // Simulate a slow consumer on the target context.
            thread::sleep(Duration::from_millis(50));
            if event.is_complete() {
                slow_done.lock().send(()).unwrap();
            }
        });
        stage.subscribe(sink);

        let started = Instant::now();
        subject.send_all(1..=3, Some(Completion::Finished));
        // Four 50ms handler runs are pending; the sender must not have
        // waited for any of them.
        assert!(started.elapsed() < Duration::from_millis(50));

        done_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        scheduler.shutdown();
    }

    // --- Immediate transfer ---

    #[test]
    fn test_transfer_immediate_runs_synchronously_on_target_context() {
        let scheduler = WorkerScheduler::new();
        let subject = Subject::<i32, Infallible>::new();
        let stage = ReceiveOn::immediate(subject.clone(), Arc::clone(&scheduler));

        let (done_tx, done_rx) = mpsc::channel();
        let (sink, deliveries) = context_sink(done_tx);
        stage.subscribe(sink);

        // Drive the sends from the scheduler's own context: the fast path
        // must deliver inline, so by the time this action finishes, every
        // event has been recorded.
        let probe = Arc::clone(&deliveries);
        let driver = subject.clone();
        let (sent_tx, sent_rx) = mpsc::channel();
        scheduler.schedule_now(Box::new(move || {
            driver.send_all(1..=3, Some(Completion::Finished));
            sent_tx.send(probe.read().len()).unwrap();
        }));

        let recorded_during_send = sent_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(recorded_during_send, 4);

        done_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        let recorded = deliveries.read();
        assert!(recorded.iter().all(|(_, ctx)| *ctx == scheduler.context().0));

        scheduler.shutdown();
    }

    #[test]
    fn test_transfer_immediate_defers_off_target_context() {
        let scheduler = WorkerScheduler::new();
        let subject = Subject::<i32, Infallible>::new();
        let stage = ReceiveOn::immediate(subject.clone(), Arc::clone(&scheduler));

        let (done_tx, done_rx) = mpsc::channel();
        let (sink, deliveries) = context_sink(done_tx);
        stage.subscribe(sink);

        // Sent from the test thread, which is not the target context.
        subject.send_all(1..=2, Some(Completion::Finished));
        done_rx.recv_timeout(Duration::from_secs(5)).unwrap();

        let recorded = deliveries.read();
        let events: Vec<_> = recorded.iter().map(|(e, _)| e.clone()).collect();
        assert_eq!(events, Event::log(1..=2, Some(Completion::Finished)));
        assert!(recorded.iter().all(|(_, ctx)| *ctx == scheduler.context().0));

        scheduler.shutdown();
    }

    // --- schedule_after ---

    #[test]
    fn test_scheduler_delayed_action_runs() {
        let scheduler = WorkerScheduler::new();
        let (tx, rx) = mpsc::channel();
        let _handle = scheduler.schedule_after(
            Duration::from_millis(10),
            Box::new(move || tx.send(()).unwrap()),
        );
        rx.recv_timeout(Duration::from_secs(5)).unwrap();
        scheduler.shutdown();
    }

    #[test]
    fn test_scheduler_cancelled_delayed_action_is_skipped() {
        let scheduler = WorkerScheduler::new();
        let (tx, rx) = mpsc::channel();
        let handle = scheduler.schedule_after(
            Duration::from_millis(20),
            Box::new(move || tx.send(()).unwrap()),
        );
        handle.cancel();

        assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());
        scheduler.shutdown();
    }
}
