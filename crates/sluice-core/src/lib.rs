//! # Sluice Core
//!
//! A demand-driven reactive-stream engine: a small set of primitives
//! implementing a backpressured publish/subscribe protocol, in-process only.
//!
//! This crate provides:
//! - **Subjects**: hot multicast fan-out ([`Subject`]) and bounded replay
//!   with an overflow policy ([`BufferedSubject`])
//! - **Stages**: stateful fold ([`Scan`]) and execution-context transfer
//!   ([`ReceiveOn`])
//! - **Fan-in**: open-ended source aggregation ([`MergeInput`])
//! - **Sinks**: terminal consumers with unlimited ([`Sink`]) or externally
//!   controlled ([`DemandSink`]) demand
//!
//! ## Design Principles
//!
//! 1. **Demand is conserved** — a subscription never receives more values
//!    than it has requested; the [`Demand`] arithmetic makes over-delivery a
//!    programming error, not a runtime condition
//! 2. **Every subscription is serialized** — one logical writer advances a
//!    subscription's state at a time, with same-call-chain re-entry queued
//!    instead of deadlocked
//! 3. **Terminal states are final** — completion and cancellation race to a
//!    single winner; the loser is a silent no-op
//! 4. **No event loop** — the engine blocks only on its own mutexes; deferred
//!    execution is delegated to a host [`Scheduler`]
//!
//! ## Example
//!
//! ```rust,ignore
//! use sluice_core::{Completion, Scan, Sink, Subject};
//!
//! let subject = Subject::<i32, std::convert::Infallible>::new();
//! let totals = Scan::new(subject.clone(), 0, |sum, next| sum + next);
//! totals.subscribe(Sink::new(|event| println!("{event:?}")));
//!
//! subject.send_all(1..=4, Some(Completion::Finished));
//! ```

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod buffer;
pub mod buffered;
pub mod cell;
pub mod demand;
pub mod event;
pub mod merge;
pub mod protocol;
pub mod scan;
pub mod scheduler;
pub mod sink;
pub mod subject;
pub mod subscription;
pub mod transfer;

pub use buffer::{Buffer, OverflowError, OverflowPolicy};
pub use buffered::BufferedSubject;
pub use cell::MutexCell;
pub use demand::Demand;
pub use event::{Completion, Event};
pub use merge::MergeInput;
pub use protocol::{Publisher, Subscriber, Subscription};
pub use scan::Scan;
pub use scheduler::{Action, ContextId, ScheduleHandle, Scheduler};
pub use sink::{DemandSink, Sink};
pub use subject::Subject;
pub use subscription::{
    SerializedSubscription, StageCore, SubscriptionBehavior, SubscriptionId, SubscriptionState,
};
pub use transfer::{ReceiveOn, TransferMode};
