//! Background threads and cooperative cancellation.
//!
//! # Responsibility
//! - Provide the cancellation token, debouncer and bounded worker queue used
//!   by reconciliation scheduling and tag propagation.
//! - Poll projections on an interval.
//! - Wire everything behind [`CoreRuntime`].
//!
//! # Invariants
//! - Workers check cancellation between batches, never mid-transaction.
//! - `shutdown` joins every thread it started.

mod cancel;
mod core;
mod debounce;
mod poller;
mod worker;

pub use self::core::{CoreRuntime, RuntimeError};
pub use cancel::CancellationToken;
pub use debounce::Debouncer;
pub use poller::ProjectionPoller;
pub use worker::{BackgroundWorker, WorkerError};
