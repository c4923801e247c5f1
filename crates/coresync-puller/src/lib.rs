//! Background pulling of cores from the object store.
//!
//! This crate provides:
//!
//! - [`PullTracker`]: last pull outcome and failure count per core, and the
//!   backoff derived from it.
//! - [`PullQueue`]: deduplicating work queue of cores needing refresh.
//! - [`CorePuller`]: one pull of one core, under a lease.
//! - [`PullerFeeder`]: the worker loop draining the queue.
//! - [`FeederProcess`]: starts and stops exactly one feeder worker.
//! - [`CoreWatcher`]: turns coordination notifications into pull requests.

pub mod error;
pub mod feeder;
pub mod lifecycle;
pub mod puller;
pub mod queue;
pub mod tracker;
pub mod watcher;

pub use error::{FailureKind, PullError};
pub use feeder::PullerFeeder;
pub use lifecycle::{FeederProcess, FeederState, WorkerInfo};
pub use puller::{CorePuller, PullReport};
pub use queue::PullQueue;
pub use tracker::PullTracker;
pub use watcher::{CoreNotification, CoreWatcher};

#[cfg(test)]
mod tests;
