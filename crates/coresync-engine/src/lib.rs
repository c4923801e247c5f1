//! Composition root of coresync.
//!
//! The [`StoreManager`] owns the stores of one node and lazily builds every
//! sync subsystem on first use: the lease table, pull tracker, work queue,
//! feeder and its lifecycle, delete manager, pusher, and watcher. It also
//! exposes the caller-facing operations (enqueue a pull, take a lease,
//! push, start and stop the worker, report status).

pub mod error;
pub mod manager;
pub mod pusher;

pub use error::EngineError;
pub use manager::{CoreStatus, StoreManager};
pub use pusher::{CorePusher, PushOutcome};

pub use coresync_lease::{Lease, LeaseGrant, LeaseKind, ReleaseOutcome};
pub use coresync_puller::{CoreNotification, FeederState, WorkerInfo};

#[cfg(test)]
mod tests;
