//! Concurrency controller for coresync.
//!
//! Every operation that touches a core's remote or local state (a pull, a
//! push, a delete sweep) first takes that core's lease from the
//! [`ConcurrencyController`]. At most one lease of any kind exists per core
//! at a time; cores never contend with each other.
//!
//! The controller also tracks the newest remote generation it has heard of
//! per core, which lets it report a pull as [`ReleaseOutcome::Degraded`]
//! when the remote advanced while the pull was running.

mod controller;
mod lease;

pub use controller::ConcurrencyController;
pub use lease::{Lease, LeaseGrant, LeaseInfo, LeaseKind, ReleaseOutcome};
