//! Reclaims object store space taken by superseded segment blobs.
//!
//! A blob becomes a [`DeleteCandidate`] only once a strictly newer
//! generation of its core stops referencing it. [`DeleteManager::sweep`]
//! removes candidates that have aged past the grace period, taking a sweep
//! lease per core so nothing is deleted while a pull or push is running.

mod error;
mod manager;

pub use error::GcError;
pub use manager::{DeleteCandidate, DeleteManager, ScheduleOutcome, SweepSummary};
