//! Lease tokens and the results of acquiring and releasing them.

use std::fmt;

use coresync_types::{CoreIdentity, Generation};
use tokio::time::{Duration, Instant};

/// What a lease holder intends to do with the core.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LeaseKind {
    /// Download a newer generation into the local core.
    Pull,
    /// Upload a new generation to the object store.
    Push,
    /// Delete superseded blobs of the core.
    Sweep,
}

impl fmt::Display for LeaseKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LeaseKind::Pull => "pull",
            LeaseKind::Push => "push",
            LeaseKind::Sweep => "sweep",
        };
        f.write_str(name)
    }
}

/// Exclusive right to operate on one core.
///
/// Deliberately neither `Clone` nor `Copy`: the holder gives it back by
/// value through [`ConcurrencyController::release`](crate::ConcurrencyController::release).
/// A lease that is dropped without release stays held until it exceeds the
/// controller's maximum hold duration, at which point it is revoked.
#[derive(Debug)]
pub struct Lease {
    pub(crate) id: u64,
    pub(crate) core: CoreIdentity,
    pub(crate) kind: LeaseKind,
    pub(crate) holder: String,
    pub(crate) acquired_at: Instant,
    pub(crate) observed_generation: Option<Generation>,
}

impl Lease {
    /// Unique id of this grant.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// The leased core.
    pub fn core(&self) -> &CoreIdentity {
        &self.core
    }

    /// Kind of operation the lease was granted for.
    pub fn kind(&self) -> LeaseKind {
        self.kind
    }

    /// Holder token given at acquisition.
    pub fn holder(&self) -> &str {
        &self.holder
    }

    /// When the lease was granted.
    pub fn acquired_at(&self) -> Instant {
        self.acquired_at
    }

    /// Newest remote generation this holder has seen.
    pub fn observed_generation(&self) -> Option<Generation> {
        self.observed_generation
    }

    /// Record a remote generation seen by the holder.
    ///
    /// Only ever moves forward.
    pub fn observe(&mut self, generation: Generation) {
        self.observed_generation = Some(match self.observed_generation {
            Some(current) => current.max(generation),
            None => generation,
        });
    }
}

/// Result of waiting for a lease.
#[derive(Debug)]
pub enum LeaseGrant {
    /// The lease is yours.
    Acquired(Lease),
    /// Another holder kept the core for the whole wait.
    TimedOut {
        /// Kind of the lease that was in the way.
        held_by: LeaseKind,
    },
}

/// Result of giving a lease back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseOutcome {
    /// Released, and nothing happened underneath the holder.
    Clean,
    /// Released, but the remote generation advanced past what a pull saw.
    Degraded {
        /// Newest generation the pull observed.
        observed: Generation,
        /// Newest generation the controller knows of.
        current: Generation,
    },
    /// The lease had already been revoked for exceeding the maximum hold.
    Revoked,
}

/// Snapshot of a core's current lease, for status reporting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaseInfo {
    /// Kind of the outstanding lease.
    pub kind: LeaseKind,
    /// Holder token.
    pub holder: String,
    /// How long it has been held.
    pub held_for: Duration,
}
