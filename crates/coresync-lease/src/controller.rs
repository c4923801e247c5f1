//! Keyed lease table with per-core wake-ups and generation tracking.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use coresync_types::events::{EventBus, LeaseRevoked};
use coresync_types::{CoreIdentity, Generation};
use tokio::sync::Notify;
use tokio::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::lease::{Lease, LeaseGrant, LeaseInfo, LeaseKind, ReleaseOutcome};

/// The lease currently outstanding on a core.
struct Held {
    id: u64,
    kind: LeaseKind,
    holder: String,
    acquired_at: Instant,
}

/// Per-core synchronization state.
#[derive(Default)]
struct CoreSlot {
    held: Mutex<Option<Held>>,
    released: Notify,
}

/// Serializes pulls, pushes, and sweeps per core.
///
/// The table lock is only held to look up or prune a core's slot; waiting
/// happens on the slot's own [`Notify`], so contention on one core never
/// delays another.
pub struct ConcurrencyController {
    max_hold: Duration,
    slots: Mutex<HashMap<CoreIdentity, Arc<CoreSlot>>>,
    generations: Mutex<HashMap<CoreIdentity, Generation>>,
    next_id: AtomicU64,
    events: EventBus,
}

impl ConcurrencyController {
    /// Create a controller that revokes leases held longer than `max_hold`.
    pub fn new(max_hold: Duration, events: EventBus) -> Self {
        Self {
            max_hold,
            slots: Mutex::new(HashMap::new()),
            generations: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            events,
        }
    }

    // -----------------------------------------------------------------------
    // Acquisition
    // -----------------------------------------------------------------------

    /// Wait up to `timeout` for an exclusive pull lease on `core`.
    pub async fn acquire_pull_lease(
        &self,
        core: &CoreIdentity,
        holder: &str,
        timeout: Duration,
    ) -> LeaseGrant {
        self.acquire(core, LeaseKind::Pull, holder, timeout).await
    }

    /// Wait up to `timeout` for an exclusive push lease on `core`.
    pub async fn acquire_push_lease(
        &self,
        core: &CoreIdentity,
        holder: &str,
        timeout: Duration,
    ) -> LeaseGrant {
        self.acquire(core, LeaseKind::Push, holder, timeout).await
    }

    /// Wait up to `timeout` for an exclusive lease of any kind on `core`.
    pub async fn acquire(
        &self,
        core: &CoreIdentity,
        kind: LeaseKind,
        holder: &str,
        timeout: Duration,
    ) -> LeaseGrant {
        let deadline = Instant::now() + timeout;
        let slot = self.slot(core);

        loop {
            let notified = slot.released.notified();
            tokio::pin!(notified);
            // Register before inspecting the slot so a release in between
            // is not missed.
            notified.as_mut().enable();

            let (held_by, expires_at) = match self.take_slot(core, &slot, kind, holder) {
                Ok(lease) => return LeaseGrant::Acquired(lease),
                Err(busy) => busy,
            };

            if Instant::now() >= deadline {
                debug!(%core, %kind, %held_by, "lease acquisition timed out");
                return LeaseGrant::TimedOut { held_by };
            }

            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep_until(deadline.min(expires_at)) => {}
            }
        }
    }

    /// Take the lease on `core` only if it is free right now.
    ///
    /// An expired lease is revoked first, as with [`acquire`](Self::acquire).
    pub fn try_acquire(&self, core: &CoreIdentity, kind: LeaseKind, holder: &str) -> Option<Lease> {
        let slot = self.slot(core);
        let lease = self.take_slot(core, &slot, kind, holder).ok();
        if lease.is_none() {
            drop(slot);
            self.prune(core);
        }
        lease
    }

    /// Give a lease back and wake anyone waiting on its core.
    ///
    /// For pull leases, reports [`ReleaseOutcome::Degraded`] when the
    /// controller learned of a generation newer than the holder observed.
    pub fn release(&self, lease: Lease) -> ReleaseOutcome {
        let slot = {
            let slots = self.slots.lock().expect("lock poisoned");
            slots.get(&lease.core).cloned()
        };

        let released = slot.as_ref().is_some_and(|slot| {
            let mut held = slot.held.lock().expect("lock poisoned");
            if held.as_ref().is_some_and(|h| h.id == lease.id) {
                *held = None;
                true
            } else {
                false
            }
        });

        if !released {
            warn!(core = %lease.core, kind = %lease.kind, holder = %lease.holder,
                  "released a lease that had already been revoked");
            return ReleaseOutcome::Revoked;
        }

        if let Some(slot) = slot {
            slot.released.notify_waiters();
        }
        self.prune(&lease.core);

        debug!(core = %lease.core, kind = %lease.kind, held_for = ?lease.acquired_at.elapsed(),
               "lease released");

        if lease.kind != LeaseKind::Pull {
            return ReleaseOutcome::Clean;
        }
        let observed = lease.observed_generation.unwrap_or(Generation::ZERO);
        match self.current_generation(&lease.core) {
            Some(current) if current > observed => ReleaseOutcome::Degraded { observed, current },
            _ => ReleaseOutcome::Clean,
        }
    }

    // -----------------------------------------------------------------------
    // Inspection
    // -----------------------------------------------------------------------

    /// Whether any lease is outstanding on `core`.
    pub fn is_leased(&self, core: &CoreIdentity) -> bool {
        self.lease_info(core).is_some()
    }

    /// The outstanding lease on `core`, if any.
    pub fn lease_info(&self, core: &CoreIdentity) -> Option<LeaseInfo> {
        let slots = self.slots.lock().expect("lock poisoned");
        let slot = slots.get(core)?;
        let held = slot.held.lock().expect("lock poisoned");
        held.as_ref().map(|h| LeaseInfo {
            kind: h.kind,
            holder: h.holder.clone(),
            held_for: h.acquired_at.elapsed(),
        })
    }

    // -----------------------------------------------------------------------
    // Generations
    // -----------------------------------------------------------------------

    /// Record a remote generation of `core`. Returns whether it was newer
    /// than anything seen before.
    pub fn observe_generation(&self, core: &CoreIdentity, generation: Generation) -> bool {
        let mut generations = self.generations.lock().expect("lock poisoned");
        match generations.get_mut(core) {
            Some(current) if *current >= generation => false,
            Some(current) => {
                *current = generation;
                true
            }
            None => {
                generations.insert(core.clone(), generation);
                true
            }
        }
    }

    /// Newest remote generation of `core` the controller knows of.
    pub fn current_generation(&self, core: &CoreIdentity) -> Option<Generation> {
        let generations = self.generations.lock().expect("lock poisoned");
        generations.get(core).copied()
    }

    /// Drop generation tracking for a core that left this node.
    pub fn forget(&self, core: &CoreIdentity) {
        self.generations
            .lock()
            .expect("lock poisoned")
            .remove(core);
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    fn slot(&self, core: &CoreIdentity) -> Arc<CoreSlot> {
        let mut slots = self.slots.lock().expect("lock poisoned");
        slots.entry(core.clone()).or_default().clone()
    }

    /// Grant the lease if the slot is free (revoking an expired holder), or
    /// report who holds it and when their hold expires.
    fn take_slot(
        &self,
        core: &CoreIdentity,
        slot: &CoreSlot,
        kind: LeaseKind,
        holder: &str,
    ) -> Result<Lease, (LeaseKind, Instant)> {
        let mut held = slot.held.lock().expect("lock poisoned");

        if let Some(current) = held.as_ref() {
            let held_for = current.acquired_at.elapsed();
            if held_for < self.max_hold {
                return Err((current.kind, current.acquired_at + self.max_hold));
            }
            warn!(%core, kind = %current.kind, holder = %current.holder, ?held_for,
                  "revoking lease held past maximum duration");
            self.events.emit(LeaseRevoked {
                core: core.clone(),
                holder: current.holder.clone(),
                held_for,
            });
        }

        let lease = Lease {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            core: core.clone(),
            kind,
            holder: holder.to_string(),
            acquired_at: Instant::now(),
            observed_generation: self.current_generation(core),
        };
        *held = Some(Held {
            id: lease.id,
            kind,
            holder: lease.holder.clone(),
            acquired_at: lease.acquired_at,
        });
        debug!(%core, %kind, holder, lease_id = lease.id, "lease acquired");
        Ok(lease)
    }

    /// Remove the slot of `core` if it is free and nobody else references it.
    fn prune(&self, core: &CoreIdentity) {
        let mut slots = self.slots.lock().expect("lock poisoned");
        let idle = slots.get(core).is_some_and(|slot| {
            Arc::strong_count(slot) == 1 && slot.held.lock().expect("lock poisoned").is_none()
        });
        if idle {
            slots.remove(core);
        }
    }

    #[cfg(test)]
    pub(crate) fn slot_count(&self) -> usize {
        self.slots.lock().expect("lock poisoned").len()
    }
}
