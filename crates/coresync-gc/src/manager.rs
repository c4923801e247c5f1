//! Delete candidate bookkeeping and the sweep.

use std::collections::{BTreeSet, HashMap};
use std::future::Future;
use std::sync::{Arc, Mutex};

use coresync_lease::{ConcurrencyController, LeaseKind};
use coresync_store::{BlobStore, DeleteOutcome, StoreError};
use coresync_types::events::{BlobDeleted, EventBus};
use coresync_types::{BlobMetadata, BlobRef, CoreIdentity, Generation, unix_millis};
use tokio::sync::watch;
use tokio::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::error::GcError;

/// A superseded blob waiting for deletion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeleteCandidate {
    /// The blob to delete.
    pub blob: BlobRef,
    /// Last generation that referenced it.
    pub generation: Generation,
    /// When it became a candidate.
    pub discovered_at: Instant,
    /// Same moment as a Unix timestamp in milliseconds, for display.
    pub discovered_at_ms: u64,
}

/// Result of [`DeleteManager::schedule_for_deletion`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleOutcome {
    /// The blob is now a candidate.
    Scheduled,
    /// The blob was already a candidate; its discovery time is unchanged.
    AlreadyScheduled,
    /// No strictly newer generation of the core has been observed.
    NotSuperseded,
    /// The newest known generation still references the blob.
    StillReferenced,
}

/// Counts from one sweep.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepSummary {
    /// Blobs removed from the object store.
    pub deleted: usize,
    /// Candidates whose blob was already gone.
    pub already_gone: usize,
    /// Candidates skipped because their core was leased.
    pub skipped_leased: usize,
    /// Candidates still inside the grace period.
    pub skipped_young: usize,
    /// Candidates dropped because the current generation references them again.
    pub rescued: usize,
    /// Candidates whose deletion failed; retried next sweep.
    pub failed: usize,
    /// Unreferenced blobs found in the store and newly scheduled.
    pub discovered: usize,
}

#[derive(Default)]
struct GcState {
    candidates: HashMap<BlobRef, DeleteCandidate>,
    /// Newest metadata seen per core.
    latest: HashMap<CoreIdentity, BlobMetadata>,
}

/// Tracks superseded blobs and deletes them once safe.
pub struct DeleteManager {
    blobs: Arc<dyn BlobStore>,
    controller: Arc<ConcurrencyController>,
    grace_period: Duration,
    io_timeout: Duration,
    holder: String,
    state: Mutex<GcState>,
    events: EventBus,
}

impl DeleteManager {
    /// Create a delete manager.
    pub fn new(
        blobs: Arc<dyn BlobStore>,
        controller: Arc<ConcurrencyController>,
        grace_period: Duration,
        io_timeout: Duration,
        holder: impl Into<String>,
        events: EventBus,
    ) -> Self {
        Self {
            blobs,
            controller,
            grace_period,
            io_timeout,
            holder: holder.into(),
            state: Mutex::new(GcState::default()),
            events,
        }
    }

    // -----------------------------------------------------------------------
    // Scheduling
    // -----------------------------------------------------------------------

    /// Record the newest metadata of a core.
    ///
    /// Older metadata is ignored. Candidates the new generation references
    /// again stop being candidates.
    pub fn observe_metadata(&self, metadata: &BlobMetadata) {
        let mut state = self.state.lock().expect("lock poisoned");
        observe_locked(&mut state, metadata);
    }

    /// `new` replaced `old`: blobs of `old` that `new` does not reference
    /// become candidates. Returns how many were scheduled.
    pub fn on_superseded(&self, old: &BlobMetadata, new: &BlobMetadata) -> usize {
        if old.core != new.core || new.generation <= old.generation {
            warn!(old_core = %old.core, new_core = %new.core, old = %old.generation,
                  new = %new.generation, "ignoring supersession that is not a strict advance");
            return 0;
        }

        let mut state = self.state.lock().expect("lock poisoned");
        observe_locked(&mut state, new);

        let mut scheduled = 0;
        for blob in old.blob_refs() {
            if schedule_locked(&mut state, blob, old.generation) == ScheduleOutcome::Scheduled {
                scheduled += 1;
            }
        }
        debug!(core = %new.core, from = %old.generation, to = %new.generation, scheduled,
               "generation superseded");
        scheduled
    }

    /// Mark a blob of `generation` for deletion.
    ///
    /// Accepted only if a strictly newer generation of the same core has
    /// been observed and that generation does not reference the blob.
    pub fn schedule_for_deletion(&self, blob: BlobRef, generation: Generation) -> ScheduleOutcome {
        let mut state = self.state.lock().expect("lock poisoned");
        schedule_locked(&mut state, blob, generation)
    }

    /// Current candidates, ordered by blob.
    pub fn candidates(&self) -> Vec<DeleteCandidate> {
        let state = self.state.lock().expect("lock poisoned");
        let mut all: Vec<_> = state.candidates.values().cloned().collect();
        all.sort_by(|a, b| a.blob.cmp(&b.blob));
        all
    }

    /// Number of current candidates.
    pub fn pending(&self) -> usize {
        self.state.lock().expect("lock poisoned").candidates.len()
    }

    // -----------------------------------------------------------------------
    // Sweeping
    // -----------------------------------------------------------------------

    /// Delete every candidate that is safe to delete now.
    ///
    /// Visits every core with candidates or observed metadata. Cores with an
    /// outstanding lease are skipped entirely. Failures are counted and left
    /// for the next sweep.
    pub async fn sweep(&self) -> SweepSummary {
        let cores: BTreeSet<CoreIdentity> = {
            let state = self.state.lock().expect("lock poisoned");
            state
                .latest
                .keys()
                .cloned()
                .chain(state.candidates.keys().map(|blob| blob.core.clone()))
                .collect()
        };

        let mut summary = SweepSummary::default();
        for core in cores {
            let Some(lease) = self
                .controller
                .try_acquire(&core, LeaseKind::Sweep, &self.holder)
            else {
                let pending = self.pending_for(&core).len();
                debug!(%core, candidates = pending, "core leased, skipping sweep");
                summary.skipped_leased += pending;
                continue;
            };

            if let Err(e) = self.sweep_core(&core, &mut summary).await {
                warn!(%core, error = %e, "sweep of core failed, will retry");
                summary.failed += self.pending_for(&core).len();
            }
            self.controller.release(lease);
        }

        if summary != SweepSummary::default() {
            info!(
                deleted = summary.deleted,
                already_gone = summary.already_gone,
                skipped_leased = summary.skipped_leased,
                skipped_young = summary.skipped_young,
                rescued = summary.rescued,
                failed = summary.failed,
                discovered = summary.discovered,
                "delete sweep finished"
            );
        }
        summary
    }

    /// Sweep every `interval` until `shutdown` is signalled.
    pub async fn run(self: Arc<Self>, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        info!(?interval, "delete manager started");
        let mut tick = tokio::time::interval(interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = tick.tick() => {
                    self.sweep().await;
                }
                _ = shutdown.changed() => break,
            }
        }
        info!("delete manager stopped");
    }

    /// Sweep the candidates of one core while holding its sweep lease.
    ///
    /// Blobs found unreferenced in the store join the candidates and start
    /// their grace period; they are not deleted in the same sweep.
    async fn sweep_core(
        &self,
        core: &CoreIdentity,
        summary: &mut SweepSummary,
    ) -> Result<(), GcError> {
        let candidates = self.pending_for(core);

        // Re-read the authoritative metadata: another node may have pushed a
        // generation that references a candidate again.
        if let Some(remote) = self
            .timed(core, "list_metadata", self.blobs.list_metadata(core))
            .await?
        {
            if remote.core != *core {
                return Err(GcError::MisfiledMetadata {
                    core: core.clone(),
                    found: remote.core,
                });
            }
            self.observe_metadata(&remote);
            summary.discovered += self.discover_orphans(&remote).await?;
        }

        let now = Instant::now();
        for candidate in candidates {
            if self.is_referenced(&candidate.blob) {
                summary.rescued += 1;
                self.forget(&candidate.blob);
                continue;
            }
            if now.duration_since(candidate.discovered_at) < self.grace_period {
                summary.skipped_young += 1;
                continue;
            }

            match self
                .timed(core, "delete", self.blobs.delete(&candidate.blob))
                .await
            {
                Ok(DeleteOutcome::Deleted) => {
                    debug!(blob = %candidate.blob, generation = %candidate.generation, "blob deleted");
                    self.forget(&candidate.blob);
                    summary.deleted += 1;
                    self.events.emit(BlobDeleted {
                        blob: candidate.blob,
                        generation: candidate.generation,
                    });
                }
                Ok(DeleteOutcome::NotFound) => {
                    self.forget(&candidate.blob);
                    summary.already_gone += 1;
                }
                Err(e) => {
                    warn!(blob = %candidate.blob, error = %e, "blob deletion failed");
                    summary.failed += 1;
                }
            }
        }
        Ok(())
    }

    /// Schedule every stored blob of the core that `current` does not
    /// reference, whichever node's push left it behind.
    async fn discover_orphans(&self, current: &BlobMetadata) -> Result<usize, GcError> {
        let core = &current.core;
        let stored = self
            .timed(core, "list_blobs", self.blobs.list_blobs(core))
            .await?;
        let superseded = Generation(current.generation.0.saturating_sub(1));

        let mut state = self.state.lock().expect("lock poisoned");
        let mut found = 0;
        for hash in stored {
            if current.references(&hash) {
                continue;
            }
            let blob = BlobRef::new(core.clone(), hash);
            if schedule_locked(&mut state, blob, superseded) == ScheduleOutcome::Scheduled {
                found += 1;
            }
        }
        if found > 0 {
            debug!(%core, generation = %current.generation, found, "unreferenced blobs scheduled");
        }
        Ok(found)
    }

    fn pending_for(&self, core: &CoreIdentity) -> Vec<DeleteCandidate> {
        let state = self.state.lock().expect("lock poisoned");
        state
            .candidates
            .values()
            .filter(|c| c.blob.core == *core)
            .cloned()
            .collect()
    }

    fn is_referenced(&self, blob: &BlobRef) -> bool {
        let state = self.state.lock().expect("lock poisoned");
        state
            .latest
            .get(&blob.core)
            .is_some_and(|md| md.references(&blob.hash))
    }

    fn forget(&self, blob: &BlobRef) {
        self.state
            .lock()
            .expect("lock poisoned")
            .candidates
            .remove(blob);
    }

    async fn timed<T>(
        &self,
        core: &CoreIdentity,
        operation: &'static str,
        call: impl Future<Output = Result<T, StoreError>>,
    ) -> Result<T, GcError> {
        match tokio::time::timeout(self.io_timeout, call).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(GcError::Timeout {
                core: core.clone(),
                operation,
                timeout: self.io_timeout,
            }),
        }
    }
}

fn observe_locked(state: &mut GcState, metadata: &BlobMetadata) {
    let newer = state
        .latest
        .get(&metadata.core)
        .is_none_or(|current| metadata.generation > current.generation);
    if !newer {
        return;
    }
    state
        .latest
        .insert(metadata.core.clone(), metadata.clone());

    let before = state.candidates.len();
    state
        .candidates
        .retain(|blob, _| blob.core != metadata.core || !metadata.references(&blob.hash));
    let rescued = before - state.candidates.len();
    if rescued > 0 {
        debug!(core = %metadata.core, generation = %metadata.generation, rescued,
               "candidates referenced again by newer generation");
    }
}

fn schedule_locked(state: &mut GcState, blob: BlobRef, generation: Generation) -> ScheduleOutcome {
    let Some(latest) = state.latest.get(&blob.core) else {
        return ScheduleOutcome::NotSuperseded;
    };
    if latest.generation <= generation {
        return ScheduleOutcome::NotSuperseded;
    }
    if latest.references(&blob.hash) {
        return ScheduleOutcome::StillReferenced;
    }
    if state.candidates.contains_key(&blob) {
        return ScheduleOutcome::AlreadyScheduled;
    }
    state.candidates.insert(
        blob.clone(),
        DeleteCandidate {
            blob,
            generation,
            discovered_at: Instant::now(),
            discovered_at_ms: unix_millis(),
        },
    );
    ScheduleOutcome::Scheduled
}
