//! The background worker that drains the pull queue.
//!
//! Each iteration goes: dequeue, take the core's pull lease, pull, release
//! the lease, record the outcome. A contended lease or a generation that
//! moved during the pull puts the item back without counting a failure;
//! real failures back off exponentially until the retry bound, after which
//! the core is marked permanently failed and announced on the event bus.

use std::sync::Arc;

use coresync_lease::{ConcurrencyController, LeaseGrant, ReleaseOutcome};
use coresync_types::events::{EventBus, PullAbandoned, PullDeferred, PullFailed, PullSucceeded};
use coresync_types::{
    CoreIdentity, DeferReason, Generation, PullOutcome, SyncConfig, WorkItem,
};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::error::{FailureKind, PullError};
use crate::puller::{CorePuller, PullReport};
use crate::queue::PullQueue;
use crate::tracker::PullTracker;

/// Drains the [`PullQueue`] one item at a time.
pub struct PullerFeeder {
    config: SyncConfig,
    queue: Arc<PullQueue>,
    controller: Arc<ConcurrencyController>,
    tracker: Arc<PullTracker>,
    puller: Arc<CorePuller>,
    events: EventBus,
}

impl PullerFeeder {
    /// Create a feeder over shared handles.
    pub fn new(
        config: SyncConfig,
        queue: Arc<PullQueue>,
        controller: Arc<ConcurrencyController>,
        tracker: Arc<PullTracker>,
        puller: Arc<CorePuller>,
        events: EventBus,
    ) -> Self {
        Self {
            config,
            queue,
            controller,
            tracker,
            puller,
            events,
        }
    }

    /// Request a pull of `core` up to at least `generation`.
    ///
    /// The generation is also reported to the lease table, so a pull of the
    /// same core already in flight is flagged as stale when it releases.
    pub fn enqueue(&self, core: &CoreIdentity, generation: Generation) -> bool {
        if generation > Generation::ZERO {
            self.controller.observe_generation(core, generation);
        }
        self.queue.enqueue(core, generation)
    }

    /// The queue this feeder drains.
    pub fn queue(&self) -> &Arc<PullQueue> {
        &self.queue
    }

    /// Run until `shutdown` is signalled.
    ///
    /// The current item always runs to completion; the signal is only
    /// checked between items.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!(holder = %self.config.holder, "puller feeder started");
        while let Some(item) = self.queue.dequeue(&mut shutdown).await {
            self.process(item).await;
        }
        info!("puller feeder stopped");
    }

    /// Handle one work item and return the recorded outcome.
    pub async fn process(&self, item: WorkItem) -> PullOutcome {
        let core = item.core.clone();

        if self.tracker.is_permanently_failed(&core) {
            debug!(%core, "skipping permanently failed core");
            return self
                .tracker
                .status(&core)
                .map_or(PullOutcome::InProgress, |r| r.outcome);
        }

        let mut lease = match self
            .controller
            .acquire_pull_lease(&core, &self.config.holder, self.config.lease_timeout)
            .await
        {
            LeaseGrant::Acquired(lease) => lease,
            LeaseGrant::TimedOut { held_by } => {
                debug!(%core, %held_by, "pull lease contended, deferring");
                self.queue.requeue_after(item, self.config.backoff_base);
                return self.defer(&core, DeferReason::LeaseContended);
            }
        };

        self.tracker.record_attempt(&core, item.requested_generation);
        let result = self.puller.pull(&mut lease).await;
        let release = self.controller.release(lease);

        match result {
            Ok(report) => self.on_pulled(item, report, release),
            Err(e) => self.on_failed(item, e),
        }
    }

    fn on_pulled(&self, item: WorkItem, report: PullReport, release: ReleaseOutcome) -> PullOutcome {
        let core = item.core.clone();
        match release {
            ReleaseOutcome::Clean => {
                info!(%core, generation = %report.generation(), fetched_files = report.fetched_files(),
                      "pull succeeded");
                self.tracker.record_outcome(&core, PullOutcome::Succeeded);
                self.events.emit(PullSucceeded {
                    core,
                    generation: report.generation(),
                    fetched_files: report.fetched_files(),
                });
                PullOutcome::Succeeded
            }
            ReleaseOutcome::Degraded { observed, current } => {
                info!(%core, %observed, %current, "remote advanced during pull, re-enqueueing");
                self.queue
                    .enqueue(&core, item.requested_generation.max(current));
                self.defer(&core, DeferReason::StaleGeneration)
            }
            ReleaseOutcome::Revoked => {
                warn!(%core, "pull outlived its lease, re-enqueueing");
                self.queue.enqueue(&core, item.requested_generation);
                self.defer(&core, DeferReason::StaleGeneration)
            }
        }
    }

    fn on_failed(&self, item: WorkItem, e: PullError) -> PullOutcome {
        let core = item.core.clone();
        let reason = e.to_string();
        let record = self.tracker.record_outcome(
            &core,
            PullOutcome::Failed {
                reason: reason.clone(),
            },
        );
        let attempts = record.consecutive_failures;

        if e.kind() == FailureKind::Fatal || attempts >= self.config.max_pull_attempts {
            error!(%core, attempts, error = %e, "giving up on core, operator attention required");
            self.tracker.mark_permanent(&core, reason.clone());
            self.events.emit(PullAbandoned {
                core,
                attempts,
                reason: reason.clone(),
            });
            return PullOutcome::PermanentlyFailed { reason };
        }

        let retry_in = self.tracker.backoff(attempts);
        warn!(%core, attempts, ?retry_in, kind = ?e.kind(), error = %e, "pull failed, will retry");
        self.queue.requeue_after(item, retry_in);
        self.events.emit(PullFailed {
            core,
            attempt: attempts,
            retry_in,
            reason: reason.clone(),
        });
        PullOutcome::Failed { reason }
    }

    fn defer(&self, core: &CoreIdentity, reason: DeferReason) -> PullOutcome {
        let outcome = PullOutcome::Deferred(reason);
        self.tracker.record_outcome(core, outcome.clone());
        self.events.emit(PullDeferred {
            core: core.clone(),
            reason,
        });
        outcome
    }
}
