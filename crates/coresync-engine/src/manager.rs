//! [`StoreManager`]: lazily built, memoized subsystem handles for one node.

use std::sync::{Arc, OnceLock};

use bytes::Bytes;
use coresync_gc::{DeleteManager, SweepSummary};
use coresync_lease::{ConcurrencyController, Lease, LeaseGrant, LeaseInfo, ReleaseOutcome};
use coresync_puller::{
    CorePuller, CoreWatcher, FeederProcess, PullQueue, PullTracker, PullerFeeder, WorkerInfo,
};
use coresync_store::{BlobStore, CoreStore};
use coresync_types::events::EventBus;
use coresync_types::{CoreIdentity, Generation, PullRecord, SyncConfig};
use tokio::time::Duration;
use tracing::info;

use crate::error::EngineError;
use crate::pusher::{CorePusher, PushOutcome};

/// Sync state of one core as seen from this node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoreStatus {
    /// The core.
    pub core: CoreIdentity,
    /// Generation the local core serves.
    pub local_generation: Generation,
    /// Newest remote generation this node has heard of.
    pub known_remote_generation: Option<Generation>,
    /// Last pull attempt, if any.
    pub last_pull: Option<PullRecord>,
    /// Outstanding lease, if any.
    pub lease: Option<LeaseInfo>,
    /// Whether a pull request is waiting in the queue.
    pub queued: bool,
}

/// Owns one node's stores and hands out its sync subsystems.
///
/// Every accessor builds its subsystem on first call and returns the same
/// `Arc` afterwards; [`OnceLock`] makes that safe under concurrent first
/// calls.
pub struct StoreManager {
    config: SyncConfig,
    blobs: Arc<dyn BlobStore>,
    local: Arc<dyn CoreStore>,
    events: EventBus,

    controller: OnceLock<Arc<ConcurrencyController>>,
    tracker: OnceLock<Arc<PullTracker>>,
    queue: OnceLock<Arc<PullQueue>>,
    puller: OnceLock<Arc<CorePuller>>,
    feeder: OnceLock<Arc<PullerFeeder>>,
    process: OnceLock<Arc<FeederProcess>>,
    delete_manager: OnceLock<Arc<DeleteManager>>,
    pusher: OnceLock<Arc<CorePusher>>,
    watcher: OnceLock<Arc<CoreWatcher>>,
}

impl StoreManager {
    /// Create a manager over a remote object store and the local cores.
    pub fn new(config: SyncConfig, blobs: Arc<dyn BlobStore>, local: Arc<dyn CoreStore>) -> Self {
        Self {
            config,
            blobs,
            local,
            events: EventBus::new(),
            controller: OnceLock::new(),
            tracker: OnceLock::new(),
            queue: OnceLock::new(),
            puller: OnceLock::new(),
            feeder: OnceLock::new(),
            process: OnceLock::new(),
            delete_manager: OnceLock::new(),
            pusher: OnceLock::new(),
            watcher: OnceLock::new(),
        }
    }

    /// Use a shared event bus instead of a private one.
    pub fn with_event_bus(mut self, events: EventBus) -> Self {
        self.events = events;
        self
    }

    // ------------------------------------------------------------------
    // Handles
    // ------------------------------------------------------------------

    /// The node's sync configuration.
    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// The event bus every subsystem emits on.
    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// The remote object store.
    pub fn blob_store(&self) -> &Arc<dyn BlobStore> {
        &self.blobs
    }

    /// The local cores.
    pub fn core_store(&self) -> &Arc<dyn CoreStore> {
        &self.local
    }

    /// The lease table.
    pub fn controller(&self) -> &Arc<ConcurrencyController> {
        self.controller.get_or_init(|| {
            Arc::new(ConcurrencyController::new(
                self.config.max_lease_hold,
                self.events.clone(),
            ))
        })
    }

    /// The pull tracker.
    pub fn tracker(&self) -> &Arc<PullTracker> {
        self.tracker.get_or_init(|| {
            Arc::new(PullTracker::new(
                self.config.backoff_base,
                self.config.backoff_max,
            ))
        })
    }

    /// The pull work queue.
    pub fn queue(&self) -> &Arc<PullQueue> {
        self.queue.get_or_init(|| Arc::new(PullQueue::new()))
    }

    /// The single-core puller.
    pub fn puller(&self) -> &Arc<CorePuller> {
        self.puller.get_or_init(|| {
            Arc::new(
                CorePuller::new(
                    self.blobs.clone(),
                    self.local.clone(),
                    self.controller().clone(),
                    self.config.fetch_timeout,
                )
                .with_delete_manager(self.delete_manager().clone()),
            )
        })
    }

    /// The feeder worker loop.
    pub fn feeder(&self) -> &Arc<PullerFeeder> {
        self.feeder.get_or_init(|| {
            Arc::new(PullerFeeder::new(
                self.config.clone(),
                self.queue().clone(),
                self.controller().clone(),
                self.tracker().clone(),
                self.puller().clone(),
                self.events.clone(),
            ))
        })
    }

    /// The lifecycle manager of the feeder worker.
    pub fn process(&self) -> &Arc<FeederProcess> {
        self.process
            .get_or_init(|| Arc::new(FeederProcess::new(self.feeder().clone())))
    }

    /// The delete manager.
    pub fn delete_manager(&self) -> &Arc<DeleteManager> {
        self.delete_manager.get_or_init(|| {
            Arc::new(DeleteManager::new(
                self.blobs.clone(),
                self.controller().clone(),
                self.config.delete_grace_period,
                self.config.fetch_timeout,
                self.config.holder.clone(),
                self.events.clone(),
            ))
        })
    }

    /// The write path.
    pub fn pusher(&self) -> &Arc<CorePusher> {
        self.pusher.get_or_init(|| {
            Arc::new(CorePusher::new(
                &self.config,
                self.blobs.clone(),
                self.local.clone(),
                self.controller().clone(),
                self.delete_manager().clone(),
                self.events.clone(),
            ))
        })
    }

    /// The coordination watcher.
    pub fn watcher(&self) -> &Arc<CoreWatcher> {
        self.watcher.get_or_init(|| {
            Arc::new(CoreWatcher::new(
                self.feeder().clone(),
                self.controller().clone(),
            ))
        })
    }

    // ------------------------------------------------------------------
    // Caller-facing operations
    // ------------------------------------------------------------------

    /// Ask for `core` to be brought up to at least `generation`.
    ///
    /// Returns `false` if the request merged into one already queued.
    pub fn enqueue_pull(&self, core: &CoreIdentity, generation: Generation) -> bool {
        self.feeder().enqueue(core, generation)
    }

    /// Wait up to `timeout` for the pull lease of `core`.
    pub async fn request_pull_lease(&self, core: &CoreIdentity, timeout: Duration) -> LeaseGrant {
        self.controller()
            .acquire_pull_lease(core, &self.config.holder, timeout)
            .await
    }

    /// Wait up to `timeout` for the push lease of `core`.
    pub async fn request_push_lease(&self, core: &CoreIdentity, timeout: Duration) -> LeaseGrant {
        self.controller()
            .acquire_push_lease(core, &self.config.holder, timeout)
            .await
    }

    /// Give back a lease obtained from this manager.
    pub fn release_lease(&self, lease: Lease) -> ReleaseOutcome {
        self.controller().release(lease)
    }

    /// Start the feeder worker, replacing a running one.
    pub async fn start(&self) -> WorkerInfo {
        let worker = self.process().start().await;
        info!(worker = worker.id, "sync worker started");
        worker
    }

    /// Stop the feeder worker and wait for it to exit.
    pub async fn stop(&self) -> Result<(), EngineError> {
        self.process().stop().await.map_err(EngineError::from_pull)
    }

    /// The current or most recent feeder worker.
    pub fn active_worker(&self) -> Result<WorkerInfo, EngineError> {
        self.process().active_worker().map_err(EngineError::from_pull)
    }

    /// Sync state of `core`.
    pub async fn status(&self, core: &CoreIdentity) -> Result<CoreStatus, EngineError> {
        Ok(CoreStatus {
            core: core.clone(),
            local_generation: self.local.local_generation(core).await?,
            known_remote_generation: self.controller().current_generation(core),
            last_pull: self.tracker().status(core),
            lease: self.controller().lease_info(core),
            queued: self.queue().contains(core),
        })
    }

    /// Publish `files` as the next generation of `core`.
    pub async fn push(
        &self,
        core: &CoreIdentity,
        files: Vec<(String, Bytes)>,
    ) -> Result<PushOutcome, EngineError> {
        self.pusher().push(core, files).await
    }

    /// Run one delete sweep.
    pub async fn sweep(&self) -> SweepSummary {
        self.delete_manager().sweep().await
    }

    /// Clear a permanent pull failure of `core` and pull it again.
    pub fn reset_core(&self, core: &CoreIdentity) -> bool {
        let was_failed = self.tracker().reset(core);
        let known = self
            .controller()
            .current_generation(core)
            .unwrap_or(Generation::ZERO);
        self.enqueue_pull(core, known);
        was_failed
    }

    /// Cores that exhausted their pull retries.
    pub fn permanent_failures(&self) -> Vec<PullRecord> {
        self.tracker().permanent_failures()
    }
}
