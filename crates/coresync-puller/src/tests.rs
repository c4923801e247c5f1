//! Scenario tests for the pull pipeline: feeder, lifecycle, and watcher.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use coresync_lease::{ConcurrencyController, LeaseGrant};
use coresync_store::{
    BlobStore, CoreStore, DeleteOutcome, FlakyStore, MemoryBlobStore, MemoryCoreStore, StoreError,
};
use coresync_types::events::{EventBus, PullAbandoned, PullDeferred, PullSucceeded};
use coresync_types::*;
use tokio::sync::broadcast;
use tokio::time::Duration;

use crate::{
    CoreNotification, CorePuller, CoreWatcher, FeederProcess, FeederState, PullError, PullQueue,
    PullTracker, PullerFeeder,
};

// ---------------------------------------------------------------------------
// Test helpers
// ---------------------------------------------------------------------------

fn core(n: &str) -> CoreIdentity {
    format!("books/shard1/{n}").parse().unwrap()
}

fn test_config() -> SyncConfig {
    SyncConfig {
        lease_timeout: Duration::from_millis(50),
        backoff_base: Duration::from_millis(10),
        backoff_max: Duration::from_millis(100),
        max_pull_attempts: 3,
        holder: "node-test".into(),
        ..SyncConfig::default()
    }
}

struct Harness {
    local: Arc<MemoryCoreStore>,
    controller: Arc<ConcurrencyController>,
    tracker: Arc<PullTracker>,
    queue: Arc<PullQueue>,
    feeder: Arc<PullerFeeder>,
    bus: EventBus,
}

fn harness(remote: Arc<dyn BlobStore>) -> Harness {
    let config = test_config();
    let bus = EventBus::new();
    let local = Arc::new(MemoryCoreStore::new());
    let controller = Arc::new(ConcurrencyController::new(config.max_lease_hold, bus.clone()));
    let tracker = Arc::new(PullTracker::new(config.backoff_base, config.backoff_max));
    let queue = Arc::new(PullQueue::new());
    let puller = Arc::new(CorePuller::new(
        remote,
        local.clone(),
        controller.clone(),
        config.fetch_timeout,
    ));
    let feeder = Arc::new(PullerFeeder::new(
        config,
        queue.clone(),
        controller.clone(),
        tracker.clone(),
        puller,
        bus.clone(),
    ));
    Harness {
        local,
        controller,
        tracker,
        queue,
        feeder,
        bus,
    }
}

/// Publish a generation made of `files` directly into `remote`.
async fn publish(
    remote: &dyn BlobStore,
    core: &CoreIdentity,
    generation: u64,
    files: &[&[u8]],
) -> BlobMetadata {
    let mut segments = Vec::new();
    for (i, data) in files.iter().enumerate() {
        let seg = SegmentRef::for_data(format!("_{i}.cfs"), data);
        remote
            .put_file(&BlobRef::new(core.clone(), seg.hash), Bytes::copy_from_slice(data))
            .await
            .unwrap();
        segments.push(seg);
    }
    let md = BlobMetadata {
        core: core.clone(),
        generation: Generation(generation),
        segments,
    };
    remote.put_metadata(&md).await.unwrap();
    md
}

/// Install `md` as the local core's active generation.
async fn install_locally(local: &MemoryCoreStore, md: &BlobMetadata, files: &[&[u8]]) {
    for (seg, data) in md.segments.iter().zip(files) {
        local
            .write_file(&md.core, seg, Bytes::copy_from_slice(data))
            .await
            .unwrap();
    }
    local.apply_generation(md).await.unwrap();
}

// ---------------------------------------------------------------------------
// Feeder
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_pull_from_gen_three_to_five() {
    let remote = Arc::new(MemoryBlobStore::new());
    let h = harness(remote.clone());
    let shard = core("shardA");

    let gen3 = publish(remote.as_ref(), &shard, 3, &[b"seg-a", b"seg-b"]).await;
    install_locally(&h.local, &gen3, &[b"seg-a", b"seg-b"]).await;
    let gen5 = publish(remote.as_ref(), &shard, 5, &[b"seg-a", b"seg-c", b"seg-d"]).await;

    let mut succeeded = h.bus.subscribe::<PullSucceeded>();
    h.feeder.enqueue(&shard, Generation(5));
    let item = h.queue.try_dequeue().unwrap();

    assert_eq!(h.feeder.process(item).await, PullOutcome::Succeeded);

    assert_eq!(h.local.local_generation(&shard).await.unwrap(), Generation(5));
    for seg in &gen5.segments {
        assert!(h.local.verify_file(&shard, seg).await.unwrap());
    }
    assert_eq!(remote.fetch_count(), 2, "only seg-c and seg-d were missing");

    let record = h.tracker.status(&shard).unwrap();
    assert_eq!(record.outcome, PullOutcome::Succeeded);
    assert_eq!(record.attempted_generation, Generation(5));
    assert_eq!(record.consecutive_failures, 0);

    assert!(!h.controller.is_leased(&shard), "lease released after the pull");
    let event = succeeded.try_recv().unwrap();
    assert_eq!(event.generation, Generation(5));
    assert_eq!(event.fetched_files, 2);
    assert!(succeeded.try_recv().is_none(), "exactly one pull ran");
}

#[tokio::test]
async fn test_contended_lease_defers_without_failure() {
    let remote = Arc::new(MemoryBlobStore::new());
    let h = harness(remote.clone());
    let shard = core("shardA");
    publish(remote.as_ref(), &shard, 1, &[b"x"]).await;

    let push = match h
        .controller
        .acquire_push_lease(&shard, "writer", Duration::ZERO)
        .await
    {
        LeaseGrant::Acquired(lease) => lease,
        LeaseGrant::TimedOut { .. } => panic!("core must be free"),
    };

    h.feeder.enqueue(&shard, Generation(1));
    let item = h.queue.try_dequeue().unwrap();
    assert_eq!(
        h.feeder.process(item).await,
        PullOutcome::Deferred(DeferReason::LeaseContended)
    );
    assert!(h.queue.contains(&shard), "deferred item is put back");
    assert_eq!(h.tracker.status(&shard).unwrap().consecutive_failures, 0);
    assert_eq!(remote.fetch_count(), 0, "no fetch while the push holds the core");

    h.controller.release(push);
}

/// Blob store that reports a concurrent push from another node the first
/// time a file is fetched.
struct RacingStore {
    inner: MemoryBlobStore,
    controller: Arc<ConcurrencyController>,
    raced: AtomicBool,
}

#[async_trait::async_trait]
impl BlobStore for RacingStore {
    async fn list_metadata(
        &self,
        core: &CoreIdentity,
    ) -> Result<Option<BlobMetadata>, StoreError> {
        self.inner.list_metadata(core).await
    }

    async fn fetch_file(&self, blob: &BlobRef) -> Result<Bytes, StoreError> {
        if !self.raced.swap(true, Ordering::SeqCst) {
            self.controller.observe_generation(&blob.core, Generation(6));
        }
        self.inner.fetch_file(blob).await
    }

    async fn put_file(&self, blob: &BlobRef, data: Bytes) -> Result<(), StoreError> {
        self.inner.put_file(blob, data).await
    }

    async fn put_metadata(&self, metadata: &BlobMetadata) -> Result<(), StoreError> {
        self.inner.put_metadata(metadata).await
    }

    async fn delete(&self, blob: &BlobRef) -> Result<DeleteOutcome, StoreError> {
        self.inner.delete(blob).await
    }

    async fn list_blobs(&self, core: &CoreIdentity) -> Result<Vec<ContentHash>, StoreError> {
        self.inner.list_blobs(core).await
    }
}

#[tokio::test]
async fn test_generation_advancing_mid_pull_requeues_immediately() {
    let config = test_config();
    let bus = EventBus::new();
    let controller = Arc::new(ConcurrencyController::new(config.max_lease_hold, bus.clone()));
    let remote = Arc::new(RacingStore {
        inner: MemoryBlobStore::new(),
        controller: controller.clone(),
        raced: AtomicBool::new(false),
    });
    let shard = core("shardA");
    publish(remote.as_ref(), &shard, 5, &[b"v5"]).await;

    let local = Arc::new(MemoryCoreStore::new());
    let tracker = Arc::new(PullTracker::new(config.backoff_base, config.backoff_max));
    let queue = Arc::new(PullQueue::new());
    let puller = Arc::new(CorePuller::new(
        remote,
        local.clone(),
        controller.clone(),
        config.fetch_timeout,
    ));
    let feeder = PullerFeeder::new(
        config,
        queue.clone(),
        controller,
        tracker.clone(),
        puller,
        bus.clone(),
    );
    let mut deferred = bus.subscribe::<PullDeferred>();

    feeder.enqueue(&shard, Generation(5));
    let item = queue.try_dequeue().unwrap();
    assert_eq!(
        feeder.process(item).await,
        PullOutcome::Deferred(DeferReason::StaleGeneration)
    );

    // Generation 5 was still applied; the core is re-queued for 6 with no
    // backoff and no failure counted.
    assert_eq!(local.local_generation(&shard).await.unwrap(), Generation(5));
    let next = queue.try_dequeue().expect("re-enqueued without delay");
    assert_eq!(next.requested_generation, Generation(6));
    assert_eq!(tracker.status(&shard).unwrap().consecutive_failures, 0);
    assert_eq!(
        deferred.try_recv().unwrap().reason,
        DeferReason::StaleGeneration
    );
}

#[tokio::test(start_paused = true)]
async fn test_retry_bound_leads_to_permanent_failure() {
    let flaky = Arc::new(FlakyStore::new(Arc::new(MemoryBlobStore::new())));
    flaky.set_offline(true);
    let h = harness(flaky.clone());
    let shard = core("shardA");
    let mut abandoned = h.bus.subscribe::<PullAbandoned>();

    h.feeder.enqueue(&shard, Generation(2));
    let (_tx, mut rx) = tokio::sync::watch::channel(false);

    let mut outcomes = Vec::new();
    for _ in 0..3 {
        let item = h.queue.dequeue(&mut rx).await.unwrap();
        outcomes.push(h.feeder.process(item).await);
    }
    assert!(matches!(outcomes[0], PullOutcome::Failed { .. }));
    assert!(matches!(outcomes[1], PullOutcome::Failed { .. }));
    assert!(matches!(outcomes[2], PullOutcome::PermanentlyFailed { .. }));
    assert!(h.queue.is_empty(), "no silent retry after the bound");

    let event = abandoned.try_recv().unwrap();
    assert_eq!(event.core, shard);
    assert_eq!(event.attempts, 3);
    assert_eq!(h.tracker.permanent_failures().len(), 1);

    // A new trigger is ignored without touching the store.
    let calls = flaky.injected_failures();
    h.feeder.enqueue(&shard, Generation(3));
    let item = h.queue.try_dequeue().unwrap();
    assert!(matches!(
        h.feeder.process(item).await,
        PullOutcome::PermanentlyFailed { .. }
    ));
    assert_eq!(flaky.injected_failures(), calls);

    // After an operator reset the core is pulled again.
    flaky.set_offline(false);
    assert!(h.tracker.reset(&shard));
    h.feeder.enqueue(&shard, Generation(3));
    let item = h.queue.try_dequeue().unwrap();
    assert_eq!(h.feeder.process(item).await, PullOutcome::Succeeded);
}

#[tokio::test]
async fn test_corruption_is_retried_then_abandoned() {
    let remote = Arc::new(MemoryBlobStore::new());
    let h = harness(remote.clone());
    let shard = core("shardA");
    let md = publish(remote.as_ref(), &shard, 1, &[b"intact"]).await;
    remote.overwrite_unchecked(
        &BlobRef::new(shard.clone(), md.segments[0].hash),
        Bytes::from_static(b"broken"),
    );

    let mut last = PullOutcome::InProgress;
    for _ in 0..3 {
        h.feeder.enqueue(&shard, Generation(1));
        // Backoff is skipped by removing and processing directly.
        let item = h.queue.remove(&shard).unwrap();
        last = h.feeder.process(item).await;
    }
    assert!(matches!(last, PullOutcome::PermanentlyFailed { .. }));
    assert_eq!(h.local.local_generation(&shard).await.unwrap(), Generation::ZERO);
}

// ---------------------------------------------------------------------------
// Lifecycle
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_active_worker_before_start_is_not_initialized() {
    let h = harness(Arc::new(MemoryBlobStore::new()));
    let process = FeederProcess::new(h.feeder.clone());
    assert_eq!(process.state(), FeederState::NotStarted);
    assert!(matches!(
        process.active_worker(),
        Err(PullError::NotInitialized)
    ));
    // Stopping a never-started process is harmless.
    process.stop().await.unwrap();
}

#[tokio::test]
async fn test_worker_drains_queue_and_stops() {
    let remote = Arc::new(MemoryBlobStore::new());
    let h = harness(remote.clone());
    let shard = core("shardA");
    publish(remote.as_ref(), &shard, 1, &[b"one"]).await;

    let process = FeederProcess::new(h.feeder.clone());
    let mut succeeded = h.bus.subscribe::<PullSucceeded>();

    let worker = process.start().await;
    assert_eq!(worker.id, 1);
    assert_eq!(worker.state, FeederState::Running);

    h.feeder.enqueue(&shard, Generation(1));
    let event = tokio::time::timeout(Duration::from_secs(5), succeeded.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(event.core, shard);

    process.stop().await.unwrap();
    assert_eq!(process.state(), FeederState::Stopped);
    assert_eq!(process.active_worker().unwrap().state, FeederState::Stopped);
}

#[tokio::test]
async fn test_restart_replaces_worker() {
    let h = harness(Arc::new(MemoryBlobStore::new()));
    let process = FeederProcess::new(h.feeder.clone());

    let first = process.start().await;
    let second = process.start().await;
    assert_eq!(first.id, 1);
    assert_eq!(second.id, 2);
    assert_eq!(process.active_worker().unwrap().id, 2);
    assert_eq!(process.state(), FeederState::Running);

    process.stop().await.unwrap();
}

#[tokio::test]
async fn test_stop_waits_for_inflight_pull() {
    let inner = Arc::new(MemoryBlobStore::new());
    let shard = core("shardA");
    publish(inner.as_ref(), &shard, 4, &[b"a", b"b", b"c"]).await;
    let slow = Arc::new(FlakyStore::new(inner).read_latency(30, 30));
    let h = harness(slow);

    let process = FeederProcess::new(h.feeder.clone());
    process.start().await;
    h.feeder.enqueue(&shard, Generation(4));

    // Wait until the worker is mid-pull.
    while h
        .tracker
        .status(&shard)
        .is_none_or(|r| r.outcome != PullOutcome::InProgress)
    {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    process.stop().await.unwrap();

    assert_eq!(h.local.local_generation(&shard).await.unwrap(), Generation(4));
    assert_eq!(h.tracker.status(&shard).unwrap().outcome, PullOutcome::Succeeded);
}

#[tokio::test]
async fn test_repeated_requests_fetch_once() {
    let remote = Arc::new(MemoryBlobStore::new());
    let h = harness(remote.clone());
    let shard = core("shardA");
    publish(remote.as_ref(), &shard, 2, &[b"p", b"q"]).await;

    for _ in 0..10 {
        h.feeder.enqueue(&shard, Generation(2));
    }
    assert_eq!(h.queue.len(), 1);

    let process = FeederProcess::new(h.feeder.clone());
    let mut succeeded = h.bus.subscribe::<PullSucceeded>();
    process.start().await;
    tokio::time::timeout(Duration::from_secs(5), succeeded.recv())
        .await
        .unwrap()
        .unwrap();

    // More triggers after the pull find the core up to date.
    h.feeder.enqueue(&shard, Generation(2));
    let event = tokio::time::timeout(Duration::from_secs(5), succeeded.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(event.fetched_files, 0);
    process.stop().await.unwrap();

    assert_eq!(remote.fetch_count(), 2);
}

// ---------------------------------------------------------------------------
// Watcher
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_watcher_translates_notifications() {
    let h = harness(Arc::new(MemoryBlobStore::new()));
    let watcher = CoreWatcher::new(h.feeder.clone(), h.controller.clone());

    watcher.handle(CoreNotification::Assigned(core("a")));
    assert!(h.queue.contains(&core("a")));

    watcher.handle(CoreNotification::Updated {
        core: core("a"),
        generation: Generation(8),
    });
    assert_eq!(h.controller.current_generation(&core("a")), Some(Generation(8)));

    watcher.handle(CoreNotification::Removed(core("a")));
    assert!(!h.queue.contains(&core("a")));
    assert_eq!(h.controller.current_generation(&core("a")), None);
}

#[tokio::test]
async fn test_watcher_run_loop() {
    let h = harness(Arc::new(MemoryBlobStore::new()));
    let watcher = Arc::new(CoreWatcher::new(h.feeder.clone(), h.controller.clone()));
    let (tx, rx) = broadcast::channel(16);
    let (stop_tx, stop_rx) = tokio::sync::watch::channel(false);

    let task = {
        let watcher = watcher.clone();
        tokio::spawn(async move { watcher.run(rx, stop_rx).await })
    };

    tx.send(CoreNotification::Updated {
        core: core("b"),
        generation: Generation(3),
    })
    .unwrap();
    while !h.queue.contains(&core("b")) {
        tokio::task::yield_now().await;
    }

    stop_tx.send(true).unwrap();
    task.await.unwrap();
    assert_eq!(h.queue.try_dequeue().unwrap().requested_generation, Generation(3));
}
