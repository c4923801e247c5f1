//! Integration test: pulls racing a writer and local push leases.

use coresync_engine::LeaseGrant;
use coresync_integration_tests::{SyncCluster, core, segment_files};
use coresync_store::BlobStore;
use coresync_types::events::PullDeferred;
use coresync_types::{DeferReason, Generation};
use tokio::time::Duration;

const WAIT: Duration = Duration::from_secs(10);

/// A writer publishes ten generations back to back while two readers pull
/// on every announcement. Both end on the last generation, complete.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_readers_keep_up_with_writer() {
    let c = SyncCluster::new(3);
    let shard = core("books/shard1/replica_n1");
    c.start_all().await;

    let mut last = Generation::ZERO;
    for n in 1usize..=10 {
        // Each generation drops the oldest segment and adds a new one.
        let start = n.saturating_sub(3);
        last = c.push_from(0, &shard, segment_files("w", start..n + 1)).await;
        tokio::task::yield_now().await;
    }
    assert_eq!(last, Generation(10));

    for reader in 1..3 {
        assert!(
            c.wait_for_generation(reader, &shard, last, WAIT).await,
            "reader {reader} stuck at {}",
            c.local_generation(reader, &shard).await
        );
        c.assert_complete(reader, &shard).await;
    }

    let remote = c.remote().list_metadata(&shard).await.unwrap().unwrap();
    for reader in 1..3 {
        let status = c.node(reader).status(&shard).await.unwrap();
        assert_eq!(status.local_generation, remote.generation);
        assert!(status.lease.is_none());
    }
    c.stop_all().await;
}

/// A reader holding its own push lease defers the pull rather than failing
/// it, and catches up once the lease is released.
#[tokio::test]
async fn test_local_push_lease_defers_pull() {
    let c = SyncCluster::new(2);
    let shard = core("books/shard2/replica_n1");
    c.writer()
        .push(&shard, segment_files("d", 0..2))
        .await
        .unwrap();

    let reader = c.node(1);
    let mut deferred = reader.events().subscribe::<PullDeferred>();
    let LeaseGrant::Acquired(lease) = reader
        .request_push_lease(&shard, Duration::ZERO)
        .await
    else {
        panic!("core must be free");
    };

    reader.start().await;
    reader.enqueue_pull(&shard, Generation(1));

    let event = tokio::time::timeout(WAIT, deferred.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(event.reason, DeferReason::LeaseContended);
    assert_eq!(c.local_generation(1, &shard).await, Generation::ZERO);
    assert!(reader.permanent_failures().is_empty());

    reader.release_lease(lease);
    assert!(c.wait_for_generation(1, &shard, Generation(1), WAIT).await);
    c.assert_complete(1, &shard).await;
    reader.stop().await.unwrap();
}
