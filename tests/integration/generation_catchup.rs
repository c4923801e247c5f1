//! Integration test: a lagging node catches up across generations.

use coresync_engine::CoreNotification;
use coresync_integration_tests::{SyncCluster, core, segment_files};
use coresync_types::Generation;
use tokio::time::Duration;

const WAIT: Duration = Duration::from_secs(10);

/// Node 1 sits at generation 3 while node 0 publishes 4 and 5. One pull
/// request for 5 brings node 1 up, fetching only the segments it lacks.
#[tokio::test]
async fn test_lagging_node_fetches_only_new_segments() {
    let c = SyncCluster::new(2);
    let shard = core("books/shard1/replica_n1");

    for n in 1..=3 {
        c.node(0)
            .push(&shard, segment_files("a", 0..n))
            .await
            .unwrap();
    }
    c.node(1).start().await;
    c.node(1).enqueue_pull(&shard, Generation(3));
    assert!(c.wait_for_generation(1, &shard, Generation(3), WAIT).await);
    let fetched_before = c.remote().fetch_count();
    assert_eq!(fetched_before, 3);

    c.node(0)
        .push(&shard, segment_files("a", 0..4))
        .await
        .unwrap();
    c.node(0)
        .push(&shard, segment_files("a", 0..5))
        .await
        .unwrap();

    c.node(1).enqueue_pull(&shard, Generation(5));
    assert!(c.wait_for_generation(1, &shard, Generation(5), WAIT).await);
    assert_eq!(c.remote().fetch_count() - fetched_before, 2);
    c.assert_complete(1, &shard).await;

    let status = c.node(1).status(&shard).await.unwrap();
    assert_eq!(status.local_generation, Generation(5));
    assert_eq!(status.known_remote_generation, Some(Generation(5)));
    c.node(1).stop().await.unwrap();
}

/// A node assigned a core it has never seen pulls the latest generation.
#[tokio::test]
async fn test_assigned_core_is_pulled_from_scratch() {
    let c = SyncCluster::new(2);
    let shard = core("books/shard2/replica_n2");

    let writer = c.writer();
    writer
        .push(&shard, segment_files("b", 0..2))
        .await
        .unwrap();
    writer
        .push(&shard, segment_files("b", 1..4))
        .await
        .unwrap();

    c.start_all().await;
    c.notify(CoreNotification::Assigned(shard.clone()));

    for i in 0..c.len() {
        assert!(c.wait_for_generation(i, &shard, Generation(2), WAIT).await);
        c.assert_complete(i, &shard).await;
    }
    c.stop_all().await;
}

/// Requests for an older generation than the node already serves are no-ops.
#[tokio::test]
async fn test_stale_request_leaves_core_untouched() {
    let c = SyncCluster::new(2);
    let shard = core("books/shard3/replica_n1");

    c.writer()
        .push(&shard, segment_files("c", 0..3))
        .await
        .unwrap();
    c.node(1).start().await;
    c.node(1).enqueue_pull(&shard, Generation(1));
    assert!(c.wait_for_generation(1, &shard, Generation(1), WAIT).await);
    let fetched = c.remote().fetch_count();

    c.node(1).enqueue_pull(&shard, Generation(1));
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(c.remote().fetch_count(), fetched);
    assert_eq!(c.local_generation(1, &shard).await, Generation(1));
    c.node(1).stop().await.unwrap();
}
