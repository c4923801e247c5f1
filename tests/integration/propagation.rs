//! Integration test: coordination notifications spread generations.

use coresync_engine::CoreNotification;
use coresync_integration_tests::{SyncCluster, core, segment_files};
use coresync_types::Generation;
use tokio::time::Duration;

const WAIT: Duration = Duration::from_secs(10);

/// Node 0 writes three cores; every other node picks each up from the
/// `Updated` notifications alone.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_updates_reach_every_node() {
    let c = SyncCluster::new(5);
    let shards = [
        core("books/shard1/replica_n1"),
        core("books/shard2/replica_n1"),
        core("authors/shard1/replica_n1"),
    ];
    c.start_all().await;

    for (n, shard) in shards.iter().enumerate() {
        let tag = format!("p{n}");
        c.push_from(0, shard, segment_files(&tag, 0..3)).await;
        c.push_from(0, shard, segment_files(&tag, 1..5)).await;
    }

    for i in 1..c.len() {
        for shard in &shards {
            assert!(
                c.wait_for_generation(i, shard, Generation(2), WAIT).await,
                "node {i} did not reach generation 2 of {shard}"
            );
            c.assert_complete(i, shard).await;
        }
    }
    c.stop_all().await;
}

/// `Removed` drops queued work and forgets what the node knew of the core.
#[tokio::test]
async fn test_removed_core_is_forgotten() {
    let c = SyncCluster::new(1);
    let shard = core("books/shard1/replica_n3");
    let node = c.node(0);

    // Worker not started: the request stays queued.
    node.enqueue_pull(&shard, Generation(4));
    let status = node.status(&shard).await.unwrap();
    assert!(status.queued);
    assert_eq!(status.known_remote_generation, Some(Generation(4)));

    node.watcher().handle(CoreNotification::Removed(shard.clone()));
    let status = node.status(&shard).await.unwrap();
    assert!(!status.queued);
    assert!(status.known_remote_generation.is_none());
}

/// Notifications sent after shutdown are not processed.
#[tokio::test]
async fn test_watchers_stop_with_cluster() {
    let c = SyncCluster::new(2);
    let shard = core("books/shard4/replica_n1");
    c.start_all().await;
    c.stop_all().await;

    c.writer()
        .push(&shard, segment_files("s", 0..1))
        .await
        .unwrap();
    c.notify(CoreNotification::Updated {
        core: shard.clone(),
        generation: Generation(1),
    });
    tokio::time::sleep(Duration::from_millis(100)).await;
    for i in 0..c.len() {
        assert_eq!(c.local_generation(i, &shard).await, Generation::ZERO);
    }
}
