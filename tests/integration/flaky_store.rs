//! Integration test: pulls through an unreliable object store.

use coresync_integration_tests::{SyncCluster, core, fast_config, segment_files};
use coresync_types::events::PullAbandoned;
use coresync_types::{Generation, PullOutcome, SyncConfig};
use tokio::time::Duration;

const WAIT: Duration = Duration::from_secs(20);

fn few_attempts(holder: &str) -> SyncConfig {
    SyncConfig {
        max_pull_attempts: 3,
        ..fast_config(holder)
    }
}

/// One call in ten fails and reads are slow; retries still converge every
/// node on the latest generation with intact segments.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_nodes_converge_through_failures() {
    let c = SyncCluster::flaky(3, 0.1, 42);
    let shards = [
        core("books/shard1/replica_n1"),
        core("books/shard2/replica_n1"),
    ];
    let writer = c.writer();
    for shard in &shards {
        writer
            .push(shard, segment_files("f", 0..4))
            .await
            .unwrap();
        writer
            .push(shard, segment_files("f", 2..8))
            .await
            .unwrap();
    }

    c.start_all().await;
    for i in 0..c.len() {
        for shard in &shards {
            c.node(i).enqueue_pull(shard, Generation(2));
        }
    }

    for i in 0..c.len() {
        for shard in &shards {
            assert!(
                c.wait_for_generation(i, shard, Generation(2), WAIT).await,
                "node {i} did not converge on {shard}: {:?}",
                c.node(i).status(shard).await.unwrap().last_pull
            );
            c.assert_complete(i, shard).await;
        }
        assert!(c.node(i).permanent_failures().is_empty());
    }
    c.stop_all().await;
}

/// An unreachable store exhausts the retries. The core stays parked until an
/// operator resets it, after which it syncs normally.
#[tokio::test]
async fn test_outage_parks_core_until_reset() {
    let c = SyncCluster::flaky_with_config(1, 0.0, 7, few_attempts);
    let shard = core("books/shard1/replica_n1");
    c.writer()
        .push(&shard, segment_files("o", 0..2))
        .await
        .unwrap();

    let node = c.node(0);
    let flaky = c.flaky_store(0).unwrap();
    flaky.set_offline(true);
    let mut abandoned = node.events().subscribe::<PullAbandoned>();

    node.start().await;
    node.enqueue_pull(&shard, Generation(1));
    let event = tokio::time::timeout(WAIT, abandoned.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(event.core, shard);
    assert_eq!(event.attempts, 3);
    assert!(flaky.injected_failures() >= 3);

    let failures = node.permanent_failures();
    assert_eq!(failures.len(), 1);
    assert!(matches!(
        failures[0].outcome,
        PullOutcome::PermanentlyFailed { .. }
    ));

    // Store back, but the core stays parked without a reset.
    flaky.set_offline(false);
    node.enqueue_pull(&shard, Generation(1));
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(c.local_generation(0, &shard).await, Generation::ZERO);

    assert!(node.reset_core(&shard));
    assert!(c.wait_for_generation(0, &shard, Generation(1), WAIT).await);
    c.assert_complete(0, &shard).await;
    assert!(node.permanent_failures().is_empty());
    node.stop().await.unwrap();
}
