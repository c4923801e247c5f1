//! Shared test utilities for coresync-engine tests.

use std::sync::Arc;

use bytes::Bytes;
use coresync_store::{BlobStore, MemoryBlobStore, MemoryCoreStore};
use coresync_types::{CoreIdentity, SyncConfig};
use tokio::time::Duration;

use crate::StoreManager;

pub fn core(name: &str) -> CoreIdentity {
    format!("books/shard1/{name}").parse().unwrap()
}

pub fn test_config(holder: &str) -> SyncConfig {
    SyncConfig {
        lease_timeout: Duration::from_millis(100),
        backoff_base: Duration::from_millis(10),
        backoff_max: Duration::from_millis(200),
        max_pull_attempts: 3,
        delete_grace_period: Duration::from_secs(60),
        holder: holder.into(),
        ..SyncConfig::default()
    }
}

/// Named segment files with distinct contents.
pub fn files(names: &[&str]) -> Vec<(String, Bytes)> {
    names
        .iter()
        .map(|n| (format!("{n}.cfs"), Bytes::from(format!("contents of {n}"))))
        .collect()
}

/// A node with its own local cores over a shared remote store.
pub fn node(remote: Arc<dyn BlobStore>, holder: &str) -> StoreManager {
    StoreManager::new(test_config(holder), remote, Arc::new(MemoryCoreStore::new()))
}

/// A single node over a fresh in-memory remote.
pub fn single_node() -> (Arc<MemoryBlobStore>, StoreManager) {
    let remote = Arc::new(MemoryBlobStore::new());
    let manager = node(remote.clone(), "node-1");
    (remote, manager)
}
