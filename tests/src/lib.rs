//! Shared test harness for coresync integration tests.
//!
//! Provides [`SyncCluster`]: N nodes, each with its own local cores and
//! [`StoreManager`], all publishing to and pulling from one shared
//! in-memory object store. Nodes may reach the store through a
//! [`FlakyStore`] for fault injection, and a broadcast channel plays the
//! role of the coordination layer.

use std::sync::Arc;

use bytes::Bytes;
use coresync_engine::{CoreNotification, PushOutcome, StoreManager};
use coresync_store::{BlobStore, CoreStore, FlakyStore, MemoryBlobStore, MemoryCoreStore};
use coresync_types::{CoreIdentity, Generation, SyncConfig};
use tokio::sync::{broadcast, watch};
use tokio::time::{Duration, Instant};

/// Install a test subscriber once; honours `RUST_LOG`.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Parse `collection/shard/core` or panic.
pub fn core(s: &str) -> CoreIdentity {
    s.parse().unwrap()
}

/// Generate `count` deterministic segment files tagged with `tag`.
///
/// Files with the same tag and index have identical contents, so they share
/// a content hash across generations.
pub fn segment_files(tag: &str, range: std::ops::Range<usize>) -> Vec<(String, Bytes)> {
    range
        .map(|i| {
            let data: Vec<u8> = format!("{tag}:{i}:")
                .bytes()
                .cycle()
                .take(512 + i * 37)
                .collect();
            (format!("_{tag}{i}.seg"), Bytes::from(data))
        })
        .collect()
}

/// Engine tuning with short timeouts so failures resolve quickly.
pub fn fast_config(holder: &str) -> SyncConfig {
    SyncConfig {
        lease_timeout: Duration::from_millis(200),
        max_lease_hold: Duration::from_secs(10),
        fetch_timeout: Duration::from_secs(1),
        backoff_base: Duration::from_millis(5),
        backoff_max: Duration::from_millis(50),
        max_pull_attempts: 20,
        delete_grace_period: Duration::from_secs(600),
        holder: holder.to_string(),
    }
}

/// A group of nodes sharing one object store.
pub struct SyncCluster {
    remote: Arc<MemoryBlobStore>,
    flaky: Vec<Option<Arc<FlakyStore>>>,
    locals: Vec<Arc<MemoryCoreStore>>,
    nodes: Vec<Arc<StoreManager>>,
    notifications: broadcast::Sender<CoreNotification>,
    shutdown: watch::Sender<bool>,
}

impl SyncCluster {
    /// `n` nodes with direct access to the shared store.
    pub fn new(n: usize) -> Self {
        Self::build(n, |_, _| None, fast_config)
    }

    /// `n` nodes whose store calls fail at `failure_rate`.
    pub fn flaky(n: usize, failure_rate: f64, seed: u64) -> Self {
        Self::flaky_with_config(n, failure_rate, seed, fast_config)
    }

    /// Like [`SyncCluster::flaky`] with a custom config per holder name.
    pub fn flaky_with_config(
        n: usize,
        failure_rate: f64,
        seed: u64,
        config: fn(&str) -> SyncConfig,
    ) -> Self {
        Self::build(
            n,
            |i, remote| {
                Some(Arc::new(
                    FlakyStore::new(remote)
                        .read_latency(0, 3)
                        .failure_rate(failure_rate)
                        .seed(seed + i as u64),
                ))
            },
            config,
        )
    }

    /// A writer outside the cluster, publishing straight to the shared store.
    pub fn writer(&self) -> StoreManager {
        StoreManager::new(
            fast_config("writer"),
            self.remote.clone(),
            Arc::new(MemoryCoreStore::new()),
        )
    }

    /// `n` nodes with a custom config per holder name.
    pub fn with_config(n: usize, config: fn(&str) -> SyncConfig) -> Self {
        Self::build(n, |_, _| None, config)
    }

    fn build(
        n: usize,
        wrap: impl Fn(usize, Arc<dyn BlobStore>) -> Option<Arc<FlakyStore>>,
        config: fn(&str) -> SyncConfig,
    ) -> Self {
        init_tracing();
        let remote = Arc::new(MemoryBlobStore::new());
        let (notifications, _) = broadcast::channel(256);
        let (shutdown, _) = watch::channel(false);

        let mut flaky = Vec::with_capacity(n);
        let mut locals = Vec::with_capacity(n);
        let mut nodes = Vec::with_capacity(n);
        for i in 0..n {
            let shared: Arc<dyn BlobStore> = remote.clone();
            let wrapped = wrap(i, shared.clone());
            let blobs: Arc<dyn BlobStore> = match &wrapped {
                Some(f) => f.clone(),
                None => shared,
            };
            let local = Arc::new(MemoryCoreStore::new());
            let manager = StoreManager::new(config(&format!("node-{i}")), blobs, local.clone());
            flaky.push(wrapped);
            locals.push(local);
            nodes.push(Arc::new(manager));
        }

        Self {
            remote,
            flaky,
            locals,
            nodes,
            notifications,
            shutdown,
        }
    }

    /// Node `i`.
    pub fn node(&self, i: usize) -> &Arc<StoreManager> {
        &self.nodes[i]
    }

    /// Number of nodes.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether the cluster has no nodes.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// The shared store, bypassing any fault injection.
    pub fn remote(&self) -> &Arc<MemoryBlobStore> {
        &self.remote
    }

    /// Node `i`'s local cores.
    pub fn local(&self, i: usize) -> &Arc<MemoryCoreStore> {
        &self.locals[i]
    }

    /// Node `i`'s fault injector, if it was built with one.
    pub fn flaky_store(&self, i: usize) -> Option<&Arc<FlakyStore>> {
        self.flaky[i].as_ref()
    }

    /// Start every node's feeder and coordination watcher.
    pub async fn start_all(&self) {
        for node in &self.nodes {
            node.start().await;
            let watcher = Arc::clone(node.watcher());
            let notifications = self.notifications.subscribe();
            let shutdown = self.shutdown.subscribe();
            tokio::spawn(async move { watcher.run(notifications, shutdown).await });
        }
    }

    /// Stop every watcher and feeder.
    pub async fn stop_all(&self) {
        let _ = self.shutdown.send(true);
        for node in &self.nodes {
            node.stop().await.unwrap();
        }
    }

    /// Publish a coordination notification to every node.
    pub fn notify(&self, notification: CoreNotification) {
        let _ = self.notifications.send(notification);
    }

    /// Push `files` from node `i` and announce the new generation.
    pub async fn push_from(
        &self,
        i: usize,
        core: &CoreIdentity,
        files: Vec<(String, Bytes)>,
    ) -> Generation {
        match self.nodes[i].push(core, files).await.unwrap() {
            PushOutcome::Pushed { generation, .. } => {
                self.notify(CoreNotification::Updated {
                    core: core.clone(),
                    generation,
                });
                generation
            }
            PushOutcome::Unchanged { generation } => generation,
            PushOutcome::Contended { held_by } => {
                panic!("push from node {i} contended by {held_by} lease")
            }
        }
    }

    /// Generation node `i` serves for `core`.
    pub async fn local_generation(&self, i: usize, core: &CoreIdentity) -> Generation {
        self.locals[i].local_generation(core).await.unwrap()
    }

    /// Poll until node `i` serves at least `generation` of `core`.
    pub async fn wait_for_generation(
        &self,
        i: usize,
        core: &CoreIdentity,
        generation: Generation,
        timeout: Duration,
    ) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.local_generation(i, core).await >= generation {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    /// Assert that node `i`'s active generation of `core` matches the remote
    /// metadata of that generation and every segment verifies.
    pub async fn assert_complete(&self, i: usize, core: &CoreIdentity) {
        let local = self.locals[i]
            .active_metadata(core)
            .await
            .unwrap()
            .unwrap_or_else(|| panic!("node {i} has no active generation of {core}"));
        for segment in &local.segments {
            assert!(
                self.locals[i].verify_file(core, segment).await.unwrap(),
                "node {i}: segment {} of {core} generation {} does not verify",
                segment.name,
                local.generation
            );
        }
    }
}
