//! A [`BlobStore`] wrapper that injects latency and failures.
//!
//! `FlakyStore` wraps any `Arc<dyn BlobStore>`. Before each call it sleeps
//! for a random duration and may fail the call with
//! [`StoreError::Unavailable`]. The RNG is seeded for reproducible runs.
//!
//! # Example
//!
//! ```ignore
//! let flaky = FlakyStore::new(inner)
//!     .read_latency(5, 20)    // 5–20 ms per read
//!     .failure_rate(0.3)      // 30% of calls fail
//!     .seed(42);
//! flaky.set_offline(true);    // every call fails until set back
//! ```

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use coresync_types::{BlobMetadata, BlobRef, ContentHash, CoreIdentity};
use rand::Rng;
use rand::SeedableRng;
use rand::rngs::StdRng;

use crate::error::StoreError;
use crate::traits::{BlobStore, DeleteOutcome};

/// A [`BlobStore`] wrapper for fault-injection tests.
pub struct FlakyStore {
    inner: Arc<dyn BlobStore>,
    read_latency_ms: (u64, u64),
    write_latency_ms: (u64, u64),
    failure_rate: f64,
    offline: AtomicBool,
    injected: AtomicUsize,
    rng: Mutex<StdRng>,
}

impl FlakyStore {
    /// Wrap an existing store as a pass-through.
    pub fn new(inner: Arc<dyn BlobStore>) -> Self {
        Self {
            inner,
            read_latency_ms: (0, 0),
            write_latency_ms: (0, 0),
            failure_rate: 0.0,
            offline: AtomicBool::new(false),
            injected: AtomicUsize::new(0),
            rng: Mutex::new(StdRng::seed_from_u64(0)),
        }
    }

    /// Set the read latency range in milliseconds (uniform random).
    pub fn read_latency(mut self, min_ms: u64, max_ms: u64) -> Self {
        self.read_latency_ms = (min_ms, max_ms);
        self
    }

    /// Set the write latency range in milliseconds (uniform random).
    pub fn write_latency(mut self, min_ms: u64, max_ms: u64) -> Self {
        self.write_latency_ms = (min_ms, max_ms);
        self
    }

    /// Fail this fraction of calls (0.0 to 1.0).
    pub fn failure_rate(mut self, rate: f64) -> Self {
        self.failure_rate = rate.clamp(0.0, 1.0);
        self
    }

    /// Set the RNG seed for deterministic behaviour.
    pub fn seed(self, seed: u64) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
            ..self
        }
    }

    /// Fail every call while `offline` is true.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::Relaxed);
    }

    /// Number of calls failed by injection so far.
    pub fn injected_failures(&self) -> usize {
        self.injected.load(Ordering::Relaxed)
    }

    /// Sleep for a random duration in `range`, then decide whether to fail.
    async fn disturb(&self, range: (u64, u64)) -> Result<(), StoreError> {
        let (min, max) = range;
        let (ms, fail) = {
            let mut rng = self.rng.lock().expect("rng lock poisoned");
            let ms = if max == 0 || min == max {
                min
            } else {
                rng.random_range(min..=max)
            };
            let fail = self.failure_rate > 0.0 && rng.random_bool(self.failure_rate);
            (ms, fail)
        };

        if ms > 0 {
            tokio::time::sleep(tokio::time::Duration::from_millis(ms)).await;
        }

        if fail || self.offline.load(Ordering::Relaxed) {
            self.injected.fetch_add(1, Ordering::Relaxed);
            return Err(StoreError::Unavailable("injected failure".into()));
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl BlobStore for FlakyStore {
    async fn list_metadata(
        &self,
        core: &CoreIdentity,
    ) -> Result<Option<BlobMetadata>, StoreError> {
        self.disturb(self.read_latency_ms).await?;
        self.inner.list_metadata(core).await
    }

    async fn fetch_file(&self, blob: &BlobRef) -> Result<Bytes, StoreError> {
        self.disturb(self.read_latency_ms).await?;
        self.inner.fetch_file(blob).await
    }

    async fn put_file(&self, blob: &BlobRef, data: Bytes) -> Result<(), StoreError> {
        self.disturb(self.write_latency_ms).await?;
        self.inner.put_file(blob, data).await
    }

    async fn put_metadata(&self, metadata: &BlobMetadata) -> Result<(), StoreError> {
        self.disturb(self.write_latency_ms).await?;
        self.inner.put_metadata(metadata).await
    }

    async fn delete(&self, blob: &BlobRef) -> Result<DeleteOutcome, StoreError> {
        self.disturb(self.write_latency_ms).await?;
        self.inner.delete(blob).await
    }

    async fn list_blobs(&self, core: &CoreIdentity) -> Result<Vec<ContentHash>, StoreError> {
        self.inner.list_blobs(core).await
    }
}
