//! In-memory object store backend.

use std::collections::HashMap;
use std::sync::RwLock;
use std::sync::atomic::{AtomicUsize, Ordering};

use bytes::Bytes;
use coresync_types::{BlobMetadata, BlobRef, ContentHash, CoreIdentity};
use tracing::debug;

use crate::error::StoreError;
use crate::traits::{BlobStore, DeleteOutcome};

#[derive(Default)]
struct CoreBlobs {
    metadata: Option<BlobMetadata>,
    blobs: HashMap<ContentHash, Bytes>,
}

/// In-memory object store backed by a `RwLock<HashMap>`.
///
/// Used by tests and by single-process setups where several nodes share one
/// store instance. Counts downloads so tests can assert that a pull only
/// fetched what it was missing.
#[derive(Default)]
pub struct MemoryBlobStore {
    cores: RwLock<HashMap<CoreIdentity, CoreBlobs>>,
    fetches: AtomicUsize,
}

impl MemoryBlobStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of successful [`fetch_file`](BlobStore::fetch_file) calls so far.
    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::Relaxed)
    }

    /// Replace a blob's bytes without checking its hash.
    ///
    /// Simulates bit rot or a torn upload in the remote store.
    pub fn overwrite_unchecked(&self, blob: &BlobRef, data: Bytes) {
        let mut cores = self.cores.write().expect("lock poisoned");
        cores
            .entry(blob.core.clone())
            .or_default()
            .blobs
            .insert(blob.hash, data);
    }
}

#[async_trait::async_trait]
impl BlobStore for MemoryBlobStore {
    async fn list_metadata(
        &self,
        core: &CoreIdentity,
    ) -> Result<Option<BlobMetadata>, StoreError> {
        let cores = self.cores.read().expect("lock poisoned");
        Ok(cores.get(core).and_then(|c| c.metadata.clone()))
    }

    async fn fetch_file(&self, blob: &BlobRef) -> Result<Bytes, StoreError> {
        let cores = self.cores.read().expect("lock poisoned");
        let data = cores
            .get(&blob.core)
            .and_then(|c| c.blobs.get(&blob.hash))
            .cloned()
            .ok_or_else(|| StoreError::BlobNotFound(blob.clone()))?;
        self.fetches.fetch_add(1, Ordering::Relaxed);
        Ok(data)
    }

    async fn put_file(&self, blob: &BlobRef, data: Bytes) -> Result<(), StoreError> {
        let mut cores = self.cores.write().expect("lock poisoned");
        debug!(%blob, size = data.len(), "storing blob in memory");
        cores
            .entry(blob.core.clone())
            .or_default()
            .blobs
            .insert(blob.hash, data);
        Ok(())
    }

    async fn put_metadata(&self, metadata: &BlobMetadata) -> Result<(), StoreError> {
        let mut cores = self.cores.write().expect("lock poisoned");
        debug!(core = %metadata.core, generation = %metadata.generation, "storing metadata in memory");
        cores.entry(metadata.core.clone()).or_default().metadata = Some(metadata.clone());
        Ok(())
    }

    async fn delete(&self, blob: &BlobRef) -> Result<DeleteOutcome, StoreError> {
        let mut cores = self.cores.write().expect("lock poisoned");
        let removed = cores
            .get_mut(&blob.core)
            .and_then(|c| c.blobs.remove(&blob.hash));
        Ok(match removed {
            Some(_) => {
                debug!(%blob, "deleted blob from memory");
                DeleteOutcome::Deleted
            }
            None => DeleteOutcome::NotFound,
        })
    }

    async fn list_blobs(&self, core: &CoreIdentity) -> Result<Vec<ContentHash>, StoreError> {
        let cores = self.cores.read().expect("lock poisoned");
        Ok(cores
            .get(core)
            .map(|c| c.blobs.keys().copied().collect())
            .unwrap_or_default())
    }
}
