//! In-memory local core backend.

use std::collections::{HashMap, HashSet};
use std::sync::RwLock;

use bytes::Bytes;
use coresync_types::{BlobMetadata, ContentHash, CoreIdentity, Generation, SegmentRef};
use tracing::debug;

use crate::error::StoreError;
use crate::traits::CoreStore;

#[derive(Default)]
struct LocalCore {
    active: Option<BlobMetadata>,
    files: HashMap<ContentHash, Bytes>,
}

/// Local cores held in memory.
///
/// Each core keeps its staged and active segment files in one map; the
/// active generation is a single `Option<BlobMetadata>` replaced under the
/// write lock, which is what makes [`apply_generation`](CoreStore::apply_generation)
/// atomic for readers.
#[derive(Default)]
pub struct MemoryCoreStore {
    cores: RwLock<HashMap<CoreIdentity, LocalCore>>,
}

impl MemoryCoreStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace a local file's bytes without touching its recorded hash.
    ///
    /// Simulates on-disk corruption of a staged or active segment.
    pub fn corrupt_file(&self, core: &CoreIdentity, hash: ContentHash, data: Bytes) {
        let mut cores = self.cores.write().expect("lock poisoned");
        cores.entry(core.clone()).or_default().files.insert(hash, data);
    }
}

#[async_trait::async_trait]
impl CoreStore for MemoryCoreStore {
    async fn local_generation(&self, core: &CoreIdentity) -> Result<Generation, StoreError> {
        let cores = self.cores.read().expect("lock poisoned");
        Ok(cores
            .get(core)
            .and_then(|c| c.active.as_ref())
            .map_or(Generation::ZERO, |md| md.generation))
    }

    async fn active_metadata(
        &self,
        core: &CoreIdentity,
    ) -> Result<Option<BlobMetadata>, StoreError> {
        let cores = self.cores.read().expect("lock poisoned");
        Ok(cores.get(core).and_then(|c| c.active.clone()))
    }

    async fn list_files(&self, core: &CoreIdentity) -> Result<Vec<ContentHash>, StoreError> {
        let cores = self.cores.read().expect("lock poisoned");
        Ok(cores
            .get(core)
            .map(|c| c.files.keys().copied().collect())
            .unwrap_or_default())
    }

    async fn write_file(
        &self,
        core: &CoreIdentity,
        segment: &SegmentRef,
        data: Bytes,
    ) -> Result<(), StoreError> {
        let mut cores = self.cores.write().expect("lock poisoned");
        debug!(%core, segment = %segment.name, size = data.len(), "staging segment in memory");
        cores
            .entry(core.clone())
            .or_default()
            .files
            .insert(segment.hash, data);
        Ok(())
    }

    async fn read_file(
        &self,
        core: &CoreIdentity,
        segment: &SegmentRef,
    ) -> Result<Option<Bytes>, StoreError> {
        let cores = self.cores.read().expect("lock poisoned");
        Ok(cores
            .get(core)
            .and_then(|c| c.files.get(&segment.hash))
            .cloned())
    }

    async fn verify_file(
        &self,
        core: &CoreIdentity,
        segment: &SegmentRef,
    ) -> Result<bool, StoreError> {
        let cores = self.cores.read().expect("lock poisoned");
        Ok(cores
            .get(core)
            .and_then(|c| c.files.get(&segment.hash))
            .is_some_and(|data| {
                data.len() as u64 == segment.size && ContentHash::from_data(data) == segment.hash
            }))
    }

    async fn apply_generation(&self, metadata: &BlobMetadata) -> Result<(), StoreError> {
        let mut cores = self.cores.write().expect("lock poisoned");
        let local = cores.entry(metadata.core.clone()).or_default();

        if let Some(missing) = metadata
            .segments
            .iter()
            .find(|s| !local.files.contains_key(&s.hash))
        {
            return Err(StoreError::SegmentMissing {
                core: metadata.core.clone(),
                hash: missing.hash,
            });
        }

        local.active = Some(metadata.clone());
        debug!(core = %metadata.core, generation = %metadata.generation, "applied generation");
        Ok(())
    }

    async fn prune_unreferenced(&self, core: &CoreIdentity) -> Result<usize, StoreError> {
        let mut cores = self.cores.write().expect("lock poisoned");
        let Some(local) = cores.get_mut(core) else {
            return Ok(0);
        };
        let Some(active) = &local.active else {
            return Ok(0);
        };
        let keep: HashSet<ContentHash> = active.segments.iter().map(|s| s.hash).collect();
        let before = local.files.len();
        local.files.retain(|hash, _| keep.contains(hash));
        let removed = before - local.files.len();
        if removed > 0 {
            debug!(%core, removed, "pruned unreferenced segments");
        }
        Ok(removed)
    }
}
