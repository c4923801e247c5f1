//! On-disk local core backend.
//!
//! Layout per core: `{base_dir}/{collection}/{shard}/{core}/segments/{hex}`
//! holds staged and active segment files, and `.../active` holds the
//! postcard-encoded [`BlobMetadata`] of the applied generation. Applying a
//! generation is a single atomic rename of `active`.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use bytes::Bytes;
use coresync_types::{BlobMetadata, ContentHash, CoreIdentity, Generation, SegmentRef};
use tracing::{debug, warn};

use crate::error::StoreError;
use crate::file_store::write_atomic;
use crate::traits::CoreStore;

/// Local cores stored under a directory on this node.
pub struct FileCoreStore {
    base_dir: PathBuf,
}

impl FileCoreStore {
    /// Create a store rooted at the given directory, creating it if needed.
    pub fn new(base_dir: impl AsRef<Path>) -> Result<Self, StoreError> {
        let base_dir = base_dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&base_dir)?;
        Ok(Self { base_dir })
    }

    fn core_dir(&self, core: &CoreIdentity) -> PathBuf {
        self.base_dir
            .join(core.collection())
            .join(core.shard())
            .join(core.core())
    }

    fn segments_dir(&self, core: &CoreIdentity) -> PathBuf {
        self.core_dir(core).join("segments")
    }

    fn segment_path(&self, core: &CoreIdentity, hash: &ContentHash) -> PathBuf {
        self.segments_dir(core).join(hash.to_string())
    }

    fn active_path(&self, core: &CoreIdentity) -> PathBuf {
        self.core_dir(core).join("active")
    }
}

#[async_trait::async_trait]
impl CoreStore for FileCoreStore {
    async fn local_generation(&self, core: &CoreIdentity) -> Result<Generation, StoreError> {
        Ok(self
            .active_metadata(core)
            .await?
            .map_or(Generation::ZERO, |md| md.generation))
    }

    async fn active_metadata(
        &self,
        core: &CoreIdentity,
    ) -> Result<Option<BlobMetadata>, StoreError> {
        match tokio::fs::read(self.active_path(core)).await {
            Ok(bytes) => Ok(Some(postcard::from_bytes(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StoreError::Io(e)),
        }
    }

    async fn list_files(&self, core: &CoreIdentity) -> Result<Vec<ContentHash>, StoreError> {
        let mut hashes = Vec::new();
        let mut dir = match tokio::fs::read_dir(self.segments_dir(core)).await {
            Ok(dir) => dir,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(hashes),
            Err(e) => return Err(StoreError::Io(e)),
        };
        while let Some(entry) = dir.next_entry().await? {
            // Leftover `.tmp` files from an interrupted write are skipped.
            if let Some(name) = entry.file_name().to_str()
                && let Ok(hash) = ContentHash::from_hex(name)
            {
                hashes.push(hash);
            }
        }
        Ok(hashes)
    }

    async fn write_file(
        &self,
        core: &CoreIdentity,
        segment: &SegmentRef,
        data: Bytes,
    ) -> Result<(), StoreError> {
        let path = self.segment_path(core, &segment.hash);
        write_atomic(&path, &data).await?;
        debug!(%core, segment = %segment.name, path = %path.display(), "staged segment file");
        Ok(())
    }

    async fn read_file(
        &self,
        core: &CoreIdentity,
        segment: &SegmentRef,
    ) -> Result<Option<Bytes>, StoreError> {
        match tokio::fs::read(self.segment_path(core, &segment.hash)).await {
            Ok(data) => Ok(Some(Bytes::from(data))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StoreError::Io(e)),
        }
    }

    async fn verify_file(
        &self,
        core: &CoreIdentity,
        segment: &SegmentRef,
    ) -> Result<bool, StoreError> {
        let Some(data) = self.read_file(core, segment).await? else {
            return Ok(false);
        };
        let ok = data.len() as u64 == segment.size && ContentHash::from_data(&data) == segment.hash;
        if !ok {
            warn!(%core, segment = %segment.name, "local segment failed verification");
        }
        Ok(ok)
    }

    async fn apply_generation(&self, metadata: &BlobMetadata) -> Result<(), StoreError> {
        for segment in &metadata.segments {
            let path = self.segment_path(&metadata.core, &segment.hash);
            if !tokio::fs::try_exists(&path).await? {
                return Err(StoreError::SegmentMissing {
                    core: metadata.core.clone(),
                    hash: segment.hash,
                });
            }
        }

        let bytes = postcard::to_allocvec(metadata)?;
        write_atomic(&self.active_path(&metadata.core), &bytes).await?;
        debug!(core = %metadata.core, generation = %metadata.generation, "applied generation");
        Ok(())
    }

    async fn prune_unreferenced(&self, core: &CoreIdentity) -> Result<usize, StoreError> {
        let Some(active) = self.active_metadata(core).await? else {
            return Ok(0);
        };
        let keep: HashSet<ContentHash> = active.segments.iter().map(|s| s.hash).collect();

        let mut removed = 0;
        for hash in self.list_files(core).await? {
            if keep.contains(&hash) {
                continue;
            }
            match tokio::fs::remove_file(self.segment_path(core, &hash)).await {
                Ok(()) => removed += 1,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(StoreError::Io(e)),
            }
        }
        if removed > 0 {
            debug!(%core, removed, "pruned unreferenced segments");
        }
        Ok(removed)
    }
}
