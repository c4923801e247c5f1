//! File-based object store backend.
//!
//! Layout per core: `{base_dir}/{collection}/{shard}/{core}/metadata` holds
//! the postcard-encoded latest [`BlobMetadata`], and segment blobs live at
//! `{...}/blobs/{hex[0..2]}/{hex}`.

use std::path::{Path, PathBuf};

use bytes::Bytes;
use coresync_types::{BlobMetadata, BlobRef, ContentHash, CoreIdentity};
use tracing::{debug, error};

use crate::error::StoreError;
use crate::traits::{BlobStore, DeleteOutcome};

/// Object store rooted in a local (or network-mounted) directory.
///
/// Writes are atomic: data goes to a temporary file first and is then
/// renamed into place, so a reader never observes a half-written blob or
/// metadata file. Reads re-hash blob contents and refuse corrupt data.
pub struct FileBlobStore {
    base_dir: PathBuf,
}

impl FileBlobStore {
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

    fn metadata_path(&self, core: &CoreIdentity) -> PathBuf {
        self.core_dir(core).join("metadata")
    }

    fn blobs_dir(&self, core: &CoreIdentity) -> PathBuf {
        self.core_dir(core).join("blobs")
    }

    fn blob_path(&self, blob: &BlobRef) -> PathBuf {
        let hex = blob.hash.to_string();
        self.blobs_dir(&blob.core).join(&hex[0..2]).join(&hex)
    }
}

/// Write `data` to `path` through a sibling temp file and a rename.
pub(crate) async fn write_atomic(path: &Path, data: &[u8]) -> Result<(), StoreError> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let tmp_path = path.with_extension("tmp");
    tokio::fs::write(&tmp_path, data).await?;
    tokio::fs::rename(&tmp_path, path).await?;
    Ok(())
}

#[async_trait::async_trait]
impl BlobStore for FileBlobStore {
    async fn list_metadata(
        &self,
        core: &CoreIdentity,
    ) -> Result<Option<BlobMetadata>, StoreError> {
        match tokio::fs::read(self.metadata_path(core)).await {
            Ok(bytes) => Ok(Some(postcard::from_bytes(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StoreError::Io(e)),
        }
    }

    async fn fetch_file(&self, blob: &BlobRef) -> Result<Bytes, StoreError> {
        let path = self.blob_path(blob);
        match tokio::fs::read(&path).await {
            Ok(data) => {
                let actual = ContentHash::from_data(&data);
                if actual != blob.hash {
                    error!(%blob, %actual, "blob corruption detected on read");
                    return Err(StoreError::Corrupt {
                        expected: blob.hash,
                        actual,
                    });
                }
                Ok(Bytes::from(data))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StoreError::BlobNotFound(blob.clone()))
            }
            Err(e) => Err(StoreError::Io(e)),
        }
    }

    async fn put_file(&self, blob: &BlobRef, data: Bytes) -> Result<(), StoreError> {
        let path = self.blob_path(blob);
        write_atomic(&path, &data).await?;
        debug!(%blob, path = %path.display(), size = data.len(), "stored blob to file");
        Ok(())
    }

    async fn put_metadata(&self, metadata: &BlobMetadata) -> Result<(), StoreError> {
        let bytes = postcard::to_allocvec(metadata)?;
        write_atomic(&self.metadata_path(&metadata.core), &bytes).await?;
        debug!(core = %metadata.core, generation = %metadata.generation, "stored metadata to file");
        Ok(())
    }

    async fn delete(&self, blob: &BlobRef) -> Result<DeleteOutcome, StoreError> {
        match tokio::fs::remove_file(self.blob_path(blob)).await {
            Ok(()) => {
                debug!(%blob, "deleted blob file");
                Ok(DeleteOutcome::Deleted)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(DeleteOutcome::NotFound),
            Err(e) => Err(StoreError::Io(e)),
        }
    }

    async fn list_blobs(&self, core: &CoreIdentity) -> Result<Vec<ContentHash>, StoreError> {
        let mut hashes = Vec::new();

        let mut fanout = match tokio::fs::read_dir(self.blobs_dir(core)).await {
            Ok(dir) => dir,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(hashes),
            Err(e) => return Err(StoreError::Io(e)),
        };
        while let Some(bucket) = fanout.next_entry().await? {
            if !bucket.file_type().await?.is_dir() {
                continue;
            }
            let mut files = tokio::fs::read_dir(bucket.path()).await?;
            while let Some(entry) = files.next_entry().await? {
                if let Some(name) = entry.file_name().to_str()
                    && let Ok(hash) = ContentHash::from_hex(name)
                {
                    hashes.push(hash);
                }
            }
        }
        Ok(hashes)
    }
}
