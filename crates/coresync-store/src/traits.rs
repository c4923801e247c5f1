//! Core traits for remote and local storage.

use bytes::Bytes;
use coresync_types::{BlobMetadata, BlobRef, ContentHash, CoreIdentity, Generation, SegmentRef};

use crate::error::StoreError;

/// Result of deleting a blob.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
    /// The blob existed and was removed.
    Deleted,
    /// The blob was already gone.
    NotFound,
}

/// Client of the remote object store holding authoritative cores.
///
/// All implementations must be `Send + Sync` for use across async tasks.
/// File payloads travel as [`Bytes`] so they can be handed between the
/// store and the local core without copying.
#[async_trait::async_trait]
pub trait BlobStore: Send + Sync {
    /// Read the latest metadata of a core, or `None` if it was never pushed.
    async fn list_metadata(&self, core: &CoreIdentity)
    -> Result<Option<BlobMetadata>, StoreError>;

    /// Download one segment blob.
    async fn fetch_file(&self, blob: &BlobRef) -> Result<Bytes, StoreError>;

    /// Upload one segment blob.
    async fn put_file(&self, blob: &BlobRef, data: Bytes) -> Result<(), StoreError>;

    /// Publish metadata, replacing the core's previous metadata.
    async fn put_metadata(&self, metadata: &BlobMetadata) -> Result<(), StoreError>;

    /// Remove a segment blob.
    async fn delete(&self, blob: &BlobRef) -> Result<DeleteOutcome, StoreError>;

    /// List the content hashes of every blob stored for a core.
    async fn list_blobs(&self, core: &CoreIdentity) -> Result<Vec<ContentHash>, StoreError>;
}

/// The local index engine's on-disk cores, as seen by the sync engine.
///
/// Query threads read the active generation concurrently, so
/// [`apply_generation`](CoreStore::apply_generation) must swap the active
/// pointer atomically: readers see either the old or the new generation,
/// never a mix.
#[async_trait::async_trait]
pub trait CoreStore: Send + Sync {
    /// Generation currently served by the core, or [`Generation::ZERO`].
    async fn local_generation(&self, core: &CoreIdentity) -> Result<Generation, StoreError>;

    /// Metadata of the active generation, listing its segment files.
    async fn active_metadata(
        &self,
        core: &CoreIdentity,
    ) -> Result<Option<BlobMetadata>, StoreError>;

    /// Content hashes of every segment file present locally, active or staged.
    async fn list_files(&self, core: &CoreIdentity) -> Result<Vec<ContentHash>, StoreError>;

    /// Stage a segment file. Staged files are invisible until applied.
    async fn write_file(
        &self,
        core: &CoreIdentity,
        segment: &SegmentRef,
        data: Bytes,
    ) -> Result<(), StoreError>;

    /// Read a segment file, or `None` if it is not present.
    async fn read_file(
        &self,
        core: &CoreIdentity,
        segment: &SegmentRef,
    ) -> Result<Option<Bytes>, StoreError>;

    /// Check that a segment file is present, readable, and matches its hash.
    async fn verify_file(
        &self,
        core: &CoreIdentity,
        segment: &SegmentRef,
    ) -> Result<bool, StoreError>;

    /// Atomically make `metadata` the core's active generation.
    ///
    /// Fails with [`StoreError::SegmentMissing`] if any referenced file is
    /// absent, leaving the previous generation active.
    async fn apply_generation(&self, metadata: &BlobMetadata) -> Result<(), StoreError>;

    /// Remove local segment files the active generation does not reference.
    ///
    /// Returns the number of files removed. A core with no active generation
    /// is left untouched. Readers holding a file open keep their handle.
    async fn prune_unreferenced(&self, core: &CoreIdentity) -> Result<usize, StoreError>;
}
