//! Write path: publish a new generation of a core to the object store.

use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;

use bytes::Bytes;
use coresync_gc::DeleteManager;
use coresync_lease::{ConcurrencyController, Lease, LeaseGrant, LeaseKind};
use coresync_store::{BlobStore, CoreStore, StoreError};
use coresync_types::events::{CorePushed, EventBus};
use coresync_types::{BlobMetadata, BlobRef, ContentHash, CoreIdentity, Generation, SegmentRef, SyncConfig};
use tokio::time::Duration;
use tracing::{debug, info, warn};

use crate::error::EngineError;

/// What a push did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    /// A new generation was published.
    Pushed {
        /// The generation created.
        generation: Generation,
        /// Blobs uploaded; blobs already stored remotely are skipped.
        uploaded_files: usize,
    },
    /// The files are identical to the current remote generation.
    Unchanged {
        /// The current remote generation.
        generation: Generation,
    },
    /// Another lease held the core for the whole acquisition timeout.
    Contended {
        /// Kind of the lease in the way.
        held_by: LeaseKind,
    },
}

/// Publishes new generations under a push lease.
///
/// Steps, all under the core's lease:
/// 1. Read the current remote metadata.
/// 2. Upload segments whose hash is not stored remotely yet.
/// 3. Write metadata at the next generation.
/// 4. Make the same generation active locally, so this node does not pull
///    back what it just pushed.
/// 5. Hand the superseded generation to the delete manager.
pub struct CorePusher {
    blobs: Arc<dyn BlobStore>,
    local: Arc<dyn CoreStore>,
    controller: Arc<ConcurrencyController>,
    delete_manager: Arc<DeleteManager>,
    lease_timeout: Duration,
    io_timeout: Duration,
    holder: String,
    events: EventBus,
}

impl CorePusher {
    /// Create a pusher over shared handles.
    pub fn new(
        config: &SyncConfig,
        blobs: Arc<dyn BlobStore>,
        local: Arc<dyn CoreStore>,
        controller: Arc<ConcurrencyController>,
        delete_manager: Arc<DeleteManager>,
        events: EventBus,
    ) -> Self {
        Self {
            blobs,
            local,
            controller,
            delete_manager,
            lease_timeout: config.lease_timeout,
            io_timeout: config.fetch_timeout,
            holder: config.holder.clone(),
            events,
        }
    }

    /// Publish `files` (name and contents) as the next generation of `core`.
    #[tracing::instrument(skip(self, files), fields(files = files.len()))]
    pub async fn push(
        &self,
        core: &CoreIdentity,
        files: Vec<(String, Bytes)>,
    ) -> Result<PushOutcome, EngineError> {
        if files.is_empty() {
            return Err(EngineError::EmptyPush(core.clone()));
        }

        let mut lease = match self
            .controller
            .acquire_push_lease(core, &self.holder, self.lease_timeout)
            .await
        {
            LeaseGrant::Acquired(lease) => lease,
            LeaseGrant::TimedOut { held_by } => {
                debug!(%core, %held_by, "push lease contended");
                return Ok(PushOutcome::Contended { held_by });
            }
        };

        let result = self.push_leased(&mut lease, files).await;
        self.controller.release(lease);
        result
    }

    async fn push_leased(
        &self,
        lease: &mut Lease,
        files: Vec<(String, Bytes)>,
    ) -> Result<PushOutcome, EngineError> {
        let core = lease.core().clone();

        let previous = self
            .timed(&core, "list_metadata", self.blobs.list_metadata(&core))
            .await?;

        let segments: Vec<SegmentRef> = files
            .iter()
            .map(|(name, data)| SegmentRef::for_data(name.clone(), data))
            .collect();

        if let Some(prev) = &previous
            && prev.segments == segments
        {
            debug!(%core, generation = %prev.generation, "push is identical to remote, skipping");
            return Ok(PushOutcome::Unchanged {
                generation: prev.generation,
            });
        }

        let stored: HashSet<ContentHash> = self
            .timed(&core, "list_blobs", self.blobs.list_blobs(&core))
            .await?
            .into_iter()
            .collect();
        let present_locally: HashSet<ContentHash> = self
            .timed(&core, "list_files", self.local.list_files(&core))
            .await?
            .into_iter()
            .collect();

        let mut uploaded = HashSet::new();
        for (segment, (_, data)) in segments.iter().zip(&files) {
            if !stored.contains(&segment.hash) && uploaded.insert(segment.hash) {
                let blob = BlobRef::new(core.clone(), segment.hash);
                self.timed(&core, "put_file", self.blobs.put_file(&blob, data.clone()))
                    .await?;
            }
            if !present_locally.contains(&segment.hash) {
                self.timed(
                    &core,
                    "write_file",
                    self.local.write_file(&core, segment, data.clone()),
                )
                .await?;
            }
        }

        let generation = previous
            .as_ref()
            .map_or(Generation::ZERO, |md| md.generation)
            .next();
        let metadata = BlobMetadata {
            core: core.clone(),
            generation,
            segments,
        };
        self.timed(&core, "put_metadata", self.blobs.put_metadata(&metadata))
            .await?;
        self.controller.observe_generation(&core, generation);
        lease.observe(generation);

        self.timed(&core, "apply_generation", self.local.apply_generation(&metadata))
            .await?;
        if let Err(e) = self.local.prune_unreferenced(&core).await {
            warn!(%core, error = %e, "failed to prune superseded local segments");
        }

        match &previous {
            Some(prev) => {
                self.delete_manager.on_superseded(prev, &metadata);
            }
            None => self.delete_manager.observe_metadata(&metadata),
        }

        info!(%core, %generation, uploaded_files = uploaded.len(), "pushed new generation");
        self.events.emit(CorePushed {
            core,
            generation,
            uploaded_files: uploaded.len(),
        });
        Ok(PushOutcome::Pushed {
            generation,
            uploaded_files: uploaded.len(),
        })
    }

    async fn timed<T>(
        &self,
        core: &CoreIdentity,
        operation: &'static str,
        call: impl Future<Output = Result<T, StoreError>>,
    ) -> Result<T, EngineError> {
        match tokio::time::timeout(self.io_timeout, call).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(EngineError::Timeout {
                core: core.clone(),
                operation,
                timeout: self.io_timeout,
            }),
        }
    }
}
