//! One pull of one core: fetch what changed, verify it, swap it in.

use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;

use bytes::Bytes;
use coresync_gc::DeleteManager;
use coresync_lease::{ConcurrencyController, Lease};
use coresync_store::{BlobStore, CoreStore, StoreError};
use coresync_types::{BlobMetadata, BlobRef, ContentHash, CoreIdentity, Generation, SegmentRef};
use tokio::time::Duration;
use tracing::{debug, info, warn};

use crate::error::PullError;

/// What a successful pull did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PullReport {
    /// The core was never pushed; there is nothing to pull.
    NoRemote,
    /// The local core was already at or past the remote generation.
    UpToDate {
        /// The local generation.
        generation: Generation,
    },
    /// A newer generation was downloaded and made active.
    Applied {
        /// The generation now active.
        generation: Generation,
        /// Segment files downloaded.
        fetched_files: usize,
    },
}

impl PullReport {
    /// Local generation after the pull.
    pub fn generation(&self) -> Generation {
        match self {
            PullReport::NoRemote => Generation::ZERO,
            PullReport::UpToDate { generation } | PullReport::Applied { generation, .. } => {
                *generation
            }
        }
    }

    /// Segment files downloaded.
    pub fn fetched_files(&self) -> usize {
        match self {
            PullReport::Applied { fetched_files, .. } => *fetched_files,
            _ => 0,
        }
    }
}

/// Brings a local core up to the remote generation.
///
/// Only segments absent locally are downloaded. Every downloaded file is
/// checked against its hash and size before it is staged, and the new
/// generation becomes visible only after every referenced file verifies.
/// With a [`DeleteManager`] attached, every applied generation reports the
/// one it replaced so superseded blobs get scheduled on reader nodes too.
pub struct CorePuller {
    blobs: Arc<dyn BlobStore>,
    local: Arc<dyn CoreStore>,
    controller: Arc<ConcurrencyController>,
    fetch_timeout: Duration,
    delete_manager: Option<Arc<DeleteManager>>,
}

impl CorePuller {
    /// Create a puller. `fetch_timeout` bounds every individual store call.
    pub fn new(
        blobs: Arc<dyn BlobStore>,
        local: Arc<dyn CoreStore>,
        controller: Arc<ConcurrencyController>,
        fetch_timeout: Duration,
    ) -> Self {
        Self {
            blobs,
            local,
            controller,
            fetch_timeout,
            delete_manager: None,
        }
    }

    /// Report observed and superseded generations to `delete_manager`.
    pub fn with_delete_manager(mut self, delete_manager: Arc<DeleteManager>) -> Self {
        self.delete_manager = Some(delete_manager);
        self
    }

    /// Pull the leased core.
    ///
    /// The caller must hold `lease` for the whole call; the remote
    /// generation seen here is recorded on it for staleness detection.
    #[tracing::instrument(skip(self, lease), fields(core = %lease.core()))]
    pub async fn pull(&self, lease: &mut Lease) -> Result<PullReport, PullError> {
        let core = lease.core().clone();

        let Some(remote) = self
            .timed(&core, "list_metadata", self.blobs.list_metadata(&core))
            .await?
        else {
            debug!("no remote metadata, nothing to pull");
            return Ok(PullReport::NoRemote);
        };
        if remote.core != core {
            return Err(PullError::Verification {
                core,
                segment: "metadata".into(),
                reason: format!("metadata belongs to {}", remote.core),
            });
        }
        self.controller.observe_generation(&core, remote.generation);
        lease.observe(remote.generation);

        let local_generation = self
            .timed(&core, "local_generation", self.local.local_generation(&core))
            .await?;
        if local_generation >= remote.generation {
            debug!(local = %local_generation, remote = %remote.generation, "already up to date");
            if let Some(gc) = &self.delete_manager {
                gc.observe_metadata(&remote);
            }
            return Ok(PullReport::UpToDate {
                generation: local_generation,
            });
        }

        let present: HashSet<ContentHash> = self
            .timed(&core, "list_files", self.local.list_files(&core))
            .await?
            .into_iter()
            .collect();

        let mut fetched = HashSet::new();
        for segment in &remote.segments {
            if present.contains(&segment.hash) || fetched.contains(&segment.hash) {
                continue;
            }
            self.fetch_and_stage(&core, segment).await?;
            fetched.insert(segment.hash);
        }

        self.verify_all(&remote, &mut fetched).await?;

        let previous = self
            .timed(&core, "active_metadata", self.local.active_metadata(&core))
            .await?;
        self.timed(&core, "apply_generation", self.local.apply_generation(&remote))
            .await?;

        if let Some(gc) = &self.delete_manager {
            match &previous {
                Some(old) => {
                    gc.on_superseded(old, &remote);
                }
                None => gc.observe_metadata(&remote),
            }
        }
        match self.local.prune_unreferenced(&core).await {
            Ok(0) => {}
            Ok(pruned) => debug!(pruned, "removed superseded local segments"),
            Err(e) => warn!(error = %e, "failed to prune superseded local segments"),
        }

        info!(
            from = %local_generation,
            to = %remote.generation,
            fetched_files = fetched.len(),
            "pulled new generation"
        );
        Ok(PullReport::Applied {
            generation: remote.generation,
            fetched_files: fetched.len(),
        })
    }

    /// Verify every segment of `remote`. A local file that fails is
    /// downloaded again once; a second failure aborts the pull.
    async fn verify_all(
        &self,
        remote: &BlobMetadata,
        fetched: &mut HashSet<ContentHash>,
    ) -> Result<(), PullError> {
        let core = &remote.core;
        for segment in &remote.segments {
            if self
                .timed(core, "verify_file", self.local.verify_file(core, segment))
                .await?
            {
                continue;
            }

            warn!(%core, segment = %segment.name, "local segment unreadable or corrupt, fetching again");
            self.fetch_and_stage(core, segment).await?;
            fetched.insert(segment.hash);

            if !self
                .timed(core, "verify_file", self.local.verify_file(core, segment))
                .await?
            {
                return Err(PullError::Verification {
                    core: core.clone(),
                    segment: segment.name.clone(),
                    reason: "staged file does not match its hash".into(),
                });
            }
        }
        Ok(())
    }

    async fn fetch_and_stage(
        &self,
        core: &CoreIdentity,
        segment: &SegmentRef,
    ) -> Result<(), PullError> {
        let blob = BlobRef::new(core.clone(), segment.hash);
        let data = self
            .timed(core, "fetch_file", self.blobs.fetch_file(&blob))
            .await?;
        check_segment(core, segment, &data)?;
        self.timed(core, "write_file", self.local.write_file(core, segment, data))
            .await?;
        debug!(%core, segment = %segment.name, size = segment.size, "segment staged");
        Ok(())
    }

    async fn timed<T>(
        &self,
        core: &CoreIdentity,
        operation: &'static str,
        call: impl Future<Output = Result<T, StoreError>>,
    ) -> Result<T, PullError> {
        match tokio::time::timeout(self.fetch_timeout, call).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(PullError::Timeout {
                core: core.clone(),
                operation,
                timeout: self.fetch_timeout,
            }),
        }
    }
}

/// Check downloaded bytes against the segment's size and hash.
fn check_segment(core: &CoreIdentity, segment: &SegmentRef, data: &Bytes) -> Result<(), PullError> {
    if data.len() as u64 != segment.size {
        return Err(PullError::Verification {
            core: core.clone(),
            segment: segment.name.clone(),
            reason: format!("expected {} bytes, got {}", segment.size, data.len()),
        });
    }
    let actual = ContentHash::from_data(data);
    if actual != segment.hash {
        return Err(PullError::Store(StoreError::Corrupt {
            expected: segment.hash,
            actual,
        }));
    }
    Ok(())
}
