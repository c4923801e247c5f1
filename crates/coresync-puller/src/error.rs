//! Error types for pull operations.

use coresync_store::StoreError;
use coresync_types::CoreIdentity;
use tokio::time::Duration;

/// How the retry policy treats a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Network or availability trouble; retry after backoff.
    Transient,
    /// Data did not match its hash or a file went missing; retry, but never apply it.
    Corruption,
    /// Retrying cannot help.
    Fatal,
}

/// Errors that can occur while pulling a core or managing the worker.
#[derive(Debug, thiserror::Error)]
pub enum PullError {
    /// The object store or the local core failed.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// A store call exceeded the per-request I/O timeout.
    #[error("{operation} for {core} timed out after {timeout:?}")]
    Timeout {
        /// Core being pulled.
        core: CoreIdentity,
        /// The store call that timed out.
        operation: &'static str,
        /// The configured limit.
        timeout: Duration,
    },

    /// A fetched or staged segment did not match the metadata.
    #[error("segment {segment} of {core} failed verification: {reason}")]
    Verification {
        /// Core being pulled.
        core: CoreIdentity,
        /// File name of the segment.
        segment: String,
        /// What did not match.
        reason: String,
    },

    /// The feeder was queried before it was ever started.
    #[error("pull feeder has not been started")]
    NotInitialized,

    /// The feeder task panicked or was aborted.
    #[error("pull feeder worker failed: {0}")]
    Worker(String),
}

impl PullError {
    /// Classify this error for the retry policy.
    pub fn kind(&self) -> FailureKind {
        match self {
            PullError::Store(
                StoreError::Corrupt { .. } | StoreError::SegmentMissing { .. } | StoreError::Serde(_),
            )
            | PullError::Verification { .. } => FailureKind::Corruption,
            PullError::Store(_) | PullError::Timeout { .. } => FailureKind::Transient,
            PullError::NotInitialized | PullError::Worker(_) => FailureKind::Fatal,
        }
    }
}
