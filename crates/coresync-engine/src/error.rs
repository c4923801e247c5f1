//! Error types for the engine.

use coresync_types::CoreIdentity;
use tokio::time::Duration;

/// Errors that can occur during engine operations.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// The object store or the local core failed.
    #[error("store error: {0}")]
    Store(#[from] coresync_store::StoreError),

    /// The pull subsystem failed.
    #[error("pull error: {0}")]
    Pull(#[from] coresync_puller::PullError),

    /// A store call exceeded the I/O timeout.
    #[error("{operation} for {core} timed out after {timeout:?}")]
    Timeout {
        /// Core being operated on.
        core: CoreIdentity,
        /// The store call that timed out.
        operation: &'static str,
        /// The configured limit.
        timeout: Duration,
    },

    /// The pull worker was queried before it was ever started.
    #[error("sync worker not initialized: call start() first")]
    NotInitialized,

    /// A push was given no files.
    #[error("refusing to push an empty generation of {0}")]
    EmptyPush(CoreIdentity),
}

impl EngineError {
    /// Map the lifecycle's uninitialized error onto [`EngineError::NotInitialized`].
    pub(crate) fn from_pull(e: coresync_puller::PullError) -> Self {
        match e {
            coresync_puller::PullError::NotInitialized => EngineError::NotInitialized,
            other => EngineError::Pull(other),
        }
    }
}
