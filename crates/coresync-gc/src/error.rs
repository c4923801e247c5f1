//! Error types for the delete manager.

use coresync_store::StoreError;
use coresync_types::CoreIdentity;
use tokio::time::Duration;

/// Errors that can occur while sweeping one core.
///
/// A failed core is logged and retried on the next sweep; it never stops
/// the sweep of other cores.
#[derive(Debug, thiserror::Error)]
pub enum GcError {
    /// The object store failed.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// A store call exceeded the I/O timeout.
    #[error("{operation} for {core} timed out after {timeout:?}")]
    Timeout {
        /// Core being swept.
        core: CoreIdentity,
        /// The store call that timed out.
        operation: &'static str,
        /// The configured limit.
        timeout: Duration,
    },

    /// The store returned metadata recorded for a different core.
    #[error("metadata listed for {core} belongs to {found}")]
    MisfiledMetadata {
        /// Core being swept.
        core: CoreIdentity,
        /// Core named inside the returned metadata.
        found: CoreIdentity,
    },
}
