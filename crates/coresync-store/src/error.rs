//! Error types for storage operations.

use coresync_types::{BlobRef, ContentHash, CoreIdentity};

/// Errors that can occur while talking to a blob store or a local core.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The requested blob does not exist in the object store.
    #[error("blob not found: {0}")]
    BlobNotFound(BlobRef),

    /// A generation referenced a segment that is not present locally.
    #[error("segment {hash} missing from local core {core}")]
    SegmentMissing {
        /// The core being applied.
        core: CoreIdentity,
        /// The absent segment.
        hash: ContentHash,
    },

    /// Data does not match its content hash.
    #[error("corrupt blob: expected {expected}, actual hash {actual}")]
    Corrupt {
        /// The hash that was requested.
        expected: ContentHash,
        /// The hash of the data actually read.
        actual: ContentHash,
    },

    /// The backend is unreachable or refused the request.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// An I/O error occurred.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Metadata could not be encoded or decoded.
    #[error("serialization error: {0}")]
    Serde(#[from] postcard::Error),
}
