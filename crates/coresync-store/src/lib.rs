//! Storage collaborators of the sync engine.
//!
//! This crate defines the two storage seams the synchronization engine talks
//! through, along with concrete backends for each:
//!
//! - [`BlobStore`]: the remote object store holding the authoritative copy
//!   of every core. Backends: [`MemoryBlobStore`], [`FileBlobStore`], and the
//!   fault-injecting [`FlakyStore`] wrapper.
//! - [`CoreStore`]: the local index engine's view of on-disk cores. Backends:
//!   [`MemoryCoreStore`] and [`FileCoreStore`].

mod error;
mod file_core;
mod file_store;
mod flaky_store;
mod memory_core;
mod memory_store;
mod traits;

pub use error::StoreError;
pub use file_core::FileCoreStore;
pub use file_store::FileBlobStore;
pub use flaky_store::FlakyStore;
pub use memory_core::MemoryCoreStore;
pub use memory_store::MemoryBlobStore;
pub use traits::{BlobStore, CoreStore, DeleteOutcome};
