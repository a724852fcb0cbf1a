//! Server-side chunk storage and merge protocol.
//!
//! Chunks are keyed by `(FileHash, ChunkIndex)` and written idempotently, so
//! retries and concurrent uploaders of the same content never conflict. The
//! [`Merger`] assembles a complete chunk set into the final artifact at most
//! once per hash, and [`UploadService`] exposes the fixed set of operations a
//! transport proxies for remote clients.
//!
//! Storage media are pluggable through [`ChunkStore`]; [`MemoryChunkStore`]
//! and [`FsChunkStore`] ship with the crate.

mod filesystem;
mod memory;
mod merger;
mod service;
mod store;

use chunkflow_protocol::{ChunkIndex, FileHash};

pub use filesystem::FsChunkStore;
pub use memory::MemoryChunkStore;
pub use merger::{MergeOutcome, Merger};
pub use service::UploadService;
pub use store::{ArtifactWriter, ChunkStore, StoreFuture};

/// Errors produced by chunk stores and the merge protocol.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("storage write failed: {source}")]
    StorageWrite { source: std::io::Error },

    #[error("storage read failed: {source}")]
    StorageRead { source: std::io::Error },

    #[error("chunk {index} of {file_hash} not found")]
    ChunkNotFound { file_hash: FileHash, index: ChunkIndex },

    #[error("upload {file_hash} is incomplete, missing chunks {missing:?}")]
    IncompleteUpload {
        file_hash: FileHash,
        missing: Vec<ChunkIndex>,
    },

    #[error("checksum mismatch for chunk {index}")]
    ChecksumMismatch { index: ChunkIndex },

    #[error("merged content hashes to {actual}, expected {expected}")]
    HashMismatch { expected: FileHash, actual: FileHash },
}

impl StoreError {
    pub(crate) fn write(source: std::io::Error) -> Self {
        StoreError::StorageWrite { source }
    }

    pub(crate) fn read(source: std::io::Error) -> Self {
        StoreError::StorageRead { source }
    }
}
