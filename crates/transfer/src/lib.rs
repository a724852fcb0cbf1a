//! Content hashing, chunk slicing and progress sampling.
//!
//! Everything here is transport-agnostic: the uploader uses it to hash a
//! source file and read chunks by index, the chunk store uses the streaming
//! hasher to verify merged artifacts.

mod chunked;
mod progress;
mod types;

pub use chunked::{
    ChunkReader, ContentHasher, checksum_bytes, hash_file, hash_reader, verify_checksum,
};
pub use progress::ProgressThrottle;
pub use types::{Chunk, ChunkPlan};

/// Default chunk size: 4 MiB.
pub const DEFAULT_CHUNK_SIZE: u64 = 4 * 1024 * 1024;

/// Errors produced by the transfer crate.
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("checksum mismatch")]
    ChecksumMismatch,

    #[error("chunk size must be greater than zero")]
    InvalidChunkSize,

    #[error("chunk {index} out of range (chunk count {chunk_count})")]
    ChunkOutOfRange { index: u64, chunk_count: u64 },
}
