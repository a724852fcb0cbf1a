//! Shared types for chunked, content-addressed uploads.
//!
//! Both sides of an upload speak in terms of these types: the client-side
//! orchestrator publishes [`SessionSnapshot`]s, the server-side store keys
//! chunks by [`FileHash`] and [`ChunkIndex`], and a transport carries the
//! payloads in [`messages`] between them.

pub mod messages;
pub mod types;

pub use messages::{MergeRequest, UploadChunkRequest};
pub use types::{ChunkIndex, ErrorKind, FileHash, SessionError, SessionSnapshot, UploadState};

/// Errors produced when decoding protocol values.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("invalid file hash: {0}")]
    InvalidFileHash(String),
}
