//! Upload error types.

use chunkflow_chunk_store::StoreError;
use chunkflow_protocol::{ChunkIndex, ErrorKind, SessionError, UploadState};
use chunkflow_transfer::TransferError;

/// Errors produced by an upload session.
#[derive(Debug, thiserror::Error)]
pub enum UploadError {
    /// The source file could not be read or hashed.
    #[error("hash computation failed: {0}")]
    HashComputation(String),

    #[error("storage write failed: {0}")]
    StorageWrite(String),

    #[error("storage read failed: {0}")]
    StorageRead(String),

    #[error("upload incomplete, missing chunks {missing:?}")]
    IncompleteUpload { missing: Vec<ChunkIndex> },

    #[error("transfer failed: {0}")]
    Transfer(String),

    #[error("cannot {operation} while {state}")]
    SessionState {
        operation: &'static str,
        state: UploadState,
    },

    #[error("merged content does not match file hash: {0}")]
    HashMismatch(String),

    /// The backend refused the request and retrying will not help.
    #[error("rejected: {0}")]
    Rejected(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("cancelled")]
    Cancelled,
}

impl UploadError {
    /// Returns `true` if a chunk upload failing with this error may be retried.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            UploadError::Transfer(_) | UploadError::StorageWrite(_) | UploadError::StorageRead(_)
        )
    }

    /// Category surfaced through the session error signal.
    pub fn kind(&self) -> ErrorKind {
        match self {
            UploadError::HashComputation(_) => ErrorKind::HashComputation,
            UploadError::StorageWrite(_) => ErrorKind::StorageWrite,
            UploadError::StorageRead(_) => ErrorKind::StorageRead,
            UploadError::IncompleteUpload { .. } => ErrorKind::IncompleteUpload,
            UploadError::Transfer(_) => ErrorKind::Transfer,
            UploadError::SessionState { .. } => ErrorKind::SessionState,
            UploadError::HashMismatch(_) => ErrorKind::HashMismatch,
            UploadError::Rejected(_) | UploadError::InvalidConfig(_) => ErrorKind::Rejected,
            UploadError::Cancelled => ErrorKind::Cancelled,
        }
    }

    pub fn to_session_error(&self) -> SessionError {
        SessionError {
            kind: self.kind(),
            message: self.to_string(),
        }
    }
}

impl From<StoreError> for UploadError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::StorageWrite { .. } => UploadError::StorageWrite(e.to_string()),
            StoreError::ChecksumMismatch { .. } => UploadError::Transfer(e.to_string()),
            StoreError::IncompleteUpload { missing, .. } => {
                UploadError::IncompleteUpload { missing }
            }
            StoreError::ChunkNotFound { index, .. } => UploadError::IncompleteUpload {
                missing: vec![index],
            },
            StoreError::HashMismatch { .. } => UploadError::HashMismatch(e.to_string()),
            StoreError::StorageRead { .. } => UploadError::StorageRead(e.to_string()),
        }
    }
}

impl From<TransferError> for UploadError {
    fn from(e: TransferError) -> Self {
        UploadError::HashComputation(e.to_string())
    }
}
