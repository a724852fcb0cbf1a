use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::ProtocolError;

/// Zero-based position of a chunk within a file.
pub type ChunkIndex = u64;

/// Content digest identifying a logical upload.
///
/// Always 64 lowercase hex characters (SHA-256). Because the value is used to
/// build storage keys, parsing rejects anything else, including path
/// separators and `..`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct FileHash(String);

impl FileHash {
    /// Length of the hex-encoded digest.
    pub const HEX_LEN: usize = 64;

    /// Parses and normalizes a hex digest (uppercase input is accepted).
    pub fn parse(value: &str) -> Result<Self, ProtocolError> {
        if value.is_empty() {
            return Err(ProtocolError::InvalidFileHash("empty hash".into()));
        }
        if value.len() != Self::HEX_LEN {
            return Err(ProtocolError::InvalidFileHash(format!(
                "expected {} hex characters, got {}: {value}",
                Self::HEX_LEN,
                value.len()
            )));
        }
        if !value.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(ProtocolError::InvalidFileHash(format!(
                "non-hex character in hash: {value}"
            )));
        }
        Ok(Self(value.to_ascii_lowercase()))
    }

    /// Builds a hash from a raw SHA-256 digest.
    pub fn from_digest(digest: [u8; 32]) -> Self {
        Self(hex::encode(digest))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First 12 characters, for log lines.
    pub fn short(&self) -> &str {
        &self.0[..12]
    }
}

impl fmt::Display for FileHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for FileHash {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for FileHash {
    type Error = ProtocolError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<FileHash> for String {
    fn from(hash: FileHash) -> Self {
        hash.0
    }
}

/// Upload session state as observed by the UI.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UploadState {
    #[default]
    Default,
    CalculatingHash,
    FastUploaded,
    WaitForUpload,
    Uploading,
    UploadStopped,
    UploadSuccessfully,
    Error,
}

impl UploadState {
    /// Returns `true` once the session can make no further progress on its own.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            UploadState::FastUploaded | UploadState::UploadSuccessfully | UploadState::Error
        )
    }

    /// Returns `true` for the states that may escalate to [`UploadState::Error`].
    pub fn is_active(self) -> bool {
        matches!(
            self,
            UploadState::CalculatingHash
                | UploadState::WaitForUpload
                | UploadState::Uploading
                | UploadState::UploadStopped
        )
    }
}

impl fmt::Display for UploadState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            UploadState::Default => "default",
            UploadState::CalculatingHash => "calculating_hash",
            UploadState::FastUploaded => "fast_uploaded",
            UploadState::WaitForUpload => "wait_for_upload",
            UploadState::Uploading => "uploading",
            UploadState::UploadStopped => "upload_stopped",
            UploadState::UploadSuccessfully => "upload_successfully",
            UploadState::Error => "error",
        };
        f.write_str(name)
    }
}

/// Summarized error category surfaced to observers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    HashComputation,
    StorageWrite,
    StorageRead,
    IncompleteUpload,
    Transfer,
    SessionState,
    HashMismatch,
    Rejected,
    Cancelled,
}

/// Last error retained by a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionError {
    pub kind: ErrorKind,
    pub message: String,
}

/// Read-only projection of an upload session.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    pub state: UploadState,
    /// Percentage in `[0, 100]`, never decreasing within one run.
    pub progress: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<SessionError>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_hash: Option<FileHash>,
    pub chunk_count: u64,
    pub completed_chunks: u64,
    /// Indices not yet confirmed by the store, in ascending order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pending_chunks: Vec<ChunkIndex>,
}

impl SessionSnapshot {
    /// Progress derived from completed chunks; an empty file counts as done.
    pub fn percentage(completed: u64, chunk_count: u64) -> f64 {
        if chunk_count == 0 {
            return 100.0;
        }
        completed.min(chunk_count) as f64 * 100.0 / chunk_count as f64
    }
}
