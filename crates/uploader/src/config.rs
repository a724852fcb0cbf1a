//! Per-session upload configuration.

use serde::{Deserialize, Serialize};

use chunkflow_transfer::DEFAULT_CHUNK_SIZE;

use crate::error::UploadError;
use crate::retry::RetryPolicy;

/// Default number of concurrent chunk transfers.
pub const DEFAULT_CONCURRENCY: usize = 4;

/// Tunables for one upload session.
///
/// Deserializes from camelCase JSON; every field is optional.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct UploadConfig {
    /// Chunk size in bytes.
    pub chunk_size: u64,
    /// Maximum chunk transfers in flight.
    pub concurrency: usize,
    /// Begin uploading as soon as the resume point is known.
    pub auto_start: bool,
    pub retry: RetryPolicy,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            concurrency: DEFAULT_CONCURRENCY,
            auto_start: true,
            retry: RetryPolicy::default(),
        }
    }
}

impl UploadConfig {
    pub fn validate(&self) -> Result<(), UploadError> {
        if self.chunk_size == 0 {
            return Err(UploadError::InvalidConfig(
                "chunkSize must be greater than zero".into(),
            ));
        }
        if self.concurrency == 0 {
            return Err(UploadError::InvalidConfig(
                "concurrency must be at least 1".into(),
            ));
        }
        self.retry.validate()
    }
}
