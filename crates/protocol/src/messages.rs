use serde::{Deserialize, Serialize};

use crate::types::{ChunkIndex, FileHash};

// ---------------------------------------------------------------------------
// Request payloads
// ---------------------------------------------------------------------------

/// Sends one chunk of a file.
///
/// The `data` field is base64-encoded in JSON so the payload survives text
/// transports unchanged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadChunkRequest {
    pub file_hash: FileHash,
    pub chunk_index: ChunkIndex,
    #[serde(with = "base64_bytes")]
    pub data: Vec<u8>,
    /// SHA-256 hex of `data` (empty means no verification).
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub checksum: String,
}

/// Asks the store to assemble the final artifact.
///
/// The expected chunk count travels with the request; the store never infers
/// it from the chunks it happens to hold.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MergeRequest {
    pub file_hash: FileHash,
    pub chunk_count: u64,
}

mod base64_bytes {
    use base64::{Engine, engine::general_purpose::STANDARD};
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(data: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        STANDARD.encode(data).serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        STANDARD.decode(&s).map_err(serde::de::Error::custom)
    }
}
