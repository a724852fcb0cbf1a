use std::sync::Arc;

use chunkflow_protocol::{ChunkIndex, FileHash, MergeRequest, UploadChunkRequest};
use chunkflow_transfer::verify_checksum;
use tracing::{debug, warn};

use crate::StoreError;
use crate::merger::{MergeOutcome, Merger};
use crate::store::ChunkStore;

/// The server-side upload surface.
///
/// Every operation a remote uploader needs goes through here, so a transport
/// only has to decode a request, call one method and encode the result.
pub struct UploadService {
    store: Arc<dyn ChunkStore>,
    merger: Merger,
}

impl UploadService {
    pub fn new(store: Arc<dyn ChunkStore>) -> Self {
        let merger = Merger::new(Arc::clone(&store));
        Self { store, merger }
    }

    pub fn store(&self) -> &Arc<dyn ChunkStore> {
        &self.store
    }

    /// Verifies and stores one chunk.
    ///
    /// Uploads for a hash that is already merged are accepted and dropped.
    pub async fn upload_chunk(&self, request: &UploadChunkRequest) -> Result<(), StoreError> {
        let index = request.chunk_index;
        if verify_checksum(&request.data, &request.checksum).is_err() {
            warn!(
                file_hash = %request.file_hash.short(),
                chunk = index,
                "chunk rejected, checksum mismatch"
            );
            return Err(StoreError::ChecksumMismatch { index });
        }
        if self.store.exists(&request.file_hash).await? {
            debug!(
                file_hash = %request.file_hash.short(),
                chunk = index,
                "artifact exists, chunk ignored"
            );
            return Ok(());
        }
        self.store
            .write_chunk(&request.file_hash, index, &request.data)
            .await?;
        debug!(
            file_hash = %request.file_hash.short(),
            chunk = index,
            bytes = request.data.len(),
            "chunk stored"
        );
        Ok(())
    }

    pub async fn file_exists(&self, file_hash: &FileHash) -> Result<bool, StoreError> {
        self.store.exists(file_hash).await
    }

    pub async fn chunk_exists(
        &self,
        file_hash: &FileHash,
        index: ChunkIndex,
    ) -> Result<bool, StoreError> {
        self.store.chunk_exists(file_hash, index).await
    }

    pub async fn merge(&self, request: &MergeRequest) -> Result<MergeOutcome, StoreError> {
        self.merger
            .merge(&request.file_hash, request.chunk_count)
            .await
    }

    /// Resume hint: the highest index with every chunk before it stored.
    pub async fn last_existed_chunk_index(
        &self,
        file_hash: &FileHash,
    ) -> Result<Option<ChunkIndex>, StoreError> {
        self.store.last_contiguous_index(file_hash).await
    }
}
