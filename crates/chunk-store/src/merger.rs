use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use chunkflow_protocol::{ChunkIndex, FileHash};
use chunkflow_transfer::ContentHasher;
use tracing::{debug, info, warn};

use crate::StoreError;
use crate::store::ChunkStore;

/// Result of a successful merge call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    /// The artifact was assembled by this call.
    Merged { bytes: u64 },
    /// An artifact already existed; nothing was written.
    AlreadyMerged,
}

/// Assembles stored chunks into the final artifact.
///
/// Merges of the same hash are serialized within the process. Across
/// processes the store's atomic artifact publish keeps the first artifact,
/// and since content is addressed by hash any duplicate is identical.
pub struct Merger {
    store: Arc<dyn ChunkStore>,
    locks: Mutex<HashMap<FileHash, Arc<tokio::sync::Mutex<()>>>>,
}

impl Merger {
    pub fn new(store: Arc<dyn ChunkStore>) -> Self {
        Self {
            store,
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Merges chunks `0..chunk_count` of `file_hash` in index order.
    ///
    /// Fails with [`StoreError::IncompleteUpload`] before writing anything if
    /// a chunk is missing; the chunks are kept for a later attempt. Fails with
    /// [`StoreError::HashMismatch`] if the assembled bytes do not hash to
    /// `file_hash`; that chunk set can never merge, so it is discarded and the
    /// next upload of the hash starts from chunk 0.
    pub async fn merge(
        &self,
        file_hash: &FileHash,
        chunk_count: u64,
    ) -> Result<MergeOutcome, StoreError> {
        let lock = self.lock_for(file_hash);
        let result = {
            let _guard = lock.lock().await;
            self.merge_locked(file_hash, chunk_count).await
        };
        drop(lock);
        self.release_lock(file_hash);
        result
    }

    async fn merge_locked(
        &self,
        file_hash: &FileHash,
        chunk_count: u64,
    ) -> Result<MergeOutcome, StoreError> {
        if self.store.exists(file_hash).await? {
            debug!(file_hash = %file_hash.short(), "artifact already merged");
            return Ok(MergeOutcome::AlreadyMerged);
        }

        let missing = self.missing_chunks(file_hash, chunk_count).await?;
        if !missing.is_empty() {
            warn!(
                file_hash = %file_hash.short(),
                missing = missing.len(),
                "merge rejected, upload incomplete"
            );
            return Err(StoreError::IncompleteUpload {
                file_hash: file_hash.clone(),
                missing,
            });
        }

        let mut writer = self.store.create_artifact(file_hash).await?;
        let mut hasher = ContentHasher::new();
        let mut bytes = 0u64;
        for index in 0..chunk_count {
            let data = self.store.read_chunk(file_hash, index).await?;
            hasher.update(&data);
            writer.append(&data).await?;
            bytes += data.len() as u64;
        }

        let actual = hasher.finalize();
        if &actual != file_hash {
            warn!(
                file_hash = %file_hash.short(),
                actual = %actual.short(),
                "merged content does not match its hash, discarding chunks"
            );
            drop(writer);
            if let Err(e) = self.store.discard_chunks(file_hash).await {
                warn!(file_hash = %file_hash.short(), error = %e, "failed to discard chunks");
            }
            return Err(StoreError::HashMismatch {
                expected: file_hash.clone(),
                actual,
            });
        }

        writer.commit().await?;
        info!(file_hash = %file_hash.short(), chunk_count, bytes, "artifact merged");
        Ok(MergeOutcome::Merged { bytes })
    }

    async fn missing_chunks(
        &self,
        file_hash: &FileHash,
        chunk_count: u64,
    ) -> Result<Vec<ChunkIndex>, StoreError> {
        let mut missing = Vec::new();
        for index in 0..chunk_count {
            if !self.store.chunk_exists(file_hash, index).await? {
                missing.push(index);
            }
        }
        Ok(missing)
    }

    fn lock_for(&self, file_hash: &FileHash) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(locks.entry(file_hash.clone()).or_default())
    }

    fn release_lock(&self, file_hash: &FileHash) {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        if locks
            .get(file_hash)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            locks.remove(file_hash);
        }
    }

    #[cfg(test)]
    fn lock_count(&self) -> usize {
        self.locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}
