//! In-memory chunk store.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chunkflow_protocol::{ChunkIndex, FileHash};

use crate::StoreError;
use crate::store::{ArtifactWriter, ChunkStore, StoreFuture};

/// Chunk store backed by process memory.
///
/// Used by tests and by single-process setups that do not need durability.
#[derive(Default, Clone)]
pub struct MemoryChunkStore {
    inner: Arc<RwLock<MemoryInner>>,
}

#[derive(Default)]
struct MemoryInner {
    chunks: HashMap<FileHash, BTreeMap<ChunkIndex, Arc<Vec<u8>>>>,
    artifacts: HashMap<FileHash, Arc<Vec<u8>>>,
}

impl MemoryChunkStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, MemoryInner> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, MemoryInner> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns the merged artifact bytes, if any.
    pub fn artifact(&self, file_hash: &FileHash) -> Option<Vec<u8>> {
        self.read()
            .artifacts
            .get(file_hash)
            .map(|data| data.as_ref().clone())
    }

    /// Returns the stored chunk indices for a hash, ascending.
    pub fn chunk_indices(&self, file_hash: &FileHash) -> Vec<ChunkIndex> {
        self.read()
            .chunks
            .get(file_hash)
            .map(|chunks| chunks.keys().copied().collect())
            .unwrap_or_default()
    }
}

impl ChunkStore for MemoryChunkStore {
    fn exists<'a>(&'a self, file_hash: &'a FileHash) -> StoreFuture<'a, bool> {
        Box::pin(async move { Ok(self.read().artifacts.contains_key(file_hash)) })
    }

    fn chunk_exists<'a>(
        &'a self,
        file_hash: &'a FileHash,
        index: ChunkIndex,
    ) -> StoreFuture<'a, bool> {
        Box::pin(async move {
            Ok(self
                .read()
                .chunks
                .get(file_hash)
                .is_some_and(|chunks| chunks.contains_key(&index)))
        })
    }

    fn write_chunk<'a>(
        &'a self,
        file_hash: &'a FileHash,
        index: ChunkIndex,
        data: &'a [u8],
    ) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            let mut inner = self.write();
            inner
                .chunks
                .entry(file_hash.clone())
                .or_default()
                .entry(index)
                .or_insert_with(|| Arc::new(data.to_vec()));
            Ok(())
        })
    }

    fn read_chunk<'a>(
        &'a self,
        file_hash: &'a FileHash,
        index: ChunkIndex,
    ) -> StoreFuture<'a, Vec<u8>> {
        Box::pin(async move {
            self.read()
                .chunks
                .get(file_hash)
                .and_then(|chunks| chunks.get(&index))
                .map(|data| data.as_ref().clone())
                .ok_or_else(|| StoreError::ChunkNotFound {
                    file_hash: file_hash.clone(),
                    index,
                })
        })
    }

    fn last_contiguous_index<'a>(
        &'a self,
        file_hash: &'a FileHash,
    ) -> StoreFuture<'a, Option<ChunkIndex>> {
        Box::pin(async move {
            let inner = self.read();
            let Some(chunks) = inner.chunks.get(file_hash) else {
                return Ok(None);
            };
            Ok(last_contiguous(chunks.keys().copied()))
        })
    }

    fn discard_chunks<'a>(&'a self, file_hash: &'a FileHash) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            self.write().chunks.remove(file_hash);
            Ok(())
        })
    }

    fn create_artifact<'a>(
        &'a self,
        file_hash: &'a FileHash,
    ) -> StoreFuture<'a, Box<dyn ArtifactWriter>> {
        Box::pin(async move {
            let writer: Box<dyn ArtifactWriter> = Box::new(MemoryArtifactWriter {
                inner: Arc::clone(&self.inner),
                file_hash: file_hash.clone(),
                buffer: Vec::new(),
            });
            Ok(writer)
        })
    }
}

struct MemoryArtifactWriter {
    inner: Arc<RwLock<MemoryInner>>,
    file_hash: FileHash,
    buffer: Vec<u8>,
}

impl ArtifactWriter for MemoryArtifactWriter {
    fn append<'a>(&'a mut self, data: &'a [u8]) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            self.buffer.extend_from_slice(data);
            Ok(())
        })
    }

    fn commit(self: Box<Self>) -> StoreFuture<'static, ()> {
        Box::pin(async move {
            let MemoryArtifactWriter {
                inner,
                file_hash,
                buffer,
            } = *self;
            let mut guard = inner.write().unwrap_or_else(PoisonError::into_inner);
            guard
                .artifacts
                .entry(file_hash)
                .or_insert_with(|| Arc::new(buffer));
            Ok(())
        })
    }
}

/// Walks ascending indices and returns the end of the run starting at 0.
pub(crate) fn last_contiguous(sorted: impl IntoIterator<Item = ChunkIndex>) -> Option<ChunkIndex> {
    let mut last = None;
    for (expected, index) in sorted.into_iter().enumerate() {
        if index != expected as ChunkIndex {
            break;
        }
        last = Some(index);
    }
    last
}
