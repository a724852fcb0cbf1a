//! Storage traits implemented by every backend.

use std::future::Future;
use std::pin::Pin;

use chunkflow_protocol::{ChunkIndex, FileHash};

use crate::StoreError;

/// A boxed future returned by store methods.
pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, StoreError>> + Send + 'a>>;

/// Durable store of chunk records and merged artifacts.
///
/// Implementations must tolerate concurrent callers for the same key: a
/// chunk write whose key already exists succeeds without touching the stored
/// bytes, and artifacts are published atomically.
pub trait ChunkStore: Send + Sync {
    /// Returns `true` if a merged artifact exists for `file_hash`.
    fn exists<'a>(&'a self, file_hash: &'a FileHash) -> StoreFuture<'a, bool>;

    /// Returns `true` if chunk `index` of `file_hash` is stored.
    fn chunk_exists<'a>(&'a self, file_hash: &'a FileHash, index: ChunkIndex)
    -> StoreFuture<'a, bool>;

    /// Stores a chunk. Writing an existing key is a silent success.
    fn write_chunk<'a>(
        &'a self,
        file_hash: &'a FileHash,
        index: ChunkIndex,
        data: &'a [u8],
    ) -> StoreFuture<'a, ()>;

    /// Reads a stored chunk.
    fn read_chunk<'a>(&'a self, file_hash: &'a FileHash, index: ChunkIndex)
    -> StoreFuture<'a, Vec<u8>>;

    /// Highest `i` such that every chunk in `0..=i` is stored, or `None` when
    /// chunk 0 is missing.
    fn last_contiguous_index<'a>(
        &'a self,
        file_hash: &'a FileHash,
    ) -> StoreFuture<'a, Option<ChunkIndex>>;

    /// Drops every stored chunk of `file_hash`. Discarding a hash with no
    /// chunks succeeds.
    fn discard_chunks<'a>(&'a self, file_hash: &'a FileHash) -> StoreFuture<'a, ()>;

    /// Starts writing the artifact for `file_hash`.
    ///
    /// Nothing is visible through [`exists`](Self::exists) until the returned
    /// writer is committed; dropping it uncommitted discards the partial data.
    fn create_artifact<'a>(
        &'a self,
        file_hash: &'a FileHash,
    ) -> StoreFuture<'a, Box<dyn ArtifactWriter>>;
}

/// In-progress artifact being assembled by the merger.
pub trait ArtifactWriter: Send {
    /// Appends bytes to the artifact.
    fn append<'a>(&'a mut self, data: &'a [u8]) -> StoreFuture<'a, ()>;

    /// Publishes the artifact. If another writer published the same hash
    /// first, the existing artifact is kept and this one is dropped.
    fn commit(self: Box<Self>) -> StoreFuture<'static, ()>;
}
