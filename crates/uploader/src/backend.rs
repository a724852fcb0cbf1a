//! Upload backend trait and the in-process implementation.
//!
//! `UploadBackend` is the transport seam: a remote client implements it on
//! top of its wire protocol, while [`LocalBackend`] calls an
//! [`UploadService`] directly.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use chunkflow_chunk_store::UploadService;
use chunkflow_protocol::{ChunkIndex, FileHash, MergeRequest, UploadChunkRequest};

use crate::error::UploadError;

/// A boxed future returned by backend methods.
pub type BackendFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, UploadError>> + Send + 'a>>;

/// The fixed set of operations an uploader needs from the store side.
///
/// Every method is independently invocable and idempotent.
pub trait UploadBackend: Send + Sync {
    /// Stores one chunk. `checksum` is the SHA-256 hex of `data`.
    fn upload_chunk<'a>(
        &'a self,
        file_hash: &'a FileHash,
        index: ChunkIndex,
        data: &'a [u8],
        checksum: &'a str,
    ) -> BackendFuture<'a, ()>;

    /// Returns `true` if the merged artifact exists.
    fn file_exists<'a>(&'a self, file_hash: &'a FileHash) -> BackendFuture<'a, bool>;

    fn chunk_exists<'a>(
        &'a self,
        file_hash: &'a FileHash,
        index: ChunkIndex,
    ) -> BackendFuture<'a, bool>;

    /// Assembles `chunk_count` chunks into the artifact.
    fn merge<'a>(&'a self, file_hash: &'a FileHash, chunk_count: u64) -> BackendFuture<'a, ()>;

    /// Highest index with every chunk up to it stored.
    fn last_existed_chunk_index<'a>(
        &'a self,
        file_hash: &'a FileHash,
    ) -> BackendFuture<'a, Option<ChunkIndex>>;
}

/// Backend calling an in-process [`UploadService`].
#[derive(Clone)]
pub struct LocalBackend {
    service: Arc<UploadService>,
}

impl LocalBackend {
    pub fn new(service: Arc<UploadService>) -> Self {
        Self { service }
    }

    pub fn service(&self) -> &Arc<UploadService> {
        &self.service
    }
}

impl UploadBackend for LocalBackend {
    fn upload_chunk<'a>(
        &'a self,
        file_hash: &'a FileHash,
        index: ChunkIndex,
        data: &'a [u8],
        checksum: &'a str,
    ) -> BackendFuture<'a, ()> {
        Box::pin(async move {
            let request = UploadChunkRequest {
                file_hash: file_hash.clone(),
                chunk_index: index,
                data: data.to_vec(),
                checksum: checksum.to_string(),
            };
            Ok(self.service.upload_chunk(&request).await?)
        })
    }

    fn file_exists<'a>(&'a self, file_hash: &'a FileHash) -> BackendFuture<'a, bool> {
        Box::pin(async move { Ok(self.service.file_exists(file_hash).await?) })
    }

    fn chunk_exists<'a>(
        &'a self,
        file_hash: &'a FileHash,
        index: ChunkIndex,
    ) -> BackendFuture<'a, bool> {
        Box::pin(async move { Ok(self.service.chunk_exists(file_hash, index).await?) })
    }

    fn merge<'a>(&'a self, file_hash: &'a FileHash, chunk_count: u64) -> BackendFuture<'a, ()> {
        Box::pin(async move {
            let request = MergeRequest {
                file_hash: file_hash.clone(),
                chunk_count,
            };
            self.service.merge(&request).await?;
            Ok(())
        })
    }

    fn last_existed_chunk_index<'a>(
        &'a self,
        file_hash: &'a FileHash,
    ) -> BackendFuture<'a, Option<ChunkIndex>> {
        Box::pin(async move { Ok(self.service.last_existed_chunk_index(file_hash).await?) })
    }
}
