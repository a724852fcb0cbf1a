//! Filesystem chunk store.
//!
//! Layout under the root directory:
//!
//! ```text
//! chunks/<file-hash>/<index>.chunk
//! artifacts/<file-hash>
//! tmp/<uuid>.tmp
//! ```
//!
//! Every write goes to `tmp/` first and is linked into place, so readers
//! never observe a partial chunk or artifact and a published file is never
//! replaced.

use std::io;
use std::path::{Path, PathBuf};

use chunkflow_protocol::{ChunkIndex, FileHash};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::debug;

use crate::StoreError;
use crate::memory::last_contiguous;
use crate::store::{ArtifactWriter, ChunkStore, StoreFuture};

const CHUNK_EXTENSION: &str = "chunk";

/// Chunk store rooted at a directory.
#[derive(Debug, Clone)]
pub struct FsChunkStore {
    root: PathBuf,
}

impl FsChunkStore {
    /// Opens (and creates if needed) a store rooted at `root`.
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        for dir in ["chunks", "artifacts", "tmp"] {
            fs::create_dir_all(root.join(dir))
                .await
                .map_err(StoreError::write)?;
        }
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn chunk_dir(&self, file_hash: &FileHash) -> PathBuf {
        self.root.join("chunks").join(file_hash.as_str())
    }

    fn chunk_path(&self, file_hash: &FileHash, index: ChunkIndex) -> PathBuf {
        self.chunk_dir(file_hash)
            .join(format!("{index}.{CHUNK_EXTENSION}"))
    }

    /// Path of the merged artifact for `file_hash`.
    pub fn artifact_path(&self, file_hash: &FileHash) -> PathBuf {
        self.root.join("artifacts").join(file_hash.as_str())
    }

    fn temp_path(&self) -> PathBuf {
        self.root
            .join("tmp")
            .join(format!("{}.tmp", uuid::Uuid::new_v4()))
    }

    /// Lists stored chunk indices, ascending.
    async fn chunk_indices(&self, file_hash: &FileHash) -> Result<Vec<ChunkIndex>, StoreError> {
        let mut entries = match fs::read_dir(self.chunk_dir(file_hash)).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(StoreError::read(e)),
        };

        let mut indices = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(StoreError::read)? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(CHUNK_EXTENSION) {
                continue;
            }
            if let Some(index) = path
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(|s| s.parse::<ChunkIndex>().ok())
            {
                indices.push(index);
            }
        }
        indices.sort_unstable();
        Ok(indices)
    }
}

async fn path_exists(path: &Path) -> Result<bool, StoreError> {
    fs::try_exists(path).await.map_err(StoreError::read)
}

/// Moves a finished temp file into place without replacing an existing
/// destination.
///
/// The temp file is hard-linked to `dest`, which fails with `AlreadyExists`
/// when another writer published first; the first file is kept either way
/// and the temp name is removed.
async fn publish(temp: &Path, dest: &Path) -> Result<(), StoreError> {
    let linked = fs::hard_link(temp, dest).await;
    let _ = fs::remove_file(temp).await;
    match linked {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
            debug!(dest = %dest.display(), "destination already published");
            Ok(())
        }
        Err(e) => Err(StoreError::write(e)),
    }
}

impl ChunkStore for FsChunkStore {
    fn exists<'a>(&'a self, file_hash: &'a FileHash) -> StoreFuture<'a, bool> {
        Box::pin(async move { path_exists(&self.artifact_path(file_hash)).await })
    }

    fn chunk_exists<'a>(
        &'a self,
        file_hash: &'a FileHash,
        index: ChunkIndex,
    ) -> StoreFuture<'a, bool> {
        Box::pin(async move { path_exists(&self.chunk_path(file_hash, index)).await })
    }

    fn write_chunk<'a>(
        &'a self,
        file_hash: &'a FileHash,
        index: ChunkIndex,
        data: &'a [u8],
    ) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            let dest = self.chunk_path(file_hash, index);
            if path_exists(&dest).await? {
                debug!(file_hash = %file_hash.short(), chunk = index, "chunk already stored");
                return Ok(());
            }
            fs::create_dir_all(self.chunk_dir(file_hash))
                .await
                .map_err(StoreError::write)?;

            let temp = self.temp_path();
            let mut file = fs::File::create(&temp).await.map_err(StoreError::write)?;
            let written: io::Result<()> = async {
                file.write_all(data).await?;
                file.sync_all().await
            }
            .await;
            drop(file);
            if let Err(e) = written {
                let _ = fs::remove_file(&temp).await;
                return Err(StoreError::write(e));
            }
            publish(&temp, &dest).await
        })
    }

    fn read_chunk<'a>(
        &'a self,
        file_hash: &'a FileHash,
        index: ChunkIndex,
    ) -> StoreFuture<'a, Vec<u8>> {
        Box::pin(async move {
            match fs::read(self.chunk_path(file_hash, index)).await {
                Ok(data) => Ok(data),
                Err(e) if e.kind() == io::ErrorKind::NotFound => Err(StoreError::ChunkNotFound {
                    file_hash: file_hash.clone(),
                    index,
                }),
                Err(e) => Err(StoreError::read(e)),
            }
        })
    }

    fn last_contiguous_index<'a>(
        &'a self,
        file_hash: &'a FileHash,
    ) -> StoreFuture<'a, Option<ChunkIndex>> {
        Box::pin(async move { Ok(last_contiguous(self.chunk_indices(file_hash).await?)) })
    }

    fn discard_chunks<'a>(&'a self, file_hash: &'a FileHash) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            match fs::remove_dir_all(self.chunk_dir(file_hash)).await {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
                Err(e) => Err(StoreError::write(e)),
            }
        })
    }

    fn create_artifact<'a>(
        &'a self,
        file_hash: &'a FileHash,
    ) -> StoreFuture<'a, Box<dyn ArtifactWriter>> {
        Box::pin(async move {
            let temp = self.temp_path();
            let file = fs::File::create(&temp).await.map_err(StoreError::write)?;
            let writer: Box<dyn ArtifactWriter> = Box::new(FsArtifactWriter {
                file: Some(file),
                temp,
                dest: self.artifact_path(file_hash),
                committed: false,
            });
            Ok(writer)
        })
    }
}

struct FsArtifactWriter {
    file: Option<fs::File>,
    temp: PathBuf,
    dest: PathBuf,
    committed: bool,
}

impl ArtifactWriter for FsArtifactWriter {
    fn append<'a>(&'a mut self, data: &'a [u8]) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            let file = self
                .file
                .as_mut()
                .ok_or_else(|| StoreError::write(io::Error::other("artifact writer closed")))?;
            file.write_all(data).await.map_err(StoreError::write)
        })
    }

    fn commit(mut self: Box<Self>) -> StoreFuture<'static, ()> {
        Box::pin(async move {
            let mut file = self
                .file
                .take()
                .ok_or_else(|| StoreError::write(io::Error::other("artifact writer closed")))?;
            file.flush().await.map_err(StoreError::write)?;
            file.sync_all().await.map_err(StoreError::write)?;
            drop(file);
            publish(&self.temp, &self.dest).await?;
            self.committed = true;
            Ok(())
        })
    }
}

impl Drop for FsArtifactWriter {
    fn drop(&mut self) {
        if !self.committed {
            let _ = std::fs::remove_file(&self.temp);
        }
    }
}
