use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use chunkflow_protocol::{ChunkIndex, FileHash};
use sha2::{Digest, Sha256};

use crate::TransferError;
use crate::types::{Chunk, ChunkPlan};

const READ_BUFFER_SIZE: usize = 64 * 1024;

// ---------------------------------------------------------------------------
// Hashing
// ---------------------------------------------------------------------------

/// Incremental SHA-256 over a file's full content.
///
/// Feeding the same bytes in any split always yields the same [`FileHash`].
#[derive(Default)]
pub struct ContentHasher {
    inner: Sha256,
}

impl ContentHasher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, data: &[u8]) {
        self.inner.update(data);
    }

    pub fn finalize(self) -> FileHash {
        FileHash::from_digest(self.inner.finalize().into())
    }
}

/// Computes SHA-256 of `data` and returns the hex-encoded digest.
pub fn checksum_bytes(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Checks `data` against a hex checksum. An empty checksum always passes.
pub fn verify_checksum(data: &[u8], checksum: &str) -> Result<(), TransferError> {
    if checksum.is_empty() || checksum_bytes(data).eq_ignore_ascii_case(checksum) {
        Ok(())
    } else {
        Err(TransferError::ChecksumMismatch)
    }
}

/// Hashes a byte stream without buffering it whole.
pub fn hash_reader<R: Read>(mut reader: R) -> Result<FileHash, TransferError> {
    let mut hasher = ContentHasher::new();
    let mut buf = vec![0u8; READ_BUFFER_SIZE];
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hasher.finalize())
}

/// Hashes an entire file.
pub fn hash_file(path: &Path) -> Result<FileHash, TransferError> {
    let file = File::open(path)?;
    hash_reader(file)
}

// ---------------------------------------------------------------------------
// ChunkReader
// ---------------------------------------------------------------------------

/// Random-access chunk reader over a source file.
///
/// Chunks are read by index so a pool of workers can share one reader; the
/// file handle is released when the reader is dropped.
pub struct ChunkReader {
    file: Mutex<File>,
    plan: ChunkPlan,
    path: PathBuf,
}

impl ChunkReader {
    /// Opens `path` for chunked reading.
    pub fn open(path: &Path, chunk_size: u64) -> Result<Self, TransferError> {
        let file = File::open(path)?;
        let file_size = file.metadata()?.len();
        let plan = ChunkPlan::new(file_size, chunk_size)?;
        Ok(Self {
            file: Mutex::new(file),
            plan,
            path: path.to_path_buf(),
        })
    }

    /// Reads chunk `index` and computes its checksum.
    pub fn read_chunk(&self, index: ChunkIndex) -> Result<Chunk, TransferError> {
        let range = self.plan.range(index)?;
        let mut data = vec![0u8; (range.end - range.start) as usize];
        {
            let mut file = self.file.lock().unwrap_or_else(PoisonError::into_inner);
            file.seek(SeekFrom::Start(range.start))?;
            file.read_exact(&mut data)?;
        }
        let checksum = checksum_bytes(&data);
        Ok(Chunk {
            index,
            offset: range.start,
            data,
            checksum,
        })
    }

    pub fn plan(&self) -> ChunkPlan {
        self.plan
    }

    pub fn chunk_count(&self) -> u64 {
        self.plan.chunk_count()
    }

    pub fn file_size(&self) -> u64 {
        self.plan.file_size()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}
