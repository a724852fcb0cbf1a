use std::ops::Range;

use chunkflow_protocol::ChunkIndex;

use crate::TransferError;

/// A chunk of file data for transfer.
#[derive(Debug, Clone)]
pub struct Chunk {
    /// Position of this chunk within the file.
    pub index: ChunkIndex,
    /// Byte offset within the file.
    pub offset: u64,
    /// Raw chunk data.
    pub data: Vec<u8>,
    /// SHA-256 hex checksum of `data`.
    pub checksum: String,
}

/// How a file of a given size splits into fixed-size chunks.
///
/// `chunk_count = ceil(file_size / chunk_size)`; every chunk but the last is
/// exactly `chunk_size` bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkPlan {
    file_size: u64,
    chunk_size: u64,
}

impl ChunkPlan {
    pub fn new(file_size: u64, chunk_size: u64) -> Result<Self, TransferError> {
        if chunk_size == 0 {
            return Err(TransferError::InvalidChunkSize);
        }
        Ok(Self {
            file_size,
            chunk_size,
        })
    }

    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    pub fn chunk_size(&self) -> u64 {
        self.chunk_size
    }

    /// Number of chunks; zero for an empty file.
    pub fn chunk_count(&self) -> u64 {
        self.file_size.div_ceil(self.chunk_size)
    }

    /// Byte range covered by chunk `index`.
    pub fn range(&self, index: ChunkIndex) -> Result<Range<u64>, TransferError> {
        let chunk_count = self.chunk_count();
        if index >= chunk_count {
            return Err(TransferError::ChunkOutOfRange { index, chunk_count });
        }
        let start = index * self.chunk_size;
        let end = (start + self.chunk_size).min(self.file_size);
        Ok(start..end)
    }

    /// All indices, `[0, chunk_count)`.
    pub fn indices(&self) -> Range<ChunkIndex> {
        0..self.chunk_count()
    }
}
