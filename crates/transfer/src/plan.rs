use std::ops::Range;

use crate::TransferError;

/// Fixed-size chunk layout of a file.
///
/// Every chunk is `chunk_size` bytes except possibly the last one, which
/// holds the remainder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkPlan {
    total_size: u64,
    chunk_size: u64,
    total_chunks: u32,
}

impl ChunkPlan {
    /// Builds the plan for a file of `total_size` bytes.
    pub fn new(total_size: u64, chunk_size: u64) -> Result<Self, TransferError> {
        if chunk_size == 0 {
            return Err(TransferError::InvalidPlan("chunk size must be positive".into()));
        }
        let total_chunks = u32::try_from(total_size.div_ceil(chunk_size)).map_err(|_| {
            TransferError::InvalidPlan(format!(
                "{total_size} bytes in {chunk_size}-byte chunks exceeds the chunk limit"
            ))
        })?;
        Ok(Self {
            total_size,
            chunk_size,
            total_chunks,
        })
    }

    pub fn total_size(&self) -> u64 {
        self.total_size
    }

    pub fn chunk_size(&self) -> u64 {
        self.chunk_size
    }

    /// `ceil(total_size / chunk_size)`.
    pub fn total_chunks(&self) -> u32 {
        self.total_chunks
    }

    /// Byte offset where chunk `index` starts.
    pub fn offset(&self, index: u32) -> u64 {
        u64::from(index) * self.chunk_size
    }

    /// Byte range `[index*chunk_size, min((index+1)*chunk_size, total_size))`.
    pub fn range(&self, index: u32) -> Result<Range<u64>, TransferError> {
        if index >= self.total_chunks {
            return Err(TransferError::ChunkOutOfRange {
                index,
                total: self.total_chunks,
            });
        }
        let start = self.offset(index);
        let end = (start + self.chunk_size).min(self.total_size);
        Ok(start..end)
    }

    /// Length in bytes of chunk `index`.
    pub fn chunk_len(&self, index: u32) -> Result<u64, TransferError> {
        let range = self.range(index)?;
        Ok(range.end - range.start)
    }

    /// Sum of the lengths of the given chunks; out-of-range indices count as zero.
    pub fn bytes_in<I: IntoIterator<Item = u32>>(&self, indices: I) -> u64 {
        indices
            .into_iter()
            .filter_map(|i| self.chunk_len(i).ok())
            .sum()
    }
}
