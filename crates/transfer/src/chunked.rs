use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};

use crate::{ChunkPlan, TransferError};

const HASH_BUFFER: usize = 64 * 1024;

// ---------------------------------------------------------------------------
// Checksum helpers
// ---------------------------------------------------------------------------

/// Computes SHA-256 of `data` and returns the hex-encoded digest.
pub fn checksum_bytes(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Streams an entire file through SHA-256 and returns the hex digest.
pub fn calculate_file_checksum(path: &Path) -> Result<String, TransferError> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; HASH_BUFFER];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

// ---------------------------------------------------------------------------
// ChunkReader
// ---------------------------------------------------------------------------

/// Reads individual chunks of a local file by index.
///
/// Each read opens its own handle, so a reader can be cloned into several
/// worker tasks and used concurrently.
#[derive(Debug, Clone)]
pub struct ChunkReader {
    path: PathBuf,
    plan: ChunkPlan,
}

impl ChunkReader {
    /// Opens `path` and lays it out in `chunk_size` chunks.
    pub fn new(path: &Path, chunk_size: u64) -> Result<Self, TransferError> {
        let file_size = std::fs::metadata(path)?.len();
        Ok(Self {
            path: path.to_path_buf(),
            plan: ChunkPlan::new(file_size, chunk_size)?,
        })
    }

    pub fn plan(&self) -> &ChunkPlan {
        &self.plan
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads the bytes of chunk `index`.
    ///
    /// Fails with `UnexpectedEof` if the file shrank since it was planned.
    pub fn read_chunk(&self, index: u32) -> Result<Vec<u8>, TransferError> {
        let range = self.plan.range(index)?;
        let mut file = File::open(&self.path)?;
        file.seek(SeekFrom::Start(range.start))?;
        let mut buf = vec![0u8; (range.end - range.start) as usize];
        file.read_exact(&mut buf)?;
        Ok(buf)
    }
}

// ---------------------------------------------------------------------------
// Positional writes
// ---------------------------------------------------------------------------

/// Writes `data` at byte `offset` of `path` and flushes it to disk.
///
/// The file is created if missing and never truncated, so chunks may land
/// in any order.
pub fn write_chunk_at(path: &Path, offset: u64, data: &[u8]) -> Result<(), TransferError> {
    let mut file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(false)
        .open(path)?;
    file.seek(SeekFrom::Start(offset))?;
    file.write_all(data)?;
    file.sync_data()?;
    Ok(())
}
