use std::io::{Cursor, Read};
use std::path::Path;

use crate::TransferError;

/// One fixed-size slice of a source stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub offset: u64,
    pub data: Vec<u8>,
}

impl Chunk {
    /// Offset one past the last byte of this chunk.
    pub fn end(&self) -> u64 {
        self.offset + self.data.len() as u64
    }
}

// ---------------------------------------------------------------------------
// ChunkReader
// ---------------------------------------------------------------------------

/// Splits a stream into chunks of at most `chunk_size` bytes.
///
/// The chunk size is fixed for the lifetime of the reader.
pub struct ChunkReader {
    source: Box<dyn Read + Send>,
    chunk_size: usize,
    offset: u64,
    total: u64,
}

impl ChunkReader {
    /// Wraps an arbitrary reader whose length is known up front.
    pub fn new(source: Box<dyn Read + Send>, total: u64, chunk_size: usize) -> Self {
        Self {
            source,
            chunk_size: chunk_size.max(1),
            offset: 0,
            total,
        }
    }

    /// Opens `path` for chunked reading.
    pub fn from_path(path: &Path, chunk_size: usize) -> Result<Self, TransferError> {
        let file = std::fs::File::open(path)?;
        let total = file.metadata()?.len();
        Ok(Self::new(Box::new(file), total, chunk_size))
    }

    /// Reads chunks out of an in-memory buffer (e.g. a zipped directory).
    pub fn from_bytes(data: Vec<u8>, chunk_size: usize) -> Self {
        let total = data.len() as u64;
        Self::new(Box::new(Cursor::new(data)), total, chunk_size)
    }

    /// Reads the next chunk. Returns `None` at end of stream.
    pub fn next_chunk(&mut self) -> Result<Option<Chunk>, TransferError> {
        let remaining = self.total.saturating_sub(self.offset);
        if remaining == 0 {
            return Ok(None);
        }

        let want = std::cmp::min(remaining, self.chunk_size as u64) as usize;
        let mut buf = vec![0u8; want];
        let mut filled = 0;
        while filled < want {
            let n = self.source.read(&mut buf[filled..])?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        if filled == 0 {
            return Ok(None);
        }
        buf.truncate(filled);

        let chunk = Chunk {
            offset: self.offset,
            data: buf,
        };
        self.offset += filled as u64;
        Ok(Some(chunk))
    }

    /// Returns `true` when the next read would be the last chunk.
    pub fn is_last(&self, chunk: &Chunk) -> bool {
        chunk.end() >= self.total
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn total(&self) -> u64 {
        self.total
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }
}
