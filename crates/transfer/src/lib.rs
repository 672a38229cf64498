//! Chunked file transfer primitives for the device agent.
//!
//! - [`ChunkPolicy`]: chunk size for the active transport
//! - [`Checksum`]: incremental MD5 / SHA-256 hashing
//! - [`FileStorage`]: offset-addressed writes, range reads, gap checks, archives
//! - [`RangeSet`]: written-byte bookkeeping for out-of-order chunks
//! - [`ChunkReader`]: fixed-size chunking of files and in-memory buffers

mod checksum;
mod chunked;
mod progress;
mod ranges;
mod storage;
mod transport;
mod validation;

pub use checksum::{Checksum, ChecksumAlgorithm, calculate_file_checksum, checksum_bytes};
pub use chunked::{Chunk, ChunkReader};
pub use progress::{ProgressThrottle, TransferClock, percent_complete};
pub use ranges::RangeSet;
pub use storage::{FileStorage, is_archive};
pub use transport::{ChunkPolicy, TransportType};
pub use validation::validate_archive_entry;

/// Default block size for whole-object uploads: 4 MiB.
pub const DEFAULT_BLOCK_SIZE: usize = 4 * 1024 * 1024;

/// Errors produced by the transfer crate.
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("archive error: {0}")]
    Archive(#[from] zip::result::ZipError),

    #[error("checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    #[error("invalid path: {0}")]
    InvalidPath(String),

    #[error("not a directory: {0}")]
    NotADirectory(String),
}
