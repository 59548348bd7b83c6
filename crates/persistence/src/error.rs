use thiserror::Error;
use std::io;

#[derive(Error, Debug)]
pub enum PersistenceError {
    #[error("Invalid magic bytes in header")]
    InvalidMagic,
    #[error("Unsupported format version {0}")]
    UnsupportedVersion(u32),
    #[error("Truncated header: file holds {len} bytes")]
    TruncatedHeader { len: u64 },
    #[error("Checksum mismatch at position {position}: expected {expected}, found {found}")]
    ChecksumMismatch {
        position: u64,
        expected: u64,
        found: u64,
    },
    #[error("Record out of order: expected position {expected}, found {found}")]
    OutOfOrder { expected: u64, found: u64 },
    #[error("Truncated record at position {position}")]
    TruncatedRecord { position: u64 },
    #[error("Snapshot blob length mismatch: expected {expected}, found {found}")]
    LengthMismatch { expected: u64, found: u64 },
    #[error("Snapshot blob hash mismatch")]
    HashMismatch,
    #[error("Segment writer poisoned by a failed rollback")]
    Poisoned,
    #[error("IO error: {0}")]
    IoError(#[from] io::Error),
    #[error("Invalid data format: {0}")]
    InvalidFormat(String),
}

impl PersistenceError {
    /// True when the storage medium failed, as opposed to stored bytes
    /// being wrong.
    pub fn is_io(&self) -> bool {
        match self {
            PersistenceError::IoError(e) => e.kind() != io::ErrorKind::UnexpectedEof,
            PersistenceError::Poisoned => true,
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, PersistenceError>;
