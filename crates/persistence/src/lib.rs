//! On-disk formats for vat transcripts and snapshots.
//!
//! Two file kinds live here:
//! - transcript segments: a fixed header followed by checksummed records,
//!   one segment per span
//! - snapshot files: a fixed header carrying the blob's length and blake3
//!   hash, followed by the blob
//!
//! Both are created through a temp file, fsync and rename, so a reader
//! never observes a half-written file under its final name.

pub mod error;
pub mod segment;
pub mod snapshot;

pub use error::{PersistenceError, Result};

use std::fs::File;
use std::path::Path;

/// Make a rename or unlink inside `dir` durable.
pub fn fsync_dir(dir: impl AsRef<Path>) -> Result<()> {
    File::open(dir.as_ref())?.sync_all()?;
    Ok(())
}
