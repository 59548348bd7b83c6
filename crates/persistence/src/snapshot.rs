//! Snapshot files.
//!
//! # Layout
//! ```text
//! [SnapshotHeader: 64 bytes][blob]
//! ```
//! The header records the blob length and blake3 hash; a reader verifies
//! both before handing the blob out.

use crate::error::{PersistenceError, Result};
use crate::fsync_dir;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::fs::{self, File};
use std::io::{BufWriter, Read, Write};
use std::path::Path;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotHeader {
    pub magic: [u8; 4],
    pub version: u32,
    pub incarnation: u32,
    pub reserved: u32,
    pub end_pos: u64,
    pub blob_len: u64,
    pub blob_hash: [u8; 32],
}

impl SnapshotHeader {
    pub const SIZE: usize = 4 + 4 + 4 + 4 + 8 + 8 + 32; // 64 bytes
    pub const MAGIC: [u8; 4] = *b"VSNP";
    pub const VERSION: u32 = 1;

    pub fn new(incarnation: u32, end_pos: u64, blob: &[u8]) -> Self {
        Self {
            magic: Self::MAGIC,
            version: Self::VERSION,
            incarnation,
            reserved: 0,
            end_pos,
            blob_len: blob.len() as u64,
            blob_hash: *blake3::hash(blob).as_bytes(),
        }
    }

    pub fn write_to<W: Write>(&self, mut writer: W) -> Result<()> {
        writer.write_all(&self.magic)?;
        writer.write_u32::<LittleEndian>(self.version)?;
        writer.write_u32::<LittleEndian>(self.incarnation)?;
        writer.write_u32::<LittleEndian>(self.reserved)?;
        writer.write_u64::<LittleEndian>(self.end_pos)?;
        writer.write_u64::<LittleEndian>(self.blob_len)?;
        writer.write_all(&self.blob_hash)?;
        Ok(())
    }

    pub fn read_from<R: Read>(mut reader: R) -> Result<Self> {
        let mut magic = [0u8; 4];
        reader.read_exact(&mut magic)?;
        if magic != Self::MAGIC {
            return Err(PersistenceError::InvalidMagic);
        }
        let version = reader.read_u32::<LittleEndian>()?;
        if version != Self::VERSION {
            return Err(PersistenceError::UnsupportedVersion(version));
        }
        let incarnation = reader.read_u32::<LittleEndian>()?;
        let reserved = reader.read_u32::<LittleEndian>()?;
        let end_pos = reader.read_u64::<LittleEndian>()?;
        let blob_len = reader.read_u64::<LittleEndian>()?;
        let mut blob_hash = [0u8; 32];
        reader.read_exact(&mut blob_hash)?;

        Ok(Self {
            magic,
            version,
            incarnation,
            reserved,
            end_pos,
            blob_len,
            blob_hash,
        })
    }
}

/// Durably write a snapshot: temp file, fsync, rename, fsync directory.
pub fn write_snapshot(path: impl AsRef<Path>, header: &SnapshotHeader, blob: &[u8]) -> Result<()> {
    let path = path.as_ref();
    let tmp = path.with_extension("tmp");
    {
        let file = File::create(&tmp)?;
        let mut writer = BufWriter::new(file);
        header.write_to(&mut writer)?;
        writer.write_all(blob)?;
        writer.flush()?;
        writer.get_ref().sync_all()?;
    }
    fs::rename(&tmp, path)?;
    if let Some(dir) = path.parent() {
        fsync_dir(dir)?;
    }
    Ok(())
}

pub fn read_header(path: impl AsRef<Path>) -> Result<SnapshotHeader> {
    let file = File::open(path)?;
    SnapshotHeader::read_from(file)
}

pub fn read_snapshot(path: impl AsRef<Path>) -> Result<(SnapshotHeader, Vec<u8>)> {
    let mut file = File::open(path)?;
    let header = SnapshotHeader::read_from(&mut file)?;
    let mut blob = Vec::new();
    file.read_to_end(&mut blob)?;
    if blob.len() as u64 != header.blob_len {
        return Err(PersistenceError::LengthMismatch {
            expected: header.blob_len,
            found: blob.len() as u64,
        });
    }
    if *blake3::hash(&blob).as_bytes() != header.blob_hash {
        return Err(PersistenceError::HashMismatch);
    }
    Ok((header, blob))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_snapshot_header_serialization() {
        let header = SnapshotHeader::new(2, 100, b"state");
        let mut bytes = Vec::new();
        header.write_to(&mut bytes).unwrap();
        assert_eq!(bytes.len(), SnapshotHeader::SIZE);

        let decoded = SnapshotHeader::read_from(&bytes[..]).unwrap();
        assert_eq!(header, decoded);
    }

    #[test]
    fn test_invalid_magic() {
        let mut bytes = [0u8; SnapshotHeader::SIZE];
        bytes[0..4].copy_from_slice(b"BADM");
        let result = SnapshotHeader::read_from(&bytes[..]);
        assert!(matches!(result, Err(PersistenceError::InvalidMagic)));
    }

    #[test]
    fn write_then_read_verifies_blob() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("00000000000000000003.snap");
        let blob = b"worker heap".to_vec();
        write_snapshot(&path, &SnapshotHeader::new(0, 3, &blob), &blob).unwrap();

        let (header, read) = read_snapshot(&path).unwrap();
        assert_eq!(read, blob);
        assert_eq!(header.end_pos, 3);
        assert_eq!(read_header(&path).unwrap(), header);
        assert!(!path.with_extension("tmp").exists());
    }

    #[test]
    fn tampered_blob_is_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("00000000000000000003.snap");
        let blob = b"worker heap".to_vec();
        write_snapshot(&path, &SnapshotHeader::new(0, 3, &blob), &blob).unwrap();

        let mut bytes = fs::read(&path).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0x01;
        fs::write(&path, &bytes).unwrap();
        assert!(matches!(read_snapshot(&path), Err(PersistenceError::HashMismatch)));

        bytes.pop();
        fs::write(&path, &bytes).unwrap();
        assert!(matches!(read_snapshot(&path), Err(PersistenceError::LengthMismatch { .. })));
    }
}
