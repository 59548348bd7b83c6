//! Transcript segment files.
//!
//! # Layout
//! ```text
//! [SegmentHeader: 32 bytes]
//! [RecordHeader: 20 bytes][payload] ...
//! ```
//! Record positions are dense, starting at the header's `start_pos`. Each
//! record's checksum covers its position, length and payload.
//!
//! # Recovery
//! A record cut short by a crash at the tail is torn: [`SegmentWriter::open`]
//! truncates it. A complete record with a bad checksum, or a position gap,
//! is corruption and is never repaired.

use crate::error::{PersistenceError, Result};
use crate::fsync_dir;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use crc64fast::Digest;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentHeader {
    pub magic: [u8; 4],
    pub version: u32,
    pub start_pos: u64,
    pub incarnation: u32,
    pub reserved: [u8; 12],
}

impl SegmentHeader {
    pub const SIZE: usize = 4 + 4 + 8 + 4 + 12; // 32 bytes
    pub const MAGIC: [u8; 4] = *b"VTSG";
    pub const VERSION: u32 = 1;

    pub fn new(start_pos: u64, incarnation: u32) -> Self {
        Self {
            magic: Self::MAGIC,
            version: Self::VERSION,
            start_pos,
            incarnation,
            reserved: [0; 12],
        }
    }

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[0..4].copy_from_slice(&self.magic);
        buf[4..8].copy_from_slice(&self.version.to_le_bytes());
        buf[8..16].copy_from_slice(&self.start_pos.to_le_bytes());
        buf[16..20].copy_from_slice(&self.incarnation.to_le_bytes());
        buf[20..32].copy_from_slice(&self.reserved);
        buf
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
        let start_pos = reader.read_u64::<LittleEndian>()?;
        let incarnation = reader.read_u32::<LittleEndian>()?;
        let mut reserved = [0u8; 12];
        reader.read_exact(&mut reserved)?;

        Ok(Self {
            magic,
            version,
            start_pos,
            incarnation,
            reserved,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordHeader {
    pub position: u64,
    pub payload_len: u32,
    pub checksum: u64,
}

impl RecordHeader {
    pub const SIZE: usize = 8 + 4 + 8; // 20 bytes

    pub fn new(position: u64, payload: &[u8]) -> Result<Self> {
        let payload_len = u32::try_from(payload.len()).map_err(|_| {
            PersistenceError::InvalidFormat(format!("record of {} bytes is too large", payload.len()))
        })?;
        Ok(Self {
            position,
            payload_len,
            checksum: checksum(position, payload_len, payload),
        })
    }

    pub fn read_from<R: Read>(mut reader: R) -> Result<Self> {
        let position = reader.read_u64::<LittleEndian>()?;
        let payload_len = reader.read_u32::<LittleEndian>()?;
        let checksum = reader.read_u64::<LittleEndian>()?;
        Ok(Self {
            position,
            payload_len,
            checksum,
        })
    }

    pub fn write_to<W: Write>(&self, mut writer: W) -> Result<()> {
        writer.write_u64::<LittleEndian>(self.position)?;
        writer.write_u32::<LittleEndian>(self.payload_len)?;
        writer.write_u64::<LittleEndian>(self.checksum)?;
        Ok(())
    }
}

fn checksum(position: u64, payload_len: u32, payload: &[u8]) -> u64 {
    let mut digest = Digest::new();
    digest.write(&position.to_le_bytes());
    digest.write(&payload_len.to_le_bytes());
    digest.write(payload);
    digest.sum64()
}

fn verify(header: &RecordHeader, payload: &[u8]) -> Result<()> {
    let found = checksum(header.position, header.payload_len, payload);
    if found != header.checksum {
        return Err(PersistenceError::ChecksumMismatch {
            position: header.position,
            expected: header.checksum,
            found,
        });
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentRecord {
    pub position: u64,
    pub payload: Vec<u8>,
}

/// Write a complete segment under `path` in one step.
///
/// The records get positions `header.start_pos..`. The file only appears
/// under its final name once header and records are durable.
pub fn write_segment(path: impl AsRef<Path>, header: &SegmentHeader, records: &[Vec<u8>]) -> Result<()> {
    let path = path.as_ref();
    let tmp = path.with_extension("tmp");
    {
        let file = File::create(&tmp)?;
        let mut writer = BufWriter::new(file);
        writer.write_all(&header.to_bytes())?;
        for (i, payload) in records.iter().enumerate() {
            let rec = RecordHeader::new(header.start_pos + i as u64, payload)?;
            rec.write_to(&mut writer)?;
            writer.write_all(payload)?;
        }
        writer.flush()?;
        writer.get_ref().sync_all()?;
    }
    fs::rename(&tmp, path)?;
    if let Some(dir) = path.parent() {
        fsync_dir(dir)?;
    }
    Ok(())
}

/// Outcome of validating a segment file front to back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentScan {
    pub header: SegmentHeader,
    pub records: u64,
    pub next_pos: u64,
    /// Bytes up to the end of the last complete record.
    pub valid_len: u64,
    /// Bytes of an incomplete trailing record.
    pub torn_bytes: u64,
}

pub fn scan_segment(path: impl AsRef<Path>) -> Result<SegmentScan> {
    let file = File::open(path.as_ref())?;
    let len = file.metadata()?.len();
    if len < SegmentHeader::SIZE as u64 {
        return Err(PersistenceError::TruncatedHeader { len });
    }
    let mut reader = BufReader::new(file);
    let header = SegmentHeader::read_from(&mut reader)?;

    let mut offset = SegmentHeader::SIZE as u64;
    let mut expected = header.start_pos;
    let mut torn_bytes = 0;
    let mut payload = Vec::new();
    while offset < len {
        let remaining = len - offset;
        if remaining < RecordHeader::SIZE as u64 {
            torn_bytes = remaining;
            break;
        }
        let rec = RecordHeader::read_from(&mut reader)?;
        let needed = RecordHeader::SIZE as u64 + rec.payload_len as u64;
        if remaining < needed {
            torn_bytes = remaining;
            break;
        }
        payload.resize(rec.payload_len as usize, 0);
        reader.read_exact(&mut payload)?;
        verify(&rec, &payload)?;
        if rec.position != expected {
            return Err(PersistenceError::OutOfOrder {
                expected,
                found: rec.position,
            });
        }
        offset += needed;
        expected += 1;
    }

    Ok(SegmentScan {
        records: expected - header.start_pos,
        next_pos: expected,
        valid_len: offset,
        torn_bytes,
        header,
    })
}

/// Appends records to the tail of one segment.
pub struct SegmentWriter {
    path: PathBuf,
    file: File,
    header: SegmentHeader,
    next_pos: u64,
    len: u64,
    poisoned: bool,
}

impl SegmentWriter {
    /// Open an existing segment for appending, truncating a torn tail.
    pub fn open(path: impl AsRef<Path>) -> Result<(Self, SegmentScan)> {
        let path = path.as_ref().to_path_buf();
        let scan = scan_segment(&path)?;
        let file = OpenOptions::new().write(true).open(&path)?;
        if scan.torn_bytes > 0 {
            file.set_len(scan.valid_len)?;
            file.sync_all()?;
        }
        let writer = Self {
            path,
            file,
            header: scan.header.clone(),
            next_pos: scan.next_pos,
            len: scan.valid_len,
            poisoned: false,
        };
        Ok((writer, scan))
    }

    /// Append one record and fsync it.
    ///
    /// On failure the partial bytes are cut off again so the segment ends
    /// on a record boundary; if that also fails the writer refuses further
    /// appends.
    pub fn append(&mut self, position: u64, payload: &[u8]) -> Result<()> {
        if self.poisoned {
            return Err(PersistenceError::Poisoned);
        }
        if position != self.next_pos {
            return Err(PersistenceError::OutOfOrder {
                expected: self.next_pos,
                found: position,
            });
        }
        let rec = RecordHeader::new(position, payload)?;
        let mut buf = Vec::with_capacity(RecordHeader::SIZE + payload.len());
        rec.write_to(&mut buf)?;
        buf.extend_from_slice(payload);

        if let Err(e) = self.write_durable(&buf) {
            if self.file.set_len(self.len).is_err() {
                self.poisoned = true;
            }
            return Err(e.into());
        }
        self.len += buf.len() as u64;
        self.next_pos += 1;
        Ok(())
    }

    fn write_durable(&mut self, buf: &[u8]) -> io::Result<()> {
        self.file.seek(SeekFrom::Start(self.len))?;
        self.file.write_all(buf)?;
        self.file.sync_data()
    }

    pub fn header(&self) -> &SegmentHeader {
        &self.header
    }

    pub fn next_position(&self) -> u64 {
        self.next_pos
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Iterates the records of a segment as of the moment it was opened.
pub struct SegmentReader {
    reader: BufReader<File>,
    header: SegmentHeader,
    expected: u64,
    remaining: u64,
    failed: bool,
}

impl SegmentReader {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let file = File::open(path.as_ref())?;
        let len = file.metadata()?.len();
        if len < SegmentHeader::SIZE as u64 {
            return Err(PersistenceError::TruncatedHeader { len });
        }
        let mut reader = BufReader::new(file);
        let header = SegmentHeader::read_from(&mut reader)?;
        Ok(Self {
            reader,
            expected: header.start_pos,
            remaining: len - SegmentHeader::SIZE as u64,
            header,
            failed: false,
        })
    }

    pub fn header(&self) -> &SegmentHeader {
        &self.header
    }

    fn read_record(&mut self) -> Result<SegmentRecord> {
        let truncated = PersistenceError::TruncatedRecord { position: self.expected };
        if self.remaining < RecordHeader::SIZE as u64 {
            return Err(truncated);
        }
        let rec = RecordHeader::read_from(&mut self.reader)?;
        let needed = RecordHeader::SIZE as u64 + rec.payload_len as u64;
        if self.remaining < needed {
            return Err(truncated);
        }
        let mut payload = vec![0u8; rec.payload_len as usize];
        self.reader.read_exact(&mut payload)?;
        verify(&rec, &payload)?;
        if rec.position != self.expected {
            return Err(PersistenceError::OutOfOrder {
                expected: self.expected,
                found: rec.position,
            });
        }
        self.remaining -= needed;
        self.expected += 1;
        Ok(SegmentRecord {
            position: rec.position,
            payload,
        })
    }
}

impl Iterator for SegmentReader {
    type Item = Result<SegmentRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.remaining == 0 {
            return None;
        }
        let result = self.read_record();
        if result.is_err() {
            self.failed = true;
        }
        Some(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn seg_path(dir: &Path) -> PathBuf {
        dir.join("span-00000000000000000000.seg")
    }

    #[test]
    fn header_round_trip() {
        let header = SegmentHeader::new(42, 3);
        let bytes = header.to_bytes();
        let decoded = SegmentHeader::read_from(&bytes[..]).unwrap();
        assert_eq!(header, decoded);
    }

    #[test]
    fn invalid_magic_is_rejected() {
        let mut bytes = SegmentHeader::new(0, 0).to_bytes();
        bytes[0..4].copy_from_slice(b"BADM");
        assert!(matches!(SegmentHeader::read_from(&bytes[..]), Err(PersistenceError::InvalidMagic)));
    }

    #[test]
    fn write_append_and_read_back() {
        let dir = tempdir().unwrap();
        let path = seg_path(dir.path());
        write_segment(&path, &SegmentHeader::new(10, 1), &[b"a".to_vec(), b"bb".to_vec()]).unwrap();

        let (mut writer, scan) = SegmentWriter::open(&path).unwrap();
        assert_eq!(scan.records, 2);
        assert_eq!(writer.next_position(), 12);
        writer.append(12, b"ccc").unwrap();
        assert!(matches!(writer.append(14, b"x"), Err(PersistenceError::OutOfOrder { expected: 13, found: 14 })));

        let records: Vec<_> = SegmentReader::open(&path).unwrap().map(|r| r.unwrap()).collect();
        let positions: Vec<u64> = records.iter().map(|r| r.position).collect();
        assert_eq!(positions, vec![10, 11, 12]);
        assert_eq!(records[2].payload, b"ccc");
        assert!(!dir.path().join("span-00000000000000000000.tmp").exists());
    }

    #[test]
    fn torn_tail_is_truncated_on_open() {
        let dir = tempdir().unwrap();
        let path = seg_path(dir.path());
        write_segment(&path, &SegmentHeader::new(0, 0), &[b"first".to_vec(), b"second".to_vec()]).unwrap();
        let full = fs::metadata(&path).unwrap().len();
        let file = OpenOptions::new().write(true).open(&path).unwrap();
        file.set_len(full - 3).unwrap();
        drop(file);

        let (mut writer, scan) = SegmentWriter::open(&path).unwrap();
        assert_eq!(scan.records, 1);
        assert!(scan.torn_bytes > 0);
        assert_eq!(writer.next_position(), 1);
        writer.append(1, b"again").unwrap();

        let payloads: Vec<_> = SegmentReader::open(&path).unwrap().map(|r| r.unwrap().payload).collect();
        assert_eq!(payloads, vec![b"first".to_vec(), b"again".to_vec()]);
    }

    #[test]
    fn flipped_byte_mid_file_is_corruption() {
        let dir = tempdir().unwrap();
        let path = seg_path(dir.path());
        write_segment(&path, &SegmentHeader::new(0, 0), &[b"alpha".to_vec(), b"beta".to_vec()]).unwrap();
        let mut bytes = fs::read(&path).unwrap();
        let idx = SegmentHeader::SIZE + RecordHeader::SIZE + 1;
        bytes[idx] ^= 0xFF;
        fs::write(&path, &bytes).unwrap();

        assert!(matches!(scan_segment(&path), Err(PersistenceError::ChecksumMismatch { position: 0, .. })));
        assert!(SegmentWriter::open(&path).is_err());
        let first = SegmentReader::open(&path).unwrap().next().unwrap();
        assert!(first.is_err());
    }

    #[test]
    fn reader_reports_truncation_instead_of_stopping() {
        let dir = tempdir().unwrap();
        let path = seg_path(dir.path());
        write_segment(&path, &SegmentHeader::new(0, 0), &[b"one".to_vec(), b"two".to_vec()]).unwrap();
        let full = fs::metadata(&path).unwrap().len();
        OpenOptions::new().write(true).open(&path).unwrap().set_len(full - 1).unwrap();

        let results: Vec<_> = SegmentReader::open(&path).unwrap().collect();
        assert_eq!(results.len(), 2);
        assert!(results[0].is_ok());
        assert!(matches!(results[1], Err(PersistenceError::TruncatedRecord { position: 1 })));
    }
}
