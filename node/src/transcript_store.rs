// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! Transcript Store
//!
//! Append-only, per-vat delivery log split into spans. Each span is one
//! segment file named after its start position:
//!
//! ```text
//! <root>/<vat>/span-00000000000000000000.seg
//! <root>/<vat>/span-00000000000000000003.seg   <- current span
//! ```
//!
//! # Invariants
//! - Positions of a vat are dense from 0; spans tile them without gap or
//!   overlap.
//! - Only the current span accepts appends. Earlier spans are sealed and
//!   never rewritten.
//! - A span always begins with `initialize-worker` or `load-snapshot`.
//!   New segments are written whole (temp file + rename), so a span never
//!   exists without its opening entries.
//! - An append returns only after the entry is fsynced.

use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};
use vatlog_kernel::delivery::{Delivery, DeliveryKind, DeliveryStatus, RecordedSyscall, TranscriptEntry};
use vatlog_kernel::types::{Incarnation, Position, SnapshotRef, SpanBounds, VatId};
use vatlog_persistence::fsync_dir;
use vatlog_persistence::segment::{scan_segment, write_segment, SegmentHeader, SegmentReader, SegmentWriter};

use crate::errors::{VatError, VatResult};

/// An entry before the store has assigned it a position.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryDraft {
    pub delivery: Delivery,
    pub syscalls: Vec<RecordedSyscall>,
    pub status: DeliveryStatus,
}

impl EntryDraft {
    pub fn new(delivery: Delivery, syscalls: Vec<RecordedSyscall>, status: DeliveryStatus) -> Self {
        Self { delivery, syscalls, status }
    }

    /// Pseudo-delivery with no syscalls.
    pub fn marker(delivery: Delivery) -> Self {
        Self::new(delivery, Vec::new(), DeliveryStatus::Ok)
    }

    pub fn kind(&self) -> DeliveryKind {
        self.delivery.kind()
    }

    fn into_entry(self, vat: &VatId, position: Position) -> TranscriptEntry {
        TranscriptEntry {
            vat_id: vat.clone(),
            position,
            delivery: self.delivery,
            syscalls: self.syscalls,
            status: self.status,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SpanInfo {
    pub bounds: SpanBounds,
    /// Snapshot loaded by the span's first entry, if it opens with one.
    pub opened_by: Option<SnapshotRef>,
    pub current: bool,
}

#[derive(Debug, Clone)]
struct SpanMeta {
    start_pos: Position,
    end_pos: Position,
    incarnation: Incarnation,
    opened_by: Option<SnapshotRef>,
    path: PathBuf,
}

impl SpanMeta {
    fn bounds(&self) -> SpanBounds {
        SpanBounds {
            start_pos: self.start_pos,
            end_pos: self.end_pos,
            incarnation: self.incarnation,
        }
    }
}

struct VatTranscript {
    dir: PathBuf,
    sealed: Vec<SpanMeta>,
    current: SpanMeta,
    writer: SegmentWriter,
    stopped: bool,
}

fn segment_name(start_pos: Position) -> String {
    format!("span-{:020}.seg", start_pos)
}

fn parse_segment_name(name: &str) -> Option<Position> {
    name.strip_prefix("span-")?.strip_suffix(".seg")?.parse().ok()
}

fn decode_record(vat: &VatId, position: Position, payload: &[u8]) -> VatResult<TranscriptEntry> {
    let entry = TranscriptEntry::decode(payload)
        .map_err(|e| VatError::corruption(vat, format!("entry {}: {}", position, e)))?;
    if entry.position != position {
        return Err(VatError::corruption(
            vat,
            format!("record {} holds entry for position {}", position, entry.position),
        ));
    }
    if entry.vat_id != *vat {
        return Err(VatError::corruption(
            vat,
            format!("entry {} belongs to vat {}", position, entry.vat_id),
        ));
    }
    Ok(entry)
}

fn encode_all(vat: &VatId, start: Position, opening: Vec<EntryDraft>) -> VatResult<(Vec<TranscriptEntry>, Vec<Vec<u8>>)> {
    let mut entries = Vec::with_capacity(opening.len());
    let mut encoded = Vec::with_capacity(opening.len());
    for (i, draft) in opening.into_iter().enumerate() {
        let entry = draft.into_entry(vat, start + i as u64);
        encoded.push(entry.encode()?);
        entries.push(entry);
    }
    Ok((entries, encoded))
}

/// First entry of a segment; must open a worker.
fn read_opening(vat: &VatId, path: &Path, start_pos: Position) -> VatResult<Option<SnapshotRef>> {
    let mut reader = SegmentReader::open(path)?;
    let record = match reader.next() {
        Some(record) => record?,
        None => return Err(VatError::corruption(vat, format!("span at {} is empty", start_pos))),
    };
    let entry = decode_record(vat, record.position, &record.payload)?;
    match entry.delivery {
        Delivery::InitializeWorker { .. } => Ok(None),
        Delivery::LoadSnapshot { snapshot } => Ok(Some(snapshot)),
        other => Err(VatError::corruption(
            vat,
            format!("span at {} opens with {}", start_pos, other.kind().as_str()),
        )),
    }
}

impl VatTranscript {
    fn open(vat: &VatId, dir: PathBuf) -> VatResult<Option<Self>> {
        let mut segments = Vec::new();
        for dir_entry in fs::read_dir(&dir)? {
            let dir_entry = dir_entry?;
            let name = dir_entry.file_name().to_string_lossy().into_owned();
            if name.ends_with(".tmp") {
                warn!(vat = %vat, file = %name, "removing unfinished segment");
                fs::remove_file(dir_entry.path())?;
                continue;
            }
            if let Some(start) = parse_segment_name(&name) {
                segments.push((start, dir_entry.path()));
            }
        }
        if segments.is_empty() {
            return Ok(None);
        }
        segments.sort_by_key(|(start, _)| *start);

        let last = segments.len() - 1;
        let mut sealed = Vec::with_capacity(last);
        let mut expected_start = 0;
        let mut incarnation = 0;
        let mut current = None;
        for (i, (start, path)) in segments.into_iter().enumerate() {
            if start != expected_start {
                return Err(VatError::corruption(
                    vat,
                    format!("span file starts at {}, expected {}", start, expected_start),
                ));
            }
            let (scan, writer) = if i < last {
                let scan = scan_segment(&path)?;
                if scan.torn_bytes > 0 {
                    return Err(VatError::corruption(vat, format!("sealed span at {} has a torn tail", start)));
                }
                (scan, None)
            } else {
                let (writer, scan) = SegmentWriter::open(&path)?;
                if scan.torn_bytes > 0 {
                    warn!(vat = %vat, bytes = scan.torn_bytes, "truncated torn record at transcript tail");
                }
                (scan, Some(writer))
            };
            if scan.header.start_pos != start || scan.records == 0 {
                return Err(VatError::corruption(vat, format!("span file at {} has a bad header or no entries", start)));
            }
            if scan.header.incarnation < incarnation {
                return Err(VatError::corruption(vat, format!("incarnation goes backwards at span {}", start)));
            }
            incarnation = scan.header.incarnation;

            let meta = SpanMeta {
                start_pos: start,
                end_pos: scan.next_pos,
                incarnation,
                opened_by: read_opening(vat, &path, start)?,
                path,
            };
            expected_start = meta.end_pos;
            match writer {
                Some(writer) => current = Some((meta, writer)),
                None => sealed.push(meta),
            }
        }

        let Some((current, writer)) = current else {
            return Ok(None);
        };
        Ok(Some(Self {
            dir,
            sealed,
            current,
            writer,
            stopped: false,
        }))
    }

    fn span_containing(&self, pos: Position) -> Option<&SpanMeta> {
        if self.current.start_pos == pos {
            return Some(&self.current);
        }
        self.all_spans().find(|s| s.bounds().contains(pos))
    }

    fn all_spans(&self) -> impl Iterator<Item = &SpanMeta> {
        self.sealed.iter().chain(std::iter::once(&self.current))
    }
}

/// Lazily decodes the entries of one span.
pub struct SpanEntries {
    vat: VatId,
    reader: SegmentReader,
    end_pos: Position,
    next_pos: Position,
}

impl SpanEntries {
    fn open(vat: &VatId, span: &SpanMeta) -> VatResult<Self> {
        Ok(Self {
            vat: vat.clone(),
            reader: SegmentReader::open(&span.path)?,
            end_pos: span.end_pos,
            next_pos: span.start_pos,
        })
    }
}

impl Iterator for SpanEntries {
    type Item = VatResult<TranscriptEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.next_pos >= self.end_pos {
            return None;
        }
        let position = self.next_pos;
        self.next_pos += 1;
        let item = match self.reader.next() {
            Some(Ok(record)) => decode_record(&self.vat, position, &record.payload),
            Some(Err(e)) => Err(e.into()),
            None => Err(VatError::corruption(&self.vat, format!("span ends before position {}", position))),
        };
        if item.is_err() {
            self.end_pos = position;
        }
        Some(item)
    }
}

/// Entries from some position to the end of the transcript, across spans.
pub struct TranscriptCursor {
    vat: VatId,
    spans: std::vec::IntoIter<SpanMeta>,
    current: Option<SpanEntries>,
    from_pos: Position,
}

impl Iterator for TranscriptCursor {
    type Item = VatResult<TranscriptEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(entries) = self.current.as_mut() {
                match entries.next() {
                    Some(Ok(entry)) if entry.position < self.from_pos => continue,
                    Some(item) => return Some(item),
                    None => self.current = None,
                }
            }
            let span = self.spans.next()?;
            match SpanEntries::open(&self.vat, &span) {
                Ok(entries) => self.current = Some(entries),
                Err(e) => return Some(Err(e)),
            }
        }
    }
}

pub struct TranscriptStore {
    root: PathBuf,
    vats: RwLock<FxHashMap<VatId, Arc<Mutex<VatTranscript>>>>,
}

impl TranscriptStore {
    /// Open every vat transcript under `root`, repairing torn tails.
    pub fn open(root: impl Into<PathBuf>) -> VatResult<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        let mut vats = FxHashMap::default();
        for dir_entry in fs::read_dir(&root)? {
            let dir_entry = dir_entry?;
            if !dir_entry.file_type()?.is_dir() {
                continue;
            }
            let name = dir_entry.file_name().to_string_lossy().into_owned();
            let Ok(vat) = VatId::new(name.clone()) else {
                warn!(dir = %name, "ignoring directory that is not a vat id");
                continue;
            };
            if let Some(transcript) = VatTranscript::open(&vat, dir_entry.path())? {
                vats.insert(vat, Arc::new(Mutex::new(transcript)));
            }
        }
        debug!(root = %root.display(), vats = vats.len(), "opened transcript store");
        Ok(Self {
            root,
            vats: RwLock::new(vats),
        })
    }

    fn handle(&self, vat: &VatId) -> VatResult<Arc<Mutex<VatTranscript>>> {
        self.vats
            .read()
            .get(vat)
            .cloned()
            .ok_or_else(|| VatError::UnknownVat(vat.clone()))
    }

    pub fn contains(&self, vat: &VatId) -> bool {
        self.vats.read().contains_key(vat)
    }

    pub fn vat_ids(&self) -> Vec<VatId> {
        let mut ids: Vec<VatId> = self.vats.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Create a vat's first span, incarnation 0, holding `opening`.
    pub fn init_transcript(&self, vat: &VatId, opening: Vec<EntryDraft>) -> VatResult<Vec<TranscriptEntry>> {
        if opening.first().map(EntryDraft::kind) != Some(DeliveryKind::InitializeWorker) {
            return Err(VatError::protocol(vat, "a transcript must open with initialize-worker"));
        }
        let mut vats = self.vats.write();
        if vats.contains_key(vat) {
            return Err(VatError::AlreadyExists(vat.clone()));
        }
        let dir = self.root.join(vat.as_str());
        fs::create_dir_all(&dir)?;
        fsync_dir(&self.root)?;

        let (entries, encoded) = encode_all(vat, 0, opening)?;
        let path = dir.join(segment_name(0));
        write_segment(&path, &SegmentHeader::new(0, 0), &encoded)?;
        let (writer, _) = SegmentWriter::open(&path)?;
        let current = SpanMeta {
            start_pos: 0,
            end_pos: writer.next_position(),
            incarnation: 0,
            opened_by: None,
            path,
        };
        vats.insert(
            vat.clone(),
            Arc::new(Mutex::new(VatTranscript {
                dir,
                sealed: Vec::new(),
                current,
                writer,
                stopped: false,
            })),
        );
        metrics::counter!("vatlog_transcript_entries_total", entries.len() as u64);
        debug!(vat = %vat, entries = entries.len(), "initialized transcript");
        Ok(entries)
    }

    /// Durably append one entry to the current span and return it with its
    /// assigned position.
    pub fn append(&self, vat: &VatId, draft: EntryDraft) -> VatResult<TranscriptEntry> {
        let handle = self.handle(vat)?;
        let mut transcript = handle.lock();
        if transcript.stopped {
            return Err(VatError::VatDead(vat.clone()));
        }
        let position = transcript.current.end_pos;
        let entry = draft.into_entry(vat, position);
        let bytes = entry.encode()?;
        transcript.writer.append(position, &bytes)?;
        transcript.current.end_pos = transcript.writer.next_position();
        metrics::counter!("vatlog_transcript_entries_total", 1);
        debug!(vat = %vat, position, kind = entry.kind().as_str(), "appended transcript entry");
        Ok(entry)
    }

    /// Seal the current span and start a new one at the current write
    /// position, holding `opening`.
    ///
    /// `load-snapshot` keeps the incarnation and must reference the new
    /// start position; `initialize-worker` requires a higher incarnation.
    pub fn rotate_span(
        &self,
        vat: &VatId,
        incarnation: Incarnation,
        opening: Vec<EntryDraft>,
    ) -> VatResult<Vec<TranscriptEntry>> {
        let handle = self.handle(vat)?;
        let mut transcript = handle.lock();
        if transcript.stopped {
            return Err(VatError::VatDead(vat.clone()));
        }
        let start = transcript.current.end_pos;
        let current_incarnation = transcript.current.incarnation;
        let opened_by = match opening.first().map(|d| &d.delivery) {
            Some(Delivery::LoadSnapshot { snapshot }) => {
                if incarnation != current_incarnation {
                    return Err(VatError::protocol(vat, "load-snapshot cannot change the incarnation"));
                }
                if snapshot.end_pos != start {
                    return Err(VatError::protocol(
                        vat,
                        format!("snapshot ends at {} but the new span starts at {}", snapshot.end_pos, start),
                    ));
                }
                Some(*snapshot)
            }
            Some(Delivery::InitializeWorker { .. }) => {
                if incarnation <= current_incarnation {
                    return Err(VatError::protocol(
                        vat,
                        format!("incarnation {} does not follow {}", incarnation, current_incarnation),
                    ));
                }
                None
            }
            _ => return Err(VatError::protocol(vat, "a span must open with initialize-worker or load-snapshot")),
        };

        let (entries, encoded) = encode_all(vat, start, opening)?;
        let path = transcript.dir.join(segment_name(start));
        write_segment(&path, &SegmentHeader::new(start, incarnation), &encoded)?;
        let (writer, _) = SegmentWriter::open(&path)?;
        let next = SpanMeta {
            start_pos: start,
            end_pos: writer.next_position(),
            incarnation,
            opened_by,
            path,
        };
        let sealed = std::mem::replace(&mut transcript.current, next);
        transcript.sealed.push(sealed);
        transcript.writer = writer;
        metrics::counter!("vatlog_transcript_entries_total", entries.len() as u64);
        debug!(vat = %vat, start, incarnation, "rotated transcript span");
        Ok(entries)
    }

    pub fn current_span_bounds(&self, vat: &VatId) -> VatResult<SpanBounds> {
        Ok(self.handle(vat)?.lock().current.bounds())
    }

    pub fn current_span(&self, vat: &VatId) -> VatResult<SpanInfo> {
        let handle = self.handle(vat)?;
        let transcript = handle.lock();
        Ok(SpanInfo {
            bounds: transcript.current.bounds(),
            opened_by: transcript.current.opened_by,
            current: true,
        })
    }

    /// Every span in position order, current one last.
    pub fn spans(&self, vat: &VatId) -> VatResult<Vec<SpanInfo>> {
        let handle = self.handle(vat)?;
        let transcript = handle.lock();
        let current_start = transcript.current.start_pos;
        Ok(transcript
            .all_spans()
            .map(|s| SpanInfo {
                bounds: s.bounds(),
                opened_by: s.opened_by,
                current: s.start_pos == current_start,
            })
            .collect())
    }

    pub fn next_position(&self, vat: &VatId) -> VatResult<Position> {
        Ok(self.handle(vat)?.lock().current.end_pos)
    }

    /// Entries of the span that starts at or contains `pos`, from the span's
    /// first entry, as of this call.
    pub fn read_span(&self, vat: &VatId, pos: Position) -> VatResult<SpanEntries> {
        let handle = self.handle(vat)?;
        let transcript = handle.lock();
        let span = transcript.span_containing(pos).ok_or_else(|| VatError::NotFound {
            vat: vat.clone(),
            what: format!("span containing {}", pos),
        })?;
        SpanEntries::open(vat, span)
    }

    /// Entries at positions `>= from_pos`, across span boundaries.
    pub fn read_from(&self, vat: &VatId, from_pos: Position) -> VatResult<TranscriptCursor> {
        let handle = self.handle(vat)?;
        let transcript = handle.lock();
        let spans: Vec<SpanMeta> = transcript
            .all_spans()
            .filter(|s| s.end_pos > from_pos)
            .cloned()
            .collect();
        Ok(TranscriptCursor {
            vat: vat.clone(),
            spans: spans.into_iter(),
            current: None,
            from_pos,
        })
    }

    pub fn read_full_transcript(&self, vat: &VatId) -> VatResult<TranscriptCursor> {
        self.read_from(vat, 0)
    }

    pub fn last_entry(&self, vat: &VatId) -> VatResult<TranscriptEntry> {
        let bounds = self.current_span_bounds(vat)?;
        let mut last = None;
        for entry in self.read_span(vat, bounds.start_pos)? {
            last = Some(entry?);
        }
        last.ok_or_else(|| VatError::corruption(vat, "current span is empty"))
    }

    /// Freeze the transcript: later appends and rotations fail with `VatDead`.
    pub fn stop_using(&self, vat: &VatId) -> VatResult<()> {
        self.handle(vat)?.lock().stopped = true;
        Ok(())
    }

    pub fn is_stopped(&self, vat: &VatId) -> VatResult<bool> {
        Ok(self.handle(vat)?.lock().stopped)
    }
}
