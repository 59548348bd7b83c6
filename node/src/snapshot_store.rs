// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! Snapshot Store
//!
//! Durable worker-state blobs keyed by `(vat, end_pos)`:
//!
//! ```text
//! <root>/<vat>/00000000000000000003.snap   in use
//! <root>/<vat>/00000000000000000010.old    superseded, awaiting pruning
//! ```
//!
//! # Guarantees
//! - `save` returns only after the blob, its header and the directory entry
//!   are fsynced.
//! - `latest` never returns a superseded snapshot.
//! - Pruning only ever deletes superseded files.

use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, warn};
use vatlog_kernel::types::{Incarnation, Position, VatId};
use vatlog_persistence::fsync_dir;
use vatlog_persistence::snapshot::{read_header, read_snapshot, write_snapshot, SnapshotHeader};

use crate::errors::{VatError, VatResult};

const IN_USE_EXT: &str = "snap";
const SUPERSEDED_EXT: &str = "old";

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct SnapshotId {
    pub vat_id: VatId,
    pub end_pos: Position,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SnapshotInfo {
    pub vat_id: VatId,
    pub end_pos: Position,
    pub incarnation: Incarnation,
    pub hash: [u8; 32],
    pub size: u64,
    pub in_use: bool,
}

impl SnapshotInfo {
    pub fn id(&self) -> SnapshotId {
        SnapshotId {
            vat_id: self.vat_id.clone(),
            end_pos: self.end_pos,
        }
    }
}

pub struct LoadedSnapshot {
    pub info: SnapshotInfo,
    pub blob: Vec<u8>,
}

struct VatSnapshots {
    dir: PathBuf,
    infos: BTreeMap<Position, SnapshotInfo>,
}

impl VatSnapshots {
    fn path(&self, end_pos: Position, in_use: bool) -> PathBuf {
        let ext = if in_use { IN_USE_EXT } else { SUPERSEDED_EXT };
        self.dir.join(format!("{:020}.{}", end_pos, ext))
    }

    fn open(vat: &VatId, dir: PathBuf) -> VatResult<Self> {
        let mut infos: BTreeMap<Position, SnapshotInfo> = BTreeMap::new();
        for dir_entry in fs::read_dir(&dir)? {
            let path = dir_entry?.path();
            let ext = path.extension().and_then(|e| e.to_str()).unwrap_or_default().to_string();
            if ext == "tmp" {
                warn!(vat = %vat, file = %path.display(), "removing unfinished snapshot");
                fs::remove_file(&path)?;
                continue;
            }
            let in_use = match ext.as_str() {
                IN_USE_EXT => true,
                SUPERSEDED_EXT => false,
                _ => continue,
            };
            let Some(end_pos) = path
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(|s| s.parse::<Position>().ok())
            else {
                continue;
            };
            let header = match read_header(&path) {
                Ok(header) => header,
                Err(e) if !in_use => {
                    warn!(vat = %vat, end_pos, error = %e, "removing unreadable superseded snapshot");
                    fs::remove_file(&path)?;
                    continue;
                }
                Err(e) => return Err(VatError::corruption(vat, format!("snapshot {}: {}", end_pos, e))),
            };
            if header.end_pos != end_pos {
                return Err(VatError::corruption(
                    vat,
                    format!("snapshot file {} claims end position {}", end_pos, header.end_pos),
                ));
            }
            match infos.get(&end_pos) {
                // a superseded copy left beside a later save of the same position
                Some(existing) if existing.in_use => {
                    fs::remove_file(&path)?;
                    continue;
                }
                Some(_) => {
                    fs::remove_file(dir.join(format!("{:020}.{}", end_pos, SUPERSEDED_EXT)))?;
                }
                None => {}
            }
            infos.insert(
                end_pos,
                SnapshotInfo {
                    vat_id: vat.clone(),
                    end_pos,
                    incarnation: header.incarnation,
                    hash: header.blob_hash,
                    size: header.blob_len,
                    in_use,
                },
            );
        }
        Ok(Self { dir, infos })
    }
}

pub struct SnapshotStore {
    root: PathBuf,
    keep_superseded: bool,
    vats: RwLock<FxHashMap<VatId, Arc<Mutex<VatSnapshots>>>>,
}

impl SnapshotStore {
    pub fn open(root: impl Into<PathBuf>, keep_superseded: bool) -> VatResult<Self> {
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
            let snapshots = VatSnapshots::open(&vat, dir_entry.path())?;
            vats.insert(vat, Arc::new(Mutex::new(snapshots)));
        }
        Ok(Self {
            root,
            keep_superseded,
            vats: RwLock::new(vats),
        })
    }

    fn handle(&self, vat: &VatId) -> Option<Arc<Mutex<VatSnapshots>>> {
        self.vats.read().get(vat).cloned()
    }

    fn handle_or_create(&self, vat: &VatId) -> VatResult<Arc<Mutex<VatSnapshots>>> {
        if let Some(handle) = self.handle(vat) {
            return Ok(handle);
        }
        let mut vats = self.vats.write();
        if let Some(handle) = vats.get(vat) {
            return Ok(handle.clone());
        }
        let dir = self.root.join(vat.as_str());
        fs::create_dir_all(&dir)?;
        fsync_dir(&self.root)?;
        let handle = Arc::new(Mutex::new(VatSnapshots {
            dir,
            infos: BTreeMap::new(),
        }));
        vats.insert(vat.clone(), handle.clone());
        Ok(handle)
    }

    /// Durably store `blob` as the state of `vat` just before `end_pos`.
    pub fn save(&self, vat: &VatId, end_pos: Position, incarnation: Incarnation, blob: &[u8]) -> VatResult<SnapshotId> {
        let handle = self.handle_or_create(vat)?;
        let mut snapshots = handle.lock();
        let stale = snapshots.path(end_pos, false);
        if stale.exists() {
            fs::remove_file(&stale)?;
        }
        let header = SnapshotHeader::new(incarnation, end_pos, blob);
        write_snapshot(snapshots.path(end_pos, true), &header, blob)?;
        snapshots.infos.insert(
            end_pos,
            SnapshotInfo {
                vat_id: vat.clone(),
                end_pos,
                incarnation,
                hash: header.blob_hash,
                size: header.blob_len,
                in_use: true,
            },
        );
        metrics::counter!("vatlog_snapshots_saved_total", 1);
        info!(vat = %vat, end_pos, incarnation, size = blob.len(), "saved snapshot");
        Ok(SnapshotId {
            vat_id: vat.clone(),
            end_pos,
        })
    }

    /// Metadata of the newest in-use snapshot.
    pub fn latest_info(&self, vat: &VatId) -> Option<SnapshotInfo> {
        let handle = self.handle(vat)?;
        let snapshots = handle.lock();
        snapshots.infos.values().rev().find(|i| i.in_use).cloned()
    }

    /// Newest in-use snapshot with its verified blob.
    pub fn latest(&self, vat: &VatId) -> VatResult<Option<LoadedSnapshot>> {
        let Some(handle) = self.handle(vat) else {
            return Ok(None);
        };
        let snapshots = handle.lock();
        let Some(info) = snapshots.infos.values().rev().find(|i| i.in_use).cloned() else {
            return Ok(None);
        };
        let blob = read_blob(vat, &snapshots, &info)?;
        Ok(Some(LoadedSnapshot { info, blob }))
    }

    /// Any snapshot still on disk, in use or superseded.
    pub fn load(&self, id: &SnapshotId) -> VatResult<LoadedSnapshot> {
        let not_found = || VatError::NotFound {
            vat: id.vat_id.clone(),
            what: format!("snapshot ending at {}", id.end_pos),
        };
        let handle = self.handle(&id.vat_id).ok_or_else(not_found)?;
        let snapshots = handle.lock();
        let info = snapshots.infos.get(&id.end_pos).cloned().ok_or_else(not_found)?;
        let blob = read_blob(&id.vat_id, &snapshots, &info)?;
        Ok(LoadedSnapshot { info, blob })
    }

    pub fn list(&self, vat: &VatId) -> Vec<SnapshotInfo> {
        match self.handle(vat) {
            Some(handle) => handle.lock().infos.values().cloned().collect(),
            None => Vec::new(),
        }
    }

    pub fn list_all(&self) -> Vec<SnapshotInfo> {
        let handles: Vec<_> = self.vats.read().values().cloned().collect();
        let mut all: Vec<SnapshotInfo> = handles
            .iter()
            .flat_map(|h| h.lock().infos.values().cloned().collect::<Vec<_>>())
            .collect();
        all.sort_by(|a, b| a.vat_id.cmp(&b.vat_id).then(a.end_pos.cmp(&b.end_pos)));
        all
    }

    /// Mark a snapshot as no longer needed for replay. Idempotent.
    pub fn mark_superseded(&self, id: &SnapshotId) -> VatResult<()> {
        let Some(handle) = self.handle(&id.vat_id) else {
            return Ok(());
        };
        let mut snapshots = handle.lock();
        supersede(&mut snapshots, id.end_pos)?;
        Ok(())
    }

    /// Mark every snapshot of `vat` superseded. Returns how many changed.
    pub fn stop_using(&self, vat: &VatId) -> VatResult<usize> {
        let Some(handle) = self.handle(vat) else {
            return Ok(0);
        };
        let mut snapshots = handle.lock();
        let in_use: Vec<Position> = snapshots.infos.values().filter(|i| i.in_use).map(|i| i.end_pos).collect();
        for end_pos in &in_use {
            supersede(&mut snapshots, *end_pos)?;
        }
        Ok(in_use.len())
    }

    /// Delete superseded snapshot files. A no-op when configured to keep them.
    pub fn prune(&self) -> VatResult<usize> {
        if self.keep_superseded {
            return Ok(0);
        }
        let handles: Vec<_> = self.vats.read().values().cloned().collect();
        let mut removed = 0;
        for handle in handles {
            let mut snapshots = handle.lock();
            let doomed: Vec<Position> = snapshots.infos.values().filter(|i| !i.in_use).map(|i| i.end_pos).collect();
            if doomed.is_empty() {
                continue;
            }
            for end_pos in doomed {
                let path = snapshots.path(end_pos, false);
                match fs::remove_file(&path) {
                    Ok(()) => {}
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => return Err(e.into()),
                }
                snapshots.infos.remove(&end_pos);
                removed += 1;
            }
            fsync_dir(&snapshots.dir)?;
        }
        if removed > 0 {
            metrics::counter!("vatlog_snapshots_pruned_total", removed as u64);
            debug!(removed, "pruned superseded snapshots");
        }
        Ok(removed)
    }
}

fn supersede(snapshots: &mut VatSnapshots, end_pos: Position) -> VatResult<()> {
    let in_use = match snapshots.infos.get(&end_pos) {
        Some(info) => info.in_use,
        None => return Ok(()),
    };
    if !in_use {
        return Ok(());
    }
    fs::rename(snapshots.path(end_pos, true), snapshots.path(end_pos, false))?;
    fsync_dir(&snapshots.dir)?;
    if let Some(info) = snapshots.infos.get_mut(&end_pos) {
        info.in_use = false;
    }
    debug!(end_pos, "marked snapshot superseded");
    Ok(())
}

fn read_blob(vat: &VatId, snapshots: &VatSnapshots, info: &SnapshotInfo) -> VatResult<Vec<u8>> {
    let path = snapshots.path(info.end_pos, info.in_use);
    let (header, blob) = read_snapshot(&path)
        .map_err(|e| VatError::corruption(vat, format!("snapshot {}: {}", info.end_pos, e)))?;
    if header.blob_hash != info.hash || header.incarnation != info.incarnation {
        return Err(VatError::corruption(vat, format!("snapshot {} changed on disk", info.end_pos)));
    }
    Ok(blob)
}
