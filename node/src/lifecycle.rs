// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! Vat Lifecycle
//!
//! Owns every vat's record and live worker and drives the transitions:
//!
//! ```text
//! (absent) --create--> Active --deliver--> Active
//!                      Active --upgrade--> Active (incarnation + 1)
//!                      Active --terminate--> Terminated (frozen)
//! ```
//!
//! # Protocol: snapshot rotation
//! 1. serialize the worker
//! 2. save the blob durably with `end_pos = save position + 1`
//! 3. append `save-snapshot`
//! 4. open a new span with `load-snapshot` at `end_pos`
//! 5. mark the previous snapshot superseded
//!
//! A crash after step 3 is completed on open; a crash before it leaves an
//! orphan blob that is superseded on open.
//!
//! # Protocol: upgrade
//! The old worker gets `bringOutYourDead`, the new worker is initialized and
//! runs `startVat`, all in memory. The recorded entries are then written to
//! the vat record as a pending upgrade before any of them touch the
//! transcript, so a crash part way through is finished on open without
//! running a worker.
//!
//! # Concurrency
//! One mutex per vat. Operations on different vats never wait on each
//! other; eviction only ever `try_lock`s a victim.

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use vatlog_kernel::activity::CrankHasher;
use vatlog_kernel::delivery::{Delivery, DeliveryStatus, Payload, RecordedSyscall};
use vatlog_kernel::error::KernelResult;
use vatlog_kernel::policy::{SnapshotPolicy, SpanProgress};
use vatlog_kernel::simulator::SyscallRecorder;
use vatlog_kernel::types::{Incarnation, Position, SnapshotRef, SpanBounds, VatId};
use vatlog_kernel::worker::{SyscallHandler, VatWorker, WorkerFactory};

use crate::errors::{VatError, VatResult};
use crate::replay::{Rebuilt, ReplayEngine};
use crate::snapshot_store::{SnapshotId, SnapshotStore};
use crate::state_file::{read_json, write_json_atomic};
use crate::transcript_store::{EntryDraft, SpanInfo, TranscriptStore};
use crate::warehouse::OnlineSet;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum VatStatus {
    #[default]
    Active,
    Terminated,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VatRecord {
    pub vat_id: VatId,
    pub incarnation: Incarnation,
    pub status: VatStatus,
    pub current_span: SpanBounds,
}

/// Entries an upgrade will write, recorded before the first one is.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct PendingUpgrade {
    incarnation: Incarnation,
    /// Next transcript position when the upgrade was recorded.
    closing_start: Position,
    closing: Vec<EntryDraft>,
    opening: Vec<EntryDraft>,
}

/// `vats/<vat>.json`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct VatRecordFile {
    status: VatStatus,
    #[serde(default)]
    pending_upgrade: Option<PendingUpgrade>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryReport {
    pub vat_id: VatId,
    pub position: Position,
    pub status: DeliveryStatus,
    pub syscalls: Vec<RecordedSyscall>,
    /// Snapshot taken by the policy right after this delivery.
    pub snapshot: Option<SnapshotId>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpgradeReport {
    pub vat_id: VatId,
    pub incarnation: Incarnation,
    /// Outcome of `startVat` in the new incarnation.
    pub start: DeliveryReport,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RebuildReport {
    pub vat_id: VatId,
    pub span: SpanBounds,
    pub replayed: u64,
    pub from_snapshot: Option<Position>,
}

#[derive(Debug, Clone, Copy)]
pub struct LifecycleSettings {
    pub policy: SnapshotPolicy,
    pub max_vats_online: usize,
    pub restart_worker_on_snapshot: bool,
}

struct VatSlot {
    vat_id: VatId,
    incarnation: Incarnation,
    status: VatStatus,
    span: SpanInfo,
    pending: Option<PendingUpgrade>,
    worker: Option<Box<dyn VatWorker>>,
}

impl VatSlot {
    fn record(&self) -> VatRecord {
        VatRecord {
            vat_id: self.vat_id.clone(),
            incarnation: self.incarnation,
            status: self.status,
            current_span: self.span.bounds,
        }
    }

    fn progress(&self) -> SpanProgress {
        SpanProgress {
            start_pos: self.span.bounds.start_pos,
            next_pos: self.span.bounds.end_pos,
            opened_by_snapshot: self.span.opened_by.is_some(),
        }
    }

    fn worker_mut(&mut self) -> VatResult<&mut Box<dyn VatWorker>> {
        let vat = self.vat_id.clone();
        self.worker
            .as_mut()
            .ok_or_else(|| VatError::protocol(&vat, "worker is not online"))
    }
}

fn run_delivery(
    worker: &mut dyn VatWorker,
    delivery: &Delivery,
    handler: &mut dyn SyscallHandler,
) -> KernelResult<(DeliveryStatus, Vec<RecordedSyscall>)> {
    let mut recorder = SyscallRecorder::new(handler);
    let status = worker.deliver(delivery, &mut recorder)?;
    Ok((status, recorder.into_recorded()))
}

fn worker_error(vat: &VatId) -> impl FnOnce(vatlog_kernel::error::KernelError) -> VatError + '_ {
    move |error| VatError::Worker { vat: vat.clone(), error }
}

pub struct VatLifecycle {
    transcripts: Arc<TranscriptStore>,
    snapshots: Arc<SnapshotStore>,
    replay: ReplayEngine,
    factory: Arc<dyn WorkerFactory>,
    records_dir: PathBuf,
    policy: RwLock<SnapshotPolicy>,
    restart_worker_on_snapshot: bool,
    slots: RwLock<BTreeMap<VatId, Arc<Mutex<VatSlot>>>>,
    online: Mutex<OnlineSet>,
}

impl VatLifecycle {
    /// Load every vat and reconcile what a crash may have left half done.
    ///
    /// Entries written while reconciling are not folded into any crank
    /// hash here; the kernel re-folds everything past its recorded
    /// positions after this returns.
    pub fn open(
        settings: LifecycleSettings,
        records_dir: impl Into<PathBuf>,
        transcripts: Arc<TranscriptStore>,
        snapshots: Arc<SnapshotStore>,
        factory: Arc<dyn WorkerFactory>,
    ) -> VatResult<Self> {
        let records_dir = records_dir.into();
        fs::create_dir_all(&records_dir)?;
        let lifecycle = Self {
            replay: ReplayEngine::new(transcripts.clone(), snapshots.clone(), factory.clone()),
            transcripts,
            snapshots,
            factory,
            records_dir,
            policy: RwLock::new(settings.policy),
            restart_worker_on_snapshot: settings.restart_worker_on_snapshot,
            slots: RwLock::new(BTreeMap::new()),
            online: Mutex::new(OnlineSet::new(settings.max_vats_online)),
        };

        for vat in lifecycle.recorded_vats()? {
            if !lifecycle.transcripts.contains(&vat) {
                return Err(VatError::corruption(&vat, "vat record exists without a transcript"));
            }
        }
        let mut scratch = CrankHasher::new();
        for vat in lifecycle.transcripts.vat_ids() {
            let file = match lifecycle.read_record(&vat)? {
                Some(file) => file,
                None => {
                    // creation stopped between the first span and the record
                    let file = VatRecordFile::default();
                    lifecycle.write_record(&vat, &file)?;
                    file
                }
            };
            let span = lifecycle.transcripts.current_span(&vat)?;
            let mut slot = VatSlot {
                vat_id: vat.clone(),
                incarnation: span.bounds.incarnation,
                status: file.status,
                span,
                pending: file.pending_upgrade,
                worker: None,
            };
            lifecycle.reconcile(&mut slot, &mut scratch)?;
            lifecycle.slots.write().insert(vat, Arc::new(Mutex::new(slot)));
        }
        info!(vats = lifecycle.slots.read().len(), "vat lifecycle opened");
        Ok(lifecycle)
    }

    fn record_path(&self, vat: &VatId) -> PathBuf {
        self.records_dir.join(format!("{}.json", vat))
    }

    fn read_record(&self, vat: &VatId) -> VatResult<Option<VatRecordFile>> {
        read_json(&self.record_path(vat))
    }

    fn write_record(&self, vat: &VatId, file: &VatRecordFile) -> VatResult<()> {
        write_json_atomic(&self.record_path(vat), file)
    }

    fn recorded_vats(&self) -> VatResult<Vec<VatId>> {
        let mut vats = Vec::new();
        for dir_entry in fs::read_dir(&self.records_dir)? {
            let path = dir_entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            if let Some(vat) = path.file_stem().and_then(|s| s.to_str()).and_then(|s| VatId::new(s).ok()) {
                vats.push(vat);
            }
        }
        Ok(vats)
    }

    fn reconcile(&self, slot: &mut VatSlot, crank: &mut CrankHasher) -> VatResult<()> {
        let vat = slot.vat_id.clone();
        if slot.status == VatStatus::Terminated {
            self.transcripts.stop_using(&vat)?;
            self.snapshots.stop_using(&vat)?;
            return Ok(());
        }

        if slot.pending.is_some() {
            info!(vat = %vat, "finishing interrupted upgrade");
            self.finish_upgrade(slot, crank)?;
        } else {
            let last = self.transcripts.last_entry(&vat)?;
            match last.delivery {
                Delivery::SaveSnapshot { snapshot } => self.roll_forward(slot, snapshot, crank)?,
                Delivery::ShutdownWorker => {
                    return Err(VatError::corruption(&vat, "transcript ends with shutdown-worker but no upgrade is pending"))
                }
                _ => {}
            }
        }

        // exactly the snapshot that opens the current span stays in use
        let keep = slot.span.opened_by.map(|s| s.end_pos);
        for info in self.snapshots.list(&vat) {
            if info.in_use && Some(info.end_pos) != keep {
                warn!(vat = %vat, end_pos = info.end_pos, "superseding snapshot not referenced by the current span");
                self.snapshots.mark_superseded(&info.id())?;
            }
        }
        Ok(())
    }

    /// Complete a rotation whose `save-snapshot` reached the transcript.
    fn roll_forward(&self, slot: &mut VatSlot, snapshot: SnapshotRef, crank: &mut CrankHasher) -> VatResult<()> {
        let vat = slot.vat_id.clone();
        let durable = self.snapshots.latest_info(&vat).is_some_and(|info| {
            info.end_pos == snapshot.end_pos && info.hash == snapshot.hash && info.incarnation == slot.incarnation
        });
        if !durable {
            warn!(vat = %vat, end_pos = snapshot.end_pos, "save-snapshot without a durable blob; span replays from its start");
            return Ok(());
        }
        let opened = self.transcripts.rotate_span(
            &vat,
            slot.incarnation,
            vec![EntryDraft::marker(Delivery::LoadSnapshot { snapshot })],
        )?;
        let previous = slot.span.opened_by;
        slot.span = self.transcripts.current_span(&vat)?;
        for entry in &opened {
            crank.add_entry(entry)?;
        }
        if let Some(previous) = previous {
            self.abandon_snapshot(&SnapshotId { vat_id: vat.clone(), end_pos: previous.end_pos });
        }
        info!(vat = %vat, start = slot.span.bounds.start_pos, "completed interrupted snapshot rotation");
        Ok(())
    }

    fn slot(&self, vat: &VatId) -> VatResult<Arc<Mutex<VatSlot>>> {
        self.slots
            .read()
            .get(vat)
            .cloned()
            .ok_or_else(|| VatError::UnknownVat(vat.clone()))
    }

    pub fn contains(&self, vat: &VatId) -> bool {
        self.slots.read().contains_key(vat)
    }

    /// All vats, terminated ones included, in id order.
    pub fn vat_ids(&self) -> Vec<VatId> {
        self.slots.read().keys().cloned().collect()
    }

    pub fn active_vat_ids(&self) -> Vec<VatId> {
        let slots: Vec<_> = self.slots.read().iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        slots
            .into_iter()
            .filter(|(_, slot)| slot.lock().status == VatStatus::Active)
            .map(|(vat, _)| vat)
            .collect()
    }

    pub fn record(&self, vat: &VatId) -> VatResult<VatRecord> {
        Ok(self.slot(vat)?.lock().record())
    }

    pub fn next_position(&self, vat: &VatId) -> VatResult<Position> {
        self.transcripts.next_position(vat)
    }

    pub fn is_online(&self, vat: &VatId) -> bool {
        match self.slots.read().get(vat) {
            Some(slot) => slot.lock().worker.is_some(),
            None => false,
        }
    }

    pub fn online_count(&self) -> usize {
        self.online.lock().len()
    }

    pub fn policy(&self) -> SnapshotPolicy {
        *self.policy.read()
    }

    pub fn set_snapshot_interval(&self, interval: u64) {
        self.policy.write().snapshot_interval = interval;
    }

    pub fn transcripts(&self) -> &TranscriptStore {
        &self.transcripts
    }

    pub fn snapshots(&self) -> &SnapshotStore {
        &self.snapshots
    }

    pub fn replay_engine(&self) -> &ReplayEngine {
        &self.replay
    }

    /// Create a vat: `initialize-worker` and `startVat` form its first span.
    pub fn create(
        &self,
        vat: &VatId,
        options: Payload,
        vat_parameters: Payload,
        handler: &mut dyn SyscallHandler,
        crank: &mut CrankHasher,
    ) -> VatResult<DeliveryReport> {
        if self.contains(vat) || self.transcripts.contains(vat) {
            return Err(VatError::AlreadyExists(vat.clone()));
        }
        let mut worker = self.factory.initialize(vat, &options).map_err(worker_error(vat))?;
        let start = Delivery::StartVat { vat_parameters };
        let (status, syscalls) = run_delivery(worker.as_mut(), &start, handler).map_err(worker_error(vat))?;

        let entries = self.transcripts.init_transcript(
            vat,
            vec![
                EntryDraft::marker(Delivery::InitializeWorker { options }),
                EntryDraft::new(start, syscalls.clone(), status.clone()),
            ],
        )?;
        for entry in &entries {
            crank.add_entry(entry)?;
        }
        self.write_record(vat, &VatRecordFile::default())?;

        let slot = VatSlot {
            vat_id: vat.clone(),
            incarnation: 0,
            status: VatStatus::Active,
            span: self.transcripts.current_span(vat)?,
            pending: None,
            worker: Some(worker),
        };
        let handle = Arc::new(Mutex::new(slot));
        self.slots.write().insert(vat.clone(), handle.clone());

        let snapshot = {
            let mut slot = handle.lock();
            self.maybe_snapshot(&mut slot, crank)
        };
        self.mark_online(vat);
        info!(vat = %vat, "created vat");
        Ok(DeliveryReport {
            vat_id: vat.clone(),
            position: entries.last().map(|e| e.position).unwrap_or_default(),
            status,
            syscalls,
            snapshot,
        })
    }

    /// Deliver one routine delivery, rebuilding the worker first if it is
    /// not online.
    pub fn deliver(
        &self,
        vat: &VatId,
        delivery: Delivery,
        handler: &mut dyn SyscallHandler,
        crank: &mut CrankHasher,
    ) -> VatResult<DeliveryReport> {
        if !delivery.kind().is_routine() {
            return Err(VatError::protocol(
                vat,
                format!("{} cannot be delivered directly", delivery.kind().as_str()),
            ));
        }
        let handle = self.slot(vat)?;
        let report = {
            let mut slot = handle.lock();
            self.ensure_live(&mut slot)?;
            let worker = slot.worker_mut()?;
            let (status, syscalls) = match run_delivery(worker.as_mut(), &delivery, handler) {
                Ok(result) => result,
                Err(error) => {
                    slot.worker = None;
                    return Err(VatError::Worker { vat: vat.clone(), error });
                }
            };
            let entry = match self
                .transcripts
                .append(vat, EntryDraft::new(delivery, syscalls.clone(), status.clone()))
            {
                Ok(entry) => entry,
                Err(e) => {
                    // the worker has moved past what the transcript holds
                    slot.worker = None;
                    return Err(e);
                }
            };
            slot.span.bounds.end_pos = entry.position + 1;
            crank.add_entry(&entry)?;
            let snapshot = self.maybe_snapshot(&mut slot, crank);
            DeliveryReport {
                vat_id: vat.clone(),
                position: entry.position,
                status,
                syscalls,
                snapshot,
            }
        };
        self.mark_online(vat);
        Ok(report)
    }

    /// Replace the vat's code: close the current incarnation and open the
    /// next one with `initialize-worker` and `startVat`.
    pub fn upgrade(
        &self,
        vat: &VatId,
        options: Payload,
        vat_parameters: Payload,
        handler: &mut dyn SyscallHandler,
        crank: &mut CrankHasher,
    ) -> VatResult<UpgradeReport> {
        let handle = self.slot(vat)?;
        let report = {
            let mut slot = handle.lock();
            self.ensure_live(&mut slot)?;

            let old = slot.worker_mut()?;
            let reaped = run_delivery(old.as_mut(), &Delivery::BringOutYourDead, handler);
            slot.worker = None;
            let (reap_status, reap_syscalls) = reaped.map_err(worker_error(vat))?;

            let incarnation = slot.incarnation + 1;
            let mut worker = self.factory.initialize(vat, &options).map_err(worker_error(vat))?;
            let start = Delivery::StartVat { vat_parameters };
            let (status, syscalls) = run_delivery(worker.as_mut(), &start, handler).map_err(worker_error(vat))?;

            let pending = PendingUpgrade {
                incarnation,
                closing_start: slot.span.bounds.end_pos,
                closing: vec![
                    EntryDraft::new(Delivery::BringOutYourDead, reap_syscalls, reap_status),
                    EntryDraft::marker(Delivery::ShutdownWorker),
                ],
                opening: vec![
                    EntryDraft::marker(Delivery::InitializeWorker { options }),
                    EntryDraft::new(start, syscalls.clone(), status.clone()),
                ],
            };
            self.write_record(
                vat,
                &VatRecordFile {
                    status: VatStatus::Active,
                    pending_upgrade: Some(pending.clone()),
                },
            )?;
            slot.pending = Some(pending);
            self.finish_upgrade(&mut slot, crank)?;
            slot.worker = Some(worker);

            let position = slot.span.bounds.start_pos + 1;
            let snapshot = self.maybe_snapshot(&mut slot, crank);
            UpgradeReport {
                vat_id: vat.clone(),
                incarnation,
                start: DeliveryReport {
                    vat_id: vat.clone(),
                    position,
                    status,
                    syscalls,
                    snapshot,
                },
            }
        };
        self.mark_online(vat);
        info!(vat = %vat, incarnation = report.incarnation, "upgraded vat");
        Ok(report)
    }

    /// Write whatever part of a pending upgrade is not yet in the
    /// transcript, then clear the intent.
    fn finish_upgrade(&self, slot: &mut VatSlot, crank: &mut CrankHasher) -> VatResult<()> {
        let Some(pending) = slot.pending.clone() else {
            return Ok(());
        };
        let vat = slot.vat_id.clone();
        let span = self.transcripts.current_span(&vat)?;
        if span.bounds.incarnation < pending.incarnation {
            let next = span.bounds.end_pos;
            let written = next.checked_sub(pending.closing_start).filter(|n| *n <= pending.closing.len() as u64);
            let Some(written) = written else {
                return Err(VatError::corruption(
                    &vat,
                    format!("pending upgrade recorded at {} but transcript is at {}", pending.closing_start, next),
                ));
            };
            for draft in pending.closing.iter().skip(written as usize) {
                let entry = self.transcripts.append(&vat, draft.clone())?;
                crank.add_entry(&entry)?;
            }
            let opened = self.transcripts.rotate_span(&vat, pending.incarnation, pending.opening.clone())?;
            for entry in &opened {
                crank.add_entry(entry)?;
            }
        }
        for info in self.snapshots.list(&vat) {
            if info.in_use && info.incarnation < pending.incarnation {
                self.snapshots.mark_superseded(&info.id())?;
            }
        }
        self.write_record(&vat, &VatRecordFile::default())?;
        slot.pending = None;
        slot.incarnation = pending.incarnation;
        slot.span = self.transcripts.current_span(&vat)?;
        debug!(vat = %vat, incarnation = slot.incarnation, start = slot.span.bounds.start_pos, "opened new incarnation");
        Ok(())
    }

    /// Permanently stop a vat. Its transcript stays readable.
    pub fn terminate(&self, vat: &VatId) -> VatResult<()> {
        let handle = self.slot(vat)?;
        {
            let mut slot = handle.lock();
            if slot.status == VatStatus::Terminated {
                return Err(VatError::VatDead(vat.clone()));
            }
            self.write_record(
                vat,
                &VatRecordFile {
                    status: VatStatus::Terminated,
                    pending_upgrade: None,
                },
            )?;
            slot.status = VatStatus::Terminated;
            slot.pending = None;
            slot.worker = None;
            self.transcripts.stop_using(vat)?;
            self.snapshots.stop_using(vat)?;
        }
        self.online.lock().remove(vat);
        info!(vat = %vat, "terminated vat");
        Ok(())
    }

    /// Throw away the live worker and replay the current span.
    pub fn rebuild(&self, vat: &VatId) -> VatResult<RebuildReport> {
        let handle = self.slot(vat)?;
        let report = {
            let Some(mut slot) = handle.try_lock() else {
                return Err(VatError::protocol(vat, "replay requested while a delivery is in flight"));
            };
            if slot.status == VatStatus::Terminated {
                return Err(VatError::VatDead(vat.clone()));
            }
            if slot.pending.is_some() {
                return Err(VatError::protocol(vat, "an upgrade is still pending"));
            }
            slot.worker = None;
            let rebuilt = self.replay.rebuild(&slot.record())?;
            let report = RebuildReport {
                vat_id: vat.clone(),
                span: rebuilt.span,
                replayed: rebuilt.replayed,
                from_snapshot: rebuilt.loaded_snapshot.map(|s| s.end_pos),
            };
            slot.worker = Some(rebuilt.worker);
            report
        };
        self.mark_online(vat);
        Ok(report)
    }

    /// Take a snapshot now unless the span holds nothing since its
    /// opening snapshot. Terminated vats are skipped.
    pub fn snapshot_now(&self, vat: &VatId, crank: &mut CrankHasher) -> VatResult<Option<SnapshotId>> {
        let handle = self.slot(vat)?;
        let id = {
            let mut slot = handle.lock();
            if slot.status == VatStatus::Terminated {
                return Ok(None);
            }
            if slot.span.opened_by.is_some() && slot.span.bounds.len() <= 1 {
                return Ok(None);
            }
            self.ensure_live(&mut slot)?;
            self.snapshot_slot(&mut slot, crank)?
        };
        self.mark_online(vat);
        Ok(Some(id))
    }

    /// Serialize the live worker without persisting anything.
    pub fn capture_state(&self, vat: &VatId) -> VatResult<Vec<u8>> {
        let handle = self.slot(vat)?;
        let state = {
            let mut slot = handle.lock();
            self.ensure_live(&mut slot)?;
            slot.worker_mut()?.save_snapshot().map_err(worker_error(vat))?
        };
        self.mark_online(vat);
        Ok(state)
    }

    fn ensure_live(&self, slot: &mut VatSlot) -> VatResult<()> {
        if slot.status == VatStatus::Terminated {
            return Err(VatError::VatDead(slot.vat_id.clone()));
        }
        if slot.pending.is_some() {
            return Err(VatError::protocol(&slot.vat_id, "an upgrade is still pending"));
        }
        if slot.worker.is_none() {
            let Rebuilt { worker, .. } = self.replay.rebuild(&slot.record())?;
            slot.worker = Some(worker);
        }
        Ok(())
    }

    fn maybe_snapshot(&self, slot: &mut VatSlot, crank: &mut CrankHasher) -> Option<SnapshotId> {
        let reason = self.policy.read().evaluate(&slot.progress())?;
        debug!(vat = %slot.vat_id, ?reason, "snapshot policy triggered");
        match self.snapshot_slot(slot, crank) {
            Ok(id) => Some(id),
            Err(e) => {
                error!(vat = %slot.vat_id, error = %e, "snapshot rotation failed; span keeps growing");
                None
            }
        }
    }

    fn snapshot_slot(&self, slot: &mut VatSlot, crank: &mut CrankHasher) -> VatResult<SnapshotId> {
        let vat = slot.vat_id.clone();
        let blob = slot.worker_mut()?.save_snapshot().map_err(worker_error(&vat))?;
        let end_pos = slot.span.bounds.end_pos + 1;
        let snapshot = SnapshotRef {
            end_pos,
            hash: *blake3::hash(&blob).as_bytes(),
        };

        let id = self.snapshots.save(&vat, end_pos, slot.incarnation, &blob)?;
        let saved = self
            .transcripts
            .append(&vat, EntryDraft::marker(Delivery::SaveSnapshot { snapshot }));
        let saved = match saved {
            Ok(entry) => entry,
            Err(e) => {
                self.abandon_snapshot(&id);
                return Err(e);
            }
        };
        crank.add_entry(&saved)?;
        slot.span.bounds.end_pos = end_pos;

        let opened = self.transcripts.rotate_span(
            &vat,
            slot.incarnation,
            vec![EntryDraft::marker(Delivery::LoadSnapshot { snapshot })],
        );
        let opened = match opened {
            Ok(entries) => entries,
            Err(e) => {
                self.abandon_snapshot(&id);
                return Err(e);
            }
        };
        let previous = slot.span.opened_by;
        slot.span = self.transcripts.current_span(&vat)?;
        for entry in &opened {
            crank.add_entry(entry)?;
        }
        // reconcile on open supersedes whatever is left over here
        if let Some(previous) = previous {
            self.abandon_snapshot(&SnapshotId { vat_id: vat.clone(), end_pos: previous.end_pos });
        }

        if self.restart_worker_on_snapshot {
            match self.factory.load_snapshot(&vat, &blob) {
                Ok(worker) => slot.worker = Some(worker),
                Err(e) => {
                    warn!(vat = %vat, error = %e, "restart from fresh snapshot failed; worker will be rebuilt");
                    slot.worker = None;
                }
            }
        }
        debug!(vat = %vat, end_pos, "rotated span on snapshot");
        Ok(id)
    }

    fn abandon_snapshot(&self, id: &SnapshotId) {
        if let Err(e) = self.snapshots.mark_superseded(id) {
            warn!(vat = %id.vat_id, end_pos = id.end_pos, error = %e, "could not supersede snapshot");
        }
    }

    fn mark_online(&self, vat: &VatId) {
        let victims = {
            let mut online = self.online.lock();
            online.touch(vat);
            online.overflow(vat)
        };
        for victim in victims {
            let handle = self.slots.read().get(&victim).cloned();
            let Some(handle) = handle else {
                self.online.lock().remove(&victim);
                continue;
            };
            // busy vats stay online until a later pass
            let Some(mut slot) = handle.try_lock() else {
                continue;
            };
            slot.worker = None;
            drop(slot);
            self.online.lock().remove(&victim);
            debug!(vat = %victim, "evicted worker");
        }
    }
}
