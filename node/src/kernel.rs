// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! Kernel
//!
//! Front door of the node: opens the stores, reconciles every vat, keeps
//! the activity hash, and groups each operation into one crank.
//!
//! # Activity hash
//! Every transcript entry written by an operation goes into that
//! operation's crank hash. When the operation finishes the crank is folded
//! into the running activity hash and `kernel.json` is rewritten with the
//! new digest and each vat's committed position. On open, entries past
//! those positions are folded as one crank so a crash between an append and
//! the checkpoint yields the same digest as an uninterrupted run.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use vatlog_kernel::activity::{ActivityHashAccumulator, CrankHasher};
use vatlog_kernel::delivery::{Delivery, Payload};
use vatlog_kernel::error::KernelError;
use vatlog_kernel::policy::SnapshotPolicy;
use vatlog_kernel::types::{Position, SpanBounds, VatId};
use vatlog_kernel::worker::{SyscallHandler, WorkerFactory};

use crate::config::KernelConfig;
use crate::errors::{VatError, VatResult};
use crate::lifecycle::{
    DeliveryReport, LifecycleSettings, RebuildReport, UpgradeReport, VatLifecycle, VatRecord, VatStatus,
};
use crate::replay::Rebuilt;
use crate::snapshot_store::{SnapshotInfo, SnapshotStore};
use crate::state_file::{read_json, write_json_atomic};
use crate::transcript_store::TranscriptStore;

const STATE_VERSION: u32 = 1;

/// `kernel.json`
#[derive(Debug, Clone, Serialize, Deserialize)]
struct KernelStateFile {
    version: u32,
    crank_number: u64,
    activity_hash: String,
    snapshot_initial: u64,
    snapshot_interval: u64,
    positions: BTreeMap<VatId, Position>,
}

struct ActivityLedger {
    accumulator: ActivityHashAccumulator,
    positions: BTreeMap<VatId, Position>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SpanDump {
    pub bounds: SpanBounds,
    pub current: bool,
    pub kinds: Vec<&'static str>,
}

#[derive(Debug, Clone, Serialize)]
pub struct VatDump {
    pub record: VatRecord,
    pub spans: Vec<SpanDump>,
    pub snapshots: Vec<SnapshotInfo>,
}

pub struct Kernel {
    config: KernelConfig,
    lifecycle: VatLifecycle,
    activity: Mutex<ActivityLedger>,
}

impl Kernel {
    pub fn open(config: KernelConfig, factory: Arc<dyn WorkerFactory>) -> VatResult<Self> {
        config.validate()?;
        fs::create_dir_all(&config.data_dir)?;
        let state: Option<KernelStateFile> = read_json(&config.state_path())?;
        if let Some(state) = &state {
            if state.version != STATE_VERSION {
                return Err(VatError::State(format!("unsupported kernel state version {}", state.version)));
            }
        }
        // a recorded policy wins over the config file
        let policy = match &state {
            Some(state) => SnapshotPolicy {
                snapshot_initial: state.snapshot_initial,
                snapshot_interval: state.snapshot_interval,
            },
            None => SnapshotPolicy {
                snapshot_initial: config.snapshot_initial,
                snapshot_interval: config.snapshot_interval,
            },
        };

        let transcripts = Arc::new(TranscriptStore::open(config.transcripts_dir())?);
        let snapshots = Arc::new(SnapshotStore::open(config.snapshots_dir(), config.keep_superseded_snapshots)?);
        let lifecycle = VatLifecycle::open(
            LifecycleSettings {
                policy,
                max_vats_online: config.max_vats_online,
                restart_worker_on_snapshot: config.restart_worker_on_snapshot,
            },
            config.vats_dir(),
            transcripts.clone(),
            snapshots,
            factory,
        )?;

        let ledger = match state {
            Some(state) => {
                let mut digest = [0u8; 32];
                hex::decode_to_slice(&state.activity_hash, &mut digest)
                    .map_err(|e| VatError::State(format!("bad activity hash {:?}: {}", state.activity_hash, e)))?;
                ActivityLedger {
                    accumulator: ActivityHashAccumulator::resume(digest, state.crank_number),
                    positions: state.positions,
                }
            }
            None => ActivityLedger {
                accumulator: ActivityHashAccumulator::new(),
                positions: BTreeMap::new(),
            },
        };
        for (vat, committed) in &ledger.positions {
            if !transcripts.contains(vat) {
                return Err(VatError::State(format!("kernel state names vat {} which has no transcript", vat)));
            }
            let next = transcripts.next_position(vat)?;
            if *committed > next {
                return Err(VatError::State(format!(
                    "kernel state has vat {} at {} but its transcript ends at {}",
                    vat, committed, next
                )));
            }
        }

        let kernel = Self {
            config,
            lifecycle,
            activity: Mutex::new(ledger),
        };

        let mut crank = CrankHasher::new();
        for vat in transcripts.vat_ids() {
            kernel.fold_unrecorded(&vat, &mut crank)?;
        }
        if !crank.is_empty() {
            info!(entries = crank.entry_count(), "folding entries written after the last checkpoint");
        }
        kernel.commit(crank)?;
        info!(
            vats = kernel.lifecycle.vat_ids().len(),
            cranks = kernel.crank_number(),
            activity = %kernel.activity_hash_hex(),
            "kernel opened"
        );
        Ok(kernel)
    }

    /// Bring up to half of `max_vats_online` active vats online ahead of
    /// their first delivery. Failures are logged and left for that delivery
    /// to report.
    pub fn start(&self) {
        let budget = (self.config.max_vats_online / 2).max(1);
        for vat in self.lifecycle.active_vat_ids().into_iter().take(budget) {
            match self.lifecycle.rebuild(&vat) {
                Ok(report) => debug!(vat = %vat, replayed = report.replayed, "warmed up worker"),
                Err(e) => warn!(vat = %vat, error = %e, "could not warm up worker"),
            }
        }
    }

    /// Add the entries of `vat` past its committed position to `crank`.
    fn fold_unrecorded(&self, vat: &VatId, crank: &mut CrankHasher) -> VatResult<()> {
        let from = self.activity.lock().positions.get(vat).copied().unwrap_or(0);
        for entry in self.lifecycle.transcripts().read_from(vat, from)? {
            crank.add_entry(&entry?)?;
        }
        Ok(())
    }

    /// Fold a finished crank and checkpoint. Empty cranks leave the hash
    /// alone but still write the checkpoint.
    fn commit(&self, crank: CrankHasher) -> VatResult<()> {
        let mut ledger = self.activity.lock();
        if !crank.is_empty() {
            let (digest, touched) = crank.finish();
            ledger.accumulator.fold(&digest);
            ledger.positions.extend(touched);
        }
        let policy = self.lifecycle.policy();
        let state = KernelStateFile {
            version: STATE_VERSION,
            crank_number: ledger.accumulator.crank_count(),
            activity_hash: hex::encode(ledger.accumulator.digest()),
            snapshot_initial: policy.snapshot_initial,
            snapshot_interval: policy.snapshot_interval,
            positions: ledger.positions.clone(),
        };
        write_json_atomic(&self.config.state_path(), &state)
    }

    /// Run `op` as one crank. Entries that reached the transcript are
    /// committed even when `op` fails part way.
    fn crank<T>(&self, op: impl FnOnce(&mut CrankHasher) -> VatResult<T>) -> VatResult<T> {
        let mut crank = CrankHasher::new();
        let result = op(&mut crank);
        let touched = !crank.is_empty();
        if touched {
            self.commit(crank)?;
        }
        result
    }

    pub fn create_vat(
        &self,
        vat: &VatId,
        options: Payload,
        vat_parameters: Payload,
        handler: &mut dyn SyscallHandler,
    ) -> VatResult<DeliveryReport> {
        self.crank(|crank| self.lifecycle.create(vat, options, vat_parameters, handler, crank))
    }

    pub fn deliver(
        &self,
        vat: &VatId,
        delivery: Delivery,
        handler: &mut dyn SyscallHandler,
    ) -> VatResult<DeliveryReport> {
        self.crank(|crank| self.lifecycle.deliver(vat, delivery, handler, crank))
    }

    pub fn upgrade_vat(
        &self,
        vat: &VatId,
        options: Payload,
        vat_parameters: Payload,
        handler: &mut dyn SyscallHandler,
    ) -> VatResult<UpgradeReport> {
        self.crank(|crank| self.lifecycle.upgrade(vat, options, vat_parameters, handler, crank))
    }

    pub fn terminate_vat(&self, vat: &VatId) -> VatResult<()> {
        self.lifecycle.terminate(vat)
    }

    /// Discard the vat's live worker and replay its current span.
    pub fn rebuild(&self, vat: &VatId) -> VatResult<RebuildReport> {
        self.lifecycle.rebuild(vat)
    }

    /// Deliver `bringOutYourDead` to every active vat whose transcript moved
    /// since `last_positions`, in vat-id order, as one crank. Returns each
    /// active vat's next position afterwards.
    pub fn reap_all_vats(
        &self,
        last_positions: &BTreeMap<VatId, Position>,
        handler: &mut dyn SyscallHandler,
    ) -> VatResult<BTreeMap<VatId, Position>> {
        self.crank(|crank| {
            let mut positions = BTreeMap::new();
            for vat in self.lifecycle.active_vat_ids() {
                let next = self.lifecycle.next_position(&vat)?;
                if last_positions.get(&vat) != Some(&next) {
                    self.lifecycle.deliver(&vat, Delivery::BringOutYourDead, &mut *handler, crank)?;
                }
                positions.insert(vat.clone(), self.lifecycle.next_position(&vat)?);
            }
            info!(vats = positions.len(), "reaped vats");
            Ok(positions)
        })
    }

    /// Snapshot every active vat whose span holds anything past its opening
    /// snapshot. Vats are captured in parallel; each vat's entries are then
    /// folded as its own crank in vat-id order.
    pub fn snapshot_all_vats(&self) -> VatResult<BTreeSet<VatId>> {
        let vats = self.lifecycle.active_vat_ids();
        let threads = std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1);
        let chunk = vats.len().div_ceil(threads).max(1);

        let results: Vec<(VatId, VatResult<bool>, Option<CrankHasher>)> = std::thread::scope(|scope| {
            let handles: Vec<_> = vats
                .chunks(chunk)
                .map(|group| {
                    let handle = scope.spawn(move || {
                        group
                            .iter()
                            .map(|vat| {
                                let mut crank = CrankHasher::new();
                                let taken = self.lifecycle.snapshot_now(vat, &mut crank).map(|id| id.is_some());
                                (vat.clone(), taken, Some(crank))
                            })
                            .collect::<Vec<_>>()
                    });
                    (group, handle)
                })
                .collect();
            handles
                .into_iter()
                .flat_map(|(group, handle)| match handle.join() {
                    Ok(results) => results,
                    Err(_) => {
                        error!(vats = group.len(), "snapshot thread panicked");
                        group
                            .iter()
                            .map(|vat| {
                                let failed = VatError::Worker {
                                    vat: vat.clone(),
                                    error: KernelError::WorkerFault("snapshot thread panicked".into()),
                                };
                                (vat.clone(), Err(failed), None)
                            })
                            .collect()
                    }
                })
                .collect()
        });

        let mut taken = BTreeSet::new();
        let mut first_error = None;
        for (vat, result, crank) in results {
            // entries written before a failure still belong to the activity hash
            let crank = match crank {
                Some(crank) => crank,
                None => {
                    let mut crank = CrankHasher::new();
                    self.fold_unrecorded(&vat, &mut crank)?;
                    crank
                }
            };
            if !crank.is_empty() {
                self.commit(crank)?;
            }
            match result {
                Ok(true) => {
                    taken.insert(vat);
                }
                Ok(false) => {}
                Err(e) => {
                    warn!(vat = %vat, error = %e, "snapshot failed");
                    first_error.get_or_insert(e);
                }
            }
        }
        if let Some(e) = first_error {
            return Err(e);
        }
        info!(vats = taken.len(), "snapshotted vats");
        Ok(taken)
    }

    pub fn activity_hash(&self) -> [u8; 32] {
        self.activity.lock().accumulator.digest()
    }

    pub fn activity_hash_hex(&self) -> String {
        hex::encode(self.activity_hash())
    }

    pub fn crank_number(&self) -> u64 {
        self.activity.lock().accumulator.crank_count()
    }

    pub fn policy(&self) -> SnapshotPolicy {
        self.lifecycle.policy()
    }

    /// Change the snapshot interval for later deliveries and persist it.
    pub fn set_snapshot_interval(&self, interval: u64) -> VatResult<()> {
        if interval == 0 {
            return Err(VatError::Config("snapshot_interval must be at least 1".into()));
        }
        self.lifecycle.set_snapshot_interval(interval);
        info!(interval, "snapshot interval changed");
        self.commit(CrankHasher::new())
    }

    /// Remove superseded snapshot files unless they are configured to be kept.
    pub fn prune_superseded_snapshots(&self) -> VatResult<usize> {
        self.lifecycle.snapshots().prune()
    }

    pub fn record(&self, vat: &VatId) -> VatResult<VatRecord> {
        self.lifecycle.record(vat)
    }

    pub fn vat_ids(&self) -> Vec<VatId> {
        self.lifecycle.vat_ids()
    }

    pub fn is_terminated(&self, vat: &VatId) -> VatResult<bool> {
        Ok(self.lifecycle.record(vat)?.status == VatStatus::Terminated)
    }

    /// Serialized state of the live worker, rebuilding it if needed.
    pub fn capture_state(&self, vat: &VatId) -> VatResult<Vec<u8>> {
        self.lifecycle.capture_state(vat)
    }

    /// Replay one span on its own, detached from the live worker.
    pub fn replay_span(&self, vat: &VatId, start_pos: Position) -> VatResult<Rebuilt> {
        self.lifecycle.replay_engine().replay_span(vat, start_pos)
    }

    pub fn dump_vat(&self, vat: &VatId) -> VatResult<VatDump> {
        let record = self.lifecycle.record(vat)?;
        let transcripts = self.lifecycle.transcripts();
        let mut spans = Vec::new();
        for span in transcripts.spans(vat)? {
            let mut kinds = Vec::new();
            for entry in transcripts.read_span(vat, span.bounds.start_pos)? {
                kinds.push(entry?.kind().as_str());
            }
            spans.push(SpanDump {
                bounds: span.bounds,
                current: span.current,
                kinds,
            });
        }
        Ok(VatDump {
            record,
            spans,
            snapshots: self.lifecycle.snapshots().list(vat),
        })
    }

    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    pub fn lifecycle(&self) -> &VatLifecycle {
        &self.lifecycle
    }
}
