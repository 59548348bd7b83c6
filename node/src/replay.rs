// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! Replay Engine
//!
//! Rebuilds a worker from the current span alone:
//!
//! ```text
//! span opens with load-snapshot     -> load the referenced in-use snapshot
//! span opens with initialize-worker -> start a fresh worker
//! every later entry                 -> re-deliver with simulated syscalls
//! ```
//!
//! # Guarantees
//! - Nothing before the current span is read.
//! - Replayed syscalls are answered from the transcript and never reach
//!   the live kernel.
//! - Any divergence, gap, misplaced pseudo-delivery or snapshot mismatch
//!   fails the rebuild with a corruption error.

use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info};
use vatlog_kernel::delivery::{Delivery, DeliveryKind};
use vatlog_kernel::simulator::SyscallSimulator;
use vatlog_kernel::types::{Position, SnapshotRef, SpanBounds, VatId};
use vatlog_kernel::worker::{VatWorker, WorkerFactory};

use crate::errors::{ErrorKind, VatError, VatResult};
use crate::lifecycle::{VatRecord, VatStatus};
use crate::snapshot_store::{SnapshotId, SnapshotStore};
use crate::transcript_store::TranscriptStore;

pub struct Rebuilt {
    pub worker: Box<dyn VatWorker>,
    pub span: SpanBounds,
    /// Entries re-delivered to the worker, pseudo-deliveries excluded.
    pub replayed: u64,
    pub loaded_snapshot: Option<SnapshotRef>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SpanKind {
    /// The span still accepting appends; its snapshot must be in use.
    Current,
    /// A sealed span; it may end with `shutdown-worker` and its snapshot
    /// may already be superseded.
    Sealed,
}

pub struct ReplayEngine {
    transcripts: Arc<TranscriptStore>,
    snapshots: Arc<SnapshotStore>,
    factory: Arc<dyn WorkerFactory>,
}

impl ReplayEngine {
    pub fn new(
        transcripts: Arc<TranscriptStore>,
        snapshots: Arc<SnapshotStore>,
        factory: Arc<dyn WorkerFactory>,
    ) -> Self {
        Self {
            transcripts,
            snapshots,
            factory,
        }
    }

    /// Reconstruct the live worker of an active vat.
    pub fn rebuild(&self, record: &VatRecord) -> VatResult<Rebuilt> {
        if record.status == VatStatus::Terminated {
            return Err(VatError::VatDead(record.vat_id.clone()));
        }
        let vat = &record.vat_id;
        let started = Instant::now();
        let bounds = self.transcripts.current_span_bounds(vat)?;
        let rebuilt = self.replay(vat, bounds.start_pos, SpanKind::Current)?;

        metrics::histogram!("vatlog_replay_duration_seconds", started.elapsed().as_secs_f64());
        metrics::counter!("vatlog_replayed_entries_total", rebuilt.replayed);
        info!(
            vat = %vat,
            start = rebuilt.span.start_pos,
            end = rebuilt.span.end_pos,
            replayed = rebuilt.replayed,
            from_snapshot = rebuilt.loaded_snapshot.is_some(),
            "rebuilt worker"
        );
        Ok(rebuilt)
    }

    /// Replay any span, sealed or current, from its own entries.
    ///
    /// A sealed span opened by a snapshot needs that snapshot on disk, so
    /// this only works for history while superseded snapshots are kept.
    pub fn replay_span(&self, vat: &VatId, start_pos: Position) -> VatResult<Rebuilt> {
        let current = self.transcripts.current_span_bounds(vat)?;
        let kind = if current.start_pos == start_pos {
            SpanKind::Current
        } else {
            SpanKind::Sealed
        };
        self.replay(vat, start_pos, kind)
    }

    fn replay(&self, vat: &VatId, start_pos: Position, kind: SpanKind) -> VatResult<Rebuilt> {
        let span = self
            .transcripts
            .spans(vat)?
            .into_iter()
            .find(|s| s.bounds.start_pos == start_pos)
            .ok_or_else(|| VatError::NotFound {
                vat: vat.clone(),
                what: format!("span starting at {}", start_pos),
            })?;
        let mut entries = self.transcripts.read_span(vat, start_pos)?;
        let first = match entries.next() {
            Some(entry) => entry?,
            None => return Err(VatError::corruption(vat, format!("span at {} is empty", start_pos))),
        };

        let (mut worker, loaded_snapshot) = match &first.delivery {
            Delivery::InitializeWorker { options } => {
                let worker = self
                    .factory
                    .initialize(vat, options)
                    .map_err(|error| VatError::Worker { vat: vat.clone(), error })?;
                (worker, None)
            }
            Delivery::LoadSnapshot { snapshot } => {
                (self.load_worker(vat, snapshot, span.bounds.incarnation, kind)?, Some(*snapshot))
            }
            other => {
                return Err(VatError::corruption(
                    vat,
                    format!("span at {} opens with {}", start_pos, other.kind().as_str()),
                ))
            }
        };

        let mut replayed = 0;
        let mut shut_down = false;
        for entry in entries {
            let entry = entry?;
            if shut_down {
                return Err(VatError::corruption(
                    vat,
                    format!("entry {} follows shutdown-worker", entry.position),
                ));
            }
            match entry.kind() {
                // marker left by a snapshot whose rotation never completed
                DeliveryKind::SaveSnapshot => {}
                DeliveryKind::ShutdownWorker if kind == SpanKind::Sealed => shut_down = true,
                DeliveryKind::ShutdownWorker => {
                    return Err(VatError::protocol(vat, "worker was shut down and no new incarnation started"))
                }
                DeliveryKind::InitializeWorker | DeliveryKind::LoadSnapshot => {
                    return Err(VatError::corruption(
                        vat,
                        format!("{} at position {} does not open a span", entry.kind().as_str(), entry.position),
                    ))
                }
                _ => {
                    let mut simulator = SyscallSimulator::new(entry.position, &entry.syscalls);
                    let outcome = worker.deliver(&entry.delivery, &mut simulator);
                    if let Err(divergence) = simulator.finish() {
                        error!(vat = %vat, position = entry.position, %divergence, "replay diverged from transcript");
                        return Err(VatError::corruption(vat, divergence.to_string()));
                    }
                    match outcome {
                        Ok(status) if status == entry.status => {}
                        Ok(_) => {
                            return Err(VatError::corruption(
                                vat,
                                format!("delivery {} produced a different outcome on replay", entry.position),
                            ))
                        }
                        Err(e) => {
                            return Err(VatError::corruption(
                                vat,
                                format!("delivery {} failed on replay: {}", entry.position, e),
                            ))
                        }
                    }
                    replayed += 1;
                }
            }
        }

        Ok(Rebuilt {
            worker,
            span: span.bounds,
            replayed,
            loaded_snapshot,
        })
    }

    fn load_worker(
        &self,
        vat: &VatId,
        reference: &SnapshotRef,
        incarnation: u32,
        kind: SpanKind,
    ) -> VatResult<Box<dyn VatWorker>> {
        let loaded = self.snapshots.load(&SnapshotId {
            vat_id: vat.clone(),
            end_pos: reference.end_pos,
        });
        // the current span may only start from a snapshot still in use
        let loaded = match loaded {
            Ok(loaded) if kind == SpanKind::Sealed || loaded.info.in_use => loaded,
            Ok(_) => return Err(VatError::corruption(vat, format!("snapshot {} is not in use", reference.end_pos))),
            Err(e) if kind == SpanKind::Current && e.kind() == ErrorKind::NotFound => {
                return Err(VatError::corruption(vat, format!("snapshot {} is missing", reference.end_pos)))
            }
            Err(e) => return Err(e),
        };
        if loaded.info.hash != reference.hash || *blake3::hash(&loaded.blob).as_bytes() != reference.hash {
            return Err(VatError::corruption(
                vat,
                format!("snapshot {} does not match the hash in the transcript", reference.end_pos),
            ));
        }
        if loaded.info.incarnation != incarnation {
            return Err(VatError::corruption(
                vat,
                format!(
                    "snapshot {} belongs to incarnation {}, span to {}",
                    reference.end_pos, loaded.info.incarnation, incarnation
                ),
            ));
        }
        self.factory
            .load_snapshot(vat, &loaded.blob)
            .map_err(|error| VatError::Worker { vat: vat.clone(), error })
    }
}
