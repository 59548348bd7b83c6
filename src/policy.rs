// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! Snapshot scheduling.
//!
//! # Rule
//! A span that does not yet have a snapshot is snapshotted once it holds
//! `snapshot_initial` entries. After that, a snapshot is taken whenever
//! `snapshot_interval` entries have been written since the last
//! `save-snapshot` entry.
//!
//! # Guarantees
//! The decision depends only on positions, never on wall-clock time, so
//! every replica rotates spans at the same positions.

use serde::{Deserialize, Serialize};

use crate::types::Position;

pub const DEFAULT_SNAPSHOT_INITIAL: u64 = 3;
pub const DEFAULT_SNAPSHOT_INTERVAL: u64 = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotPolicy {
    pub snapshot_initial: u64,
    pub snapshot_interval: u64,
}

impl Default for SnapshotPolicy {
    fn default() -> Self {
        Self {
            snapshot_initial: DEFAULT_SNAPSHOT_INITIAL,
            snapshot_interval: DEFAULT_SNAPSHOT_INTERVAL,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotReason {
    /// First snapshot of a span opened by `initialize-worker`.
    Initial,
    /// Interval elapsed since the previous `save-snapshot`.
    Interval,
}

/// Position counters for the current span.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpanProgress {
    pub start_pos: Position,
    pub next_pos: Position,
    /// True when the span opens with `load-snapshot`.
    pub opened_by_snapshot: bool,
}

impl SpanProgress {
    pub fn deliveries_since_span_start(&self) -> u64 {
        self.next_pos - self.start_pos
    }

    /// Entries written after the `save-snapshot` that closed the previous
    /// span, counting the `load-snapshot` that opened this one.
    pub fn deliveries_since_last_snapshot(&self) -> u64 {
        if self.opened_by_snapshot {
            self.next_pos - self.start_pos.saturating_sub(1)
        } else {
            self.deliveries_since_span_start()
        }
    }
}

pub fn should_snapshot(
    deliveries_since_span_start: u64,
    deliveries_since_last_snapshot: u64,
    has_snapshot_in_span: bool,
    snapshot_initial: u64,
    snapshot_interval: u64,
) -> bool {
    (!has_snapshot_in_span && deliveries_since_span_start >= snapshot_initial)
        || deliveries_since_last_snapshot >= snapshot_interval
}

impl SnapshotPolicy {
    pub fn evaluate(&self, progress: &SpanProgress) -> Option<SnapshotReason> {
        let since_start = progress.deliveries_since_span_start();
        let since_last = progress.deliveries_since_last_snapshot();
        if !should_snapshot(
            since_start,
            since_last,
            progress.opened_by_snapshot,
            self.snapshot_initial,
            self.snapshot_interval,
        ) {
            return None;
        }
        if !progress.opened_by_snapshot && since_start >= self.snapshot_initial {
            Some(SnapshotReason::Initial)
        } else {
            Some(SnapshotReason::Interval)
        }
    }
}
