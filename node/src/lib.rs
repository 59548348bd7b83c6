// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
pub mod config;
pub mod errors;
pub mod kernel;
pub mod lifecycle;
pub mod pruner;
pub mod replay;
pub mod snapshot_store;
pub mod state_file;
pub mod telemetry;
pub mod transcript_store;
pub mod warehouse;

pub use config::KernelConfig;
pub use errors::{ErrorKind, VatError, VatResult};
pub use kernel::{Kernel, SpanDump, VatDump};
pub use lifecycle::{DeliveryReport, RebuildReport, UpgradeReport, VatRecord, VatStatus};
pub use pruner::{spawn_pruner, Pruner};
pub use snapshot_store::{SnapshotId, SnapshotInfo};
pub use transcript_store::{EntryDraft, SpanInfo};
