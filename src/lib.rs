// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
#![no_std]

//! vatlog-kernel: deterministic, no_std building blocks for per-vat
//! transcripts, snapshot policy and activity hashing.
//!
//! Nothing in this crate touches a filesystem. Storage and orchestration
//! live in `vatlog-persistence` and `vatlog-node`.

extern crate alloc;

#[cfg(test)]
#[macro_use]
extern crate std;

pub mod activity;
pub mod delivery;
pub mod error;
pub mod policy;
pub mod simulator;
pub mod types;
pub mod worker;

pub use activity::{ActivityHashAccumulator, CrankHasher};
pub use delivery::{
    CapToken, Delivery, DeliveryKind, DeliveryStatus, Payload, RecordedSyscall, TranscriptEntry,
};
pub use error::{KernelError, KernelResult};
pub use policy::{SnapshotPolicy, SnapshotReason, SpanProgress};
pub use types::{Incarnation, Position, SnapshotRef, SpanBounds, VatId};
pub use worker::{SyscallHandler, VatWorker, WorkerFactory};
