// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! Seams between the transcript machinery and the code that runs a vat.

use alloc::boxed::Box;
use alloc::vec::Vec;

use crate::delivery::{Delivery, DeliveryStatus, Payload};
use crate::error::KernelResult;
use crate::types::VatId;

/// Answers syscalls made by a worker during a delivery.
pub trait SyscallHandler {
    fn syscall(&mut self, call: &Payload) -> KernelResult<Payload>;
}

/// A running vat. Must be deterministic: the same deliveries with the same
/// syscall results always leave it in the same state.
pub trait VatWorker: Send {
    fn deliver(
        &mut self,
        delivery: &Delivery,
        syscalls: &mut dyn SyscallHandler,
    ) -> KernelResult<DeliveryStatus>;

    /// Serialize the complete worker state.
    fn save_snapshot(&mut self) -> KernelResult<Vec<u8>>;
}

/// Produces workers, either fresh from `initialize-worker` options or
/// restored from a snapshot blob.
pub trait WorkerFactory: Send + Sync {
    fn initialize(&self, vat: &VatId, options: &Payload) -> KernelResult<Box<dyn VatWorker>>;

    fn load_snapshot(&self, vat: &VatId, blob: &[u8]) -> KernelResult<Box<dyn VatWorker>>;
}
