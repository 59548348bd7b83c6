// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! Error types.

use alloc::string::String;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KernelError {
    /// Vat identifier is empty, too long, or not filesystem safe.
    InvalidVatId(String),
    /// A transcript entry could not be encoded.
    Encode(String),
    /// A transcript entry could not be decoded.
    Decode(String),
    /// A replayed delivery made a syscall that differs from the recorded one.
    Divergence { position: u64, detail: String },
    /// The syscall handler refused a request.
    SyscallRejected(String),
    /// The worker failed to process a delivery or produce a snapshot.
    WorkerFault(String),
    /// The worker could not be restored from a snapshot blob.
    InvalidSnapshot(String),
}

pub type KernelResult<T> = core::result::Result<T, KernelError>;

impl core::fmt::Display for KernelError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            KernelError::InvalidVatId(id) => write!(f, "invalid vat id {:?}", id),
            KernelError::Encode(e) => write!(f, "encode failed: {}", e),
            KernelError::Decode(e) => write!(f, "decode failed: {}", e),
            KernelError::Divergence { position, detail } => {
                write!(f, "replay diverged at position {}: {}", position, detail)
            }
            KernelError::SyscallRejected(e) => write!(f, "syscall rejected: {}", e),
            KernelError::WorkerFault(e) => write!(f, "worker fault: {}", e),
            KernelError::InvalidSnapshot(e) => write!(f, "invalid snapshot: {}", e),
        }
    }
}
