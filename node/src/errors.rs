// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
use thiserror::Error;
use vatlog_kernel::error::KernelError;
use vatlog_kernel::types::VatId;
use vatlog_persistence::PersistenceError;

/// Coarse classification callers branch on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The vat is terminated.
    VatDead,
    /// Stored data contradicts itself or the worker diverged on replay.
    Corruption,
    /// A write could not be made durable.
    Durability,
    /// The caller asked for a transition that is not allowed now.
    Protocol,
    /// The worker failed outside of replay.
    Worker,
    /// No such vat, span or snapshot.
    NotFound,
    /// Configuration could not be read or is invalid.
    Config,
}

#[derive(Error, Debug)]
pub enum VatError {
    #[error("Vat {0} is terminated")]
    VatDead(VatId),

    #[error("Unknown vat {0}")]
    UnknownVat(VatId),

    #[error("Vat {0} already exists")]
    AlreadyExists(VatId),

    #[error("{what} not found for vat {vat}")]
    NotFound { vat: VatId, what: String },

    #[error("Protocol violation on vat {vat}: {reason}")]
    Protocol { vat: VatId, reason: String },

    #[error("Corrupt state for vat {vat}: {reason}")]
    Corruption { vat: VatId, reason: String },

    #[error("Worker failure in vat {vat}: {error}")]
    Worker { vat: VatId, error: KernelError },

    #[error("Kernel error: {0}")]
    Kernel(KernelError),

    #[error("Storage error: {0}")]
    Storage(#[from] PersistenceError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Kernel state file error: {0}")]
    State(String),

    #[error("Config error: {0}")]
    Config(String),
}

impl VatError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            VatError::VatDead(_) => ErrorKind::VatDead,
            VatError::UnknownVat(_) | VatError::NotFound { .. } => ErrorKind::NotFound,
            VatError::AlreadyExists(_) | VatError::Protocol { .. } => ErrorKind::Protocol,
            VatError::Corruption { .. } | VatError::State(_) => ErrorKind::Corruption,
            VatError::Worker { .. } => ErrorKind::Worker,
            VatError::Kernel(KernelError::Divergence { .. }) => ErrorKind::Corruption,
            VatError::Kernel(KernelError::Decode(_)) => ErrorKind::Corruption,
            VatError::Kernel(_) => ErrorKind::Protocol,
            VatError::Storage(e) if e.is_io() => ErrorKind::Durability,
            VatError::Storage(_) => ErrorKind::Corruption,
            VatError::Io(_) => ErrorKind::Durability,
            VatError::Config(_) => ErrorKind::Config,
        }
    }

    pub(crate) fn corruption(vat: &VatId, reason: impl Into<String>) -> Self {
        let reason = reason.into();
        tracing::error!(vat = %vat, %reason, "corruption detected");
        VatError::Corruption { vat: vat.clone(), reason }
    }

    pub(crate) fn protocol(vat: &VatId, reason: impl Into<String>) -> Self {
        VatError::Protocol { vat: vat.clone(), reason: reason.into() }
    }
}

impl From<KernelError> for VatError {
    fn from(e: KernelError) -> Self {
        VatError::Kernel(e)
    }
}

pub type VatResult<T> = std::result::Result<T, VatError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn storage_errors_split_into_durability_and_corruption() {
        let io = VatError::from(PersistenceError::IoError(std::io::Error::new(
            std::io::ErrorKind::Other,
            "disk full",
        )));
        assert_eq!(io.kind(), ErrorKind::Durability);

        let bad = VatError::from(PersistenceError::ChecksumMismatch { position: 3, expected: 1, found: 2 });
        assert_eq!(bad.kind(), ErrorKind::Corruption);

        let torn = VatError::from(PersistenceError::IoError(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            "short read",
        )));
        assert_eq!(torn.kind(), ErrorKind::Corruption);
    }

    #[test]
    fn divergence_is_corruption() {
        let err = VatError::from(KernelError::Divergence { position: 9, detail: "extra syscall".into() });
        assert_eq!(err.kind(), ErrorKind::Corruption);
    }

    #[test]
    fn dead_vat_message_names_the_vat() {
        let err = VatError::VatDead(VatId::new("v7").unwrap());
        assert_eq!(err.kind(), ErrorKind::VatDead);
        assert!(err.to_string().contains("v7"));
    }
}
