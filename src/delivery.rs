// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! Deliveries and transcript entries.
//!
//! # Encoding
//! Entries are encoded with bincode's standard configuration through serde.
//! The encoding is canonical: the same entry always yields the same bytes,
//! which is what the crank hash is computed over.

use alloc::string::String;
use alloc::vec::Vec;
use serde::{Deserialize, Serialize};

use crate::error::{KernelError, KernelResult};
use crate::types::{Position, SnapshotRef, VatId};

/// Opaque bytes owned by the kernel's object layer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payload(pub Vec<u8>);

impl Payload {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl From<&[u8]> for Payload {
    fn from(bytes: &[u8]) -> Self {
        Self(bytes.to_vec())
    }
}

impl From<&str> for Payload {
    fn from(s: &str) -> Self {
        Self(s.as_bytes().to_vec())
    }
}

impl From<Vec<u8>> for Payload {
    fn from(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }
}

/// Logical capability reference as seen by a vat.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CapToken(pub String);

impl From<&str> for CapToken {
    fn from(s: &str) -> Self {
        Self(String::from(s))
    }
}

/// Everything that can occupy a transcript position.
///
/// The first six delivery variants plus `StartVat` reach the worker.
/// `InitializeWorker`, `SaveSnapshot`, `LoadSnapshot` and `ShutdownWorker`
/// are pseudo-deliveries that only mark worker lifecycle boundaries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Delivery {
    InitializeWorker { options: Payload },
    StartVat { vat_parameters: Payload },
    Message { target: CapToken, body: Payload },
    Notify { resolutions: Payload },
    DropExports { refs: Vec<CapToken> },
    RetireExports { refs: Vec<CapToken> },
    RetireImports { refs: Vec<CapToken> },
    BringOutYourDead,
    SaveSnapshot { snapshot: SnapshotRef },
    LoadSnapshot { snapshot: SnapshotRef },
    ShutdownWorker,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum DeliveryKind {
    InitializeWorker,
    StartVat,
    Message,
    Notify,
    DropExports,
    RetireExports,
    RetireImports,
    BringOutYourDead,
    SaveSnapshot,
    LoadSnapshot,
    ShutdownWorker,
}

impl DeliveryKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryKind::InitializeWorker => "initialize-worker",
            DeliveryKind::StartVat => "startVat",
            DeliveryKind::Message => "message",
            DeliveryKind::Notify => "notify",
            DeliveryKind::DropExports => "dropExports",
            DeliveryKind::RetireExports => "retireExports",
            DeliveryKind::RetireImports => "retireImports",
            DeliveryKind::BringOutYourDead => "bringOutYourDead",
            DeliveryKind::SaveSnapshot => "save-snapshot",
            DeliveryKind::LoadSnapshot => "load-snapshot",
            DeliveryKind::ShutdownWorker => "shutdown-worker",
        }
    }

    /// True for entries that never reach the worker.
    pub fn is_pseudo(&self) -> bool {
        matches!(
            self,
            DeliveryKind::InitializeWorker
                | DeliveryKind::SaveSnapshot
                | DeliveryKind::LoadSnapshot
                | DeliveryKind::ShutdownWorker
        )
    }

    /// True for entries a caller may hand to `deliver` directly.
    pub fn is_routine(&self) -> bool {
        !self.is_pseudo() && *self != DeliveryKind::StartVat
    }
}

impl Delivery {
    pub fn kind(&self) -> DeliveryKind {
        match self {
            Delivery::InitializeWorker { .. } => DeliveryKind::InitializeWorker,
            Delivery::StartVat { .. } => DeliveryKind::StartVat,
            Delivery::Message { .. } => DeliveryKind::Message,
            Delivery::Notify { .. } => DeliveryKind::Notify,
            Delivery::DropExports { .. } => DeliveryKind::DropExports,
            Delivery::RetireExports { .. } => DeliveryKind::RetireExports,
            Delivery::RetireImports { .. } => DeliveryKind::RetireImports,
            Delivery::BringOutYourDead => DeliveryKind::BringOutYourDead,
            Delivery::SaveSnapshot { .. } => DeliveryKind::SaveSnapshot,
            Delivery::LoadSnapshot { .. } => DeliveryKind::LoadSnapshot,
            Delivery::ShutdownWorker => DeliveryKind::ShutdownWorker,
        }
    }

    /// Snapshot referenced by a `save-snapshot` or `load-snapshot` entry.
    pub fn snapshot_ref(&self) -> Option<&SnapshotRef> {
        match self {
            Delivery::SaveSnapshot { snapshot } | Delivery::LoadSnapshot { snapshot } => Some(snapshot),
            _ => None,
        }
    }
}

/// One syscall made while processing a delivery, with the result the
/// kernel returned. Replay feeds the recorded result back to the worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordedSyscall {
    pub call: Payload,
    pub result: Payload,
}

/// Result a vat reported for a delivery. A vat-level error is still a
/// committed delivery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeliveryStatus {
    Ok,
    Error(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TranscriptEntry {
    pub vat_id: VatId,
    pub position: Position,
    pub delivery: Delivery,
    pub syscalls: Vec<RecordedSyscall>,
    pub status: DeliveryStatus,
}

impl TranscriptEntry {
    /// Entry for a pseudo-delivery: no syscalls, status ok.
    pub fn marker(vat_id: VatId, position: Position, delivery: Delivery) -> Self {
        Self {
            vat_id,
            position,
            delivery,
            syscalls: Vec::new(),
            status: DeliveryStatus::Ok,
        }
    }

    pub fn kind(&self) -> DeliveryKind {
        self.delivery.kind()
    }

    pub fn encode(&self) -> KernelResult<Vec<u8>> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| KernelError::Encode(alloc::format!("{}", e)))
    }

    pub fn decode(bytes: &[u8]) -> KernelResult<Self> {
        let (entry, read) =
            bincode::serde::decode_from_slice::<Self, _>(bytes, bincode::config::standard())
                .map_err(|e| KernelError::Decode(alloc::format!("{}", e)))?;
        if read != bytes.len() {
            return Err(KernelError::Decode(alloc::format!(
                "{} trailing bytes after entry",
                bytes.len() - read
            )));
        }
        Ok(entry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vat() -> VatId {
        VatId::new("v1").unwrap()
    }

    #[test]
    fn entry_encoding_is_canonical() {
        let entry = TranscriptEntry {
            vat_id: vat(),
            position: 4,
            delivery: Delivery::Message { target: "o+0".into(), body: "ping".into() },
            syscalls: vec![RecordedSyscall { call: "send".into(), result: "ack".into() }],
            status: DeliveryStatus::Ok,
        };
        let a = entry.encode().unwrap();
        let b = entry.clone().encode().unwrap();
        assert_eq!(a, b);
        assert_eq!(TranscriptEntry::decode(&a).unwrap(), entry);
    }

    #[test]
    fn decode_rejects_trailing_garbage() {
        let entry = TranscriptEntry::marker(vat(), 0, Delivery::ShutdownWorker);
        let mut bytes = entry.encode().unwrap();
        bytes.push(0xFF);
        assert!(matches!(TranscriptEntry::decode(&bytes), Err(KernelError::Decode(_))));
    }

    #[test]
    fn pseudo_and_routine_kinds() {
        assert!(DeliveryKind::LoadSnapshot.is_pseudo());
        assert!(DeliveryKind::InitializeWorker.is_pseudo());
        assert!(!DeliveryKind::StartVat.is_pseudo());
        assert!(!DeliveryKind::StartVat.is_routine());
        assert!(DeliveryKind::BringOutYourDead.is_routine());
        assert_eq!(Delivery::BringOutYourDead.kind().as_str(), "bringOutYourDead");
    }
}
