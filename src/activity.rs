// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! Crank and activity hashes.
//!
//! # Protocol
//! Every committed transcript entry of a crank is fed into a [`CrankHasher`]
//! as `vat_id || position || encoded entry`. At the end of the crank the
//! crank digest is folded into the running activity hash:
//!
//! `activity' = blake3("activityhash\n" || activity || "\n" || crank || "\n")`
//!
//! Two replicas that committed the same entries in the same order hold the
//! same activity hash. Cranks that committed nothing are not folded.

use alloc::collections::BTreeMap;

use crate::delivery::TranscriptEntry;
use crate::error::KernelResult;
use crate::types::{Position, VatId};

const ACTIVITY_DOMAIN: &[u8] = b"activityhash\n";

pub struct CrankHasher {
    hasher: blake3::Hasher,
    entries: u64,
    touched: BTreeMap<VatId, Position>,
}

impl CrankHasher {
    pub fn new() -> Self {
        Self {
            hasher: blake3::Hasher::new(),
            entries: 0,
            touched: BTreeMap::new(),
        }
    }

    pub fn add_entry(&mut self, entry: &TranscriptEntry) -> KernelResult<()> {
        let bytes = entry.encode()?;
        self.add_encoded(&entry.vat_id, entry.position, &bytes);
        Ok(())
    }

    /// Same as [`add_entry`](Self::add_entry) for bytes already produced by
    /// [`TranscriptEntry::encode`].
    pub fn add_encoded(&mut self, vat: &VatId, position: Position, bytes: &[u8]) {
        let id = vat.as_str().as_bytes();
        self.hasher.update(&(id.len() as u32).to_le_bytes());
        self.hasher.update(id);
        self.hasher.update(&position.to_le_bytes());
        self.hasher.update(&(bytes.len() as u64).to_le_bytes());
        self.hasher.update(bytes);
        self.entries += 1;
        let next = position + 1;
        let slot = self.touched.entry(vat.clone()).or_insert(next);
        if *slot < next {
            *slot = next;
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entries == 0
    }

    pub fn entry_count(&self) -> u64 {
        self.entries
    }

    /// Next transcript position of every vat this crank wrote to.
    pub fn touched(&self) -> &BTreeMap<VatId, Position> {
        &self.touched
    }

    pub fn finish(self) -> ([u8; 32], BTreeMap<VatId, Position>) {
        (*self.hasher.finalize().as_bytes(), self.touched)
    }
}

impl Default for CrankHasher {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActivityHashAccumulator {
    current: [u8; 32],
    cranks: u64,
}

impl ActivityHashAccumulator {
    pub fn new() -> Self {
        Self { current: [0u8; 32], cranks: 0 }
    }

    pub fn resume(current: [u8; 32], cranks: u64) -> Self {
        Self { current, cranks }
    }

    /// Fold one crank digest into the chain and return the new value.
    pub fn fold(&mut self, crank_hash: &[u8; 32]) -> [u8; 32] {
        let mut hasher = blake3::Hasher::new();
        hasher.update(ACTIVITY_DOMAIN);
        hasher.update(&self.current);
        hasher.update(b"\n");
        hasher.update(crank_hash);
        hasher.update(b"\n");
        self.current = *hasher.finalize().as_bytes();
        self.cranks += 1;
        self.current
    }

    pub fn digest(&self) -> [u8; 32] {
        self.current
    }

    pub fn crank_count(&self) -> u64 {
        self.cranks
    }
}

impl Default for ActivityHashAccumulator {
    fn default() -> Self {
        Self::new()
    }
}
