// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! Identifiers and position types shared by every layer.

use alloc::string::{String, ToString};
use core::fmt;
use serde::{Deserialize, Serialize};

use crate::error::{KernelError, KernelResult};

/// Zero-based index of an entry in a vat's transcript.
pub type Position = u64;

/// Counter bumped on every upgrade of a vat's code.
pub type Incarnation = u32;

const MAX_VAT_ID_LEN: usize = 64;

/// Stable identifier for a vat.
///
/// Restricted to `[A-Za-z0-9_-]` so it can name directories directly.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct VatId(String);

impl VatId {
    pub fn new(id: impl Into<String>) -> KernelResult<Self> {
        let id = id.into();
        let valid = !id.is_empty()
            && id.len() <= MAX_VAT_ID_LEN
            && id.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_');
        if valid {
            Ok(Self(id))
        } else {
            Err(KernelError::InvalidVatId(id))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for VatId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for VatId {
    type Error = KernelError;

    fn try_from(value: String) -> KernelResult<Self> {
        Self::new(value)
    }
}

impl From<VatId> for String {
    fn from(value: VatId) -> Self {
        value.0
    }
}

impl core::str::FromStr for VatId {
    type Err = KernelError;

    fn from_str(s: &str) -> KernelResult<Self> {
        Self::new(s.to_string())
    }
}

/// Half-open range `[start_pos, end_pos)` of a span plus the incarnation
/// that wrote it. For the current span `end_pos` is the next write position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpanBounds {
    pub start_pos: Position,
    pub end_pos: Position,
    pub incarnation: Incarnation,
}

impl SpanBounds {
    pub fn len(&self) -> u64 {
        self.end_pos - self.start_pos
    }

    pub fn is_empty(&self) -> bool {
        self.end_pos == self.start_pos
    }

    pub fn contains(&self, pos: Position) -> bool {
        pos >= self.start_pos && pos < self.end_pos
    }
}

/// Reference from a transcript entry to a stored snapshot.
///
/// `end_pos` is the position of the `load-snapshot` entry that opens the
/// span following the snapshot; `hash` is the blake3 digest of the blob.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotRef {
    pub end_pos: Position,
    pub hash: [u8; 32],
}
