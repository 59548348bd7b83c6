// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! Small JSON state files (kernel state, vat records).
//!
//! Writes go to `<name>.tmp`, are fsynced, then renamed over the target,
//! so readers see either the old or the new document.

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs::{self, File};
use std::io::{ErrorKind, Write};
use std::path::Path;
use vatlog_persistence::fsync_dir;

use crate::errors::{VatError, VatResult};

pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> VatResult<()> {
    let bytes = serde_json::to_vec_pretty(value).map_err(|e| VatError::State(e.to_string()))?;
    let tmp = path.with_extension("tmp");
    {
        let mut file = File::create(&tmp)?;
        file.write_all(&bytes)?;
        file.sync_all()?;
    }
    fs::rename(&tmp, path)?;
    if let Some(dir) = path.parent() {
        fsync_dir(dir)?;
    }
    Ok(())
}

/// `Ok(None)` when the file does not exist.
pub fn read_json<T: DeserializeOwned>(path: &Path) -> VatResult<Option<T>> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    serde_json::from_slice(&bytes)
        .map(Some)
        .map_err(|e| VatError::State(format!("{}: {}", path.display(), e)))
}
