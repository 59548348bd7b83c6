// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use vatlog_kernel::policy::{DEFAULT_SNAPSHOT_INITIAL, DEFAULT_SNAPSHOT_INTERVAL};

use crate::errors::{VatError, VatResult};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KernelConfig {
    pub data_dir: PathBuf,
    /// Entries a fresh span may hold before its first snapshot. Only used
    /// when the data directory is created; afterwards the persisted value wins.
    pub snapshot_initial: u64,
    /// Entries between snapshots. Same persistence rule as `snapshot_initial`.
    pub snapshot_interval: u64,
    pub max_vats_online: usize,
    pub restart_worker_on_snapshot: bool,
    pub keep_superseded_snapshots: bool,
    /// Milliseconds between passes of the background pruner.
    pub prune_interval_ms: u64,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("vatlog-data"),
            snapshot_initial: DEFAULT_SNAPSHOT_INITIAL,
            snapshot_interval: DEFAULT_SNAPSHOT_INTERVAL,
            max_vats_online: 50,
            restart_worker_on_snapshot: true,
            keep_superseded_snapshots: false,
            prune_interval_ms: 60_000,
        }
    }
}

impl KernelConfig {
    pub fn in_dir(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            ..Self::default()
        }
    }

    /// Read a JSON config file. Missing fields take their defaults.
    pub fn load(path: impl AsRef<Path>) -> VatResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| VatError::Config(format!("reading {}: {}", path.display(), e)))?;
        let config: Self = serde_json::from_str(&text)
            .map_err(|e| VatError::Config(format!("parsing {}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> VatResult<()> {
        if self.max_vats_online == 0 {
            return Err(VatError::Config("max_vats_online must be at least 1".into()));
        }
        if self.snapshot_interval == 0 {
            return Err(VatError::Config("snapshot_interval must be at least 1".into()));
        }
        if self.prune_interval_ms == 0 {
            return Err(VatError::Config("prune_interval_ms must be at least 1".into()));
        }
        Ok(())
    }

    pub fn transcripts_dir(&self) -> PathBuf {
        self.data_dir.join("transcripts")
    }

    pub fn snapshots_dir(&self) -> PathBuf {
        self.data_dir.join("snapshots")
    }

    pub fn vats_dir(&self) -> PathBuf {
        self.data_dir.join("vats")
    }

    pub fn prune_interval(&self) -> Duration {
        Duration::from_millis(self.prune_interval_ms)
    }

    pub fn state_path(&self) -> PathBuf {
        self.data_dir.join("kernel.json")
    }
}
