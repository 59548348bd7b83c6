// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::kernel::Kernel;

/// Background task removing superseded snapshot files on an interval.
pub struct Pruner {
    stop: Option<oneshot::Sender<()>>,
    task: JoinHandle<u64>,
}

/// Spawn the pruner on the current tokio runtime, one pass every
/// `prune_interval_ms`. The first pass runs one full period after spawning.
pub fn spawn_pruner(kernel: Arc<Kernel>) -> Pruner {
    let period = kernel.config().prune_interval();
    let (stop_tx, mut stop_rx) = oneshot::channel();
    let task = tokio::spawn(async move {
        let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut removed_total = 0u64;
        loop {
            tokio::select! {
                _ = &mut stop_rx => break,
                _ = interval.tick() => {}
            }
            let kernel = kernel.clone();
            // snapshot removal is blocking file I/O
            match tokio::task::spawn_blocking(move || kernel.prune_superseded_snapshots()).await {
                Ok(Ok(0)) => tracing::trace!("Prune pass found nothing to remove"),
                Ok(Ok(removed)) => {
                    removed_total += removed as u64;
                    tracing::debug!(removed, "Pruned superseded snapshots");
                }
                Ok(Err(e)) => tracing::warn!(error = %e, "Prune pass failed"),
                Err(e) => tracing::error!(error = %e, "Prune task panicked"),
            }
        }
        removed_total
    });
    Pruner {
        stop: Some(stop_tx),
        task,
    }
}

impl Pruner {
    /// Stop the loop after any pass in progress and return how many files it
    /// removed over its lifetime.
    pub async fn shutdown(mut self) -> u64 {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        match self.task.await {
            Ok(removed) => removed,
            Err(e) => {
                tracing::error!(error = %e, "Pruner task ended abnormally");
                0
            }
        }
    }
}
