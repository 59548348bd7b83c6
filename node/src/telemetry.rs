// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Install the tracing subscriber and describe the metrics this crate emits.
///
/// Safe to call more than once; later calls leave the first subscriber in
/// place. No metrics recorder is installed here: embedders bring their own.
pub fn init_tracing() {
    let installed = tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "vatlog_node=info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .try_init()
        .is_ok();

    if installed {
        metrics::describe_counter!("vatlog_transcript_entries_total", "Transcript entries durably appended");
        metrics::describe_counter!("vatlog_snapshots_saved_total", "Snapshots written by span rotation");
        metrics::describe_counter!("vatlog_snapshots_pruned_total", "Superseded snapshot files removed");
        metrics::describe_counter!("vatlog_replayed_entries_total", "Entries re-delivered while rebuilding workers");
        metrics::describe_histogram!("vatlog_replay_duration_seconds", "Time taken to rebuild a worker from its current span");
    }
}
