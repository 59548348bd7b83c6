// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
mod common;

use common::*;
use std::time::Duration;
use tempfile::tempdir;
use vatlog_kernel::delivery::Payload;
use vatlog_node::{Kernel, SpanDump};

fn layout(dump_spans: &[SpanDump]) -> Vec<(u64, u64)> {
    dump_spans.iter().map(|s| (s.bounds.start_pos, s.bounds.end_pos)).collect()
}

fn run(kernel: &Kernel, pause: Option<Duration>) -> Vec<SpanDump> {
    let v = vat("v1");
    let mut syscalls = EchoSyscalls::default();
    let created = kernel
        .create_vat(&v, Payload::from("v1"), Payload::from("params"), &mut syscalls)
        .unwrap();
    assert_eq!(created.snapshot.map(|s| s.end_pos), Some(3));

    for expected in [4, 5, 6, 7, 8, 11] {
        if let Some(pause) = pause {
            std::thread::sleep(pause);
        }
        let report = kernel.deliver(&v, message("o+0", "inc"), &mut syscalls).unwrap();
        assert_eq!(report.position, expected);
        if report.position == 8 {
            assert_eq!(report.snapshot.map(|s| s.end_pos), Some(10));
        } else {
            assert_eq!(report.snapshot, None);
        }
    }
    kernel.dump_vat(&v).unwrap().spans
}

#[test]
fn test_snapshot_positions_with_initial_2_interval_7() {
    let dir = tempdir().unwrap();
    let kernel = open_kernel(&config(dir.path(), 2, 7), &TestFactory::new());
    let spans = run(&kernel, None);

    // 1. Layout
    // 0 = initialize-worker, 1 = startVat, 2 = save-snapshot, 3 = load-snapshot,
    // 4..=8 messages, 9 = save-snapshot, 10 = load-snapshot, 11 = message
    assert_eq!(layout(&spans), vec![(0, 3), (3, 10), (10, 12)]);

    // 2. Kinds
    assert_eq!(spans[0].kinds, vec!["initialize-worker", "startVat", "save-snapshot"]);
    assert_eq!(
        spans[1].kinds,
        vec!["load-snapshot", "message", "message", "message", "message", "message", "save-snapshot"]
    );
    assert_eq!(spans[2].kinds, vec!["load-snapshot", "message"]);
    assert!(spans[2].current);

    // 3. Exactly the snapshot opening the current span is in use
    let dump = kernel.dump_vat(&vat("v1")).unwrap();
    let in_use: Vec<_> = dump.snapshots.iter().filter(|s| s.in_use).map(|s| s.end_pos).collect();
    assert_eq!(in_use, vec![10]);
}

#[test]
fn test_policy_ignores_wall_clock() {
    let fast_dir = tempdir().unwrap();
    let slow_dir = tempdir().unwrap();
    let fast = run(&open_kernel(&config(fast_dir.path(), 2, 7), &TestFactory::new()), None);
    let slow = run(
        &open_kernel(&config(slow_dir.path(), 2, 7), &TestFactory::new()),
        Some(Duration::from_millis(15)),
    );
    assert_eq!(fast, slow);
}

#[test]
fn test_snapshot_interval_change_is_persisted() {
    let dir = tempdir().unwrap();
    let cfg = config(dir.path(), 2, 7);
    {
        let kernel = open_kernel(&cfg, &TestFactory::new());
        create(&kernel, "v1", "v1");
        kernel.set_snapshot_interval(3).unwrap();
        assert_eq!(kernel.policy().snapshot_interval, 3);
        assert!(kernel.set_snapshot_interval(0).is_err());
    }

    // the config still says 7; the data directory remembers 3
    let kernel = open_kernel(&cfg, &TestFactory::new());
    assert_eq!(kernel.policy().snapshot_interval, 3);

    // span [3, ..) was opened after save-snapshot at 2: 4 -> since_last 3
    let v = vat("v1");
    let report = kernel.deliver(&v, message("o+0", "inc"), &mut EchoSyscalls::default()).unwrap();
    assert_eq!(report.position, 4);
    assert_eq!(report.snapshot.map(|s| s.end_pos), Some(6));
}

#[test]
fn test_snapshot_all_skips_fresh_spans() {
    let dir = tempdir().unwrap();
    let kernel = open_kernel(&config(dir.path(), 2, 7), &TestFactory::new());
    let v = create(&kernel, "v1", "v1");

    // current span holds only its load-snapshot
    assert!(kernel.snapshot_all_vats().unwrap().is_empty());

    send(&kernel, &v, 1);
    let taken = kernel.snapshot_all_vats().unwrap();
    assert!(taken.contains(&v));
    assert_eq!(kernel.record(&v).unwrap().current_span.start_pos, 6);
}

#[test]
fn test_failed_supersede_keeps_rotation_schedule() {
    let deliver_all = |kernel: &Kernel| -> Vec<(u64, Option<u64>)> {
        let v = vat("v1");
        let mut syscalls = EchoSyscalls::default();
        (0..16)
            .map(|_| {
                let report = kernel.deliver(&v, message("o+0", "inc"), &mut syscalls).unwrap();
                (report.position, report.snapshot.map(|s| s.end_pos))
            })
            .collect()
    };

    let steady_dir = tempdir().unwrap();
    let steady = open_kernel(&config(steady_dir.path(), 2, 7), &TestFactory::new());
    create(&steady, "v1", "v1");
    let expected = deliver_all(&steady);

    // 1. The snapshot opening the current span vanishes, so superseding it fails
    let dir = tempdir().unwrap();
    let cfg = config(dir.path(), 2, 7);
    let kernel = open_kernel(&cfg, &TestFactory::new());
    let v = create(&kernel, "v1", "v1");
    std::fs::remove_file(cfg.snapshots_dir().join("v1").join(format!("{:020}.snap", 3))).unwrap();

    // 2. Rotations still land where the policy puts them
    assert_eq!(deliver_all(&kernel), expected);
    let spans = kernel.dump_vat(&v).unwrap().spans;
    assert_eq!(layout(&spans), layout(&steady.dump_vat(&v).unwrap().spans));
    let current = kernel.lifecycle().transcripts().current_span(&v).unwrap();
    assert_eq!(kernel.record(&v).unwrap().current_span, current.bounds);
    assert_eq!(kernel.rebuild(&v).unwrap().from_snapshot, current.opened_by.map(|s| s.end_pos));
}
