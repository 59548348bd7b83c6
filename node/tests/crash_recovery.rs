// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
mod common;

use common::*;
use std::fs::OpenOptions;
use std::io::{Seek, SeekFrom, Write};
use std::path::PathBuf;
use tempfile::tempdir;
use vatlog_kernel::delivery::{Delivery, DeliveryStatus, Payload};
use vatlog_node::snapshot_store::SnapshotStore;
use vatlog_node::transcript_store::TranscriptStore;
use vatlog_node::{EntryDraft, ErrorKind, Kernel, KernelConfig, VatError};

fn segment(cfg: &KernelConfig, vat: &str, start: u64) -> PathBuf {
    cfg.transcripts_dir().join(vat).join(format!("span-{:020}.seg", start))
}

fn open_err(cfg: &KernelConfig) -> VatError {
    match Kernel::open(cfg.clone(), TestFactory::new()) {
        Ok(_) => panic!("open should have failed"),
        Err(e) => e,
    }
}

#[test]
fn test_torn_tail_is_discarded() {
    let dir = tempdir().unwrap();
    let cfg = config(dir.path(), 100, 200);
    {
        let kernel = open_kernel(&cfg, &TestFactory::new());
        let v = create(&kernel, "v1", "v1");
        send(&kernel, &v, 3);
    }

    // 1. A write that died after a few bytes
    let mut file = OpenOptions::new().append(true).open(segment(&cfg, "v1", 0)).unwrap();
    file.write_all(&[0xAB; 7]).unwrap();
    drop(file);

    // 2. Reopen: the partial record is gone and appends continue
    let kernel = open_kernel(&cfg, &TestFactory::new());
    let v = vat("v1");
    assert_eq!(kernel.lifecycle().next_position(&v).unwrap(), 5);
    let report = kernel.deliver(&v, message("o+0", "inc"), &mut EchoSyscalls::default()).unwrap();
    assert_eq!(report.position, 5);
    let state = decode_state(&kernel.capture_state(&v).unwrap());
    assert_eq!(state.deliveries, 4);
}

#[test]
fn test_corrupted_middle_record_is_fatal() {
    let dir = tempdir().unwrap();
    let cfg = config(dir.path(), 100, 200);
    {
        let kernel = open_kernel(&cfg, &TestFactory::new());
        let v = create(&kernel, "v1", "v1");
        send(&kernel, &v, 3);
    }

    // flip a byte inside the first record's payload (32-byte segment header, 20-byte record header)
    let mut file = OpenOptions::new().read(true).write(true).open(segment(&cfg, "v1", 0)).unwrap();
    file.seek(SeekFrom::Start(32 + 20 + 3)).unwrap();
    file.write_all(&[0xFF]).unwrap();
    drop(file);

    let err = open_err(&cfg);
    println!("Corruption reported as: {}", err);
    assert_eq!(err.kind(), ErrorKind::Corruption);
}

#[test]
fn test_orphan_snapshot_is_superseded() {
    let dir = tempdir().unwrap();
    let cfg = config(dir.path(), 2, 7);
    {
        let kernel = open_kernel(&cfg, &TestFactory::new());
        let v = create(&kernel, "v1", "v1");
        send(&kernel, &v, 2);
    }

    // a blob saved just before a crash, its save-snapshot entry never written
    {
        let snapshots = SnapshotStore::open(cfg.snapshots_dir(), false).unwrap();
        snapshots.save(&vat("v1"), 7, 0, b"half-finished rotation").unwrap();
        assert_eq!(snapshots.latest_info(&vat("v1")).unwrap().end_pos, 7);
    }

    let kernel = open_kernel(&cfg, &TestFactory::new());
    let v = vat("v1");
    let latest = kernel.lifecycle().snapshots().latest_info(&v).unwrap();
    assert_eq!(latest.end_pos, 3);
    let report = kernel.rebuild(&v).unwrap();
    assert_eq!(report.from_snapshot, Some(3));
    assert_eq!(decode_state(&kernel.capture_state(&v).unwrap()).deliveries, 2);
}

#[test]
fn test_rebuild_uses_the_snapshot_named_by_the_span() {
    let dir = tempdir().unwrap();
    let kernel = open_kernel(&config(dir.path(), 2, 7), &TestFactory::new());
    let v = create(&kernel, "v1", "v1");
    send(&kernel, &v, 2);
    let expected = kernel.capture_state(&v).unwrap();

    // a newer snapshot the live run never got to supersede
    kernel.lifecycle().snapshots().save(&v, 9, 0, b"left behind").unwrap();
    assert_eq!(kernel.lifecycle().snapshots().latest_info(&v).unwrap().end_pos, 9);

    let report = kernel.rebuild(&v).unwrap();
    assert_eq!(report.from_snapshot, Some(3));
    assert_eq!(kernel.capture_state(&v).unwrap(), expected);
}

#[test]
fn test_interrupted_rotation_rolls_forward() {
    let dir = tempdir().unwrap();
    let cfg = config(dir.path(), 2, 7);

    // 1. Checkpoint before the crank that crashes
    drop(open_kernel(&cfg, &TestFactory::new()));
    let checkpoint = std::fs::read(cfg.state_path()).unwrap();
    {
        let kernel = open_kernel(&cfg, &TestFactory::new());
        create(&kernel, "v1", "v1");
    }

    // 2. Crash after save-snapshot reached the transcript, before the new span
    std::fs::remove_file(segment(&cfg, "v1", 3)).unwrap();
    std::fs::write(cfg.state_path(), &checkpoint).unwrap();

    // 3. Reopen completes the rotation
    let kernel = open_kernel(&cfg, &TestFactory::new());
    let v = vat("v1");
    let spans = kernel.lifecycle().transcripts().spans(&v).unwrap();
    let layout: Vec<_> = spans.iter().map(|s| (s.bounds.start_pos, s.bounds.end_pos)).collect();
    assert_eq!(layout, vec![(0, 3), (3, 4)]);
    assert_eq!(spans[1].opened_by.map(|s| s.end_pos), Some(3));
    assert_eq!(kernel.rebuild(&v).unwrap().from_snapshot, Some(3));

    // 4. Same digest as a run that never crashed
    let steady_dir = tempdir().unwrap();
    let steady = open_kernel(&config(steady_dir.path(), 2, 7), &TestFactory::new());
    create(&steady, "v1", "v1");
    assert_eq!(kernel.activity_hash(), steady.activity_hash());
    assert_eq!(kernel.crank_number(), steady.crank_number());
}

#[test]
fn test_interrupted_upgrade_is_finished_on_open() {
    let dir = tempdir().unwrap();
    let cfg = config(dir.path(), 100, 200);
    {
        let kernel = open_kernel(&cfg, &TestFactory::new());
        let v = create(&kernel, "v1", "v1");
        send(&kernel, &v, 2);
    }

    // 1. Crash after the upgrade intent and its first closing entry were written
    let boyd = EntryDraft::new(Delivery::BringOutYourDead, Vec::new(), DeliveryStatus::Ok);
    {
        let transcripts = TranscriptStore::open(cfg.transcripts_dir()).unwrap();
        transcripts.append(&vat("v1"), boyd.clone()).unwrap();
    }
    let intent = serde_json::json!({
        "status": "Active",
        "pending_upgrade": {
            "incarnation": 1,
            "closing_start": 4,
            "closing": [boyd, EntryDraft::marker(Delivery::ShutdownWorker)],
            "opening": [
                EntryDraft::marker(Delivery::InitializeWorker { options: Payload::from("v2") }),
                EntryDraft::new(Delivery::StartVat { vat_parameters: Payload::from("p2") }, Vec::new(), DeliveryStatus::Ok),
            ],
        },
    });
    std::fs::write(cfg.vats_dir().join("v1.json"), serde_json::to_vec(&intent).unwrap()).unwrap();

    // 2. Reopen writes the rest mechanically
    let factory = TestFactory::new();
    let kernel = open_kernel(&cfg, &factory);
    let v = vat("v1");
    assert_eq!(factory.inits() + factory.loads(), 0);
    let dump = kernel.dump_vat(&v).unwrap();
    assert_eq!(dump.record.incarnation, 1);
    let layout: Vec<_> = dump.spans.iter().map(|s| (s.bounds.start_pos, s.bounds.end_pos)).collect();
    assert_eq!(layout, vec![(0, 6), (6, 8)]);
    assert_eq!(
        dump.spans[0].kinds,
        vec!["initialize-worker", "startVat", "message", "message", "bringOutYourDead", "shutdown-worker"]
    );
    assert_eq!(dump.spans[1].kinds, vec!["initialize-worker", "startVat"]);

    let state = decode_state(&kernel.capture_state(&v).unwrap());
    assert_eq!(state.version, "v2");
    assert_eq!(state.parameters, b"p2".to_vec());

    // 3. Same digest as an upgrade that never crashed
    let steady_dir = tempdir().unwrap();
    let steady = open_kernel(&config(steady_dir.path(), 100, 200), &TestFactory::new());
    let sv = create(&steady, "v1", "v1");
    send(&steady, &sv, 2);
    steady
        .upgrade_vat(&sv, Payload::from("v2"), Payload::from("p2"), &mut EchoSyscalls::default())
        .unwrap();
    assert_eq!(kernel.activity_hash(), steady.activity_hash());
}

#[test]
fn test_checkpoint_ahead_of_transcript_is_rejected() {
    let dir = tempdir().unwrap();
    let cfg = config(dir.path(), 100, 200);
    {
        let kernel = open_kernel(&cfg, &TestFactory::new());
        create(&kernel, "v1", "v1");
    }
    let mut state: serde_json::Value = serde_json::from_slice(&std::fs::read(cfg.state_path()).unwrap()).unwrap();
    state["positions"]["v1"] = serde_json::json!(999);
    std::fs::write(cfg.state_path(), serde_json::to_vec(&state).unwrap()).unwrap();

    let err = open_err(&cfg);
    assert_eq!(err.kind(), ErrorKind::Corruption);
}

#[test]
fn test_activity_hash_is_stored_as_hex() {
    let dir = tempdir().unwrap();
    let cfg = config(dir.path(), 100, 200);
    let hex = {
        let kernel = open_kernel(&cfg, &TestFactory::new());
        create(&kernel, "v1", "v1");
        kernel.activity_hash_hex()
    };
    assert_eq!(hex.len(), 64);
    let mut state: serde_json::Value = serde_json::from_slice(&std::fs::read(cfg.state_path()).unwrap()).unwrap();
    assert_eq!(state["activity_hash"], serde_json::json!(hex));
    assert_eq!(open_kernel(&cfg, &TestFactory::new()).activity_hash_hex(), hex);

    state["activity_hash"] = serde_json::json!("not-a-digest");
    std::fs::write(cfg.state_path(), serde_json::to_vec(&state).unwrap()).unwrap();
    assert_eq!(open_err(&cfg).kind(), ErrorKind::Corruption);
}

#[test]
fn test_vat_record_without_transcript_is_rejected() {
    let dir = tempdir().unwrap();
    let cfg = config(dir.path(), 100, 200);
    drop(open_kernel(&cfg, &TestFactory::new()));
    std::fs::write(cfg.vats_dir().join("ghost.json"), br#"{"status":"Active"}"#).unwrap();

    let err = open_err(&cfg);
    assert_eq!(err.kind(), ErrorKind::Corruption);
}
