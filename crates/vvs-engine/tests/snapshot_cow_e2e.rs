#![forbid(unsafe_code)]
//! End-to-end snapshot and copy-on-write scenarios, each followed by a
//! full refcount audit of the translation tree.

use vvs_engine::VvEngine;
use vvs_error::VvsError;
use vvs_types::{BlockAddr, Tte, VvId};

const LEN: u64 = 0x1000;

fn write(engine: &mut VvEngine, vv: u32, addr: u64, val: u64) {
    engine
        .write(VvId(vv), BlockAddr(addr), LEN, Tte(val))
        .expect("write");
    engine.check_invariants().expect("tree audit after write");
}

fn read(engine: &VvEngine, vv: u32, addr: u64) -> u64 {
    engine.read(VvId(vv), BlockAddr(addr), LEN).expect("read").0
}

// Basic write/read: block 0x10000 lands in page 0x1000 = bank 0,
// L1 slot 0, L2 slot 4, L3 slot 0.
#[test]
fn basic_write_read_roundtrip() {
    let mut engine = VvEngine::new();
    write(&mut engine, 1, 0x10000, 0xAAAA);
    assert_eq!(read(&engine, 1, 0x10000), 0xAAAA);
}

#[test]
fn unmapped_read_returns_zero() {
    let engine = VvEngine::new();
    assert_eq!(read(&engine, 1, 0x20000), 0);
}

#[test]
fn snapshot_preserves_existing_mapping() {
    let mut engine = VvEngine::new();
    write(&mut engine, 1, 0x0, 0xDEAD);
    let snap = engine.create_snapshot("snap1").expect("snapshot");
    engine.check_invariants().expect("tree audit after snapshot");

    assert_eq!(snap, VvId(2));
    assert_eq!(read(&engine, 2, 0x0), 0xDEAD);
}

#[test]
fn cow_isolates_root_write_from_snapshot() {
    let mut engine = VvEngine::new();
    write(&mut engine, 1, 0x0, 0xDEAD);
    engine.create_snapshot("snap1").expect("snapshot");

    write(&mut engine, 1, 0x0, 0xBEEF);
    assert_eq!(read(&engine, 1, 0x0), 0xBEEF, "root sees its new value");
    assert_eq!(read(&engine, 2, 0x0), 0xDEAD, "snapshot keeps its view");
}

// A write under a different L1 slot splits only the bank root; the L2
// table under L1 slot 0 must stay shared between parent and snapshot.
#[test]
fn cow_of_sibling_slot_keeps_unrelated_sharing() {
    let mut engine = VvEngine::new();
    write(&mut engine, 1, 0x0, 0xDEAD);
    engine.create_snapshot("snap1").expect("snapshot");

    // Block 0x40000000 -> page 0x4000000: bank 0, L1 slot 64.
    write(&mut engine, 1, 0x4000_0000, 0x1234);
    assert_eq!(read(&engine, 2, 0x0), 0xDEAD);
    assert_eq!(read(&engine, 1, 0x4000_0000), 0x1234);

    let snap_l1 = engine
        .bank_root(VvId(2), 0)
        .expect("bank")
        .expect("snapshot kept the original L1");
    let root_l1 = engine
        .bank_root(VvId(1), 0)
        .expect("bank")
        .expect("root got a private L1");
    assert_ne!(root_l1, snap_l1, "bank root must have split");

    let shared_l2 = engine
        .store()
        .child(snap_l1, 0)
        .expect("interior")
        .expect("slot 0 still populated");
    assert_eq!(
        engine.store().child(root_l1, 0).expect("interior"),
        Some(shared_l2),
        "both volumes refer to the same L2 under L1 slot 0"
    );
    assert!(
        engine.store().refcount(shared_l2).expect("live") >= 2,
        "the untouched L2 stays shared"
    );
}

#[test]
fn two_snapshots_diverge_independently() {
    let mut engine = VvEngine::new();
    write(&mut engine, 1, 0x8000, 0xD0);
    engine.create_snapshot("s1").expect("snapshot");
    engine.create_snapshot("s2").expect("snapshot");
    engine.check_invariants().expect("tree audit after snapshots");

    write(&mut engine, 1, 0x8000, 0xD1);
    assert_eq!(read(&engine, 2, 0x8000), 0xD0);
    assert_eq!(read(&engine, 3, 0x8000), 0xD0);
    assert_eq!(read(&engine, 1, 0x8000), 0xD1);
}

#[test]
fn write_to_snapshot_leaves_parent_view_intact() {
    let mut engine = VvEngine::new();
    write(&mut engine, 1, 0x0, 0xDEAD);
    engine.create_snapshot("snap1").expect("snapshot");

    write(&mut engine, 2, 0x0, 0xF00D);
    assert_eq!(read(&engine, 2, 0x0), 0xF00D);
    assert_eq!(read(&engine, 1, 0x0), 0xDEAD, "parent unaffected");
}

#[test]
fn write_never_disturbs_other_mappings() {
    let mut engine = VvEngine::new();
    write(&mut engine, 1, 0x0, 0x10);
    write(&mut engine, 1, 0x10000, 0x20);
    write(&mut engine, 1, 1 << 36, 0x30);
    engine.create_snapshot("snap").expect("snapshot");

    write(&mut engine, 1, 0x10000, 0x21);

    assert_eq!(read(&engine, 1, 0x0), 0x10);
    assert_eq!(read(&engine, 1, 1 << 36), 0x30);
    assert_eq!(read(&engine, 2, 0x0), 0x10);
    assert_eq!(read(&engine, 2, 0x10000), 0x20);
    assert_eq!(read(&engine, 2, 1 << 36), 0x30);
}

#[test]
fn snapshot_then_write_keeps_exact_refcounts() {
    let mut engine = VvEngine::new();
    write(&mut engine, 1, 0x0, 0xA);
    engine.create_snapshot("s1").expect("snapshot");

    let shared_l1 = engine
        .bank_root(VvId(1), 0)
        .expect("bank")
        .expect("populated");
    assert_eq!(engine.store().refcount(shared_l1).expect("live"), 2);

    // Diverge the full path: every level splits exactly once.
    write(&mut engine, 1, 0x0, 0xB);
    assert_eq!(
        engine.store().refcount(shared_l1).expect("live"),
        1,
        "snapshot keeps the original L1 alone"
    );
}

// ── Snapshot deletion ───────────────────────────────────────────────────

#[test]
fn deleting_an_undiverged_snapshot_returns_shares() {
    let mut engine = VvEngine::new();
    write(&mut engine, 1, 0x0, 0xDEAD);
    engine.create_snapshot("snap1").expect("snapshot");

    let l1 = engine
        .bank_root(VvId(1), 0)
        .expect("bank")
        .expect("populated");
    assert_eq!(engine.store().refcount(l1).expect("live"), 2);

    let deleted = engine.delete_snapshot("snap1").expect("delete");
    assert_eq!(deleted, VvId(2));
    engine.check_invariants().expect("tree audit after delete");

    assert_eq!(engine.store().refcount(l1).expect("live"), 1);
    assert_eq!(read(&engine, 1, 0x0), 0xDEAD, "root view untouched");
    assert!(matches!(
        engine.read(VvId(2), BlockAddr(0), LEN).expect_err("retired"),
        VvsError::NoSuchVolume(2)
    ));
    assert_eq!(engine.list_volumes().len(), 1);
    assert_eq!(
        engine.volume_table().header(VvId(1)).expect("root").child,
        VvId(0),
        "parent child link cleared"
    );
}

#[test]
fn deleting_a_diverged_snapshot_reclaims_only_its_private_tables() {
    let mut engine = VvEngine::new();
    write(&mut engine, 1, 0x0, 0xDEAD);
    engine.create_snapshot("snap1").expect("snapshot");

    // Diverge the snapshot: it now owns a private path.
    write(&mut engine, 2, 0x0, 0xF00D);
    let nodes_with_divergence = engine.store().node_count();

    engine.delete_snapshot("snap1").expect("delete");
    engine.check_invariants().expect("tree audit after delete");

    assert!(
        engine.store().node_count() < nodes_with_divergence,
        "the snapshot's private tables are reclaimed"
    );
    assert_eq!(read(&engine, 1, 0x0), 0xDEAD);
}

#[test]
fn delete_rejects_unknown_names_and_the_root_vv() {
    let mut engine = VvEngine::new();
    assert_eq!(
        engine.delete_snapshot("nope").expect_err("unknown"),
        VvsError::NoSuchSnapshot("nope".to_owned())
    );
    assert_eq!(
        engine.delete_snapshot("root").expect_err("root is not a snapshot"),
        VvsError::NoSuchSnapshot("root".to_owned())
    );
}

#[test]
fn snapshot_ids_stay_dense_across_deletion() {
    let mut engine = VvEngine::new();
    write(&mut engine, 1, 0x0, 0x1);
    assert_eq!(engine.create_snapshot("s1").expect("snapshot"), VvId(2));
    engine.delete_snapshot("s1").expect("delete");
    assert_eq!(
        engine.create_snapshot("s2").expect("snapshot"),
        VvId(3),
        "retired ids are never reused"
    );
    engine.check_invariants().expect("tree audit");
}
