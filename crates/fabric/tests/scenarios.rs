//! Transaction scenarios on a single site.

mod common;

use std::sync::Arc;
use std::thread;

use common::{POINT, site, site_with_config};
use fabric::fabric_mvcc::AckSlot;
use fabric::{
    ClassId, CommitStatus, FabricConfig, FabricError, MemoryStore, Merger, StoreAcknowledger,
    TxnFlags, Value, Walker,
};

#[test]
fn simple_commit() {
    let site = site(b"simple");
    let branch = site.create_branch().unwrap();
    let a = site.create_object(POINT, &[], 0).unwrap();
    let before = branch.snapshot();
    assert_eq!(before.version_map_count(), 0);

    let mut t1 = branch.begin(TxnFlags::empty()).unwrap();
    t1.write(&a, 0, 11).unwrap();
    let ticket = t1.commit().unwrap();

    let after = branch.snapshot();
    assert_eq!(after.version_map_count(), 1);
    assert_eq!(after.acknowledged(), before.acknowledged());
    assert_eq!(after.read(a.id(), 0), Value::I32(11));
    assert_eq!(ticket.status(), Some(CommitStatus::Committed));
}

#[test]
fn stale_read_conflicts() {
    let site = site(b"conflict");
    let branch = site.create_branch().unwrap();
    let a = site.create_object(POINT, &[], 0).unwrap();

    let mut t1 = branch.begin(TxnFlags::empty()).unwrap();
    let mut t2 = branch.begin(TxnFlags::empty()).unwrap();
    let mut blind = branch.begin(TxnFlags::empty()).unwrap();
    assert_eq!(t2.read(&a, 0).unwrap(), Value::Null);

    t1.write(&a, 0, 1).unwrap();
    t1.commit().unwrap();

    t2.write(&a, 1, 2).unwrap();
    let err = t2.commit().unwrap_err();
    assert_eq!(err.status(), CommitStatus::Conflict);
    assert!(matches!(err, FabricError::Conflict { .. }));

    blind.write(&a, 1, 3).unwrap();
    blind.commit().unwrap();
    let snapshot = branch.snapshot();
    assert_eq!(snapshot.read(a.id(), 0), Value::I32(1));
    assert_eq!(snapshot.read(a.id(), 1), Value::I32(3));
}

#[test]
fn auto_transactions_retry_under_contention() {
    let config = FabricConfig {
        max_commit_retries: 10_000,
        ..FabricConfig::default()
    };
    let site = site_with_config(b"contended", config);
    let branch = site.create_branch().unwrap();
    let counter = site.create_object(POINT, &[], 0).unwrap();

    let workers: Vec<_> = (0..4)
        .map(|_| {
            let branch = Arc::clone(&branch);
            let counter = Arc::clone(&counter);
            thread::spawn(move || {
                for _ in 0..25 {
                    branch
                        .run(TxnFlags::AUTO, |txn| {
                            let n = txn.read(&counter, 0)?.as_i64().unwrap_or(0);
                            txn.write(&counter, 0, n + 1)
                        })
                        .unwrap();
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }
    assert_eq!(branch.snapshot().read(counter.id(), 0).as_i64(), Some(100));
}

#[test]
fn keyed_merge_overwrites_and_clears() {
    let site = site(b"keyed");
    let branch = site.create_branch().unwrap();
    let map = site.create_object(ClassId::MAP, &[], 0).unwrap();
    let k1 = Value::from("k1");

    let put = |key: &Value, value: i32| {
        let mut txn = branch.begin(TxnFlags::empty()).unwrap();
        txn.put(&map, key.clone(), Value::I32(value)).unwrap();
        txn.commit().unwrap();
    };
    put(&k1, 0);
    put(&k1, 1);
    assert_eq!(
        branch.snapshot().read_key(map.id(), &k1).unwrap(),
        Some(Value::I32(1))
    );

    // A blind clear started before another put still empties the table.
    let mut clearing = branch.begin(TxnFlags::empty()).unwrap();
    clearing.clear(&map).unwrap();
    put(&Value::from("k2"), 2);
    clearing.commit().unwrap();

    let mut reader = branch.begin(TxnFlags::READ_ONLY).unwrap();
    assert!(reader.entries(&map).unwrap().is_empty());
    assert_eq!(reader.get(&map, &k1).unwrap(), None);
}

#[test]
fn whole_collection_reads_conflict_with_any_write() {
    let site = site(b"read-all");
    let branch = site.create_branch().unwrap();
    let map = site.create_object(ClassId::MAP, &[], 0).unwrap();

    let mut scanner = branch.begin(TxnFlags::empty()).unwrap();
    assert!(scanner.entries(&map).unwrap().is_empty());

    let mut writer = branch.begin(TxnFlags::empty()).unwrap();
    writer.put(&map, Value::from("x"), Value::I32(1)).unwrap();
    writer.commit().unwrap();

    scanner
        .put(&map, Value::from("count"), Value::I32(0))
        .unwrap();
    assert_eq!(scanner.commit().unwrap_err().status(), CommitStatus::Conflict);
}

#[test]
fn acknowledged_index_never_regresses() {
    let config = FabricConfig {
        trim_threshold: 2,
        ..FabricConfig::default()
    };
    let site = site_with_config(b"monotonic", config);
    let branch = site.create_branch().unwrap();
    let a = site.create_object(POINT, &[], 0).unwrap();

    let store = Arc::new(MemoryStore::deferred());
    let slot: AckSlot = site.allocate_ack_slot().unwrap();
    branch.add_acknowledger(slot, false).unwrap();
    let mut acknowledger = StoreAcknowledger::new(store.clone());
    let mut walker = Walker::new(Some(slot), &config);
    let mut merger = Merger::new(&config);
    let branches = [Arc::clone(&branch)];

    let mut last_acknowledged = 0;
    let mut last_seen: Option<u64> = None;
    for round in 0..6 {
        for i in 0..3 {
            let mut txn = branch.begin(TxnFlags::empty()).unwrap();
            txn.write(&a, 0, round * 10 + i).unwrap();
            txn.commit().unwrap();
        }
        walker.run(&branches, &mut acknowledger).unwrap();
        if round % 2 == 1 {
            store.complete_all();
        }
        walker.run(&branches, &mut acknowledger).unwrap();
        merger.tick(&branches).unwrap();

        let snapshot = branch.snapshot();
        assert!(snapshot.acknowledged() >= last_acknowledged);
        last_acknowledged = snapshot.acknowledged();

        let seen = walker
            .last_acknowledged(branch.id())
            .map(|state| state.processed_to());
        assert!(seen >= last_seen);
        last_seen = seen;
    }
    store.complete_all();
    walker.run(&branches, &mut acknowledger).unwrap();
    merger.tick(&branches).unwrap();
    assert_eq!(store.inserted(branch.id()), 18);
    assert_eq!(branch.snapshot().read(a.id(), 0), Value::I32(52));
}
