//! Branch replication between two sites over a loopback.

mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use common::{POINT, connection, connection_with, pair, site};
use fabric::fabric_wire::{OutBuf, ReadOnlyClasses, wire_metrics_snapshot};
use fabric::{
    Authority, Branch, BranchId, ClassId, CommitStatus, CommitTicket, ConnectionId, EventLog,
    FabricError, FabricEvent, FabricObserver, Loopback, ReplicationMode, Site, TObject, TxnFlags,
    Value, VersionMap, WireConfig,
};

fn write(branch: &Arc<Branch>, object: &TObject, index: u32, value: i32) -> CommitTicket {
    let mut txn = branch.begin(TxnFlags::empty()).unwrap();
    txn.write(object, index, value).unwrap();
    txn.commit().unwrap()
}

fn replica_value(site: &Site, branch: BranchId, object: &TObject, index: u32) -> Value {
    site.branch(branch)
        .map_or(Value::Null, |b| b.snapshot().read(object.id(), index))
}

#[test]
fn relay_replicates_through_one_byte_chunks() {
    let now = Instant::now();
    let (a, b) = (site(b"relay-a"), site(b"relay-b"));
    let branch = a.create_branch().unwrap();
    let point = a.create_object(POINT, &[], 0).unwrap();
    let mut lb = pair(&a, &b, ReplicationMode::Relay, 1, now);
    lb.left.share_branch(&branch).unwrap();

    let ticket = write(&branch, &point, 0, 5);
    write(&branch, &point, 1, 6);
    assert_eq!(ticket.status(), Some(CommitStatus::Committed));
    lb.run_until_idle(now, 10_000).unwrap();

    assert_eq!(replica_value(&b, branch.id(), &point, 0), Value::I32(5));
    assert_eq!(replica_value(&b, branch.id(), &point, 1), Value::I32(6));
    let imported = b.object(point.id()).unwrap();
    assert_eq!(imported.class_id(), POINT);
}

#[test]
fn keyed_collections_replicate() {
    let now = Instant::now();
    let (a, b) = (site(b"keyed-a"), site(b"keyed-b"));
    let branch = a.create_branch().unwrap();
    let map = a.create_object(ClassId::MAP, &[], 0).unwrap();
    let mut lb = pair(&a, &b, ReplicationMode::Relay, 3, now);
    lb.left.share_branch(&branch).unwrap();

    let mut txn = branch.begin(TxnFlags::empty()).unwrap();
    txn.put(&map, Value::from("gone"), Value::I32(1)).unwrap();
    txn.put(&map, Value::from("kept"), Value::from("yes")).unwrap();
    txn.commit().unwrap();
    let mut txn = branch.begin(TxnFlags::empty()).unwrap();
    txn.remove(&map, Value::from("gone")).unwrap();
    txn.commit().unwrap();
    lb.run_until_idle(now, 1_000).unwrap();

    let replica = b.branch(branch.id()).unwrap().snapshot();
    assert_eq!(replica.read_key(map.id(), &Value::from("gone")).unwrap(), None);
    assert_eq!(
        replica.read_key(map.id(), &Value::from("kept")).unwrap(),
        Some(Value::from("yes"))
    );
}

#[test]
fn intercepted_commits_wait_for_the_peer() {
    let now = Instant::now();
    let (a, b) = (site(b"gate-a"), site(b"gate-b"));
    let branch = a.create_branch().unwrap();
    let point = a.create_object(POINT, &[], 0).unwrap();
    let mut lb = pair(&a, &b, ReplicationMode::Intercept, 7, now);
    lb.left.share_branch(&branch).unwrap();

    let ticket = write(&branch, &point, 0, 42);
    assert!(ticket.is_intercepted());
    assert_eq!(ticket.status(), None);

    lb.run_until_idle(now, 1_000).unwrap();
    assert_eq!(ticket.status(), Some(CommitStatus::Committed));
    ticket.wait().unwrap();
    assert_eq!(replica_value(&b, branch.id(), &point, 0), Value::I32(42));
    assert_eq!(lb.right.held_interceptions(), 0);
}

struct Refuse;

impl Authority for Refuse {
    fn review(&self, _: ConnectionId, _: BranchId, maps: &[Arc<VersionMap>]) -> fabric::Result<()> {
        Err(FabricError::Aborted {
            reason: format!("{} maps refused", maps.len()),
        })
    }
}

#[test]
fn refused_interceptions_discard_speculative_state() {
    let now = Instant::now();
    let (a, b) = (site(b"nack-a"), site(b"nack-b"));
    let branch = a.create_branch().unwrap();
    let point = a.create_object(POINT, &[], 0).unwrap();
    let left = connection(&a, 1, now).with_replication(ReplicationMode::Intercept);
    let right = connection(&b, 2, now).with_authority(Arc::new(Refuse));
    let mut lb = Loopback::new(left, right, 64);
    lb.left.share_branch(&branch).unwrap();

    let ticket = write(&branch, &point, 0, 9);
    assert_eq!(branch.snapshot().read(point.id(), 0), Value::I32(9));
    lb.run_until_idle(now, 1_000).unwrap();

    assert_eq!(ticket.status(), Some(CommitStatus::Abort));
    assert!(matches!(ticket.wait(), Err(FabricError::Aborted { .. })));
    assert_eq!(branch.snapshot().read(point.id(), 0), Value::Null);
    assert_eq!(replica_value(&b, branch.id(), &point, 0), Value::Null);
    assert!(!lb.left.is_closed() && !lb.right.is_closed());
}

#[test]
fn disconnection_aborts_pending_interceptions() {
    let now = Instant::now();
    let (a, b) = (site(b"drop-a"), site(b"drop-b"));
    let branch = a.create_branch().unwrap();
    let point = a.create_object(POINT, &[], 0).unwrap();
    let mut lb = pair(&a, &b, ReplicationMode::Intercept, 64, now);
    lb.left.share_branch(&branch).unwrap();

    let ticket = write(&branch, &point, 0, 1);
    lb.left.close("link lost");

    let err = ticket.wait().unwrap_err();
    assert!(matches!(err, FabricError::Disconnected { .. }));
    assert_eq!(err.status(), CommitStatus::Abort);
    assert!(branch.is_blocked());
    let mut txn = branch.begin(TxnFlags::empty()).unwrap();
    txn.write(&point, 0, 2).unwrap();
    assert!(matches!(txn.commit(), Err(FabricError::Disconnected { .. })));

    lb.run_until_idle(now, 100).unwrap();
    assert!(lb.right.is_closed());
    assert_eq!(lb.right.close_cause(), Some("closed by peer: link lost"));
}

#[test]
fn maps_are_not_echoed_to_their_source() {
    let now = Instant::now();
    let (a, b) = (site(b"echo-a"), site(b"echo-b"));
    let branch = a.create_branch().unwrap();
    let point = a.create_object(POINT, &[], 0).unwrap();
    let mut lb = pair(&a, &b, ReplicationMode::Relay, 16, now);
    lb.left.share_branch(&branch).unwrap();
    let replica = b.open_branch(branch.id());
    lb.right.share_branch(&replica).unwrap();

    write(&branch, &point, 0, 3);
    lb.run_until_idle(now, 1_000).unwrap();
    assert_eq!(replica.snapshot().end(), 1);
    assert_eq!(branch.snapshot().end(), 1);

    // Writes on the replica travel back.
    let imported = b.object(point.id()).unwrap();
    write(&replica, &imported, 1, 4);
    lb.run_until_idle(now, 1_000).unwrap();
    assert_eq!(branch.snapshot().read(point.id(), 1), Value::I32(4));
    assert_eq!(branch.snapshot().end(), 2);
    assert_eq!(replica.snapshot().end(), 2);
}

#[test]
fn validator_rejection_closes_the_connection() {
    let now = Instant::now();
    let (a, b) = (site(b"deny-a"), site(b"deny-b"));
    let branch = a.create_branch().unwrap();
    let point = a.create_object(POINT, &[], 0).unwrap();
    let log = Arc::new(EventLog::new(64));
    let observer: Arc<dyn FabricObserver> = log.clone();
    let left = connection(&a, 1, now);
    let right = connection(&b, 2, now)
        .with_validator(Arc::new(ReadOnlyClasses::new([POINT])))
        .with_observer(Some(observer));
    let mut lb = Loopback::new(left, right, 32);
    lb.left.share_branch(&branch).unwrap();

    write(&branch, &point, 0, 1);
    let outcome = lb.run_until_idle(now, 1_000);
    assert!(matches!(outcome, Err(FabricError::Validation { .. })));
    for _ in 0..10 {
        let _ = lb.pump(now);
    }

    assert!(lb.right.is_closed());
    assert!(lb.left.is_closed());
    assert_eq!(replica_value(&b, branch.id(), &point, 0), Value::Null);
    assert!(log.snapshot().iter().any(|e| matches!(e, FabricEvent::ValidatorRejected { .. })));
    assert!(log.snapshot().iter().any(|e| matches!(e, FabricEvent::ConnectionClosed { .. })));
}

#[test]
fn overload_callback_tracks_send_pressure() {
    let now = Instant::now();
    let (a, b) = (site(b"load-a"), site(b"load-b"));
    let branch = a.create_branch().unwrap();
    let point = a.create_object(POINT, &[], 0).unwrap();
    let config = WireConfig {
        overload_threshold: 4,
        ..WireConfig::default()
    };
    let transitions = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&transitions);
    let left = connection_with(&a, 1, config, now).on_overload(Box::new(move |_| {
        seen.fetch_add(1, Ordering::SeqCst);
    }));
    let right = connection(&b, 2, now);
    let mut lb = Loopback::new(left, right, 8);
    lb.left.share_branch(&branch).unwrap();

    for i in 0..40 {
        write(&branch, &point, 0, i);
    }
    lb.run_until_idle(now, 100_000).unwrap();

    assert!(transitions.load(Ordering::SeqCst) >= 2);
    assert!(!lb.left.is_overloaded());
    assert_eq!(replica_value(&b, branch.id(), &point, 0), Value::I32(39));
}

#[test]
fn heartbeats_keep_idle_connections_open() {
    let t0 = Instant::now();
    let (a, b) = (site(b"beat-a"), site(b"beat-b"));
    let mut lb = pair(&a, &b, ReplicationMode::Relay, 64, t0);
    let before = wire_metrics_snapshot();
    for step in 0..60 {
        lb.pump(t0 + Duration::from_millis(step * 500)).unwrap();
    }
    assert!(!lb.left.is_closed() && !lb.right.is_closed());
    assert!(wire_metrics_snapshot().heartbeats_sent >= before.heartbeats_sent + 20);
}

#[test]
fn silent_peers_time_out() {
    let t0 = Instant::now();
    let a = site(b"quiet-a");
    let mut lonely = connection(&a, 1, t0);
    let mut out = OutBuf::with_capacity(256);
    lonely
        .poll_write(t0 + Duration::from_secs(11), &mut out)
        .unwrap();
    assert!(lonely.is_closed());
    assert!(lonely.close_cause().unwrap().contains("no traffic"));
}
