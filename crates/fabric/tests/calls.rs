//! Method calls, handshake and distributed GC between two sites.

mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use common::{POINT, connection, pair, site};
use fabric::{
    BranchId, CallHandler, FabricError, Loopback, ReplicationMode, Site, TObject, TxnFlags, Value,
};

/// Reads field 0 of the target on one branch; `boom` panics, `fail`
/// returns an error.
struct FieldReader {
    site: Arc<Site>,
    branch: BranchId,
    invoked: AtomicUsize,
}

impl CallHandler for FieldReader {
    fn invoke(&self, object: &Arc<TObject>, method: &str, args: &[Value]) -> fabric::Result<Value> {
        self.invoked.fetch_add(1, Ordering::SeqCst);
        match method {
            "get" => Ok(self
                .site
                .branch(self.branch)
                .map_or(Value::Null, |b| b.snapshot().read(object.id(), 0))),
            "echo" => Ok(args.first().cloned().unwrap_or(Value::Null)),
            "fail" => Err(FabricError::invalid_state("refusing")),
            "boom" => panic!("handler exploded"),
            other => Err(FabricError::invalid_state(format!("no method {other}"))),
        }
    }
}

fn setup(mode: ReplicationMode, chunk: usize) -> (Loopback, Arc<Site>, Arc<FieldReader>, Arc<TObject>, Arc<fabric::Branch>) {
    let now = Instant::now();
    let (a, b) = (site(b"caller"), site(b"callee"));
    let branch = a.create_branch().unwrap();
    let point = a.create_object(POINT, &[], 0).unwrap();
    let handler = Arc::new(FieldReader {
        site: Arc::clone(&b),
        branch: branch.id(),
        invoked: AtomicUsize::new(0),
    });
    let mut lb = pair(&a, &b, mode, chunk, now);
    lb.right = connection(&b, 2, now).with_handler(handler.clone());
    lb.left.share_branch(&branch).unwrap();
    (lb, a, handler, point, branch)
}

fn commit(branch: &Arc<fabric::Branch>, object: &TObject, value: i32) {
    let mut txn = branch.begin(TxnFlags::empty()).unwrap();
    txn.write(object, 0, value).unwrap();
    txn.commit().unwrap();
}

#[test]
fn calls_see_the_state_they_depend_on() {
    for mode in [ReplicationMode::Relay, ReplicationMode::Intercept] {
        let now = Instant::now();
        let (mut lb, _a, handler, point, branch) = setup(mode, 5);
        commit(&branch, &point, 42);
        let future = lb
            .left
            .call(point.id(), "get", vec![], vec![branch.id()])
            .unwrap();
        lb.run_until_idle(now, 10_000).unwrap();

        assert_eq!(future.wait_timeout(Duration::from_secs(1)).unwrap().unwrap(), Value::I32(42));
        assert_eq!(handler.invoked.load(Ordering::SeqCst), 1);
        assert!(lb.left.calls().is_empty());
    }
}

#[test]
fn arguments_and_failures_travel_back() {
    let now = Instant::now();
    let (mut lb, _a, _handler, point, branch) = setup(ReplicationMode::Relay, 64);
    commit(&branch, &point, 1);
    let echo = lb
        .left
        .call(point.id(), "echo", vec![Value::from("hi")], vec![])
        .unwrap();
    let fail = lb.left.call(point.id(), "fail", vec![], vec![]).unwrap();
    let boom = lb.left.call(point.id(), "boom", vec![], vec![]).unwrap();
    lb.run_until_idle(now, 1_000).unwrap();

    assert_eq!(echo.wait().unwrap(), Value::from("hi"));
    assert!(matches!(fail.wait(), Err(FabricError::Aborted { .. })));
    let err = boom.wait().unwrap_err();
    assert!(err.to_string().contains("handler exploded"));
    assert!(!lb.right.is_closed());
}

#[test]
fn cancelled_calls_never_run() {
    let now = Instant::now();
    let (mut lb, _a, handler, point, branch) = setup(ReplicationMode::Relay, 64);
    commit(&branch, &point, 1);
    let future = lb
        .left
        .call(point.id(), "get", vec![], vec![branch.id()])
        .unwrap();
    assert!(future.cancel(true));
    lb.run_until_idle(now, 1_000).unwrap();

    assert!(future.is_cancelled());
    assert!(matches!(future.wait(), Err(FabricError::Cancelled)));
    assert_eq!(handler.invoked.load(Ordering::SeqCst), 0);
    assert!(lb.left.calls().is_empty());
}

#[test]
fn closing_fails_pending_calls() {
    let now = Instant::now();
    let (mut lb, _a, _handler, point, _branch) = setup(ReplicationMode::Relay, 64);
    let first = lb.left.call(point.id(), "get", vec![], vec![]).unwrap();
    let second = lb.left.call(point.id(), "get", vec![], vec![]).unwrap();
    lb.left.close("shutting down");

    for future in [&first, &second] {
        let err = future.wait().unwrap_err();
        assert!(matches!(err, FabricError::ConnectionClosed { .. }));
    }
    lb.run_until_idle(now, 100).unwrap();
    assert!(lb.right.is_closed());
}

#[test]
fn handshake_learns_branch_distances() {
    let now = Instant::now();
    let (a, b) = (site(b"hello-a"), site(b"hello-b"));
    let branch = a.create_branch().unwrap();
    let mut lb = pair(&a, &b, ReplicationMode::Relay, 1, now);
    lb.left.hello().unwrap();
    lb.right.hello().unwrap();
    lb.run_until_idle(now, 10_000).unwrap();

    assert!(lb.left.controller().is_established());
    assert!(lb.right.controller().is_established());
    assert_eq!(lb.left.controller().peer(), Some(b.id()));
    assert_eq!(b.distance_to(branch.id()), Some(1));
}

#[test]
fn remote_references_are_counted() {
    let now = Instant::now();
    let (a, b) = (site(b"dgc-a"), site(b"dgc-b"));
    let owned = b.create_object(POINT, &[], 0).unwrap();
    let mut lb = pair(&a, &b, ReplicationMode::Relay, 4, now);

    lb.left.reference_object(owned.id()).unwrap();
    lb.left.reference_object(owned.id()).unwrap();
    lb.left.release_object(owned.id()).unwrap();
    lb.run_until_idle(now, 1_000).unwrap();
    assert_eq!(lb.right.remote_references().count(owned.id()), 1);
    assert!(lb.right.take_collectable().is_empty());

    lb.left.release_object(owned.id()).unwrap();
    lb.run_until_idle(now, 1_000).unwrap();
    assert_eq!(lb.right.take_collectable(), vec![owned.id()]);

    // One release too many is a protocol violation.
    lb.left.release_object(owned.id()).unwrap();
    assert!(lb.run_until_idle(now, 1_000).is_err());
    assert!(lb.right.is_closed());
}
