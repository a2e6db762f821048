//! Remote method calls.
//!
//! The caller registers a [`CallFuture`] in its connection's [`CallTable`]
//! and the `CALL` frame is queued. The callee stores decoded requests in a
//! [`CallQueue`] and only executes the front one once the branches it
//! depends on are up to date; the `RESULT` frame resolves the future.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use fabric_error::{FabricError, Result};
use fabric_mvcc::TObject;
use fabric_types::{CallId, IdSequence, Value};
use parking_lot::{Condvar, Mutex};

use crate::frame::CallRequest;

// ---------------------------------------------------------------------------
// CallFuture
// ---------------------------------------------------------------------------

fn copy_outcome(outcome: &Result<Value>) -> Result<Value> {
    match outcome {
        Ok(value) => Ok(value.clone()),
        Err(err) => Err(err.duplicate()),
    }
}

#[derive(Debug, Default)]
struct CallState {
    outcome: Option<Result<Value>>,
    /// Cancelled with `may_interrupt`; the peer should be told.
    interrupt: bool,
}

#[derive(Debug)]
struct CallShared {
    id: CallId,
    state: Mutex<CallState>,
    done: Condvar,
}

/// Handle on the result of one outgoing call.
#[derive(Debug, Clone)]
pub struct CallFuture {
    shared: Arc<CallShared>,
}

impl CallFuture {
    fn new(id: CallId) -> Self {
        Self {
            shared: Arc::new(CallShared {
                id,
                state: Mutex::new(CallState::default()),
                done: Condvar::new(),
            }),
        }
    }

    #[must_use]
    pub fn id(&self) -> CallId {
        self.shared.id
    }

    #[must_use]
    pub fn is_done(&self) -> bool {
        self.shared.state.lock().outcome.is_some()
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(
            self.shared.state.lock().outcome,
            Some(Err(FabricError::Cancelled))
        )
    }

    /// Resolve the call as cancelled. With `may_interrupt` the connection
    /// also asks the peer to drop it. Returns `false` if the call had
    /// already finished.
    pub fn cancel(&self, may_interrupt: bool) -> bool {
        let mut state = self.shared.state.lock();
        if state.outcome.is_some() {
            return false;
        }
        state.outcome = Some(Err(FabricError::Cancelled));
        state.interrupt = may_interrupt;
        self.shared.done.notify_all();
        tracing::debug!(call = %self.shared.id, may_interrupt, "call cancelled");
        true
    }

    /// First resolution wins.
    pub(crate) fn complete(&self, outcome: Result<Value>) -> bool {
        let mut state = self.shared.state.lock();
        if state.outcome.is_some() {
            return false;
        }
        state.outcome = Some(outcome);
        self.shared.done.notify_all();
        true
    }

    fn wants_interrupt(&self) -> bool {
        self.shared.state.lock().interrupt
    }

    /// Result without blocking, if there is one.
    #[must_use]
    pub fn try_result(&self) -> Option<Result<Value>> {
        self.shared
            .state
            .lock()
            .outcome
            .as_ref()
            .map(copy_outcome)
    }

    /// Block until the call resolves.
    pub fn wait(&self) -> Result<Value> {
        let mut state = self.shared.state.lock();
        loop {
            if let Some(outcome) = &state.outcome {
                return copy_outcome(outcome);
            }
            self.shared.done.wait(&mut state);
        }
    }

    /// `None` on timeout.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<Result<Value>> {
        let mut state = self.shared.state.lock();
        if state.outcome.is_none() {
            let _ = self.shared.done.wait_for(&mut state, timeout);
        }
        state.outcome.as_ref().map(copy_outcome)
    }
}

// ---------------------------------------------------------------------------
// CallTable
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct TableInner {
    calls: HashMap<CallId, CallFuture>,
    closed: bool,
}

/// Outstanding calls of one connection.
///
/// Shared between the read side (results) and the write side (new calls,
/// cancellations, failure on close).
#[derive(Debug, Default)]
pub struct CallTable {
    ids: IdSequence,
    inner: Mutex<TableInner>,
}

impl CallTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate an id and a pending future for it.
    pub fn register(&self) -> Result<CallFuture> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return Err(FabricError::closed("call table is closed"));
        }
        let id = self
            .ids
            .alloc()
            .and_then(|raw| CallId::new(raw.get()))
            .ok_or_else(|| FabricError::internal("call ids exhausted"))?;
        let future = CallFuture::new(id);
        inner.calls.insert(id, future.clone());
        Ok(future)
    }

    /// Deliver the result for `id`. Returns `false` when the call is unknown
    /// or was already resolved locally (cancelled).
    pub fn complete(&self, id: CallId, outcome: Result<Value>) -> bool {
        let Some(future) = self.inner.lock().calls.remove(&id) else {
            return false;
        };
        future.complete(outcome)
    }

    /// Forget locally cancelled calls; returns those whose cancellation
    /// must be forwarded to the peer.
    pub fn take_cancellations(&self) -> Vec<CallId> {
        let mut inner = self.inner.lock();
        let cancelled: Vec<CallId> = inner
            .calls
            .iter()
            .filter(|(_, f)| f.is_cancelled())
            .map(|(id, _)| *id)
            .collect();
        let mut forward = Vec::new();
        for id in cancelled {
            if let Some(future) = inner.calls.remove(&id) {
                if future.wants_interrupt() {
                    forward.push(id);
                }
            }
        }
        forward.sort_unstable();
        forward
    }

    /// Fail every pending call and refuse new ones. Returns how many were
    /// failed.
    pub fn fail_all(&self, error: &FabricError) -> usize {
        let drained: Vec<CallFuture> = {
            let mut inner = self.inner.lock();
            inner.closed = true;
            inner.calls.drain().map(|(_, f)| f).collect()
        };
        drained
            .iter()
            .filter(|f| f.complete(Err(error.duplicate())))
            .count()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().calls.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ---------------------------------------------------------------------------
// Callee side
// ---------------------------------------------------------------------------

/// Application code behind incoming calls.
pub trait CallHandler: Send + Sync {
    fn invoke(&self, object: &Arc<TObject>, method: &str, args: &[Value]) -> Result<Value>;
}

/// Refuses every call.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoHandler;

impl CallHandler for NoHandler {
    fn invoke(&self, object: &Arc<TObject>, method: &str, _args: &[Value]) -> Result<Value> {
        Err(FabricError::invalid_state(format!(
            "no call handler for {method} on {}",
            object.id()
        )))
    }
}

/// Calls that are fully received (or fully built) but not yet run (or
/// sent), in arrival order.
#[derive(Default)]
pub struct CallQueue {
    queue: VecDeque<CallRequest>,
}

impl fmt::Debug for CallQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallQueue")
            .field("len", &self.queue.len())
            .finish()
    }
}

impl CallQueue {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn store(&mut self, request: CallRequest) {
        self.queue.push_back(request);
    }

    /// Drop a stored call. Returns whether it was still queued.
    pub fn cancel(&mut self, id: CallId) -> bool {
        let before = self.queue.len();
        self.queue.retain(|r| r.call != id);
        self.queue.len() != before
    }

    /// Pop the front call if `ready` accepts it. Later calls never overtake
    /// earlier ones.
    pub fn next_ready(&mut self, ready: impl Fn(&CallRequest) -> bool) -> Option<CallRequest> {
        if self.queue.front().is_some_and(ready) {
            self.queue.pop_front()
        } else {
            None
        }
    }

    pub fn drain(&mut self) -> impl Iterator<Item = CallRequest> + '_ {
        self.queue.drain(..)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fabric_types::{BranchId, ObjectId};
    use std::thread;

    fn request(call: CallId, branch: u64) -> CallRequest {
        CallRequest {
            call,
            object: ObjectId::new(1).unwrap(),
            method: "m".into(),
            args: vec![],
            branches: vec![BranchId::new(branch).unwrap()],
        }
    }

    #[test]
    fn results_wake_waiters() {
        let table = Arc::new(CallTable::new());
        let future = table.register().unwrap();
        let id = future.id();
        let t = {
            let table = Arc::clone(&table);
            thread::spawn(move || table.complete(id, Ok(Value::I32(7))))
        };
        assert_eq!(future.wait().unwrap(), Value::I32(7));
        assert!(t.join().unwrap());
        assert!(table.is_empty());
        assert!(!table.complete(id, Ok(Value::Null)));
    }

    #[test]
    fn cancellation_wins_over_late_results() {
        let table = CallTable::new();
        let quiet = table.register().unwrap();
        let loud = table.register().unwrap();
        assert!(quiet.cancel(false));
        assert!(loud.cancel(true));
        assert!(!loud.cancel(true));
        assert!(quiet.is_cancelled());
        assert_eq!(table.take_cancellations(), vec![loud.id()]);
        assert!(table.is_empty());
        assert!(!table.complete(loud.id(), Ok(Value::Null)));
        assert!(matches!(loud.wait(), Err(FabricError::Cancelled)));
    }

    #[test]
    fn fail_all_closes_the_table() {
        let table = CallTable::new();
        let a = table.register().unwrap();
        let b = table.register().unwrap();
        let c = table.register().unwrap();
        c.cancel(false);
        let err = FabricError::closed("peer went away");
        assert_eq!(table.fail_all(&err), 2);
        for f in [&a, &b] {
            assert!(matches!(f.try_result(), Some(Err(FabricError::ConnectionClosed { .. }))));
        }
        assert!(matches!(c.try_result(), Some(Err(FabricError::Cancelled))));
        assert!(table.register().is_err());
    }

    #[test]
    fn wait_timeout_reports_pending() {
        let table = CallTable::new();
        let f = table.register().unwrap();
        assert!(f.wait_timeout(Duration::from_millis(5)).is_none());
        assert!(!f.is_done());
    }

    #[test]
    fn queue_runs_in_order() {
        let mut queue = CallQueue::new();
        let ids: Vec<CallId> = (1..=3).map(|n| CallId::new(n).unwrap()).collect();
        queue.store(request(ids[0], 1));
        queue.store(request(ids[1], 2));
        queue.store(request(ids[2], 2));

        let only_two = |r: &CallRequest| r.branches[0] == BranchId::new(2).unwrap();
        assert!(queue.next_ready(only_two).is_none());
        assert!(queue.cancel(ids[0]));
        assert!(!queue.cancel(ids[0]));
        assert_eq!(queue.next_ready(only_two).unwrap().call, ids[1]);
        assert_eq!(queue.drain().count(), 1);
        assert!(queue.is_empty());
    }
}
