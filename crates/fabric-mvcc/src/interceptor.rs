//! Acknowledgement gate for commits.
//!
//! While a branch is intercepted every commit joins the branch's open
//! [`Interception`]. An acknowledger walk closes the interception so later
//! commits start a fresh one, then hands it to an [`Interceptor`], which
//! queues the covered maps and an end marker for an external authority.
//! The authority answers with [`Interceptor::ack`] or [`Interceptor::nack`];
//! until then the commit tickets of the interception stay unresolved.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use fabric_error::{CommitStatus, ErrorCode, FabricError, Result};
use fabric_types::{BranchId, ConnectionId, InterceptionId};
use parking_lot::{Condvar, Mutex};

use crate::acknowledger::{AckSlot, AckVisitor, Visit};
use crate::branch::Branch;
use crate::version_map::VersionMap;

#[derive(Debug)]
enum State {
    /// Accepting new commits.
    Open,
    /// Covers `[first_seq, end)`; waiting for the authority.
    Closed { end: u64 },
    Resolved(Result<()>),
}

/// A run of consecutive maps gated on one external acknowledgement.
#[derive(Debug)]
pub struct Interception {
    id: InterceptionId,
    branch: BranchId,
    first_seq: u64,
    state: Mutex<State>,
    resolved: Condvar,
}

impl Interception {
    #[must_use]
    pub fn new(id: InterceptionId, branch: BranchId, first_seq: u64) -> Self {
        Self {
            id,
            branch,
            first_seq,
            state: Mutex::new(State::Open),
            resolved: Condvar::new(),
        }
    }

    #[must_use]
    pub const fn id(&self) -> InterceptionId {
        self.id
    }

    #[must_use]
    pub const fn branch(&self) -> BranchId {
        self.branch
    }

    #[must_use]
    pub const fn first_seq(&self) -> u64 {
        self.first_seq
    }

    #[must_use]
    pub fn is_open(&self) -> bool {
        matches!(*self.state.lock(), State::Open)
    }

    /// Exclusive end sequence once closed.
    #[must_use]
    pub fn end(&self) -> Option<u64> {
        match *self.state.lock() {
            State::Closed { end } => Some(end),
            State::Open | State::Resolved(_) => None,
        }
    }

    #[must_use]
    pub fn is_resolved(&self) -> bool {
        matches!(*self.state.lock(), State::Resolved(_))
    }

    /// Outcome class once resolved.
    #[must_use]
    pub fn status(&self) -> Option<CommitStatus> {
        match &*self.state.lock() {
            State::Resolved(Ok(())) => Some(CommitStatus::Committed),
            State::Resolved(Err(err)) => Some(err.status()),
            State::Open | State::Closed { .. } => None,
        }
    }

    pub(crate) fn close(&self, end: u64) {
        let mut state = self.state.lock();
        if matches!(*state, State::Open) {
            *state = State::Closed { end };
        }
    }

    /// First resolution wins. Returns whether this call resolved it.
    pub(crate) fn resolve(&self, outcome: Result<()>) -> bool {
        let mut state = self.state.lock();
        if matches!(*state, State::Resolved(_)) {
            return false;
        }
        *state = State::Resolved(outcome);
        self.resolved.notify_all();
        true
    }

    /// Block until resolved.
    pub fn wait(&self) -> Result<()> {
        let mut state = self.state.lock();
        loop {
            if let State::Resolved(outcome) = &*state {
                return outcome.as_ref().map(|_| ()).map_err(FabricError::duplicate);
            }
            self.resolved.wait(&mut state);
        }
    }

    /// Block until resolved or `timeout` elapses; `None` on timeout.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<Result<()>> {
        let mut state = self.state.lock();
        if !matches!(*state, State::Resolved(_)) {
            let _ = self.resolved.wait_for(&mut state, timeout);
        }
        match &*state {
            State::Resolved(outcome) => {
                Some(outcome.as_ref().map(|_| ()).map_err(FabricError::duplicate))
            }
            State::Open | State::Closed { .. } => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Interceptor
// ---------------------------------------------------------------------------

/// Work an interceptor wants sent to its authority, in order.
#[derive(Debug, Clone)]
pub enum Outbound {
    Map {
        branch: BranchId,
        map: Arc<VersionMap>,
    },
    /// Every map of the interception has been queued.
    End {
        branch: BranchId,
        interception: InterceptionId,
    },
}

/// Acknowledger that gates commits on an external authority.
///
/// A relay (see [`Interceptor::relay`]) forwards maps the same way but
/// never holds commits back and never emits end markers.
#[derive(Debug)]
pub struct Interceptor {
    slot: AckSlot,
    gating: bool,
    /// Maps that arrived over this connection are not sent back.
    connection: Option<ConnectionId>,
    outbound: VecDeque<Outbound>,
    limit: usize,
}

impl Interceptor {
    #[must_use]
    pub fn new(slot: AckSlot, connection: Option<ConnectionId>) -> Self {
        Self {
            slot,
            gating: true,
            connection,
            outbound: VecDeque::new(),
            limit: usize::MAX,
        }
    }

    /// Forward maps without gating commits on the receiver.
    #[must_use]
    pub fn relay(slot: AckSlot, connection: Option<ConnectionId>) -> Self {
        Self {
            gating: false,
            ..Self::new(slot, connection)
        }
    }

    /// Suspend walks once this many items are queued.
    #[must_use]
    pub const fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    #[must_use]
    pub const fn slot(&self) -> AckSlot {
        self.slot
    }

    #[must_use]
    pub const fn is_gating(&self) -> bool {
        self.gating
    }

    /// Register on `branch`; a gating interceptor holds every later commit
    /// until acknowledged.
    pub fn attach(&self, branch: &Branch) -> Result<()> {
        branch.add_acknowledger(self.slot, self.gating)
    }

    pub fn detach(&self, branch: &Branch) -> Result<()> {
        branch.remove_acknowledger(self.slot, self.gating)
    }

    pub fn drain(&mut self) -> Vec<Outbound> {
        self.outbound.drain(..).collect()
    }

    #[must_use]
    pub fn queued(&self) -> usize {
        self.outbound.len()
    }

    /// The authority accepted every map of `id`.
    pub fn ack(branch: &Branch, id: InterceptionId) -> Result<()> {
        branch.resolve_interception(id)
    }

    /// The authority rejected `id`. Abort-class codes abort the waiting
    /// commits; anything else makes them conflicts.
    pub fn nack(branch: &Branch, id: InterceptionId, code: ErrorCode, cause: &str) -> Result<()> {
        let error = if code.status() == CommitStatus::Abort {
            FabricError::Aborted {
                reason: cause.to_owned(),
            }
        } else {
            FabricError::Nacked {
                branch: branch.id().get(),
                interception: id.get(),
                cause: cause.to_owned(),
            }
        };
        branch.reject_interception(id, error)
    }
}

impl AckVisitor for Interceptor {
    fn visit_map(&mut self, branch: &Arc<Branch>, map: &Arc<VersionMap>) -> Result<Visit> {
        if self.outbound.len() >= self.limit {
            return Ok(Visit::Suspend);
        }
        if self.connection.is_some() && map.source() == self.connection {
            return Ok(Visit::Done);
        }
        self.outbound.push_back(Outbound::Map {
            branch: branch.id(),
            map: Arc::clone(map),
        });
        Ok(Visit::Done)
    }

    fn visit_interception(
        &mut self,
        branch: &Arc<Branch>,
        interception: &Arc<Interception>,
    ) -> Result<Visit> {
        if !self.gating {
            return Ok(Visit::Done);
        }
        if self.outbound.len() >= self.limit {
            return Ok(Visit::Suspend);
        }
        tracing::debug!(
            branch = %branch.id(),
            interception = %interception.id(),
            first_seq = interception.first_seq(),
            end = ?interception.end(),
            "interception dispatched"
        );
        self.outbound.push_back(Outbound::End {
            branch: branch.id(),
            interception: interception.id(),
        });
        Ok(Visit::Done)
    }

    fn closes_interceptions(&self) -> bool {
        self.gating
    }

    fn outstanding(&self, branch: &Branch) -> Option<u64> {
        if self.gating {
            branch.oldest_pending()
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn interception() -> Arc<Interception> {
        Arc::new(Interception::new(
            InterceptionId::new(1).unwrap(),
            BranchId::new(1).unwrap(),
            0,
        ))
    }

    #[test]
    fn lifecycle() {
        let i = interception();
        assert!(i.is_open());
        assert_eq!(i.end(), None);
        i.close(3);
        assert_eq!(i.end(), Some(3));
        assert_eq!(i.status(), None);
        assert!(i.resolve(Ok(())));
        assert!(!i.resolve(Err(FabricError::Cancelled)));
        assert_eq!(i.status(), Some(CommitStatus::Committed));
        assert!(i.wait().is_ok());
    }

    #[test]
    fn close_after_resolve_is_ignored() {
        let i = interception();
        i.resolve(Err(FabricError::Aborted {
            reason: "gone".into(),
        }));
        i.close(9);
        assert_eq!(i.end(), None);
        assert_eq!(i.status(), Some(CommitStatus::Abort));
    }

    #[test]
    fn waiters_wake_on_resolution() {
        let i = interception();
        let waiter = {
            let i = Arc::clone(&i);
            thread::spawn(move || i.wait())
        };
        i.resolve(Err(FabricError::Nacked {
            branch: 1,
            interception: 1,
            cause: "rejected".into(),
        }));
        let outcome = waiter.join().unwrap();
        assert_eq!(outcome.unwrap_err().status(), CommitStatus::Conflict);
    }

    #[test]
    fn wait_timeout_reports_pending() {
        let i = interception();
        assert!(i.wait_timeout(Duration::from_millis(5)).is_none());
        i.resolve(Ok(()));
        assert!(i.wait_timeout(Duration::from_millis(5)).unwrap().is_ok());
    }

    #[test]
    fn relay_forwards_without_gating() {
        use crate::acknowledger::Walker;
        use crate::config::FabricConfig;
        use crate::object::{ClassDescriptor, ClassShape, TObject};
        use fabric_types::{ClassId, ObjectId, TxnFlags};

        let config = FabricConfig::default();
        let branch = Branch::new(BranchId::new(1).unwrap(), config, None);
        let mut relay = Interceptor::relay(AckSlot::new(0).unwrap(), None);
        relay.attach(&branch).unwrap();
        assert!(!branch.snapshot().slow().is_intercepted());

        let class = ClassDescriptor::new(ClassId::new(1), "P", ClassShape::Fields { count: 1 });
        let p = TObject::new(ObjectId::new(1).unwrap(), Arc::new(class), 0);
        let mut txn = branch.begin(TxnFlags::empty()).unwrap();
        txn.write(&p, 0, 5).unwrap();
        let ticket = txn.commit().unwrap();
        assert!(!ticket.is_intercepted());

        let mut walker = Walker::new(Some(relay.slot()), &config);
        walker.run(&[Arc::clone(&branch)], &mut relay).unwrap();
        let sent = relay.drain();
        assert_eq!(sent.len(), 1);
        assert!(matches!(sent[0], Outbound::Map { .. }));
        assert_eq!(branch.progress(relay.slot()), 1);
    }
}
