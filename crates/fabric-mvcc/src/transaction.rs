//! Private transactions.
//!
//! A transaction reads from the snapshot it started on and accumulates its
//! reads and writes in a stack of private layers, one per nesting level.
//! Reads consult the layers innermost first, so a transaction sees its own
//! writes. Child layers fold into their parent on commit and vanish on
//! abort; only the outermost commit touches the branch.
//!
//! Commit validates the read set against every map published since the
//! transaction started and appends the write set with a compare-and-swap.
//! A lost race re-validates only the maps that appeared in between.

use std::sync::Arc;
use std::time::Duration;

use fabric_error::{CommitStatus, FabricError, Result};
use fabric_observability::FabricEvent;
use fabric_types::{BranchId, InterceptionId, ObjectId, TxnFlags, TxnId, Value};

use crate::branch::Branch;
use crate::interceptor::Interception;
use crate::object::TObject;
use crate::observability::{emit, now_ns, record_abort, record_commit, record_conflict};
use crate::snapshot::Snapshot;
use crate::version::{Lookup, MergeFlags};
use crate::version_map::VersionMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnState {
    Active,
    Committed,
    Aborted,
}

/// Outcome handle of a successful commit.
///
/// Commits on an intercepted branch are published immediately but remain
/// speculative until the interception resolves.
#[derive(Debug, Clone)]
pub struct CommitTicket {
    branch: BranchId,
    seq: u64,
    interception: Option<Arc<Interception>>,
}

impl CommitTicket {
    #[must_use]
    pub const fn branch(&self) -> BranchId {
        self.branch
    }

    /// Sequence of the published map; for read-only commits, the snapshot
    /// end the transaction read from.
    #[must_use]
    pub const fn seq(&self) -> u64 {
        self.seq
    }

    #[must_use]
    pub fn interception_id(&self) -> Option<InterceptionId> {
        self.interception.as_ref().map(|i| i.id())
    }

    #[must_use]
    pub fn is_intercepted(&self) -> bool {
        self.interception.is_some()
    }

    /// `None` while the interception is unresolved.
    #[must_use]
    pub fn status(&self) -> Option<CommitStatus> {
        match &self.interception {
            Some(interception) => interception.status(),
            None => Some(CommitStatus::Committed),
        }
    }

    /// Block until the commit is final.
    pub fn wait(&self) -> Result<()> {
        match &self.interception {
            Some(interception) => interception.wait(),
            None => Ok(()),
        }
    }

    pub fn wait_timeout(&self, timeout: Duration) -> Option<Result<()>> {
        match &self.interception {
            Some(interception) => interception.wait_timeout(timeout),
            None => Some(Ok(())),
        }
    }
}

/// Keeps the branch from trimming maps this transaction validates against.
#[derive(Debug)]
struct ReaderGuard {
    branch: Arc<Branch>,
    start: u64,
}

impl Drop for ReaderGuard {
    fn drop(&mut self) {
        self.branch.release_reader(self.start);
    }
}

#[derive(Debug)]
pub struct Transaction {
    id: TxnId,
    snapshot: Arc<Snapshot>,
    start: u64,
    epoch: u64,
    flags: TxnFlags,
    /// Private layers; `layers[0]` is the outermost.
    layers: Vec<VersionMap>,
    state: TxnState,
    reader: ReaderGuard,
}

impl Transaction {
    pub(crate) fn new(id: TxnId, branch: Arc<Branch>, snapshot: Arc<Snapshot>, flags: TxnFlags) -> Self {
        let start = snapshot.end();
        Self {
            id,
            start,
            epoch: snapshot.reset_epoch(),
            flags,
            layers: vec![VersionMap::new(branch.id())],
            state: TxnState::Active,
            snapshot,
            reader: ReaderGuard { branch, start },
        }
    }

    #[must_use]
    pub const fn id(&self) -> TxnId {
        self.id
    }

    #[must_use]
    pub fn branch(&self) -> &Arc<Branch> {
        &self.reader.branch
    }

    #[must_use]
    pub const fn flags(&self) -> TxnFlags {
        self.flags
    }

    /// Snapshot end at start; maps from here on are validated at commit.
    #[must_use]
    pub const fn start(&self) -> u64 {
        self.start
    }

    #[must_use]
    pub fn snapshot(&self) -> &Arc<Snapshot> {
        &self.snapshot
    }

    #[must_use]
    pub const fn state(&self) -> TxnState {
        self.state
    }

    /// Nesting depth; 1 for a transaction without open children.
    #[must_use]
    pub fn depth(&self) -> usize {
        self.layers.len()
    }

    fn ensure_active(&self) -> Result<()> {
        match self.state {
            TxnState::Active => Ok(()),
            TxnState::Committed => Err(FabricError::invalid_state("transaction already committed")),
            TxnState::Aborted => Err(FabricError::invalid_state("transaction already aborted")),
        }
    }

    fn ensure_writable(&self) -> Result<()> {
        self.ensure_active()?;
        if self.flags.contains(TxnFlags::NO_WRITES) {
            return Err(FabricError::invalid_state("write in a read-only transaction"));
        }
        Ok(())
    }

    fn innermost(&mut self) -> Result<&mut VersionMap> {
        self.layers
            .last_mut()
            .ok_or_else(|| FabricError::internal("transaction has no private layer"))
    }

    // -----------------------------------------------------------------------
    // Indexed objects
    // -----------------------------------------------------------------------

    pub fn read(&mut self, object: &TObject, index: u32) -> Result<Value> {
        self.ensure_active()?;
        object.check_index(index)?;
        for layer in self.layers.iter().rev() {
            if let Some(version) = layer.get(object.id()) {
                match version.lookup(index) {
                    Lookup::Found(value) => return Ok(value),
                    Lookup::Absent => return Ok(Value::Null),
                    Lookup::Unknown => {}
                }
            }
        }
        if self.flags.records_reads() {
            self.innermost()?.version_mut(object).record_read(index)?;
        }
        Ok(self.snapshot.read(object.id(), index))
    }

    pub fn write(&mut self, object: &TObject, index: u32, value: impl Into<Value>) -> Result<()> {
        self.ensure_writable()?;
        object.check_index(index)?;
        if object.class().is_immutable() {
            return Err(FabricError::invalid_state(format!(
                "{} is immutable",
                object.id()
            )));
        }
        self.innermost()?
            .version_mut(object)
            .write(index, value.into())
    }

    // -----------------------------------------------------------------------
    // Keyed collections
    // -----------------------------------------------------------------------

    pub fn get(&mut self, object: &TObject, key: &Value) -> Result<Option<Value>> {
        self.ensure_active()?;
        object.check_keyed()?;
        for layer in self.layers.iter().rev() {
            if let Some(version) = layer.get(object.id()) {
                match version.lookup_key(key)? {
                    Lookup::Found(value) => return Ok(Some(value)),
                    Lookup::Absent => return Ok(None),
                    Lookup::Unknown => {}
                }
            }
        }
        if self.flags.records_reads() {
            self.innermost()?
                .version_mut(object)
                .record_key_read(key.clone())?;
        }
        self.snapshot.read_key(object.id(), key)
    }

    #[must_use = "contains records a read"]
    pub fn contains(&mut self, object: &TObject, key: &Value) -> Result<bool> {
        self.get(object, key).map(|v| v.is_some())
    }

    pub fn put(&mut self, object: &TObject, key: Value, value: Value) -> Result<()> {
        self.ensure_writable()?;
        object.check_keyed()?;
        self.innermost()?.version_mut(object).put(key, value)
    }

    pub fn remove(&mut self, object: &TObject, key: Value) -> Result<()> {
        self.ensure_writable()?;
        object.check_keyed()?;
        self.innermost()?.version_mut(object).remove(key)
    }

    pub fn clear(&mut self, object: &TObject) -> Result<()> {
        self.ensure_writable()?;
        object.check_keyed()?;
        self.innermost()?.version_mut(object).clear()
    }

    /// Every live entry as this transaction sees it. Records a read of the
    /// whole collection.
    pub fn entries(&mut self, object: &TObject) -> Result<Vec<(Value, Value)>> {
        self.ensure_active()?;
        object.check_keyed()?;
        if self.flags.records_reads() {
            self.innermost()?.version_mut(object).record_read_all()?;
        }
        let mut view = self.snapshot.shared_view(object)?;
        for layer in &self.layers {
            if let Some(delta) = layer.get(object.id()) {
                view.merge(delta, MergeFlags::PRIVATE)?;
            }
        }
        view.live_entries()
    }

    // -----------------------------------------------------------------------
    // Nesting
    // -----------------------------------------------------------------------

    pub fn start_child(&mut self) -> Result<()> {
        self.ensure_active()?;
        self.layers.push(VersionMap::new(self.reader.branch.id()));
        Ok(())
    }

    /// Fold the innermost child into its parent.
    pub fn commit_child(&mut self) -> Result<()> {
        self.ensure_active()?;
        if self.layers.len() < 2 {
            return Err(FabricError::invalid_state("no child transaction to commit"));
        }
        let child = self
            .layers
            .pop()
            .ok_or_else(|| FabricError::internal("child layer vanished"))?;
        self.innermost()?.merge_child(&child)
    }

    /// Discard the innermost child's reads and writes.
    pub fn abort_child(&mut self) -> Result<()> {
        self.ensure_active()?;
        if self.layers.len() < 2 {
            return Err(FabricError::invalid_state("no child transaction to abort"));
        }
        self.layers.pop();
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Completion
    // -----------------------------------------------------------------------

    pub fn abort(mut self) {
        if self.state == TxnState::Active {
            self.state = TxnState::Aborted;
            record_abort();
            tracing::debug!(branch = %self.reader.branch.id(), txn = %self.id, "transaction aborted");
        }
    }

    /// Validate and publish. See the module docs for the protocol.
    pub fn commit(mut self) -> Result<CommitTicket> {
        self.ensure_active()?;
        if self.layers.len() != 1 {
            return Err(FabricError::invalid_state(format!(
                "{} child transactions still open",
                self.layers.len() - 1
            )));
        }
        let branch = Arc::clone(&self.reader.branch);
        let private = self
            .layers
            .pop()
            .ok_or_else(|| FabricError::internal("transaction has no private layer"))?;

        if !private.has_writes() {
            self.state = TxnState::Committed;
            record_commit(true);
            return Ok(CommitTicket {
                branch: branch.id(),
                seq: self.start,
                interception: None,
            });
        }

        let result = self.publish(&branch, &private);
        match &result {
            Ok(_) => self.state = TxnState::Committed,
            Err(err) => {
                self.state = TxnState::Aborted;
                self.report_failure(&branch, err);
            }
        }
        result
    }

    fn publish(&self, branch: &Arc<Branch>, private: &VersionMap) -> Result<CommitTicket> {
        let published = private.writes_only()?;
        let validate = !self.flags.contains(TxnFlags::IGNORE_CONFLICTS);
        let mut validated_to = self.start;
        let mut attempts = 0_u32;
        let mut opened: Option<Arc<Interception>> = None;

        let outcome = loop {
            attempts += 1;
            let current = branch.snapshot();
            if let Some(cause) = current.slow().disconnect_cause() {
                break Err(FabricError::Disconnected {
                    branch: branch.id().get(),
                    cause: cause.to_owned(),
                });
            }
            if current.reset_epoch() != self.epoch {
                break Err(FabricError::conflict(branch.id().get(), None));
            }
            if validate {
                if let Err(err) = private.valid_against(&current, validated_to, current.end()) {
                    break Err(err);
                }
            }
            validated_to = current.end();

            let seq = current.end();
            let interception = if current.slow().is_intercepted() {
                match current.interception() {
                    Some(open) => Some(Arc::clone(open)),
                    None => Some(match &opened {
                        Some(mine) if mine.first_seq() == seq => Arc::clone(mine),
                        _ => {
                            if let Some(stale) = opened.take() {
                                branch.unregister_pending(stale.id());
                            }
                            let fresh = Arc::new(Interception::new(
                                branch.next_interception_id()?,
                                branch.id(),
                                seq,
                            ));
                            branch.register_pending(Arc::clone(&fresh));
                            opened = Some(Arc::clone(&fresh));
                            fresh
                        }
                    }),
                }
            } else {
                None
            };

            let map = published.with_position(seq, Some(self.id), interception.as_ref().map(|i| i.id()));
            let next = current.appended(Arc::new(map), interception.clone());
            if branch.try_install(&current, next) {
                break Ok((seq, interception));
            }
            tracing::trace!(branch = %branch.id(), txn = %self.id, attempts, "commit lost the snapshot race");
        };

        let used = outcome
            .as_ref()
            .ok()
            .and_then(|(_, i)| i.as_ref().map(|i| i.id()));
        if let Some(mine) = opened {
            if used != Some(mine.id()) {
                branch.unregister_pending(mine.id());
            }
        }

        let (seq, interception) = outcome?;
        crate::observability::record_cas_install(attempts);
        record_commit(false);
        tracing::debug!(
            branch = %branch.id(),
            txn = %self.id,
            seq,
            retries = attempts - 1,
            intercepted = interception.is_some(),
            "transaction committed"
        );
        emit(
            branch.observer(),
            &FabricEvent::Committed {
                branch: branch.id(),
                txn: self.id,
                seq,
                cas_retries: attempts - 1,
                timestamp_ns: now_ns(),
            },
        );
        Ok(CommitTicket {
            branch: branch.id(),
            seq,
            interception,
        })
    }

    fn report_failure(&self, branch: &Branch, err: &FabricError) {
        match err.status() {
            CommitStatus::Conflict => {
                record_conflict();
                let object = match err {
                    FabricError::Conflict { object, .. } => object.and_then(ObjectId::new),
                    _ => None,
                };
                tracing::debug!(branch = %branch.id(), txn = %self.id, %err, "commit conflicted");
                emit(
                    branch.observer(),
                    &FabricEvent::Conflict {
                        branch: branch.id(),
                        txn: self.id,
                        object,
                        timestamp_ns: now_ns(),
                    },
                );
            }
            CommitStatus::Abort | CommitStatus::Committed => {
                record_abort();
                tracing::debug!(branch = %branch.id(), txn = %self.id, %err, "commit aborted");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FabricConfig;
    use crate::object::{ClassDescriptor, ClassShape};
    use fabric_observability::EventLog;
    use fabric_types::ClassId;

    fn branch() -> Arc<Branch> {
        Branch::new(BranchId::new(1).unwrap(), FabricConfig::default(), None)
    }

    fn object(id: u64, fields: u32) -> TObject {
        let class = ClassDescriptor::new(ClassId::new(1), "T", ClassShape::Fields { count: fields });
        TObject::new(ObjectId::new(id).unwrap(), Arc::new(class), 0)
    }

    fn map(id: u64) -> TObject {
        let class = ClassDescriptor::new(ClassId::MAP, "map", ClassShape::Map);
        TObject::new(ObjectId::new(id).unwrap(), Arc::new(class), 0)
    }

    #[test]
    fn simple_commit_publishes_one_map() {
        let b = branch();
        let a = object(1, 2);
        assert_eq!(b.snapshot().version_map_count(), 0);
        let mut t1 = b.begin(TxnFlags::empty()).unwrap();
        t1.write(&a, 0, 42).unwrap();
        let ticket = t1.commit().unwrap();
        assert_eq!(ticket.seq(), 0);
        assert_eq!(ticket.status(), Some(CommitStatus::Committed));
        let snapshot = b.snapshot();
        assert_eq!(snapshot.version_map_count(), 1);
        assert_eq!(snapshot.acknowledged(), 0);
        assert_eq!(snapshot.read(a.id(), 0), Value::I32(42));
    }

    #[test]
    fn stale_read_conflicts() {
        let b = branch();
        let a = object(1, 2);
        let mut t1 = b.begin(TxnFlags::empty()).unwrap();
        let mut t2 = b.begin(TxnFlags::empty()).unwrap();
        assert_eq!(t2.read(&a, 0).unwrap(), Value::Null);
        t1.write(&a, 0, 1).unwrap();
        t1.commit().unwrap();
        t2.write(&a, 1, 2).unwrap();
        let err = t2.commit().unwrap_err();
        assert_eq!(err.status(), CommitStatus::Conflict);
        assert!(matches!(err, FabricError::Conflict { object: Some(1), .. }));
    }

    #[test]
    fn disjoint_fields_and_blind_writes_commit() {
        let b = branch();
        let a = object(1, 2);
        let mut t1 = b.begin(TxnFlags::empty()).unwrap();
        let mut t2 = b.begin(TxnFlags::empty()).unwrap();
        let mut t3 = b.begin(TxnFlags::empty()).unwrap();
        t2.read(&a, 1).unwrap();
        t1.write(&a, 0, 1).unwrap();
        t1.commit().unwrap();
        t2.write(&a, 1, 2).unwrap();
        t2.commit().unwrap();
        t3.write(&a, 0, 3).unwrap();
        t3.commit().unwrap();
        assert_eq!(b.snapshot().read(a.id(), 0), Value::I32(3));
    }

    #[test]
    fn read_only_transactions_skip_validation() {
        let b = branch();
        let a = object(1, 1);
        let mut reader = b.begin(TxnFlags::READ_ONLY).unwrap();
        reader.read(&a, 0).unwrap();
        let mut writer = b.begin(TxnFlags::empty()).unwrap();
        writer.write(&a, 0, 1).unwrap();
        writer.commit().unwrap();
        assert!(reader.write(&a, 0, 2).is_err());
        let ticket = reader.commit().unwrap();
        assert_eq!(ticket.seq(), 0);
        assert_eq!(b.snapshot().version_map_count(), 1);
    }

    #[test]
    fn reads_see_own_writes_through_children() {
        let b = branch();
        let a = object(1, 2);
        let mut txn = b.begin(TxnFlags::empty()).unwrap();
        txn.write(&a, 0, 1).unwrap();
        txn.start_child().unwrap();
        assert_eq!(txn.read(&a, 0).unwrap(), Value::I32(1));
        txn.write(&a, 0, 2).unwrap();
        txn.write(&a, 1, 9).unwrap();
        txn.abort_child().unwrap();
        assert_eq!(txn.read(&a, 0).unwrap(), Value::I32(1));
        assert_eq!(txn.read(&a, 1).unwrap(), Value::Null);

        txn.start_child().unwrap();
        txn.write(&a, 1, 5).unwrap();
        txn.commit_child().unwrap();
        assert_eq!(txn.depth(), 1);
        txn.commit().unwrap();
        assert_eq!(b.snapshot().read(a.id(), 1), Value::I32(5));
    }

    #[test]
    fn child_reads_fold_into_parent_for_validation() {
        let b = branch();
        let a = object(1, 2);
        let mut txn = b.begin(TxnFlags::empty()).unwrap();
        txn.start_child().unwrap();
        txn.read(&a, 0).unwrap();
        txn.commit_child().unwrap();
        let mut other = b.begin(TxnFlags::empty()).unwrap();
        other.write(&a, 0, 1).unwrap();
        other.commit().unwrap();
        txn.write(&a, 1, 1).unwrap();
        assert!(txn.commit().is_err());
    }

    #[test]
    fn open_children_block_commit() {
        let b = branch();
        let mut txn = b.begin(TxnFlags::empty()).unwrap();
        txn.start_child().unwrap();
        assert!(matches!(txn.commit(), Err(FabricError::InvalidState(_))));
    }

    #[test]
    fn ignore_conflicts_skips_validation() {
        let b = branch();
        let a = object(1, 1);
        let mut txn = b.begin(TxnFlags::IGNORE_CONFLICTS).unwrap();
        txn.read(&a, 0).unwrap();
        let mut other = b.begin(TxnFlags::empty()).unwrap();
        other.write(&a, 0, 1).unwrap();
        other.commit().unwrap();
        txn.write(&a, 0, 2).unwrap();
        assert!(txn.commit().is_ok());
    }

    #[test]
    fn keyed_operations() {
        let b = branch();
        let m = map(5);
        let mut txn = b.begin(TxnFlags::empty()).unwrap();
        txn.put(&m, Value::from("a"), Value::I32(1)).unwrap();
        txn.put(&m, Value::from("b"), Value::I32(2)).unwrap();
        txn.commit().unwrap();

        let mut txn = b.begin(TxnFlags::empty()).unwrap();
        assert_eq!(txn.get(&m, &Value::from("a")).unwrap(), Some(Value::I32(1)));
        txn.remove(&m, Value::from("a")).unwrap();
        assert_eq!(txn.get(&m, &Value::from("a")).unwrap(), None);
        txn.put(&m, Value::from("c"), Value::I32(3)).unwrap();
        let mut entries = txn.entries(&m).unwrap();
        entries.sort_by(|x, y| x.0.as_str().cmp(&y.0.as_str()));
        assert_eq!(
            entries,
            vec![
                (Value::from("b"), Value::I32(2)),
                (Value::from("c"), Value::I32(3)),
            ]
        );
        txn.clear(&m).unwrap();
        assert!(txn.entries(&m).unwrap().is_empty());
        txn.commit().unwrap();
        assert_eq!(b.snapshot().read_key(m.id(), &Value::from("b")).unwrap(), None);
    }

    #[test]
    fn enumeration_conflicts_with_any_write() {
        let b = branch();
        let m = map(5);
        let mut scan = b.begin(TxnFlags::empty()).unwrap();
        scan.entries(&m).unwrap();
        let mut writer = b.begin(TxnFlags::empty()).unwrap();
        writer.put(&m, Value::from("new"), Value::Null).unwrap();
        writer.commit().unwrap();
        scan.put(&m, Value::from("other"), Value::Null).unwrap();
        assert_eq!(scan.commit().unwrap_err().status(), CommitStatus::Conflict);
    }

    #[test]
    fn type_and_range_errors() {
        let b = branch();
        let a = object(1, 1);
        let m = map(2);
        let mut txn = b.begin(TxnFlags::empty()).unwrap();
        assert!(matches!(txn.read(&a, 3), Err(FabricError::FieldOutOfRange { .. })));
        assert!(matches!(
            txn.put(&a, Value::Null, Value::Null),
            Err(FabricError::TypeMismatch { .. })
        ));
        assert!(matches!(txn.write(&m, 0, 1), Err(FabricError::TypeMismatch { .. })));
    }

    #[test]
    fn events_reach_the_observer() {
        let log = Arc::new(EventLog::new(16));
        let b = Branch::new(BranchId::new(1).unwrap(), FabricConfig::default(), Some(log.clone()));
        let a = object(1, 1);
        let mut t1 = b.begin(TxnFlags::empty()).unwrap();
        let mut t2 = b.begin(TxnFlags::empty()).unwrap();
        t2.read(&a, 0).unwrap();
        t1.write(&a, 0, 1).unwrap();
        t1.commit().unwrap();
        t2.write(&a, 0, 2).unwrap();
        t2.commit().unwrap_err();
        let events = log.snapshot();
        assert!(matches!(events[0], FabricEvent::Committed { seq: 0, .. }));
        assert!(matches!(events[1], FabricEvent::Conflict { .. }));
    }

    #[test]
    fn nack_epoch_fails_older_transactions() {
        let b = branch();
        let a = object(1, 1);
        let slot = crate::acknowledger::AckSlot::new(0).unwrap();
        let interceptor = crate::interceptor::Interceptor::new(slot, None);
        interceptor.attach(&b).unwrap();
        let mut first = b.begin(TxnFlags::empty()).unwrap();
        first.write(&a, 0, 1).unwrap();
        let ticket = first.commit().unwrap();

        let mut late = b.begin(TxnFlags::empty()).unwrap();
        late.write(&a, 0, 2).unwrap();
        b.reject_interception(
            ticket.interception_id().unwrap(),
            FabricError::Nacked {
                branch: 1,
                interception: 1,
                cause: "rejected".into(),
            },
        )
        .unwrap();
        assert_eq!(late.commit().unwrap_err().status(), CommitStatus::Conflict);
    }
}
