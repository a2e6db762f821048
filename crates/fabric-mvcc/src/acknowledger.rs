//! Acknowledger walks.
//!
//! A [`Walker`] visits branches cooperatively. For each branch it hands
//! every map it has not seen yet to an [`AckVisitor`], then every closed
//! interception whose maps have all been seen, and records what it has
//! processed in a per-branch [`LastAcknowledged`]. Walks are resumable: a
//! visitor that cannot take more work returns [`Visit::Suspend`] and the
//! next `run` continues from the same branch and the same map.
//!
//! Visitors that gate commits also close the branch's open interception so
//! that commits arriving during processing start a new, disjoint one. The
//! close races ordinary commits on the snapshot CAS and is bounded by
//! `max_cas_attempts_per_walk`; a walker that keeps losing suspends and
//! retries on its next run.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use fabric_error::{FabricError, Result};
use fabric_types::{BranchId, InterceptionId};

use crate::branch::Branch;
use crate::config::FabricConfig;
use crate::interceptor::Interception;
use crate::observability::record_walker_giveup;
use crate::snapshot::Snapshot;
use crate::version_map::VersionMap;

/// Index of a registered acknowledger within a site.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AckSlot(u32);

impl AckSlot {
    /// Acknowledgers a site can register.
    pub const COUNT: usize = 32;

    #[must_use]
    pub const fn new(raw: u32) -> Option<Self> {
        if (raw as usize) < Self::COUNT {
            Some(Self(raw))
        } else {
            None
        }
    }

    #[must_use]
    pub const fn get(self) -> u32 {
        self.0
    }

    #[must_use]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for AckSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ack#{}", self.0)
    }
}

/// Whether a visitor took the item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Visit {
    Done,
    /// Not taken; offer it again on the next run.
    Suspend,
}

/// Result of one [`Walker::run`] slice.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WalkOutcome {
    /// Every branch was visited and nothing is left to hand out.
    Idle,
    /// Work remains; call `run` again.
    Suspended,
}

/// Work performed for each newly visible map and closed interception.
pub trait AckVisitor {
    fn visit_map(&mut self, branch: &Arc<Branch>, map: &Arc<VersionMap>) -> Result<Visit>;

    fn visit_interception(
        &mut self,
        _branch: &Arc<Branch>,
        _interception: &Arc<Interception>,
    ) -> Result<Visit> {
        Ok(Visit::Done)
    }

    /// Whether the walker should close open interceptions for this visitor.
    fn closes_interceptions(&self) -> bool {
        false
    }

    /// Lowest sequence this visitor has taken but not yet confirmed.
    fn outstanding(&self, _branch: &Branch) -> Option<u64> {
        None
    }

    /// Called once a branch has nothing left to hand out.
    fn finish_branch(&mut self, _branch: &Arc<Branch>) -> Result<()> {
        Ok(())
    }
}

/// What a walker has processed on one branch.
#[derive(Debug, Clone, Default)]
pub struct LastAcknowledged {
    /// Newest snapshot fully processed.
    snapshot: Option<Arc<Snapshot>>,
    /// Next sequence to visit.
    processed_to: u64,
    epoch: u64,
    /// Closed interceptions already handed out, by first sequence.
    processed: BTreeMap<InterceptionId, u64>,
}

impl LastAcknowledged {
    #[must_use]
    pub fn snapshot(&self) -> Option<&Arc<Snapshot>> {
        self.snapshot.as_ref()
    }

    #[must_use]
    pub const fn processed_to(&self) -> u64 {
        self.processed_to
    }

    #[must_use]
    pub fn is_processed(&self, interception: InterceptionId) -> bool {
        self.processed.contains_key(&interception)
    }

    #[must_use]
    pub fn processed_count(&self) -> usize {
        self.processed.len()
    }

    /// Catch up with `snapshot` after discards and trims.
    fn sync(&mut self, snapshot: &Snapshot) {
        if snapshot.reset_epoch() != self.epoch {
            let diverged = self
                .snapshot
                .as_deref()
                .map_or(snapshot.base_seq(), |seen| first_divergence(seen, snapshot));
            self.processed_to = self.processed_to.min(diverged);
            self.epoch = snapshot.reset_epoch();
        }
        self.processed_to = self.processed_to.max(snapshot.base_seq()).min(snapshot.end());
    }

    fn advance_snapshot(&mut self, snapshot: Arc<Snapshot>) {
        let newer = self
            .snapshot
            .as_ref()
            .is_none_or(|seen| seen.generation() < snapshot.generation());
        if newer {
            self.snapshot = Some(snapshot);
        }
    }
}

/// First sequence at which `new` no longer holds the maps `old` held.
fn first_divergence(old: &Snapshot, new: &Snapshot) -> u64 {
    let from = old.base_seq().max(new.base_seq());
    let to = old.end().min(new.end());
    (from..to)
        .find(|seq| match (old.map_at(*seq), new.map_at(*seq)) {
            (Some(a), Some(b)) => !Arc::ptr_eq(a, b),
            _ => true,
        })
        .unwrap_or(to)
}

enum BranchWalk {
    Clean,
    Suspended,
}

/// Resumable walk over a set of branches on behalf of one acknowledger.
#[derive(Debug)]
pub struct Walker {
    /// Registered slot; `None` for walkers that never hold back trimming.
    slot: Option<AckSlot>,
    budget: usize,
    max_cas_attempts: u32,
    states: HashMap<BranchId, LastAcknowledged>,
    cursor: usize,
}

impl Walker {
    #[must_use]
    pub fn new(slot: Option<AckSlot>, config: &FabricConfig) -> Self {
        Self {
            slot,
            budget: config.walker_budget as usize,
            max_cas_attempts: config.max_cas_attempts_per_walk,
            states: HashMap::new(),
            cursor: 0,
        }
    }

    #[must_use]
    pub const fn slot(&self) -> Option<AckSlot> {
        self.slot
    }

    #[must_use]
    pub fn last_acknowledged(&self, branch: BranchId) -> Option<&LastAcknowledged> {
        self.states.get(&branch)
    }

    /// Whether the last snapshot this walker fully processed is the branch's
    /// current one.
    #[must_use]
    pub fn is_up_to_date(&self, branch: &Branch) -> bool {
        let current = branch.snapshot();
        self.states
            .get(&branch.id())
            .and_then(LastAcknowledged::snapshot)
            .is_some_and(|seen| Arc::ptr_eq(seen, &current))
    }

    /// Drop state for a branch this walker no longer serves.
    pub fn forget(&mut self, branch: BranchId) {
        self.states.remove(&branch);
    }

    /// Visit up to `walker_budget` branches starting where the previous run
    /// stopped.
    pub fn run(
        &mut self,
        branches: &[Arc<Branch>],
        visitor: &mut dyn AckVisitor,
    ) -> Result<WalkOutcome> {
        if branches.is_empty() {
            return Ok(WalkOutcome::Idle);
        }
        let count = branches.len();
        let visits = count.min(self.budget);
        let mut outcome = if visits < count {
            WalkOutcome::Suspended
        } else {
            WalkOutcome::Idle
        };
        for _ in 0..visits {
            let at = self.cursor % count;
            let branch = &branches[at];
            match self.walk_branch(branch, visitor)? {
                BranchWalk::Clean => self.cursor = (at + 1) % count,
                BranchWalk::Suspended => {
                    outcome = WalkOutcome::Suspended;
                    break;
                }
            }
        }
        Ok(outcome)
    }

    /// Walk every branch until the visitor has nothing left or suspends.
    pub fn run_to_idle(
        &mut self,
        branches: &[Arc<Branch>],
        visitor: &mut dyn AckVisitor,
        max_slices: usize,
    ) -> Result<WalkOutcome> {
        for _ in 0..max_slices {
            if self.run(branches, visitor)? == WalkOutcome::Idle {
                return Ok(WalkOutcome::Idle);
            }
        }
        Ok(WalkOutcome::Suspended)
    }

    fn walk_branch(
        &mut self,
        branch: &Arc<Branch>,
        visitor: &mut dyn AckVisitor,
    ) -> Result<BranchWalk> {
        let slot = self.slot;
        let max_cas_attempts = self.max_cas_attempts;
        let state = self.states.entry(branch.id()).or_insert_with(|| {
            let snapshot = branch.snapshot();
            let start = slot.map_or(snapshot.base_seq(), |s| branch.progress(s));
            LastAcknowledged {
                snapshot: None,
                processed_to: start,
                epoch: snapshot.reset_epoch(),
                processed: BTreeMap::new(),
            }
        });
        state.processed.retain(|id, _| branch.is_pending(*id));

        let mut close_attempts = 0_u32;
        loop {
            let snapshot = branch.snapshot();
            state.sync(&snapshot);

            while state.processed_to < snapshot.end() {
                let Some(map) = snapshot.map_at(state.processed_to) else {
                    return Err(FabricError::internal(format!(
                        "{} has no map at {}",
                        branch.id(),
                        state.processed_to
                    )));
                };
                if visitor.visit_map(branch, map)? == Visit::Suspend {
                    return Ok(BranchWalk::Suspended);
                }
                state.processed_to += 1;
            }

            for interception in branch.pending_interceptions() {
                if state.processed.contains_key(&interception.id()) {
                    continue;
                }
                let Some(end) = interception.end() else {
                    continue;
                };
                if end > state.processed_to {
                    continue;
                }
                if visitor.visit_interception(branch, &interception)? == Visit::Suspend {
                    return Ok(BranchWalk::Suspended);
                }
                state
                    .processed
                    .insert(interception.id(), interception.first_seq());
            }

            if visitor.closes_interceptions() {
                if let Some(open) = snapshot.interception() {
                    if close_attempts >= max_cas_attempts {
                        record_walker_giveup();
                        tracing::debug!(
                            branch = %branch.id(),
                            interception = %open.id(),
                            attempts = close_attempts,
                            "interception close keeps losing the snapshot race; suspending"
                        );
                        return Ok(BranchWalk::Suspended);
                    }
                    close_attempts += 1;
                    branch.close_interception(open);
                    continue;
                }
            }

            if let Some(slot) = slot {
                let upto = visitor
                    .outstanding(branch)
                    .map_or(state.processed_to, |pending| pending.min(state.processed_to));
                branch.report_progress(slot, snapshot.reset_epoch(), upto)?;
            }
            state.advance_snapshot(snapshot);
            visitor.finish_branch(branch)?;
            return Ok(BranchWalk::Clean);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interceptor::{Interceptor, Outbound};
    use crate::object::{ClassDescriptor, ClassShape, TObject};
    use fabric_error::ErrorCode;
    use fabric_types::{ClassId, ObjectId, TxnFlags, Value};

    /// Takes every map; optionally suspends after `limit` maps.
    #[derive(Default)]
    struct Recorder {
        seen: Vec<u64>,
        limit: Option<usize>,
    }

    impl AckVisitor for Recorder {
        fn visit_map(&mut self, _branch: &Arc<Branch>, map: &Arc<VersionMap>) -> Result<Visit> {
            if self.limit.is_some_and(|limit| self.seen.len() >= limit) {
                return Ok(Visit::Suspend);
            }
            self.seen.push(map.seq());
            Ok(Visit::Done)
        }
    }

    fn point() -> TObject {
        let class = ClassDescriptor::new(ClassId::new(1), "P", ClassShape::Fields { count: 2 });
        TObject::new(ObjectId::new(1).unwrap(), Arc::new(class), 0)
    }

    fn branch(config: FabricConfig) -> Arc<Branch> {
        Branch::new(BranchId::new(1).unwrap(), config, None)
    }

    fn commit(branch: &Arc<Branch>, obj: &TObject, value: i32) -> crate::CommitTicket {
        let mut txn = branch.begin(TxnFlags::empty()).unwrap();
        txn.write(obj, 0, Value::I32(value)).unwrap();
        txn.commit().unwrap()
    }

    #[test]
    fn slot_bounds() {
        assert!(AckSlot::new(31).is_some());
        assert!(AckSlot::new(32).is_none());
        assert_eq!(AckSlot::new(4).unwrap().to_string(), "ack#4");
    }

    #[test]
    fn walk_resumes_where_it_suspended() {
        let b = branch(FabricConfig::default());
        let p = point();
        for i in 0..5 {
            commit(&b, &p, i);
        }
        let mut walker = Walker::new(None, &FabricConfig::default());
        let mut visitor = Recorder {
            limit: Some(2),
            ..Recorder::default()
        };
        let branches = [Arc::clone(&b)];
        assert_eq!(walker.run(&branches, &mut visitor).unwrap(), WalkOutcome::Suspended);
        assert_eq!(visitor.seen, vec![0, 1]);
        assert!(!walker.is_up_to_date(&b));
        visitor.limit = None;
        assert_eq!(walker.run(&branches, &mut visitor).unwrap(), WalkOutcome::Idle);
        assert_eq!(visitor.seen, vec![0, 1, 2, 3, 4]);
        assert!(walker.is_up_to_date(&b));
    }

    #[test]
    fn last_acknowledged_never_regresses() {
        let b = branch(FabricConfig::default());
        let p = point();
        let slot = AckSlot::new(0).unwrap();
        b.add_acknowledger(slot, false).unwrap();
        let mut walker = Walker::new(Some(slot), &FabricConfig::default());
        let mut visitor = Recorder::default();
        let branches = [Arc::clone(&b)];
        let mut generations = Vec::new();
        let mut acknowledged = Vec::new();
        for i in 0..6 {
            commit(&b, &p, i);
            walker.run(&branches, &mut visitor).unwrap();
            let state = walker.last_acknowledged(b.id()).unwrap();
            generations.push(state.snapshot().unwrap().generation());
            acknowledged.push(b.snapshot().acknowledged());
        }
        assert!(generations.windows(2).all(|w| w[0] <= w[1]));
        assert!(acknowledged.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(*acknowledged.last().unwrap(), 6);
    }

    #[test]
    fn budget_limits_branches_per_slice() {
        let config = FabricConfig {
            walker_budget: 1,
            ..FabricConfig::default()
        };
        let p = point();
        let branches: Vec<_> = (1..=3)
            .map(|id| Branch::new(BranchId::new(id).unwrap(), config, None))
            .collect();
        for b in &branches {
            commit(b, &p, 1);
        }
        let mut walker = Walker::new(None, &config);
        let mut visitor = Recorder::default();
        assert_eq!(walker.run(&branches, &mut visitor).unwrap(), WalkOutcome::Suspended);
        assert_eq!(visitor.seen.len(), 1);
        assert_eq!(
            walker.run_to_idle(&branches, &mut visitor, 8).unwrap(),
            WalkOutcome::Idle
        );
        assert_eq!(visitor.seen.len(), 3);
    }

    #[test]
    fn interceptor_closes_and_dispatches() {
        let b = branch(FabricConfig::default());
        let p = point();
        let slot = AckSlot::new(1).unwrap();
        let mut interceptor = Interceptor::new(slot, None);
        interceptor.attach(&b).unwrap();
        let first = commit(&b, &p, 1);
        let second = commit(&b, &p, 2);
        assert_eq!(first.interception_id(), second.interception_id());

        let mut walker = Walker::new(Some(slot), &FabricConfig::default());
        walker.run(&[Arc::clone(&b)], &mut interceptor).unwrap();
        let out = interceptor.drain();
        assert_eq!(out.len(), 3);
        let Outbound::End { interception, .. } = &out[2] else {
            panic!("end marker expected last");
        };
        assert_eq!(Some(*interception), first.interception_id());
        assert!(b.snapshot().interception().is_none());
        assert_eq!(first.status(), None);

        // A commit after the close opens a disjoint interception.
        let third = commit(&b, &p, 3);
        assert_ne!(third.interception_id(), first.interception_id());

        Interceptor::ack(&b, *interception).unwrap();
        assert!(first.wait().is_ok());
        assert!(second.wait().is_ok());
        walker.run(&[Arc::clone(&b)], &mut interceptor).unwrap();
        assert_eq!(b.snapshot().acknowledged(), 2);
    }

    #[test]
    fn nack_discards_and_rewinds() {
        let b = branch(FabricConfig::default());
        let p = point();
        let slot = AckSlot::new(2).unwrap();
        let mut interceptor = Interceptor::new(slot, None);
        interceptor.attach(&b).unwrap();
        let ticket = commit(&b, &p, 1);
        let mut walker = Walker::new(Some(slot), &FabricConfig::default());
        walker.run(&[Arc::clone(&b)], &mut interceptor).unwrap();
        let id = ticket.interception_id().unwrap();
        Interceptor::nack(&b, id, ErrorCode::Conflict, "stale").unwrap();

        assert_eq!(ticket.wait().unwrap_err().status(), fabric_error::CommitStatus::Conflict);
        let snapshot = b.snapshot();
        assert_eq!(snapshot.end(), 0);
        assert_eq!(snapshot.reset_epoch(), 1);
        walker.run(&[Arc::clone(&b)], &mut interceptor).unwrap();
        assert_eq!(walker.last_acknowledged(b.id()).unwrap().processed_to(), 0);
    }
}
