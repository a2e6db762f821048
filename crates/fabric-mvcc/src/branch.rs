//! Branches: one line of transactional history.
//!
//! The current [`Snapshot`] pointer is the only shared mutable cell of a
//! branch. It is replaced with a compare-and-swap and never locked; every
//! other piece of state here (acknowledger progress, live readers, pending
//! interceptions) is bookkeeping around it.

use std::borrow::Borrow;
use std::collections::BTreeMap;
use std::sync::Arc;

use arc_swap::ArcSwap;
use fabric_bits::Bits;
use fabric_error::{FabricError, Result};
use fabric_observability::{FabricEvent, NackCategory};
use fabric_types::{BranchId, IdSequence, InterceptionId, ObjectId, TxnFlags, TxnId};
use parking_lot::Mutex;

use crate::acknowledger::AckSlot;
use crate::config::FabricConfig;
use crate::interceptor::Interception;
use crate::observability::{
    SharedObserver, emit, now_ns, record_cas_install, record_interception_aborted,
    record_interception_acked, record_interception_nacked, record_interception_opened,
    record_remote_apply,
};
use crate::snapshot::Snapshot;
use crate::transaction::{CommitTicket, Transaction};
use crate::version_map::VersionMap;

/// Per-slot acknowledgement progress, valid for one reset epoch.
#[derive(Debug)]
struct Progress {
    epoch: u64,
    slots: [u64; AckSlot::COUNT],
}

pub struct Branch {
    id: BranchId,
    config: FabricConfig,
    observer: SharedObserver,
    current: ArcSwap<Snapshot>,
    progress: Mutex<Progress>,
    /// Start positions of live transactions, with multiplicity.
    readers: Mutex<BTreeMap<u64, usize>>,
    pending: Mutex<BTreeMap<InterceptionId, Arc<Interception>>>,
    txn_ids: IdSequence,
    interception_ids: IdSequence,
}

impl std::fmt::Debug for Branch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let snapshot = self.snapshot();
        f.debug_struct("Branch")
            .field("id", &self.id)
            .field("end", &snapshot.end())
            .field("acknowledged", &snapshot.acknowledged())
            .field("blocked", &snapshot.slow().is_blocked())
            .finish_non_exhaustive()
    }
}

impl Branch {
    #[must_use]
    pub fn new(id: BranchId, config: FabricConfig, observer: SharedObserver) -> Arc<Self> {
        Arc::new(Self {
            id,
            config,
            observer,
            current: ArcSwap::from_pointee(Snapshot::empty(id)),
            progress: Mutex::new(Progress {
                epoch: 0,
                slots: [0; AckSlot::COUNT],
            }),
            readers: Mutex::new(BTreeMap::new()),
            pending: Mutex::new(BTreeMap::new()),
            txn_ids: IdSequence::new(),
            interception_ids: IdSequence::new(),
        })
    }

    #[must_use]
    pub const fn id(&self) -> BranchId {
        self.id
    }

    #[must_use]
    pub const fn config(&self) -> &FabricConfig {
        &self.config
    }

    pub(crate) const fn observer(&self) -> &SharedObserver {
        &self.observer
    }

    /// Current published snapshot.
    #[must_use]
    pub fn snapshot(&self) -> Arc<Snapshot> {
        self.current.load_full()
    }

    #[must_use]
    pub fn is_blocked(&self) -> bool {
        self.current.load().slow().is_blocked()
    }

    // -----------------------------------------------------------------------
    // Snapshot publication
    // -----------------------------------------------------------------------

    /// Install `next` if the current snapshot is still `current`.
    pub(crate) fn try_install(&self, current: &Arc<Snapshot>, next: Snapshot) -> bool {
        let previous = self.current.compare_and_swap(current, Arc::new(next));
        Arc::ptr_eq(&previous, current)
    }

    /// CAS loop: derive a successor from the current snapshot until one
    /// installs. `Ok(None)` from `derive` leaves the branch unchanged.
    pub(crate) fn update<F>(&self, mut derive: F) -> Result<Arc<Snapshot>>
    where
        F: FnMut(&Arc<Snapshot>) -> Result<Option<Snapshot>>,
    {
        let mut attempts = 0_u32;
        loop {
            attempts += 1;
            let current = self.snapshot();
            let Some(next) = derive(&current)? else {
                return Ok(current);
            };
            let next = Arc::new(next);
            let previous = self.current.compare_and_swap(&current, Arc::clone(&next));
            if Arc::ptr_eq(&previous, &current) {
                record_cas_install(attempts);
                return Ok(next);
            }
            tracing::trace!(branch = %self.id, attempts, "snapshot CAS lost; retrying");
        }
    }

    // -----------------------------------------------------------------------
    // Transactions
    // -----------------------------------------------------------------------

    pub(crate) fn next_txn_id(&self) -> Result<TxnId> {
        self.txn_ids
            .alloc()
            .and_then(|raw| TxnId::new(raw.get()))
            .ok_or_else(|| FabricError::internal(format!("{} exhausted transaction ids", self.id)))
    }

    pub(crate) fn next_interception_id(&self) -> Result<InterceptionId> {
        self.interception_ids
            .alloc()
            .and_then(|raw| InterceptionId::new(raw.get()))
            .ok_or_else(|| FabricError::internal(format!("{} exhausted interception ids", self.id)))
    }

    /// Start a private transaction on the current snapshot.
    pub fn begin(self: &Arc<Self>, flags: TxnFlags) -> Result<Transaction> {
        let id = self.next_txn_id()?;
        let snapshot = {
            let mut readers = self.readers.lock();
            let snapshot = self.snapshot();
            *readers.entry(snapshot.end()).or_insert(0) += 1;
            snapshot
        };
        tracing::trace!(branch = %self.id, txn = %id, start = snapshot.end(), "transaction started");
        Ok(Transaction::new(id, Arc::clone(self), snapshot, flags))
    }

    pub(crate) fn release_reader(&self, start: u64) {
        let mut readers = self.readers.lock();
        if let Some(count) = readers.get_mut(&start) {
            *count -= 1;
            if *count == 0 {
                readers.remove(&start);
            }
        }
    }

    /// Oldest start position of a live transaction.
    #[must_use]
    pub fn horizon(&self) -> Option<u64> {
        self.readers.lock().keys().next().copied()
    }

    #[must_use]
    pub fn live_readers(&self) -> usize {
        self.readers.lock().values().sum()
    }

    /// Run `body` in a transaction and commit it. With `AUTO`, transient
    /// failures re-run the body up to `max_commit_retries` times.
    ///
    /// The returned ticket is not waited on.
    pub fn run<T, F>(self: &Arc<Self>, flags: TxnFlags, mut body: F) -> Result<(T, CommitTicket)>
    where
        F: FnMut(&mut Transaction) -> Result<T>,
    {
        let retries = if flags.contains(TxnFlags::AUTO) {
            self.config.max_commit_retries
        } else {
            0
        };
        let mut attempt = 0_u32;
        loop {
            let mut txn = self.begin(flags)?;
            let outcome = body(&mut txn).and_then(|value| txn.commit().map(|ticket| (value, ticket)));
            match outcome {
                Ok(done) => return Ok(done),
                Err(err) if err.is_transient() && attempt < retries => {
                    attempt += 1;
                    tracing::debug!(branch = %self.id, attempt, %err, "retrying transaction");
                }
                Err(err) => return Err(err),
            }
        }
    }

    // -----------------------------------------------------------------------
    // Remote maps
    // -----------------------------------------------------------------------

    /// Publish a map decoded from a connection. Remote maps are not
    /// validated; writes to read-only fields already committed are dropped.
    ///
    /// `read_only` yields the read-only fields of an object, if it has any.
    pub fn apply_remote(
        &self,
        map: &VersionMap,
        read_only: &dyn Fn(ObjectId) -> Option<Bits>,
    ) -> Result<u64> {
        self.apply_remote_batch(&[map], read_only)
    }

    /// Publish several decoded maps with a single installation: either all
    /// of them become visible, in order, or none does. Returns the sequence
    /// of the last one.
    pub fn apply_remote_batch<M: Borrow<VersionMap>>(
        &self,
        maps: &[M],
        read_only: &dyn Fn(ObjectId) -> Option<Bits>,
    ) -> Result<u64> {
        let prepared = maps
            .iter()
            .map(|map| {
                let map = map.borrow();
                if map.branch() != self.id {
                    return Err(FabricError::invalid_state(format!(
                        "map for {} applied to {}",
                        map.branch(),
                        self.id
                    )));
                }
                map.writes_only()
            })
            .collect::<Result<Vec<VersionMap>>>()?;
        if prepared.is_empty() {
            return Ok(self.snapshot().end().saturating_sub(1));
        }
        let mut dropped = 0_u32;
        let installed = self.update(|current| {
            if let Some(cause) = current.slow().disconnect_cause() {
                return Err(FabricError::Disconnected {
                    branch: self.id.get(),
                    cause: cause.to_owned(),
                });
            }
            dropped = 0;
            let mut next: Option<Snapshot> = None;
            for map in &prepared {
                let head = next.as_ref().unwrap_or(current);
                let mut attempt = map.with_position(head.end(), map.txn(), None);
                let objects: Vec<ObjectId> = attempt.objects().collect();
                for object in objects {
                    let Some(guarded) = read_only(object) else {
                        continue;
                    };
                    let written = head.written_fields(object);
                    if let Some(version) = attempt.get_mut(object) {
                        dropped += version.merge_read_only_fields(&written, &guarded);
                    }
                }
                next = Some(head.appended(Arc::new(attempt), current.interception().cloned()));
            }
            Ok(next)
        })?;
        let seq = installed.end() - 1;
        record_remote_apply();
        tracing::debug!(
            branch = %self.id,
            seq,
            maps = prepared.len(),
            source = ?prepared[0].source(),
            dropped_read_only = dropped,
            "remote version maps applied"
        );
        Ok(seq)
    }

    // -----------------------------------------------------------------------
    // Acknowledgers
    // -----------------------------------------------------------------------

    /// Register an acknowledger. An intercepting one gates every later
    /// commit on its acknowledgement.
    pub fn add_acknowledger(&self, slot: AckSlot, intercepting: bool) -> Result<()> {
        {
            let mut progress = self.progress.lock();
            progress.slots[slot.index()] = self.snapshot().base_seq();
        }
        self.update(|current| {
            Ok(Some(current.with_slow(
                current.slow().with_acknowledger(slot.get(), intercepting),
            )))
        })?;
        tracing::debug!(branch = %self.id, %slot, intercepting, "acknowledger registered");
        Ok(())
    }

    pub fn remove_acknowledger(&self, slot: AckSlot, intercepting: bool) -> Result<()> {
        self.update(|current| {
            Ok(Some(current.with_slow(
                current.slow().without_acknowledger(slot.get(), intercepting),
            )))
        })?;
        tracing::debug!(branch = %self.id, %slot, "acknowledger removed");
        self.raise_acknowledged().map(|_| ())
    }

    #[must_use]
    pub fn progress(&self, slot: AckSlot) -> u64 {
        self.progress.lock().slots[slot.index()]
    }

    /// Record that `slot` has confirmed every map below `upto`. Reports
    /// made against a discarded epoch are ignored.
    pub fn report_progress(&self, slot: AckSlot, epoch: u64, upto: u64) -> Result<()> {
        {
            let mut progress = self.progress.lock();
            if progress.epoch != epoch {
                return Ok(());
            }
            let at = &mut progress.slots[slot.index()];
            *at = (*at).max(upto);
        }
        self.raise_acknowledged().map(|_| ())
    }

    /// Minimum progress over the registered acknowledgers, `None` when the
    /// branch has none.
    fn acknowledgement_bound(&self, snapshot: &Snapshot) -> Option<u64> {
        let registered = snapshot.slow().acknowledgers();
        if registered.is_empty() {
            return None;
        }
        let progress = self.progress.lock();
        registered
            .iter()
            .map(|slot| progress.slots[slot as usize])
            .min()
    }

    /// Raise the acknowledged index to what every acknowledger confirmed.
    pub fn raise_acknowledged(&self) -> Result<Arc<Snapshot>> {
        self.update(|current| {
            Ok(self
                .acknowledgement_bound(current)
                .and_then(|bound| current.with_acknowledged(bound)))
        })
    }

    /// Like [`Branch::raise_acknowledged`], but a branch nobody acknowledges
    /// counts as fully acknowledged.
    pub fn settle_acknowledged(&self) -> Result<Arc<Snapshot>> {
        self.update(|current| {
            let bound = self
                .acknowledgement_bound(current)
                .unwrap_or_else(|| current.end());
            Ok(current.with_acknowledged(bound))
        })
    }

    // -----------------------------------------------------------------------
    // Interceptions
    // -----------------------------------------------------------------------

    pub(crate) fn register_pending(&self, interception: Arc<Interception>) {
        record_interception_opened();
        self.pending.lock().insert(interception.id(), interception);
    }

    pub(crate) fn unregister_pending(&self, id: InterceptionId) {
        self.pending.lock().remove(&id);
    }

    #[must_use]
    pub fn is_pending(&self, id: InterceptionId) -> bool {
        self.pending.lock().contains_key(&id)
    }

    /// Unresolved interceptions, oldest first.
    #[must_use]
    pub fn pending_interceptions(&self) -> Vec<Arc<Interception>> {
        let mut pending: Vec<_> = self.pending.lock().values().cloned().collect();
        pending.sort_by_key(|i| i.first_seq());
        pending
    }

    /// First sequence of the oldest unresolved interception.
    #[must_use]
    pub fn oldest_pending(&self) -> Option<u64> {
        self.pending.lock().values().map(|i| i.first_seq()).min()
    }

    /// One attempt to close `open`. Returns whether it is closed now.
    pub fn close_interception(&self, open: &Arc<Interception>) -> bool {
        let current = self.snapshot();
        match current.interception() {
            Some(installed) if Arc::ptr_eq(installed, open) => {}
            _ => return !open.is_open(),
        }
        let end = current.end();
        if !self.try_install(&current, current.with_interception(None)) {
            return false;
        }
        open.close(end);
        let maps = usize::try_from(end - open.first_seq()).unwrap_or(usize::MAX);
        tracing::debug!(branch = %self.id, interception = %open.id(), maps, "interception closed");
        emit(
            &self.observer,
            &FabricEvent::InterceptionClosed {
                branch: self.id,
                interception: open.id(),
                maps,
                timestamp_ns: now_ns(),
            },
        );
        true
    }

    /// Resolve `id` as acknowledged.
    pub fn resolve_interception(&self, id: InterceptionId) -> Result<()> {
        let Some(interception) = self.pending.lock().remove(&id) else {
            return Err(FabricError::invalid_state(format!(
                "{id} is not pending on {}",
                self.id
            )));
        };
        interception.resolve(Ok(()));
        record_interception_acked();
        tracing::debug!(branch = %self.id, interception = %id, "interception acknowledged");
        emit(
            &self.observer,
            &FabricEvent::InterceptionAcked {
                branch: self.id,
                interception: id,
                timestamp_ns: now_ns(),
            },
        );
        Ok(())
    }

    /// Reject `id`: its maps and every later speculative map are discarded
    /// and all affected interceptions resolve with `error`.
    pub fn reject_interception(&self, id: InterceptionId, error: FabricError) -> Result<()> {
        let Some(first) = self.pending.lock().get(&id).map(|i| i.first_seq()) else {
            return Err(FabricError::invalid_state(format!(
                "{id} is not pending on {}",
                self.id
            )));
        };
        self.discard_from(first, &error, NackCategory::Rejected)
    }

    fn discard_from(&self, first: u64, error: &FabricError, category: NackCategory) -> Result<()> {
        {
            let mut progress = self.progress.lock();
            let installed = self.update(|current| {
                if first < current.acknowledged() {
                    return Err(FabricError::internal(format!(
                        "cannot discard acknowledged maps of {} from {first}",
                        self.id
                    )));
                }
                Ok(Some(current.truncated(first)))
            })?;
            progress.epoch = installed.reset_epoch();
            for slot in &mut progress.slots {
                *slot = (*slot).min(first);
            }
        }
        let victims: Vec<Arc<Interception>> = {
            let mut pending = self.pending.lock();
            let ids: Vec<_> = pending
                .values()
                .filter(|i| i.first_seq() >= first)
                .map(|i| i.id())
                .collect();
            ids.iter().filter_map(|id| pending.remove(id)).collect()
        };
        tracing::warn!(
            branch = %self.id,
            from = first,
            interceptions = victims.len(),
            %error,
            "speculative maps discarded"
        );
        for victim in victims {
            victim.resolve(Err(error.duplicate()));
            match category {
                NackCategory::Rejected => record_interception_nacked(),
                NackCategory::Disconnected => record_interception_aborted(),
            }
            emit(
                &self.observer,
                &FabricEvent::InterceptionNacked {
                    branch: self.id,
                    interception: victim.id(),
                    category,
                    timestamp_ns: now_ns(),
                },
            );
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Connectivity
    // -----------------------------------------------------------------------

    /// Block the branch. Pending interceptions abort with the cause and
    /// their maps are discarded; commits fail until [`Branch::reconnect`].
    pub fn disconnect(&self, cause: &str) -> Result<()> {
        self.update(|current| {
            if current.slow().is_blocked() {
                return Ok(None);
            }
            Ok(Some(current.with_slow(current.slow().blocked(cause))))
        })?;
        tracing::warn!(branch = %self.id, cause, "branch disconnected");
        emit(
            &self.observer,
            &FabricEvent::BranchDisconnected {
                branch: self.id,
                cause: cause.to_owned(),
                timestamp_ns: now_ns(),
            },
        );
        if let Some(first) = self.oldest_pending() {
            let error = FabricError::Disconnected {
                branch: self.id.get(),
                cause: cause.to_owned(),
            };
            self.discard_from(first, &error, NackCategory::Disconnected)?;
        }
        Ok(())
    }

    pub fn reconnect(&self) -> Result<()> {
        self.update(|current| {
            if !current.slow().is_blocked() {
                return Ok(None);
            }
            Ok(Some(current.with_slow(current.slow().unblocked())))
        })?;
        tracing::info!(branch = %self.id, "branch reconnected");
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Trimming
    // -----------------------------------------------------------------------

    /// Fold acknowledged maps no live transaction still validates against
    /// into the base state, once more than `threshold` have accumulated.
    /// Returns how many maps were folded.
    pub fn trim(&self, threshold: u32) -> Result<usize> {
        let before = self.snapshot().base_seq();
        let installed = self.update(|current| {
            let horizon = self.horizon().unwrap_or(u64::MAX);
            let bound = current.acknowledged().min(horizon);
            let foldable = bound.saturating_sub(current.base_seq());
            if foldable <= u64::from(threshold) {
                return Ok(None);
            }
            current.trimmed(bound).map(Some)
        })?;
        let folded = usize::try_from(installed.base_seq().saturating_sub(before)).unwrap_or(0);
        if folded > 0 {
            tracing::debug!(
                branch = %self.id,
                folded,
                base_seq = installed.base_seq(),
                "version maps merged into base"
            );
        }
        Ok(folded)
    }
}
