//! Persistence boundary.
//!
//! A [`Store`] receives committed maps and answers lookups asynchronously:
//! completion is signalled by invoking the supplied callback, never by
//! blocking the caller. [`StoreAcknowledger`] is the walker visitor that
//! feeds a store and only lets a branch's acknowledged index pass maps the
//! store has confirmed.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;

use fabric_error::{FabricError, Result};
use fabric_types::{BranchId, ObjectId, Value};
use parking_lot::Mutex;

use crate::acknowledger::{AckVisitor, Visit};
use crate::branch::Branch;
use crate::version::{Lookup, MergeFlags, Version};
use crate::version_map::VersionMap;

/// What a lookup asks for.
#[derive(Debug, Clone, PartialEq)]
pub enum StoreKey {
    Object(ObjectId),
    /// One entry of a keyed collection.
    Entry { object: ObjectId, key: Value },
}

#[derive(Debug, Clone)]
pub enum Fetched {
    Object(Arc<Version>),
    Entry(Value),
    Missing,
}

pub type FetchCallback = Box<dyn FnOnce(Result<Fetched>) + Send>;
pub type InsertCallback = Box<dyn FnOnce(Result<()>) + Send>;

pub trait Store: Send + Sync {
    fn get_async(&self, key: StoreKey, done: FetchCallback);

    /// Persist `maps`, all of `branch`, in order.
    fn insert(&self, branch: BranchId, maps: Vec<Arc<VersionMap>>, done: InsertCallback);
}

// ---------------------------------------------------------------------------
// MemoryStore
// ---------------------------------------------------------------------------

enum Deferred {
    Insert(Result<()>, InsertCallback),
    Fetch(Result<Fetched>, FetchCallback),
}

#[derive(Default)]
struct MemoryState {
    objects: HashMap<ObjectId, Arc<Version>>,
    inserted: BTreeMap<BranchId, u64>,
    deferred: Vec<Deferred>,
    fail_inserts: Option<String>,
}

/// In-memory store. In deferred mode callbacks queue until
/// [`MemoryStore::complete_all`], which lets tests hold acknowledgements back.
pub struct MemoryStore {
    state: Mutex<MemoryState>,
    deferred: bool,
}

impl fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("MemoryStore")
            .field("objects", &state.objects.len())
            .field("queued", &state.deferred.len())
            .field("deferred", &self.deferred)
            .finish_non_exhaustive()
    }
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MemoryState::default()),
            deferred: false,
        }
    }

    #[must_use]
    pub fn deferred() -> Self {
        Self {
            state: Mutex::new(MemoryState::default()),
            deferred: true,
        }
    }

    /// Make every later insert fail with `cause`; `None` restores success.
    pub fn fail_inserts(&self, cause: Option<&str>) {
        self.state.lock().fail_inserts = cause.map(str::to_owned);
    }

    /// Run every queued callback. Returns how many ran.
    pub fn complete_all(&self) -> usize {
        let queued = std::mem::take(&mut self.state.lock().deferred);
        let count = queued.len();
        for item in queued {
            match item {
                Deferred::Insert(outcome, done) => done(outcome),
                Deferred::Fetch(outcome, done) => done(outcome),
            }
        }
        count
    }

    #[must_use]
    pub fn queued(&self) -> usize {
        self.state.lock().deferred.len()
    }

    /// Maps of `branch` persisted so far.
    #[must_use]
    pub fn inserted(&self, branch: BranchId) -> u64 {
        self.state.lock().inserted.get(&branch).copied().unwrap_or(0)
    }

    #[must_use]
    pub fn object(&self, id: ObjectId) -> Option<Arc<Version>> {
        self.state.lock().objects.get(&id).cloned()
    }

    fn apply(state: &mut MemoryState, branch: BranchId, maps: &[Arc<VersionMap>]) -> Result<()> {
        if let Some(cause) = &state.fail_inserts {
            return Err(FabricError::Aborted {
                reason: cause.clone(),
            });
        }
        for map in maps {
            for delta in map.versions().filter(|v| v.has_writes()) {
                match state.objects.get_mut(&delta.object()) {
                    Some(stored) => Version::merge_into(stored, delta, MergeFlags::PRIVATE)?,
                    None => {
                        state
                            .objects
                            .insert(delta.object(), Arc::new(delta.to_shared()?));
                    }
                }
            }
        }
        *state.inserted.entry(branch).or_insert(0) += maps.len() as u64;
        Ok(())
    }

    fn fetch(state: &MemoryState, key: &StoreKey) -> Result<Fetched> {
        match key {
            StoreKey::Object(id) => Ok(state
                .objects
                .get(id)
                .map_or(Fetched::Missing, |v| Fetched::Object(Arc::clone(v)))),
            StoreKey::Entry { object, key } => {
                let Some(version) = state.objects.get(object) else {
                    return Ok(Fetched::Missing);
                };
                Ok(match version.lookup_key(key)? {
                    Lookup::Found(value) => Fetched::Entry(value),
                    Lookup::Absent | Lookup::Unknown => Fetched::Missing,
                })
            }
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl Store for MemoryStore {
    fn get_async(&self, key: StoreKey, done: FetchCallback) {
        let mut state = self.state.lock();
        let outcome = Self::fetch(&state, &key);
        if self.deferred {
            state.deferred.push(Deferred::Fetch(outcome, done));
        } else {
            drop(state);
            done(outcome);
        }
    }

    fn insert(&self, branch: BranchId, maps: Vec<Arc<VersionMap>>, done: InsertCallback) {
        let mut state = self.state.lock();
        let outcome = Self::apply(&mut state, branch, &maps);
        if self.deferred {
            state.deferred.push(Deferred::Insert(outcome, done));
        } else {
            drop(state);
            done(outcome);
        }
    }
}

// ---------------------------------------------------------------------------
// StoreAcknowledger
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct Tracking {
    /// Sequences handed to the store and not yet confirmed.
    outstanding: BTreeMap<BranchId, BTreeSet<u64>>,
    /// Inserts the store reported as failed, to be offered again.
    failed: BTreeMap<BranchId, Vec<Arc<VersionMap>>>,
    failures: u64,
}

/// Feeds every committed map to a [`Store`].
pub struct StoreAcknowledger {
    store: Arc<dyn Store>,
    tracking: Arc<Mutex<Tracking>>,
}

impl fmt::Debug for StoreAcknowledger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoreAcknowledger")
            .field("tracking", &*self.tracking.lock())
            .finish_non_exhaustive()
    }
}

impl StoreAcknowledger {
    #[must_use]
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            store,
            tracking: Arc::new(Mutex::new(Tracking::default())),
        }
    }

    /// Maps of `branch` awaiting confirmation.
    #[must_use]
    pub fn pending(&self, branch: BranchId) -> usize {
        self.tracking
            .lock()
            .outstanding
            .get(&branch)
            .map_or(0, BTreeSet::len)
    }

    /// Inserts the store has rejected so far.
    #[must_use]
    pub fn failures(&self) -> u64 {
        self.tracking.lock().failures
    }

    fn submit(&self, branch: BranchId, map: Arc<VersionMap>) {
        let seq = map.seq();
        self.tracking
            .lock()
            .outstanding
            .entry(branch)
            .or_default()
            .insert(seq);
        let tracking = Arc::clone(&self.tracking);
        let resubmit = Arc::clone(&map);
        self.store.insert(
            branch,
            vec![map],
            Box::new(move |outcome| {
                let mut tracking = tracking.lock();
                match outcome {
                    Ok(()) => {
                        if let Some(seqs) = tracking.outstanding.get_mut(&branch) {
                            seqs.remove(&seq);
                        }
                    }
                    Err(err) => {
                        tracing::error!(%branch, seq, %err, "store insert failed");
                        tracking.failures += 1;
                        tracking.failed.entry(branch).or_default().push(resubmit);
                    }
                }
            }),
        );
    }
}

impl AckVisitor for StoreAcknowledger {
    fn visit_map(&mut self, branch: &Arc<Branch>, map: &Arc<VersionMap>) -> Result<Visit> {
        if map.has_writes() {
            self.submit(branch.id(), Arc::clone(map));
        }
        Ok(Visit::Done)
    }

    fn outstanding(&self, branch: &Branch) -> Option<u64> {
        self.tracking
            .lock()
            .outstanding
            .get(&branch.id())
            .and_then(|seqs| seqs.first().copied())
    }

    /// Offer failed inserts again, unless the map was discarded since.
    fn finish_branch(&mut self, branch: &Arc<Branch>) -> Result<()> {
        let retry = self
            .tracking
            .lock()
            .failed
            .remove(&branch.id())
            .unwrap_or_default();
        if retry.is_empty() {
            return Ok(());
        }
        let snapshot = branch.snapshot();
        for map in retry {
            let live = snapshot
                .map_at(map.seq())
                .is_some_and(|current| Arc::ptr_eq(current, &map));
            if live {
                self.tracking
                    .lock()
                    .outstanding
                    .entry(branch.id())
                    .or_default()
                    .remove(&map.seq());
                self.submit(branch.id(), map);
            } else if let Some(seqs) = self.tracking.lock().outstanding.get_mut(&branch.id()) {
                seqs.remove(&map.seq());
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acknowledger::{AckSlot, Walker};
    use crate::config::FabricConfig;
    use crate::object::{ClassDescriptor, ClassShape, TObject};
    use fabric_types::{ClassId, TxnFlags};
    use std::sync::mpsc;

    fn point() -> TObject {
        let class = ClassDescriptor::new(ClassId::new(1), "P", ClassShape::Fields { count: 2 });
        TObject::new(ObjectId::new(1).unwrap(), Arc::new(class), 0)
    }

    fn dict() -> TObject {
        let class = ClassDescriptor::new(ClassId::MAP, "map", ClassShape::Map);
        TObject::new(ObjectId::new(2).unwrap(), Arc::new(class), 0)
    }

    fn commit(branch: &Arc<Branch>, p: &TObject, value: i32) {
        let mut txn = branch.begin(TxnFlags::empty()).unwrap();
        txn.write(p, 0, value).unwrap();
        txn.commit().unwrap();
    }

    #[test]
    fn memory_store_folds_maps_and_answers_lookups() {
        let store = MemoryStore::new();
        let b = Branch::new(BranchId::new(1).unwrap(), FabricConfig::default(), None);
        let p = point();
        let d = dict();
        commit(&b, &p, 1);
        let mut txn = b.begin(TxnFlags::empty()).unwrap();
        txn.put(&d, Value::from("k"), Value::I32(4)).unwrap();
        txn.commit().unwrap();
        let snapshot = b.snapshot();
        let (tx, rx) = mpsc::channel();
        store.insert(
            b.id(),
            snapshot.version_maps().cloned().collect(),
            Box::new(move |outcome| tx.send(outcome.is_ok()).unwrap()),
        );
        assert!(rx.recv().unwrap());
        assert_eq!(store.inserted(b.id()), 2);
        assert_eq!(store.object(p.id()).unwrap().lookup(0), Lookup::Found(Value::I32(1)));

        let (tx, rx) = mpsc::channel();
        store.get_async(
            StoreKey::Entry {
                object: d.id(),
                key: Value::from("k"),
            },
            Box::new(move |outcome| tx.send(outcome.unwrap()).unwrap()),
        );
        assert!(matches!(rx.recv().unwrap(), Fetched::Entry(Value::I32(4))));

        let (tx, rx) = mpsc::channel();
        store.get_async(
            StoreKey::Object(ObjectId::new(99).unwrap()),
            Box::new(move |outcome| tx.send(outcome.unwrap()).unwrap()),
        );
        assert!(matches!(rx.recv().unwrap(), Fetched::Missing));
    }

    #[test]
    fn acknowledged_index_waits_for_the_store() {
        let store = Arc::new(MemoryStore::deferred());
        let config = FabricConfig::default();
        let b = Branch::new(BranchId::new(1).unwrap(), config, None);
        let slot = AckSlot::new(0).unwrap();
        b.add_acknowledger(slot, false).unwrap();
        let p = point();
        commit(&b, &p, 1);
        commit(&b, &p, 2);

        let mut ack = StoreAcknowledger::new(store.clone());
        let mut walker = Walker::new(Some(slot), &config);
        let branches = [Arc::clone(&b)];
        walker.run(&branches, &mut ack).unwrap();
        assert_eq!(ack.pending(b.id()), 2);
        assert_eq!(b.snapshot().acknowledged(), 0);

        assert_eq!(store.complete_all(), 2);
        walker.run(&branches, &mut ack).unwrap();
        assert_eq!(ack.pending(b.id()), 0);
        assert_eq!(b.snapshot().acknowledged(), 2);
    }

    #[test]
    fn failed_inserts_are_retried() {
        let store = Arc::new(MemoryStore::new());
        let config = FabricConfig::default();
        let b = Branch::new(BranchId::new(1).unwrap(), config, None);
        let slot = AckSlot::new(1).unwrap();
        b.add_acknowledger(slot, false).unwrap();
        commit(&b, &point(), 1);

        store.fail_inserts(Some("disk full"));
        let mut ack = StoreAcknowledger::new(store.clone());
        let mut walker = Walker::new(Some(slot), &config);
        let branches = [Arc::clone(&b)];
        walker.run(&branches, &mut ack).unwrap();
        // Once when visited and once more when the walk finishes the branch.
        assert_eq!(ack.failures(), 2);
        assert_eq!(b.snapshot().acknowledged(), 0);

        store.fail_inserts(None);
        walker.run(&branches, &mut ack).unwrap();
        walker.run(&branches, &mut ack).unwrap();
        assert_eq!(ack.pending(b.id()), 0);
        assert_eq!(b.snapshot().acknowledged(), 1);
        assert_eq!(store.inserted(b.id()), 1);
    }
}
