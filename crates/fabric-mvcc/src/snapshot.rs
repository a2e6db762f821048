//! Immutable per-branch views.
//!
//! A [`Snapshot`] is never mutated once published. Every change to a branch
//! (a commit, an acknowledgement, a trim, a disconnection) derives a new
//! snapshot from the current one and installs it with a compare-and-swap.
//! Derivations share the base state, the sealed segments of the map chain
//! (with their write indexes) and the slow changing metadata structurally,
//! so a commit copies only the open tail segment.

use std::collections::HashMap;
use std::sync::Arc;

use fabric_bits::{Bits, FixedBits};
use fabric_error::Result;
use fabric_types::{BranchId, ObjectId, Value};

use crate::chain::MapChain;
use crate::interceptor::Interception;
use crate::object::TObject;
use crate::version::{Lookup, MergeFlags, Version};
use crate::version_map::VersionMap;

/// Branch metadata that changes rarely: who acknowledges, whether commits
/// are gated, and whether the branch is blocked by a disconnection.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SlowChanging {
    acknowledgers: FixedBits,
    intercepted: bool,
    disconnected: Option<Arc<str>>,
}

impl SlowChanging {
    #[must_use]
    pub const fn acknowledgers(&self) -> FixedBits {
        self.acknowledgers
    }

    /// Commits must join an interception and wait for its acknowledgement.
    #[must_use]
    pub const fn is_intercepted(&self) -> bool {
        self.intercepted
    }

    #[must_use]
    pub const fn is_blocked(&self) -> bool {
        self.disconnected.is_some()
    }

    #[must_use]
    pub fn disconnect_cause(&self) -> Option<&str> {
        self.disconnected.as_deref()
    }

    #[must_use]
    pub(crate) fn with_acknowledger(&self, slot: u32, intercepting: bool) -> Self {
        let mut next = self.clone();
        next.acknowledgers.set(slot);
        next.intercepted |= intercepting;
        next
    }

    #[must_use]
    pub(crate) fn without_acknowledger(&self, slot: u32, interceptor_left: bool) -> Self {
        let mut next = self.clone();
        next.acknowledgers.unset(slot);
        if interceptor_left {
            next.intercepted = false;
        }
        next
    }

    #[must_use]
    pub(crate) fn blocked(&self, cause: &str) -> Self {
        Self {
            disconnected: Some(Arc::from(cause)),
            ..self.clone()
        }
    }

    #[must_use]
    pub(crate) fn unblocked(&self) -> Self {
        Self {
            disconnected: None,
            ..self.clone()
        }
    }
}

#[derive(Debug, Clone)]
pub struct Snapshot {
    branch: BranchId,
    /// Publication counter; strictly increases along a branch's history.
    generation: u64,
    /// Shared state of every object folded out of the map chain.
    base: Arc<HashMap<ObjectId, Arc<Version>>>,
    /// Sequence number of the oldest map in the chain.
    base_seq: u64,
    maps: MapChain,
    /// Maps below this sequence are confirmed by every acknowledger.
    acknowledged: u64,
    /// Interception new commits join, if one is open.
    interception: Option<Arc<Interception>>,
    slow: Arc<SlowChanging>,
    /// Incremented whenever speculative maps are discarded.
    reset_epoch: u64,
}

impl Snapshot {
    #[must_use]
    pub fn empty(branch: BranchId) -> Self {
        Self {
            branch,
            generation: 0,
            base: Arc::new(HashMap::new()),
            base_seq: 0,
            maps: MapChain::default(),
            acknowledged: 0,
            interception: None,
            slow: Arc::new(SlowChanging::default()),
            reset_epoch: 0,
        }
    }

    #[must_use]
    pub const fn branch(&self) -> BranchId {
        self.branch
    }

    #[must_use]
    pub const fn generation(&self) -> u64 {
        self.generation
    }

    #[must_use]
    pub const fn base_seq(&self) -> u64 {
        self.base_seq
    }

    /// One past the newest map's sequence number.
    #[must_use]
    pub fn end(&self) -> u64 {
        self.base_seq + self.maps.len() as u64
    }

    #[must_use]
    pub fn version_map_count(&self) -> usize {
        self.maps.len()
    }

    /// Maps in sequence order, oldest first.
    pub fn version_maps(&self) -> impl DoubleEndedIterator<Item = &Arc<VersionMap>> + '_ {
        self.maps.iter()
    }

    #[must_use]
    pub const fn acknowledged(&self) -> u64 {
        self.acknowledged
    }

    #[must_use]
    pub fn interception(&self) -> Option<&Arc<Interception>> {
        self.interception.as_ref()
    }

    #[must_use]
    pub fn slow(&self) -> &SlowChanging {
        &self.slow
    }

    #[must_use]
    pub const fn reset_epoch(&self) -> u64 {
        self.reset_epoch
    }

    #[must_use]
    pub fn map_at(&self, seq: u64) -> Option<&Arc<VersionMap>> {
        let offset = seq.checked_sub(self.base_seq)?;
        self.maps.get(usize::try_from(offset).ok()?)
    }

    /// Newest sequence number that wrote `object`, if any map did. May
    /// name a sequence already folded below `base_seq`.
    #[must_use]
    pub fn last_write(&self, object: ObjectId) -> Option<u64> {
        self.maps.last_write(object)
    }

    #[must_use]
    pub fn base_version(&self, object: ObjectId) -> Option<&Arc<Version>> {
        self.base.get(&object)
    }

    #[must_use]
    pub fn base_len(&self) -> usize {
        self.base.len()
    }

    // -----------------------------------------------------------------------
    // Reads
    // -----------------------------------------------------------------------

    /// Committed value of an indexed slot; `Null` when never written.
    #[must_use]
    pub fn read(&self, object: ObjectId, index: u32) -> Value {
        for map in self.maps.iter().rev() {
            if let Some(version) = map.get(object) {
                match version.lookup(index) {
                    Lookup::Found(value) => return value,
                    Lookup::Absent => return Value::Null,
                    Lookup::Unknown => {}
                }
            }
        }
        match self.base.get(&object).map(|v| v.lookup(index)) {
            Some(Lookup::Found(value)) => value,
            _ => Value::Null,
        }
    }

    /// Committed value for `key` in a keyed collection.
    pub fn read_key(&self, object: ObjectId, key: &Value) -> Result<Option<Value>> {
        for map in self.maps.iter().rev() {
            if let Some(version) = map.get(object) {
                match version.lookup_key(key)? {
                    Lookup::Found(value) => return Ok(Some(value)),
                    Lookup::Absent => return Ok(None),
                    Lookup::Unknown => {}
                }
            }
        }
        match self.base.get(&object) {
            Some(version) => match version.lookup_key(key)? {
                Lookup::Found(value) => Ok(Some(value)),
                Lookup::Absent | Lookup::Unknown => Ok(None),
            },
            None => Ok(None),
        }
    }

    /// Fold of the base state and every map for `object`.
    pub fn shared_view(&self, object: &TObject) -> Result<Version> {
        let mut view = match self.base.get(&object.id()) {
            Some(base) => (**base).clone(),
            None => Version::shared(object),
        };
        for map in self.maps.iter() {
            if let Some(delta) = map.get(object.id()) {
                view.merge(delta, MergeFlags::PRIVATE)?;
            }
        }
        Ok(view)
    }

    /// Indexed fields committed for `object` anywhere in this snapshot.
    #[must_use]
    pub fn written_fields(&self, object: ObjectId) -> Bits {
        let mut written = self
            .base
            .get(&object)
            .map_or_else(Bits::fixed, |v| v.written_fields());
        for map in self.maps.iter() {
            if let Some(version) = map.get(object) {
                written.merge_in(&version.written_fields());
            }
        }
        written
    }

    // -----------------------------------------------------------------------
    // Derivations
    // -----------------------------------------------------------------------

    fn derive(&self) -> Self {
        Self {
            generation: self.generation + 1,
            ..self.clone()
        }
    }

    /// New snapshot with `map` appended. `map.seq()` must equal `self.end()`.
    #[must_use]
    pub(crate) fn appended(
        &self,
        map: Arc<VersionMap>,
        interception: Option<Arc<Interception>>,
    ) -> Self {
        debug_assert_eq!(map.seq(), self.end());
        let mut next = self.derive();
        next.maps.push(map);
        next.interception = interception;
        next
    }

    #[must_use]
    pub(crate) fn with_interception(&self, interception: Option<Arc<Interception>>) -> Self {
        let mut next = self.derive();
        next.interception = interception;
        next
    }

    #[must_use]
    pub(crate) fn with_slow(&self, slow: SlowChanging) -> Self {
        let mut next = self.derive();
        next.slow = Arc::new(slow);
        next
    }

    /// Raise the acknowledged index. Never lowers it and never passes `end`.
    #[must_use]
    pub(crate) fn with_acknowledged(&self, acknowledged: u64) -> Option<Self> {
        let target = acknowledged.min(self.end()).max(self.acknowledged);
        if target == self.acknowledged {
            return None;
        }
        let mut next = self.derive();
        next.acknowledged = target;
        Some(next)
    }

    /// Discard every speculative map at or after `from` and start a new
    /// reset epoch. Maps in that range that belong to no interception
    /// (remote maps among them) are final; they are kept and renumbered
    /// behind the surviving prefix.
    #[must_use]
    pub(crate) fn truncated(&self, from: u64) -> Self {
        let from = from.max(self.base_seq);
        let mut next = self.derive();
        let keep = usize::try_from(from - self.base_seq).unwrap_or(usize::MAX);
        let tail: Vec<Arc<VersionMap>> = self.maps.iter().skip(keep).cloned().collect();
        next.maps.truncate(keep);
        for map in tail {
            if map.interception().is_some() {
                continue;
            }
            let seq = self.base_seq + next.maps.len() as u64;
            next.maps.push(Arc::new(map.with_position(seq, map.txn(), None)));
        }
        next.interception = None;
        next.reset_epoch += 1;
        next.acknowledged = next.acknowledged.min(next.end());
        next
    }

    /// Fold maps below `upto` into the base state.
    pub(crate) fn trimmed(&self, upto: u64) -> Result<Self> {
        let upto = upto.min(self.acknowledged).min(self.end());
        let count = usize::try_from(upto.saturating_sub(self.base_seq)).unwrap_or(0);
        let mut next = self.derive();
        if count == 0 {
            return Ok(next);
        }
        let base = Arc::make_mut(&mut next.base);
        for map in self.maps.iter().take(count) {
            for delta in map.versions().filter(|v| v.has_writes()) {
                match base.get_mut(&delta.object()) {
                    Some(shared) => Version::merge_into(shared, delta, MergeFlags::PRIVATE)?,
                    None => {
                        base.insert(delta.object(), Arc::new(delta.to_shared()?));
                    }
                }
            }
        }
        next.maps.drop_front(count);
        next.base_seq = upto;
        Ok(next)
    }
}
