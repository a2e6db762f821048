//! Open-addressed tables backing keyed collections (maps and sets).
//!
//! Slots are tri-state: [`Slot::Empty`] terminates a lookup chain,
//! [`Slot::Removed`] is a tombstone that keeps it going, and [`Slot::Live`]
//! holds an entry. Keys and values may be held weakly; an entry whose key or
//! weak value has been dropped is *gced* and is skipped by lookups and dropped
//! on the next rehash.
//!
//! Key `Eq`/`Hash` is user code. Every call into it goes through
//! [`guarded`], which turns a panic into [`FabricError::UserCode`] so the
//! table is never left half-updated by an unwinding comparison.

use std::hash::{Hash, Hasher};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Weak};

use fabric_error::{FabricError, Result};

/// Minimum (and initial) slot count.
pub const MIN_CAPACITY: usize = 8;

/// Grow once `live + removed >= cap - (cap >> LOAD_SHIFT)`.
pub const LOAD_SHIFT: u32 = 2;

/// Run user code, converting a panic into [`FabricError::UserCode`].
pub fn guarded<T>(f: impl FnOnce() -> T) -> Result<T> {
    catch_unwind(AssertUnwindSafe(f)).map_err(|payload| {
        let detail = payload
            .downcast_ref::<&str>()
            .map(|s| (*s).to_owned())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "non-string panic payload".to_owned());
        tracing::warn!(%detail, "user code panicked");
        FabricError::UserCode { detail }
    })
}

/// Hash a key with xxh3 under [`guarded`].
pub fn hash_key<K: Hash + ?Sized>(key: &K) -> Result<u64> {
    guarded(|| {
        let mut hasher = xxhash_rust::xxh3::Xxh3::new();
        key.hash(&mut hasher);
        hasher.finish()
    })
}

// ---------------------------------------------------------------------------
// Held references
// ---------------------------------------------------------------------------

/// A strongly or weakly held value.
#[derive(Debug)]
pub enum Held<T> {
    Strong(Arc<T>),
    Weak(Weak<T>),
}

impl<T> Held<T> {
    #[must_use]
    pub fn strong(value: T) -> Self {
        Self::Strong(Arc::new(value))
    }

    #[must_use]
    pub fn weak(value: &Arc<T>) -> Self {
        Self::Weak(Arc::downgrade(value))
    }

    #[must_use]
    pub fn upgrade(&self) -> Option<Arc<T>> {
        match self {
            Self::Strong(arc) => Some(Arc::clone(arc)),
            Self::Weak(weak) => weak.upgrade(),
        }
    }

    #[must_use]
    pub fn is_weak(&self) -> bool {
        matches!(self, Self::Weak(_))
    }

    #[must_use]
    pub fn is_gced(&self) -> bool {
        match self {
            Self::Strong(_) => false,
            Self::Weak(weak) => weak.strong_count() == 0,
        }
    }
}

impl<T> Clone for Held<T> {
    fn clone(&self) -> Self {
        match self {
            Self::Strong(arc) => Self::Strong(Arc::clone(arc)),
            Self::Weak(weak) => Self::Weak(Weak::clone(weak)),
        }
    }
}

// ---------------------------------------------------------------------------
// Entries
// ---------------------------------------------------------------------------

/// What an entry says about its key.
#[derive(Debug)]
pub enum EntryValue<V> {
    /// The key maps to a value.
    Value(Held<V>),
    /// The key was removed.
    Removal,
    /// The key was only read; carries no value.
    Read,
}

impl<V> Clone for EntryValue<V> {
    fn clone(&self) -> Self {
        match self {
            Self::Value(held) => Self::Value(held.clone()),
            Self::Removal => Self::Removal,
            Self::Read => Self::Read,
        }
    }
}

impl<V> EntryValue<V> {
    #[must_use]
    pub const fn is_write(&self) -> bool {
        !matches!(self, Self::Read)
    }
}

#[derive(Debug)]
pub struct KeyedEntry<K, V> {
    key: Held<K>,
    hash: u64,
    value: EntryValue<V>,
    update: bool,
}

impl<K, V> Clone for KeyedEntry<K, V> {
    fn clone(&self) -> Self {
        Self {
            key: self.key.clone(),
            hash: self.hash,
            value: self.value.clone(),
            update: self.update,
        }
    }
}

impl<K, V> KeyedEntry<K, V> {
    #[must_use]
    pub fn key(&self) -> Option<Arc<K>> {
        self.key.upgrade()
    }

    #[must_use]
    pub const fn hash(&self) -> u64 {
        self.hash
    }

    #[must_use]
    pub const fn value(&self) -> &EntryValue<V> {
        &self.value
    }

    /// The value is held weakly.
    #[must_use]
    pub fn is_soft(&self) -> bool {
        matches!(&self.value, EntryValue::Value(held) if held.is_weak())
    }

    /// The write replaced a value the same transaction had read, so the
    /// entry also belongs to the read set.
    #[must_use]
    pub const fn is_update(&self) -> bool {
        self.update
    }

    /// Whether the entry takes part in read validation.
    #[must_use]
    pub const fn is_read(&self) -> bool {
        self.update || matches!(self.value, EntryValue::Read)
    }

    #[must_use]
    pub fn is_gced(&self) -> bool {
        self.key.is_gced() || matches!(&self.value, EntryValue::Value(held) if held.is_gced())
    }

    /// Current value, or `None` for removals, reads, and collected values.
    #[must_use]
    pub fn current(&self) -> Option<Arc<V>> {
        match &self.value {
            EntryValue::Value(held) => held.upgrade(),
            EntryValue::Removal | EntryValue::Read => None,
        }
    }
}

#[derive(Debug)]
enum Slot<K, V> {
    Empty,
    Removed,
    Live(KeyedEntry<K, V>),
}

impl<K, V> Clone for Slot<K, V> {
    fn clone(&self) -> Self {
        match self {
            Self::Empty => Self::Empty,
            Self::Removed => Self::Removed,
            Self::Live(entry) => Self::Live(entry.clone()),
        }
    }
}

/// How [`KeyedTable::merge_from`] treats sentinels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeMode {
    /// Fold one delta into another: removals and reads are kept as entries
    /// and a cleared source marks the destination cleared.
    Fold { reads: bool },
    /// Materialize a delta onto authoritative state: removals delete,
    /// reads are ignored, and a cleared source empties the destination.
    Apply,
}

// ---------------------------------------------------------------------------
// KeyedTable
// ---------------------------------------------------------------------------

/// Linear-probing hash table from keys to [`EntryValue`]s.
#[derive(Debug)]
pub struct KeyedTable<K, V> {
    slots: Box<[Slot<K, V>]>,
    live: usize,
    removed: usize,
    cleared: bool,
}

impl<K, V> Clone for KeyedTable<K, V> {
    fn clone(&self) -> Self {
        Self {
            slots: self.slots.clone(),
            live: self.live,
            removed: self.removed,
            cleared: self.cleared,
        }
    }
}

impl<K, V> Default for KeyedTable<K, V> {
    fn default() -> Self {
        Self::with_capacity(MIN_CAPACITY)
    }
}

fn empty_slots<K, V>(cap: usize) -> Box<[Slot<K, V>]> {
    std::iter::repeat_with(|| Slot::Empty).take(cap).collect()
}

impl<K, V> KeyedTable<K, V> {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        let cap = capacity.max(MIN_CAPACITY).next_power_of_two();
        Self {
            slots: empty_slots(cap),
            live: 0,
            removed: 0,
            cleared: false,
        }
    }

    #[inline]
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Live entries, including gced ones not yet purged.
    #[inline]
    #[must_use]
    pub const fn len(&self) -> usize {
        self.live
    }

    #[inline]
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.live == 0
    }

    /// Whether this table records a collection-wide clear.
    #[inline]
    #[must_use]
    pub const fn is_cleared(&self) -> bool {
        self.cleared
    }

    /// Drop every entry and record the clear.
    pub fn clear(&mut self) {
        self.reset(self.slots.len());
        self.cleared = true;
    }

    fn reset(&mut self, cap: usize) {
        self.slots = empty_slots(cap);
        self.live = 0;
        self.removed = 0;
    }

    /// Live entries that have not been collected.
    pub fn entries(&self) -> impl Iterator<Item = &KeyedEntry<K, V>> {
        self.slots.iter().filter_map(|slot| match slot {
            Slot::Live(entry) if !entry.is_gced() => Some(entry),
            _ => None,
        })
    }

    #[inline]
    fn mask(&self) -> usize {
        self.slots.len() - 1
    }

    #[inline]
    #[allow(clippy::cast_possible_truncation)]
    fn home(&self, hash: u64) -> usize {
        (hash as usize) & self.mask()
    }

    fn needs_grow(&self) -> bool {
        let cap = self.slots.len();
        self.live + self.removed + 1 > cap - (cap >> LOAD_SHIFT)
    }

    /// Rehash into a table sized for the live population, doubling when at
    /// least half the slots hold live entries. Gced entries are dropped and
    /// tombstones disappear. Cached hashes are reused so no user code runs.
    fn rehash(&mut self) {
        let cap = self.slots.len();
        let next_cap = if self.live * 2 >= cap { cap * 2 } else { cap };
        let old = std::mem::replace(&mut self.slots, empty_slots(next_cap));
        let before = self.live;
        self.live = 0;
        self.removed = 0;
        for slot in old.into_vec() {
            if let Slot::Live(entry) = slot {
                if !entry.is_gced() {
                    self.place(entry);
                }
            }
        }
        tracing::trace!(from = cap, to = next_cap, before, after = self.live, "keyed table rehashed");
    }

    /// Insert an entry known to be absent, without comparing keys.
    fn place(&mut self, entry: KeyedEntry<K, V>) {
        let mask = self.mask();
        let mut at = self.home(entry.hash);
        loop {
            if matches!(self.slots[at], Slot::Empty) {
                self.slots[at] = Slot::Live(entry);
                self.live += 1;
                return;
            }
            at = (at + 1) & mask;
        }
    }

    /// Drop collected entries, leaving tombstones.
    pub fn purge_gced(&mut self) -> usize {
        let mut purged = 0;
        for slot in self.slots.iter_mut() {
            if matches!(slot, Slot::Live(entry) if entry.is_gced()) {
                *slot = Slot::Removed;
                self.live -= 1;
                self.removed += 1;
                purged += 1;
            }
        }
        purged
    }
}

impl<K: Hash + Eq, V> KeyedTable<K, V> {
    /// Slot index holding `key`, if present.
    fn locate(&self, key: &K, hash: u64) -> Result<Option<usize>> {
        let mask = self.mask();
        let mut at = self.home(hash);
        for _ in 0..self.slots.len() {
            match &self.slots[at] {
                Slot::Empty => return Ok(None),
                Slot::Removed => {}
                Slot::Live(entry) => {
                    if entry.hash == hash {
                        if let Some(stored) = entry.key.upgrade() {
                            if guarded(|| *stored == *key)? {
                                return Ok(Some(at));
                            }
                        }
                    }
                }
            }
            at = (at + 1) & mask;
        }
        Ok(None)
    }

    /// Look up `key`. Gced entries read as absent.
    pub fn find(&self, key: &K) -> Result<Option<&KeyedEntry<K, V>>> {
        let hash = hash_key(key)?;
        Ok(self.locate(key, hash)?.and_then(|at| match &self.slots[at] {
            Slot::Live(entry) if !entry.is_gced() => Some(entry),
            _ => None,
        }))
    }

    /// Insert or replace the entry for `key`, returning the previous one.
    pub fn insert(
        &mut self,
        key: Held<K>,
        value: EntryValue<V>,
        update: bool,
    ) -> Result<Option<KeyedEntry<K, V>>> {
        let Some(strong) = key.upgrade() else {
            return Ok(None);
        };
        let hash = hash_key(&*strong)?;
        let entry = KeyedEntry {
            key,
            hash,
            value,
            update,
        };
        self.insert_hashed(&strong, entry)
    }

    fn insert_hashed(&mut self, key: &K, entry: KeyedEntry<K, V>) -> Result<Option<KeyedEntry<K, V>>> {
        if let Some(at) = self.locate(key, entry.hash)? {
            let previous = std::mem::replace(&mut self.slots[at], Slot::Live(entry));
            return Ok(match previous {
                Slot::Live(old) => Some(old),
                Slot::Empty | Slot::Removed => None,
            });
        }
        if self.needs_grow() {
            self.rehash();
        }
        let mask = self.mask();
        let mut at = self.home(entry.hash);
        loop {
            match self.slots[at] {
                Slot::Empty => break,
                Slot::Removed => {
                    self.removed -= 1;
                    break;
                }
                Slot::Live(_) => at = (at + 1) & mask,
            }
        }
        self.slots[at] = Slot::Live(entry);
        self.live += 1;
        Ok(None)
    }

    /// Record `key -> value` with both held strongly.
    pub fn put(&mut self, key: K, value: V) -> Result<Option<KeyedEntry<K, V>>> {
        self.insert(Held::strong(key), EntryValue::Value(Held::strong(value)), false)
    }

    /// Record a removal of `key`.
    pub fn put_removal(&mut self, key: K) -> Result<Option<KeyedEntry<K, V>>> {
        self.insert(Held::strong(key), EntryValue::Removal, false)
    }

    /// Record that `key` was read. An existing write for the key is marked
    /// as an update instead of being replaced.
    pub fn mark_read(&mut self, key: K) -> Result<()> {
        let hash = hash_key(&key)?;
        if let Some(at) = self.locate(&key, hash)? {
            if let Slot::Live(entry) = &mut self.slots[at] {
                entry.update = entry.update || entry.value.is_write();
            }
            return Ok(());
        }
        let key = Arc::new(key);
        let entry = KeyedEntry {
            key: Held::Strong(Arc::clone(&key)),
            hash,
            value: EntryValue::Read,
            update: false,
        };
        self.insert_hashed(&key, entry).map(|_| ())
    }

    /// Delete the entry for `key`, leaving a tombstone.
    pub fn delete(&mut self, key: &K) -> Result<Option<KeyedEntry<K, V>>> {
        let hash = hash_key(key)?;
        let Some(at) = self.locate(key, hash)? else {
            return Ok(None);
        };
        let previous = std::mem::replace(&mut self.slots[at], Slot::Removed);
        self.live -= 1;
        self.removed += 1;
        Ok(match previous {
            Slot::Live(entry) => Some(entry),
            Slot::Empty | Slot::Removed => None,
        })
    }

    /// Merge `src` into `self`.
    ///
    /// A cleared source dominates: the destination is emptied before any
    /// source entry is applied. Source writes replace destination entries;
    /// source reads are only folded when `reads` is requested and never
    /// replace an existing destination write.
    pub fn merge_from(&mut self, src: &Self, mode: MergeMode) -> Result<()> {
        if src.cleared {
            self.reset(self.slots.len());
            self.cleared = matches!(mode, MergeMode::Fold { .. });
        }
        for entry in src.entries() {
            let Some(key) = entry.key.upgrade() else {
                continue;
            };
            match (mode, &entry.value) {
                (MergeMode::Apply, EntryValue::Read) => {}
                (MergeMode::Apply, EntryValue::Removal) => {
                    self.delete(&key)?;
                }
                (MergeMode::Apply, EntryValue::Value(held)) => {
                    let fresh = KeyedEntry {
                        key: entry.key.clone(),
                        hash: entry.hash,
                        value: EntryValue::Value(held.clone()),
                        update: false,
                    };
                    self.insert_hashed(&key, fresh)?;
                }
                (MergeMode::Fold { reads }, EntryValue::Read) => {
                    if !reads {
                        continue;
                    }
                    if let Some(at) = self.locate(&key, entry.hash)? {
                        if let Slot::Live(existing) = &mut self.slots[at] {
                            existing.update = existing.update || existing.value.is_write();
                        }
                    } else {
                        self.insert_hashed(&key, entry.clone())?;
                    }
                }
                (MergeMode::Fold { reads }, EntryValue::Removal | EntryValue::Value(_)) => {
                    let mut incoming = entry.clone();
                    if !reads {
                        incoming.update = false;
                    } else if let Some(at) = self.locate(&key, entry.hash)? {
                        if let Slot::Live(existing) = &self.slots[at] {
                            incoming.update = incoming.update || existing.is_read();
                        }
                    }
                    self.insert_hashed(&key, incoming)?;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::HashMap;

    fn value_of(table: &KeyedTable<String, i64>, key: &str) -> Option<i64> {
        table
            .find(&key.to_owned())
            .unwrap()
            .and_then(KeyedEntry::current)
            .map(|v| *v)
    }

    #[test]
    fn put_find_delete() {
        let mut table = KeyedTable::new();
        assert!(table.put("a".to_owned(), 1_i64).unwrap().is_none());
        assert!(table.put("a".to_owned(), 2).unwrap().is_some());
        assert_eq!(value_of(&table, "a"), Some(2));
        assert_eq!(table.len(), 1);
        assert!(table.delete(&"a".to_owned()).unwrap().is_some());
        assert_eq!(value_of(&table, "a"), None);
        assert!(table.is_empty());
    }

    #[test]
    fn tombstones_keep_lookup_chains() {
        // Capacity 8 and identical low bits force a shared lookup chain.
        #[derive(PartialEq, Eq)]
        struct Colliding(u32);
        impl Hash for Colliding {
            fn hash<H: Hasher>(&self, state: &mut H) {
                state.write_u8(0);
            }
        }
        let mut table: KeyedTable<Colliding, u32> = KeyedTable::new();
        for i in 0..4 {
            table.put(Colliding(i), i).unwrap();
        }
        table.delete(&Colliding(1)).unwrap();
        let found = table.find(&Colliding(3)).unwrap().and_then(KeyedEntry::current);
        assert_eq!(found.map(|v| *v), Some(3));
        // Reinsertion reuses the tombstone.
        table.put(Colliding(9), 9).unwrap();
        assert_eq!(table.len(), 4);
    }

    #[test]
    fn growth_preserves_flags_and_sentinels() {
        let mut table: KeyedTable<u32, u32> = KeyedTable::new();
        for i in 0..100 {
            match i % 3 {
                0 => {
                    table.put(i, i * 10).unwrap();
                }
                1 => {
                    table.put_removal(i).unwrap();
                }
                _ => table.mark_read(i).unwrap(),
            }
        }
        table.mark_read(0).unwrap();
        assert!(table.capacity() >= 128);
        assert_eq!(table.len(), 100);
        let zero = table.find(&0).unwrap().unwrap();
        assert!(zero.is_update());
        assert!(matches!(table.find(&1).unwrap().unwrap().value(), EntryValue::Removal));
        assert!(matches!(table.find(&2).unwrap().unwrap().value(), EntryValue::Read));
        assert!(!table.find(&3).unwrap().unwrap().is_update());
    }

    #[test]
    fn weak_entries_are_collected() {
        let mut table: KeyedTable<u32, String> = KeyedTable::new();
        let kept = Arc::new("kept".to_owned());
        {
            let dropped = Arc::new("dropped".to_owned());
            table
                .insert(Held::strong(1), EntryValue::Value(Held::weak(&dropped)), false)
                .unwrap();
            assert!(table.find(&1).unwrap().unwrap().is_soft());
        }
        table
            .insert(Held::strong(2), EntryValue::Value(Held::weak(&kept)), false)
            .unwrap();
        assert!(table.find(&1).unwrap().is_none());
        assert_eq!(table.entries().count(), 1);
        assert_eq!(table.purge_gced(), 1);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn merge_source_value_wins() {
        let mut shared: KeyedTable<String, i64> = KeyedTable::new();
        shared.put("k1".to_owned(), 0).unwrap();
        let mut write: KeyedTable<String, i64> = KeyedTable::new();
        write.put("k1".to_owned(), 1).unwrap();
        shared.merge_from(&write, MergeMode::Apply).unwrap();
        assert_eq!(value_of(&shared, "k1"), Some(1));
    }

    #[test]
    fn cleared_source_dominates() {
        let mut shared: KeyedTable<String, i64> = KeyedTable::new();
        for i in 0..20 {
            shared.put(format!("k{i}"), i).unwrap();
        }
        let mut write: KeyedTable<String, i64> = KeyedTable::new();
        write.clear();
        shared.merge_from(&write, MergeMode::Apply).unwrap();
        assert!(shared.is_empty());
        assert!(!shared.is_cleared());

        let mut parent: KeyedTable<String, i64> = KeyedTable::new();
        parent.put("x".to_owned(), 1).unwrap();
        parent.merge_from(&write, MergeMode::Fold { reads: true }).unwrap();
        assert!(parent.is_empty());
        assert!(parent.is_cleared());
    }

    #[test]
    fn apply_removal_deletes_and_reads_are_ignored() {
        let mut shared: KeyedTable<u32, u32> = KeyedTable::new();
        shared.put(1, 1).unwrap();
        shared.put(2, 2).unwrap();
        let mut delta: KeyedTable<u32, u32> = KeyedTable::new();
        delta.put_removal(1).unwrap();
        delta.mark_read(2).unwrap();
        delta.mark_read(3).unwrap();
        shared.merge_from(&delta, MergeMode::Apply).unwrap();
        assert!(shared.find(&1).unwrap().is_none());
        assert_eq!(shared.find(&2).unwrap().and_then(KeyedEntry::current).map(|v| *v), Some(2));
        assert!(shared.find(&3).unwrap().is_none());
    }

    #[test]
    fn fold_reads_only_when_requested() {
        let mut child: KeyedTable<u32, u32> = KeyedTable::new();
        child.mark_read(7).unwrap();
        child.put(8, 80).unwrap();

        let mut without: KeyedTable<u32, u32> = KeyedTable::new();
        without.merge_from(&child, MergeMode::Fold { reads: false }).unwrap();
        assert!(without.find(&7).unwrap().is_none());
        assert!(without.find(&8).unwrap().is_some());

        let mut parent: KeyedTable<u32, u32> = KeyedTable::new();
        parent.mark_read(8).unwrap();
        parent.put(7, 70).unwrap();
        parent.merge_from(&child, MergeMode::Fold { reads: true }).unwrap();
        let seven = parent.find(&7).unwrap().unwrap();
        assert!(seven.is_update());
        assert_eq!(seven.current().map(|v| *v), Some(70));
        assert!(parent.find(&8).unwrap().unwrap().is_update());
    }

    #[test]
    fn panicking_key_becomes_user_code_error() {
        #[derive(Debug, PartialEq, Eq)]
        struct Bomb;
        impl Hash for Bomb {
            fn hash<H: Hasher>(&self, _state: &mut H) {
                panic!("hash exploded");
            }
        }
        let mut table: KeyedTable<Bomb, u32> = KeyedTable::new();
        let err = table.put(Bomb, 1).unwrap_err();
        assert!(matches!(err, FabricError::UserCode { ref detail } if detail.contains("exploded")));
        assert!(err.is_transient());
        assert!(table.is_empty());
    }

    proptest! {
        #[test]
        fn prop_rehash_keeps_exact_population(keys in proptest::collection::hash_set(any::<u64>(), 1..400)) {
            let mut table: KeyedTable<u64, u64> = KeyedTable::new();
            let mut expected = HashMap::new();
            for (i, &k) in keys.iter().enumerate() {
                table.put(k, i as u64).unwrap();
                expected.insert(k, i as u64);
            }
            prop_assert_eq!(table.len(), expected.len());
            prop_assert_eq!(table.entries().count(), expected.len());
            for (k, v) in &expected {
                let got = table.find(k).unwrap().and_then(KeyedEntry::current).map(|a| *a);
                prop_assert_eq!(got, Some(*v));
            }
        }
    }
}
