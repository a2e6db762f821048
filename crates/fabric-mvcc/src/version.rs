//! Per-object versions.
//!
//! A [`Version`] is either a *delta* (the reads and writes one transaction
//! made to one object) or the *shared* state of an object (the fold of every
//! committed delta below a branch's base). Payloads are indexed (fields or
//! array elements tracked in a [`Bits`]) or keyed (a [`KeyedTable`]).
//!
//! Merging folds one version into another. Folding committed deltas into a
//! shared version in commit order yields the same state regardless of how
//! folds are batched, as long as the deltas passed validation; merge itself
//! never detects conflicts.

use std::collections::BTreeMap;
use std::sync::Arc;

use fabric_bits::{Bits, EntryValue, Held, KeyedEntry, KeyedTable, MergeMode};
use fabric_error::{FabricError, Result};
use fabric_types::{ObjectId, Value};

use crate::object::TObject;

bitflags::bitflags! {
    /// How [`Version::merge`] treats its target.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct MergeFlags: u8 {
        /// Target is exclusively owned; mutate it in place.
        const PRIVATE = 1;
        /// Never mutate the target; merge into a copy.
        const CLONE = 1 << 1;
        /// The copy must not share its value array with the original.
        const COPY_ARRAYS = 1 << 2;
        /// Keyed values are re-allocated instead of shared with the source.
        const COPY_ARRAY_ELEMENTS = 1 << 3;
        /// Also fold the read set (child into parent).
        const READS = 1 << 4;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VersionRole {
    /// Reads and writes of one transaction.
    Delta,
    /// Authoritative folded state.
    Shared,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VersionKind {
    /// Indexed with a single-word bitset.
    Indexed32,
    /// Indexed with a sparse bitset.
    IndexedN,
    Keyed,
}

/// Result of looking a field or key up in one version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lookup {
    Found(Value),
    /// Known to hold no value (removed, cleared, or never set in shared
    /// state).
    Absent,
    /// This version says nothing; consult older ones.
    Unknown,
}

#[derive(Debug, Clone)]
pub struct Indexed {
    reads: Bits,
    writes: Bits,
    /// Only written indices carry a value; arrays may be huge and sparse.
    values: Arc<BTreeMap<u32, Value>>,
}

impl Indexed {
    fn new(length: u32) -> Self {
        Self {
            reads: Bits::for_fields(length),
            writes: Bits::for_fields(length),
            values: Arc::new(BTreeMap::new()),
        }
    }

    #[must_use]
    pub fn reads(&self) -> &Bits {
        &self.reads
    }

    #[must_use]
    pub fn writes(&self) -> &Bits {
        &self.writes
    }

    /// Value at `index`, `Null` if never stored.
    #[must_use]
    pub fn value(&self, index: u32) -> &Value {
        static NULL: Value = Value::Null;
        self.values.get(&index).unwrap_or(&NULL)
    }

    fn store(&mut self, index: u32, value: Value) {
        Arc::make_mut(&mut self.values).insert(index, value);
        self.writes.set(index);
    }
}

#[derive(Debug, Clone)]
pub struct Keyed {
    table: KeyedTable<Value, Value>,
    read_all: bool,
}

impl Keyed {
    #[must_use]
    pub fn table(&self) -> &KeyedTable<Value, Value> {
        &self.table
    }

    /// The whole collection was enumerated.
    #[must_use]
    pub const fn read_all(&self) -> bool {
        self.read_all
    }
}

#[derive(Debug, Clone)]
pub enum Payload {
    Indexed(Indexed),
    Keyed(Keyed),
}

#[derive(Debug, Clone)]
pub struct Version {
    object: ObjectId,
    role: VersionRole,
    payload: Payload,
}

impl Version {
    fn empty(object: &TObject, role: VersionRole) -> Self {
        let payload = if object.is_keyed() {
            Payload::Keyed(Keyed {
                table: KeyedTable::new(),
                read_all: false,
            })
        } else {
            Payload::Indexed(Indexed::new(object.length()))
        };
        Self {
            object: object.id(),
            role,
            payload,
        }
    }

    #[must_use]
    pub fn delta(object: &TObject) -> Self {
        Self::empty(object, VersionRole::Delta)
    }

    #[must_use]
    pub fn shared(object: &TObject) -> Self {
        Self::empty(object, VersionRole::Shared)
    }

    /// Indexed delta from decoded parts.
    #[must_use]
    pub fn indexed_delta(object: ObjectId, writes: Bits, values: BTreeMap<u32, Value>) -> Self {
        let reads = if writes.is_fixed() {
            Bits::fixed()
        } else {
            Bits::for_fields(u32::MAX)
        };
        Self {
            object,
            role: VersionRole::Delta,
            payload: Payload::Indexed(Indexed {
                reads,
                writes,
                values: Arc::new(values),
            }),
        }
    }

    /// Keyed delta from decoded parts.
    #[must_use]
    pub fn keyed_delta(object: ObjectId, table: KeyedTable<Value, Value>) -> Self {
        Self {
            object,
            role: VersionRole::Delta,
            payload: Payload::Keyed(Keyed {
                table,
                read_all: false,
            }),
        }
    }

    #[must_use]
    pub const fn object(&self) -> ObjectId {
        self.object
    }

    #[must_use]
    pub const fn role(&self) -> VersionRole {
        self.role
    }

    #[must_use]
    pub const fn payload(&self) -> &Payload {
        &self.payload
    }

    #[must_use]
    pub fn kind(&self) -> VersionKind {
        match &self.payload {
            Payload::Indexed(indexed) if indexed.writes.is_fixed() && indexed.reads.is_fixed() => {
                VersionKind::Indexed32
            }
            Payload::Indexed(_) => VersionKind::IndexedN,
            Payload::Keyed(_) => VersionKind::Keyed,
        }
    }

    fn indexed_mut(&mut self) -> Result<&mut Indexed> {
        match &mut self.payload {
            Payload::Indexed(indexed) => Ok(indexed),
            Payload::Keyed(_) => Err(FabricError::TypeMismatch {
                expected: "indexed version",
                actual: "keyed version",
            }),
        }
    }

    fn keyed_mut(&mut self) -> Result<&mut Keyed> {
        match &mut self.payload {
            Payload::Keyed(keyed) => Ok(keyed),
            Payload::Indexed(_) => Err(FabricError::TypeMismatch {
                expected: "keyed version",
                actual: "indexed version",
            }),
        }
    }

    // -----------------------------------------------------------------------
    // Indexed access
    // -----------------------------------------------------------------------

    pub fn record_read(&mut self, index: u32) -> Result<()> {
        self.indexed_mut()?.reads.set(index);
        Ok(())
    }

    pub fn write(&mut self, index: u32, value: Value) -> Result<()> {
        self.indexed_mut()?.store(index, value);
        Ok(())
    }

    #[must_use]
    pub fn lookup(&self, index: u32) -> Lookup {
        match &self.payload {
            Payload::Indexed(indexed) if indexed.writes.get(index) => {
                Lookup::Found(indexed.value(index).clone())
            }
            Payload::Indexed(_) if self.role == VersionRole::Shared => Lookup::Absent,
            Payload::Indexed(_) | Payload::Keyed(_) => Lookup::Unknown,
        }
    }

    // -----------------------------------------------------------------------
    // Keyed access
    // -----------------------------------------------------------------------

    pub fn record_key_read(&mut self, key: Value) -> Result<()> {
        self.keyed_mut()?.table.mark_read(key)
    }

    pub fn record_read_all(&mut self) -> Result<()> {
        self.keyed_mut()?.read_all = true;
        Ok(())
    }

    pub fn put(&mut self, key: Value, value: Value) -> Result<()> {
        let keyed = self.keyed_mut()?;
        let update = keyed
            .table
            .find(&key)?
            .is_some_and(KeyedEntry::is_read);
        keyed.table.insert(
            Held::strong(key),
            EntryValue::Value(Held::strong(value)),
            update,
        )?;
        Ok(())
    }

    pub fn remove(&mut self, key: Value) -> Result<()> {
        let keyed = self.keyed_mut()?;
        let update = keyed
            .table
            .find(&key)?
            .is_some_and(KeyedEntry::is_read);
        keyed
            .table
            .insert(Held::strong(key), EntryValue::Removal, update)?;
        Ok(())
    }

    pub fn clear(&mut self) -> Result<()> {
        self.keyed_mut()?.table.clear();
        Ok(())
    }

    pub fn lookup_key(&self, key: &Value) -> Result<Lookup> {
        let Payload::Keyed(keyed) = &self.payload else {
            return Err(FabricError::TypeMismatch {
                expected: "keyed version",
                actual: "indexed version",
            });
        };
        match keyed.table.find(key)?.map(KeyedEntry::value) {
            Some(EntryValue::Value(held)) => {
                return Ok(held
                    .upgrade()
                    .map_or(Lookup::Absent, |v| Lookup::Found((*v).clone())));
            }
            Some(EntryValue::Removal) => return Ok(Lookup::Absent),
            Some(EntryValue::Read) | None => {}
        }
        if keyed.table.is_cleared() || self.role == VersionRole::Shared {
            Ok(Lookup::Absent)
        } else {
            Ok(Lookup::Unknown)
        }
    }

    // -----------------------------------------------------------------------
    // Sets
    // -----------------------------------------------------------------------

    #[must_use]
    pub fn has_writes(&self) -> bool {
        match &self.payload {
            Payload::Indexed(indexed) => !indexed.writes.is_empty(),
            Payload::Keyed(keyed) => {
                keyed.table.is_cleared() || keyed.table.entries().any(|e| e.value().is_write())
            }
        }
    }

    #[must_use]
    pub fn has_reads(&self) -> bool {
        match &self.payload {
            Payload::Indexed(indexed) => !indexed.reads.is_empty(),
            Payload::Keyed(keyed) => keyed.read_all || keyed.table.entries().any(KeyedEntry::is_read),
        }
    }

    /// Copy carrying only the write set, as published to other transactions.
    pub fn without_reads(&self) -> Result<Self> {
        let payload = match &self.payload {
            Payload::Indexed(indexed) => Payload::Indexed(Indexed {
                reads: if indexed.reads.is_fixed() {
                    Bits::fixed()
                } else {
                    Bits::for_fields(u32::MAX)
                },
                writes: indexed.writes.clone(),
                values: Arc::clone(&indexed.values),
            }),
            Payload::Keyed(keyed) => {
                let mut table = KeyedTable::with_capacity(keyed.table.len());
                if keyed.table.is_cleared() {
                    table.clear();
                }
                for entry in keyed.table.entries() {
                    if let (true, Some(key)) = (entry.value().is_write(), entry.key()) {
                        table.insert(Held::Strong(key), entry.value().clone(), false)?;
                    }
                }
                Payload::Keyed(Keyed {
                    table,
                    read_all: false,
                })
            }
        };
        Ok(Self {
            object: self.object,
            role: self.role,
            payload,
        })
    }

    /// Shared-role copy of this delta's writes, used to seed base state.
    pub fn to_shared(&self) -> Result<Self> {
        let mut shared = self.without_reads()?;
        shared.role = VersionRole::Shared;
        Ok(shared)
    }

    /// Live key/value pairs of a keyed version.
    pub fn live_entries(&self) -> Result<Vec<(Value, Value)>> {
        let Payload::Keyed(keyed) = &self.payload else {
            return Err(FabricError::TypeMismatch {
                expected: "keyed version",
                actual: "indexed version",
            });
        };
        Ok(keyed
            .table
            .entries()
            .filter_map(|entry| match (entry.key(), entry.current()) {
                (Some(key), Some(value)) => Some(((*key).clone(), (*value).clone())),
                _ => None,
            })
            .collect())
    }

    // -----------------------------------------------------------------------
    // Merge
    // -----------------------------------------------------------------------

    /// Fold `next` into `self` according to `flags`.
    ///
    /// `CLONE` is honoured by [`Version::merge_into`]; here the target is
    /// always mutated.
    pub fn merge(&mut self, next: &Self, flags: MergeFlags) -> Result<()> {
        if self.object != next.object {
            return Err(FabricError::internal(format!(
                "merging {} into {}",
                next.object, self.object
            )));
        }
        let role = self.role;
        match (&mut self.payload, &next.payload) {
            (Payload::Indexed(target), Payload::Indexed(source)) => {
                if flags.contains(MergeFlags::COPY_ARRAYS) {
                    target.values = Arc::new((*target.values).clone());
                }
                for index in source.writes.indices() {
                    target.store(index, source.value(index).clone());
                }
                if flags.contains(MergeFlags::READS) && role == VersionRole::Delta {
                    target.reads.merge_in(&source.reads);
                }
            }
            (Payload::Keyed(target), Payload::Keyed(source)) => {
                let mode = match role {
                    VersionRole::Shared => MergeMode::Apply,
                    VersionRole::Delta => MergeMode::Fold {
                        reads: flags.contains(MergeFlags::READS),
                    },
                };
                target.table.merge_from(&source.table, mode)?;
                if flags.contains(MergeFlags::READS) && role == VersionRole::Delta {
                    target.read_all |= source.read_all;
                }
                if flags.contains(MergeFlags::COPY_ARRAY_ELEMENTS) {
                    detach_values(&mut target.table)?;
                }
            }
            _ => {
                return Err(FabricError::TypeMismatch {
                    expected: "matching version payloads",
                    actual: "indexed and keyed",
                });
            }
        }
        Ok(())
    }

    /// Fold `next` into a shared handle. With `CLONE` (or when the handle is
    /// aliased) the merge happens on a copy; with `PRIVATE` on a unique handle
    /// it happens in place.
    pub fn merge_into(target: &mut Arc<Self>, next: &Self, flags: MergeFlags) -> Result<()> {
        if flags.contains(MergeFlags::CLONE) {
            let mut copy = (**target).clone();
            copy.merge(next, flags)?;
            *target = Arc::new(copy);
            return Ok(());
        }
        Arc::make_mut(target).merge(next, flags)
    }

    /// Drop incoming writes to read-only fields that the authoritative
    /// state already holds. `written` is the set of fields committed so far
    /// and must be read immediately before the merge that follows. Returns
    /// how many writes were dropped.
    pub fn merge_read_only_fields(&mut self, written: &Bits, read_only: &Bits) -> u32 {
        let Payload::Indexed(incoming) = &mut self.payload else {
            return 0;
        };
        let guarded: Bits = incoming
            .writes
            .indices()
            .into_iter()
            .filter(|i| read_only.get(*i) && written.get(*i))
            .collect();
        if guarded.is_empty() {
            return 0;
        }
        incoming.writes = Bits::and_not(&incoming.writes, &guarded);
        guarded.count()
    }

    /// Fields this version writes; empty for keyed payloads.
    #[must_use]
    pub fn written_fields(&self) -> Bits {
        match &self.payload {
            Payload::Indexed(indexed) => indexed.writes.clone(),
            Payload::Keyed(_) => Bits::fixed(),
        }
    }

    // -----------------------------------------------------------------------
    // Validation
    // -----------------------------------------------------------------------

    /// Whether `write` overwrote anything this delta read.
    ///
    /// A panic in key comparison counts as a conflict.
    #[must_use]
    pub fn conflicts_with(&self, write: &Self) -> bool {
        match (&self.payload, &write.payload) {
            (Payload::Indexed(read), Payload::Indexed(write)) => {
                Bits::intersects(&read.reads, &write.writes)
            }
            (Payload::Keyed(read), Payload::Keyed(write)) => {
                keyed_conflict(read, write).unwrap_or_else(|err| {
                    tracing::warn!(object = %self.object, %err, "key comparison failed during validation");
                    true
                })
            }
            _ => true,
        }
    }
}

fn keyed_conflict(read: &Keyed, write: &Keyed) -> Result<bool> {
    let write_touches = write.table.is_cleared()
        || write.table.entries().any(|e| e.value().is_write());
    if !write_touches {
        return Ok(false);
    }
    if read.read_all {
        return Ok(true);
    }
    if write.table.is_cleared() && read.table.entries().any(KeyedEntry::is_read) {
        return Ok(true);
    }
    for entry in read.table.entries().filter(|e| e.is_read()) {
        let Some(key) = entry.key() else {
            continue;
        };
        if write
            .table
            .find(&key)?
            .is_some_and(|w| w.value().is_write())
        {
            return Ok(true);
        }
    }
    Ok(false)
}

fn detach_values(table: &mut KeyedTable<Value, Value>) -> Result<()> {
    let owned: Vec<_> = table
        .entries()
        .filter_map(|entry| match entry.value() {
            EntryValue::Value(Held::Strong(value)) => entry
                .key()
                .map(|key| (key, Arc::new((**value).clone()), entry.is_update())),
            _ => None,
        })
        .collect();
    for (key, value, update) in owned {
        table.insert(
            Held::Strong(key),
            EntryValue::Value(Held::Strong(value)),
            update,
        )?;
    }
    Ok(())
}
