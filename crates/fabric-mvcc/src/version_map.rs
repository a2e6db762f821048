//! The set of versions produced by one transaction.
//!
//! A map is private and mutable while its transaction runs. At commit the
//! read sets are stripped, the map is stamped with its sequence position and
//! it becomes an immutable member of a [`Snapshot`](crate::Snapshot).

use std::collections::BTreeMap;
use std::sync::Arc;

use fabric_error::{FabricError, Result};
use fabric_types::{BranchId, ConnectionId, InterceptionId, ObjectId, TxnId};

use crate::object::TObject;
use crate::snapshot::Snapshot;
use crate::version::{MergeFlags, Version};

#[derive(Debug, Clone)]
pub struct VersionMap {
    branch: BranchId,
    seq: u64,
    txn: Option<TxnId>,
    /// Connection the map arrived from, if it was applied remotely.
    source: Option<ConnectionId>,
    interception: Option<InterceptionId>,
    versions: Arc<BTreeMap<ObjectId, Version>>,
}

impl VersionMap {
    #[must_use]
    pub fn new(branch: BranchId) -> Self {
        Self {
            branch,
            seq: 0,
            txn: None,
            source: None,
            interception: None,
            versions: Arc::new(BTreeMap::new()),
        }
    }

    /// Map decoded from `source`.
    #[must_use]
    pub fn from_source(branch: BranchId, source: ConnectionId) -> Self {
        Self {
            source: Some(source),
            ..Self::new(branch)
        }
    }

    #[must_use]
    pub const fn branch(&self) -> BranchId {
        self.branch
    }

    /// Position in the branch's history. Meaningless until published.
    #[must_use]
    pub const fn seq(&self) -> u64 {
        self.seq
    }

    #[must_use]
    pub const fn txn(&self) -> Option<TxnId> {
        self.txn
    }

    #[must_use]
    pub const fn source(&self) -> Option<ConnectionId> {
        self.source
    }

    #[must_use]
    pub const fn interception(&self) -> Option<InterceptionId> {
        self.interception
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.versions.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.versions.is_empty()
    }

    #[must_use]
    pub fn get(&self, object: ObjectId) -> Option<&Version> {
        self.versions.get(&object)
    }

    pub fn versions(&self) -> impl Iterator<Item = &Version> {
        self.versions.values()
    }

    pub fn objects(&self) -> impl Iterator<Item = ObjectId> + '_ {
        self.versions.keys().copied()
    }

    /// Version for `object`, created empty on first touch.
    pub fn version_mut(&mut self, object: &TObject) -> &mut Version {
        Arc::make_mut(&mut self.versions)
            .entry(object.id())
            .or_insert_with(|| Version::delta(object))
    }

    pub fn get_mut(&mut self, object: ObjectId) -> Option<&mut Version> {
        Arc::make_mut(&mut self.versions).get_mut(&object)
    }

    /// Insert a decoded version, replacing any previous one for its object.
    pub fn insert(&mut self, version: Version) -> Option<Version> {
        Arc::make_mut(&mut self.versions).insert(version.object(), version)
    }

    #[must_use]
    pub fn has_writes(&self) -> bool {
        self.versions.values().any(Version::has_writes)
    }

    #[must_use]
    pub fn has_reads(&self) -> bool {
        self.versions.values().any(Version::has_reads)
    }

    /// Fold a committed child layer into this one, reads included.
    pub fn merge_child(&mut self, child: &Self) -> Result<()> {
        let versions = Arc::make_mut(&mut self.versions);
        for (object, version) in child.versions.iter() {
            match versions.get_mut(object) {
                Some(existing) => {
                    existing.merge(version, MergeFlags::PRIVATE | MergeFlags::READS)?;
                }
                None => {
                    versions.insert(*object, version.clone());
                }
            }
        }
        Ok(())
    }

    /// Publishable copy: read sets stripped, read-only versions dropped.
    pub fn writes_only(&self) -> Result<Self> {
        let mut versions = BTreeMap::new();
        for (object, version) in self.versions.iter() {
            if version.has_writes() {
                versions.insert(*object, version.without_reads()?);
            }
        }
        Ok(Self {
            versions: Arc::new(versions),
            ..self.clone()
        })
    }

    /// Header copy stamped for one publication attempt. Versions are shared.
    #[must_use]
    pub fn with_position(
        &self,
        seq: u64,
        txn: Option<TxnId>,
        interception: Option<InterceptionId>,
    ) -> Self {
        Self {
            seq,
            txn,
            interception,
            ..self.clone()
        }
    }

    /// Check this map's reads against every map of `snapshot` in
    /// `[start, stop)`.
    ///
    /// Maps that arrived over the same connection as this one are skipped.
    /// Returns the first conflict found.
    pub fn valid_against(&self, snapshot: &Snapshot, start: u64, stop: u64) -> Result<()> {
        if start >= stop {
            return Ok(());
        }
        if start < snapshot.base_seq() {
            return Err(FabricError::SnapshotTooOld {
                start,
                base: snapshot.base_seq(),
            });
        }
        for (object, read) in self.versions.iter() {
            if !read.has_reads() {
                continue;
            }
            match snapshot.last_write(*object) {
                Some(last) if last >= start => {}
                _ => continue,
            }
            for seq in start..stop {
                let Some(map) = snapshot.map_at(seq) else {
                    break;
                };
                if self.source.is_some() && map.source == self.source {
                    continue;
                }
                if let Some(write) = map.get(*object) {
                    if read.conflicts_with(write) {
                        tracing::debug!(
                            branch = %self.branch,
                            object = %object,
                            against = seq,
                            "read invalidated by concurrent write"
                        );
                        return Err(FabricError::conflict(self.branch.get(), Some(object.get())));
                    }
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::{ClassDescriptor, ClassShape};
    use crate::version::Lookup;
    use fabric_types::{ClassId, Value};

    fn branch() -> BranchId {
        BranchId::new(1).unwrap()
    }

    fn object(id: u64) -> TObject {
        let class = ClassDescriptor::new(ClassId::new(1), "T", ClassShape::Fields { count: 4 });
        TObject::new(ObjectId::new(id).unwrap(), Arc::new(class), 0)
    }

    fn writing(obj: &TObject, index: u32, value: i32) -> VersionMap {
        let mut map = VersionMap::new(branch());
        map.version_mut(obj).write(index, Value::I32(value)).unwrap();
        map
    }

    fn publish(snapshot: &Snapshot, map: &VersionMap) -> Snapshot {
        let stamped = map.writes_only().unwrap().with_position(snapshot.end(), None, None);
        snapshot.appended(Arc::new(stamped), None)
    }

    #[test]
    fn child_merge_carries_reads_and_writes() {
        let a = object(1);
        let mut parent = VersionMap::new(branch());
        parent.version_mut(&a).write(0, Value::I32(1)).unwrap();
        let mut child = VersionMap::new(branch());
        child.version_mut(&a).record_read(1).unwrap();
        child.version_mut(&a).write(0, Value::I32(2)).unwrap();
        parent.merge_child(&child).unwrap();
        let merged = parent.get(a.id()).unwrap();
        assert!(merged.has_reads());
        assert_eq!(merged.lookup(0), Lookup::Found(Value::I32(2)));
    }

    #[test]
    fn writes_only_drops_pure_reads() {
        let (a, b) = (object(1), object(2));
        let mut map = writing(&a, 0, 1);
        map.version_mut(&a).record_read(3).unwrap();
        map.version_mut(&b).record_read(0).unwrap();
        let published = map.writes_only().unwrap();
        assert_eq!(published.len(), 1);
        assert!(!published.has_reads());
        assert!(published.has_writes());
    }

    #[test]
    fn validation_finds_overwritten_read() {
        let a = object(1);
        let empty = Snapshot::empty(branch());
        let after = publish(&empty, &writing(&a, 0, 7));

        let mut reader = VersionMap::new(branch());
        reader.version_mut(&a).record_read(0).unwrap();
        let err = reader.valid_against(&after, 0, after.end()).unwrap_err();
        assert!(matches!(err, FabricError::Conflict { object: Some(1), .. }));

        let mut other = VersionMap::new(branch());
        other.version_mut(&a).record_read(1).unwrap();
        assert!(other.valid_against(&after, 0, after.end()).is_ok());
        // Nothing committed after the reader started.
        assert!(reader.valid_against(&after, after.end(), after.end()).is_ok());
    }

    #[test]
    fn same_source_never_conflicts() {
        let a = object(1);
        let source = ConnectionId::new(9).unwrap();
        let mut remote = VersionMap::from_source(branch(), source);
        remote.version_mut(&a).write(0, Value::I32(1)).unwrap();
        let snapshot = publish(&Snapshot::empty(branch()), &remote);

        let mut reader = VersionMap::from_source(branch(), source);
        reader.version_mut(&a).record_read(0).unwrap();
        assert!(reader.valid_against(&snapshot, 0, snapshot.end()).is_ok());

        let mut local = VersionMap::new(branch());
        local.version_mut(&a).record_read(0).unwrap();
        assert!(local.valid_against(&snapshot, 0, snapshot.end()).is_err());
    }

    #[test]
    fn stamping_shares_versions() {
        let a = object(1);
        let map = writing(&a, 0, 1);
        let stamped = map.with_position(5, TxnId::new(3), InterceptionId::new(2));
        assert_eq!(stamped.seq(), 5);
        assert_eq!(stamped.interception().map(InterceptionId::get), Some(2));
        assert!(Arc::ptr_eq(&map.versions, &stamped.versions));
    }
}
