//! Process-wide context.
//!
//! A [`Site`] owns everything a process shares between its components: the
//! object model, configuration, observer, the branches and objects it
//! knows, identity allocation and acknowledger slots. It is constructed
//! once at startup and handed to connections and walkers explicitly.

use std::borrow::Borrow;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use fabric_bits::FixedBits;
use fabric_error::{FabricError, Result};
use fabric_types::{BranchId, ClassId, IdSequence, ObjectId, SiteId};
use parking_lot::{Mutex, RwLock};

use crate::acknowledger::AckSlot;
use crate::branch::Branch;
use crate::config::FabricConfig;
use crate::object::{ObjectModel, TObject};
use crate::observability::SharedObserver;
use crate::version_map::VersionMap;

/// Bits of a locally allocated id below the site prefix.
const LOCAL_ID_BITS: u32 = 40;

/// Distance to a branch that originates on this site.
pub const LOCAL_DISTANCE: u32 = 0;

pub struct Site {
    id: SiteId,
    model: Arc<dyn ObjectModel>,
    config: FabricConfig,
    observer: SharedObserver,
    branches: RwLock<BTreeMap<BranchId, Arc<Branch>>>,
    objects: RwLock<HashMap<ObjectId, Arc<TObject>>>,
    branch_ids: IdSequence,
    object_ids: IdSequence,
    ack_slots: Mutex<FixedBits>,
    /// Hops to each branch's origin, as learned from peers.
    distances: Mutex<HashMap<BranchId, u32>>,
}

impl fmt::Debug for Site {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Site")
            .field("id", &self.id)
            .field("branches", &self.branches.read().len())
            .field("objects", &self.objects.read().len())
            .finish_non_exhaustive()
    }
}

impl Site {
    pub fn new(
        id: SiteId,
        model: Arc<dyn ObjectModel>,
        config: FabricConfig,
        observer: SharedObserver,
    ) -> Result<Arc<Self>> {
        config.validate()?;
        let first = (id_prefix(id) << LOCAL_ID_BITS) | 1;
        tracing::info!(site = %id, "site initialized");
        Ok(Arc::new(Self {
            id,
            model,
            config,
            observer,
            branches: RwLock::new(BTreeMap::new()),
            objects: RwLock::new(HashMap::new()),
            branch_ids: IdSequence::starting_at(first),
            object_ids: IdSequence::starting_at(first),
            ack_slots: Mutex::new(FixedBits::default()),
            distances: Mutex::new(HashMap::new()),
        }))
    }

    #[must_use]
    pub const fn id(&self) -> SiteId {
        self.id
    }

    #[must_use]
    pub fn model(&self) -> &Arc<dyn ObjectModel> {
        &self.model
    }

    #[must_use]
    pub const fn config(&self) -> &FabricConfig {
        &self.config
    }

    // -----------------------------------------------------------------------
    // Branches
    // -----------------------------------------------------------------------

    /// Create a branch originating on this site.
    pub fn create_branch(&self) -> Result<Arc<Branch>> {
        let id = self
            .branch_ids
            .alloc()
            .and_then(|raw| BranchId::new(raw.get()))
            .ok_or_else(|| FabricError::internal(format!("{} exhausted branch ids", self.id)))?;
        let branch = Branch::new(id, self.config, self.observer.clone());
        self.branches.write().insert(id, Arc::clone(&branch));
        self.distances.lock().insert(id, LOCAL_DISTANCE);
        tracing::debug!(site = %self.id, branch = %id, "branch created");
        Ok(branch)
    }

    /// The local replica of `id`, created on first use.
    pub fn open_branch(&self, id: BranchId) -> Arc<Branch> {
        if let Some(branch) = self.branches.read().get(&id) {
            return Arc::clone(branch);
        }
        let mut branches = self.branches.write();
        Arc::clone(
            branches
                .entry(id)
                .or_insert_with(|| Branch::new(id, self.config, self.observer.clone())),
        )
    }

    #[must_use]
    pub fn branch(&self, id: BranchId) -> Option<Arc<Branch>> {
        self.branches.read().get(&id).cloned()
    }

    /// Every known branch, in id order.
    #[must_use]
    pub fn branches(&self) -> Vec<Arc<Branch>> {
        self.branches.read().values().cloned().collect()
    }

    // -----------------------------------------------------------------------
    // Objects
    // -----------------------------------------------------------------------

    /// Instantiate a new object with a fresh id.
    pub fn create_object(
        &self,
        class: ClassId,
        generics: &[ClassId],
        length: u32,
    ) -> Result<Arc<TObject>> {
        let id = self
            .object_ids
            .alloc()
            .and_then(|raw| ObjectId::new(raw.get()))
            .ok_or_else(|| FabricError::internal(format!("{} exhausted object ids", self.id)))?;
        let object = Arc::new(self.model.instantiate(class, generics, id, length)?);
        self.objects.write().insert(id, Arc::clone(&object));
        Ok(object)
    }

    /// Register an object first seen on the wire. An id already known
    /// returns the existing handle.
    pub fn import_object(
        &self,
        id: ObjectId,
        class: ClassId,
        generics: &[ClassId],
        length: u32,
    ) -> Result<Arc<TObject>> {
        if let Some(known) = self.objects.read().get(&id) {
            if known.class_id() != class {
                return Err(FabricError::Protocol {
                    detail: format!("{id} is a {}, not a {class}", known.class_id()),
                });
            }
            return Ok(Arc::clone(known));
        }
        let object = Arc::new(self.model.instantiate(class, generics, id, length)?);
        let mut objects = self.objects.write();
        Ok(Arc::clone(objects.entry(id).or_insert(object)))
    }

    #[must_use]
    pub fn object(&self, id: ObjectId) -> Option<Arc<TObject>> {
        self.objects.read().get(&id).cloned()
    }

    /// Forget an object no peer references any more.
    pub fn release_object(&self, id: ObjectId) -> bool {
        self.objects.write().remove(&id).is_some()
    }

    #[must_use]
    pub fn object_count(&self) -> usize {
        self.objects.read().len()
    }

    // -----------------------------------------------------------------------
    // Acknowledger slots
    // -----------------------------------------------------------------------

    pub fn allocate_ack_slot(&self) -> Result<AckSlot> {
        let mut used = self.ack_slots.lock();
        let free = (0..AckSlot::COUNT as u32)
            .find(|slot| !used.get(*slot))
            .ok_or_else(|| FabricError::invalid_state("every acknowledger slot is taken"))?;
        used.set(free);
        AckSlot::new(free).ok_or_else(|| FabricError::internal("slot index out of range"))
    }

    pub fn release_ack_slot(&self, slot: AckSlot) {
        self.ack_slots.lock().unset(slot.get());
    }

    // -----------------------------------------------------------------------
    // Replication
    // -----------------------------------------------------------------------

    /// Publish a map decoded from a peer on the local replica of its
    /// branch, protecting read-only fields of known objects.
    pub fn apply_remote(&self, map: &VersionMap) -> Result<u64> {
        self.apply_remote_batch(map.branch(), &[map])
    }

    /// Publish the maps of one released interception on `branch` as a
    /// single installation.
    pub fn apply_remote_batch<M: Borrow<VersionMap>>(
        &self,
        branch: BranchId,
        maps: &[M],
    ) -> Result<u64> {
        let branch = self.open_branch(branch);
        let read_only = |object: ObjectId| {
            self.object(object)
                .filter(|o| o.class().has_read_only_fields())
                .map(|o| o.class().read_only_bits())
        };
        branch.apply_remote_batch(maps, &read_only)
    }

    /// Record a peer's reported distance; the shortest route wins.
    pub fn learn_distance(&self, branch: BranchId, peer_distance: u32) {
        let via = peer_distance.saturating_add(1);
        let mut distances = self.distances.lock();
        let known = distances.entry(branch).or_insert(via);
        *known = (*known).min(via);
    }

    /// Hops to the origin of `branch`; `None` when unknown or when the
    /// branch is blocked by a disconnection.
    #[must_use]
    pub fn distance_to(&self, branch: BranchId) -> Option<u32> {
        if self.branch(branch).is_some_and(|b| b.is_blocked()) {
            return None;
        }
        self.distances.lock().get(&branch).copied()
    }

    /// Every reachable branch with its distance, in id order.
    #[must_use]
    pub fn distances(&self) -> Vec<(BranchId, u32)> {
        let known: Vec<(BranchId, u32)> = {
            let distances = self.distances.lock();
            let mut known: Vec<_> = distances.iter().map(|(b, d)| (*b, *d)).collect();
            known.sort_unstable();
            known
        };
        known
            .into_iter()
            .filter(|(branch, _)| !self.branch(*branch).is_some_and(|b| b.is_blocked()))
            .collect()
    }

    /// Drop learned routes, e.g. after the connection they came from closed.
    pub fn forget_distance(&self, branch: BranchId) {
        let mut distances = self.distances.lock();
        if distances.get(&branch) != Some(&LOCAL_DISTANCE) {
            distances.remove(&branch);
        }
    }
}

/// Non-zero 24-bit prefix derived from a site id, so ids allocated on
/// different sites do not collide.
fn id_prefix(site: SiteId) -> u64 {
    let bytes = site.as_bytes();
    let prefix = (u64::from(bytes[0]) << 16) | (u64::from(bytes[1]) << 8) | u64::from(bytes[2]);
    prefix.max(1)
}
