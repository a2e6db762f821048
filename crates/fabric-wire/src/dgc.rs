//! Distributed reference counting.
//!
//! A peer sends `DGC_REFERENCE` each time it hands out a reference to one of
//! our objects and `DGC_RELEASE` when it drops one. Objects whose count
//! returns to zero are reported as collectable.

use std::collections::HashMap;

use fabric_error::{FabricError, Result};
use fabric_types::ObjectId;

/// Per-connection counts of references held by the peer.
#[derive(Debug, Default)]
pub struct RemoteReferences {
    counts: HashMap<ObjectId, u32>,
}

impl RemoteReferences {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the new count.
    pub fn reference(&mut self, object: ObjectId) -> u32 {
        let count = self.counts.entry(object).or_insert(0);
        *count = count.saturating_add(1);
        *count
    }

    /// Returns `true` when this released the last reference.
    pub fn release(&mut self, object: ObjectId) -> Result<bool> {
        let Some(count) = self.counts.get_mut(&object) else {
            return Err(FabricError::protocol(format!(
                "DGC release of unreferenced {object}"
            )));
        };
        *count -= 1;
        if *count == 0 {
            self.counts.remove(&object);
            tracing::debug!(%object, "dgc: last remote reference released");
            return Ok(true);
        }
        Ok(false)
    }

    #[must_use]
    pub fn count(&self, object: ObjectId) -> u32 {
        self.counts.get(&object).copied().unwrap_or(0)
    }

    /// Objects with at least one remote reference.
    #[must_use]
    pub fn len(&self) -> usize {
        self.counts.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }

    /// Forget every reference (the peer is gone). Returns the objects that
    /// were referenced, in id order.
    pub fn drain(&mut self) -> Vec<ObjectId> {
        let mut objects: Vec<ObjectId> = self.counts.drain().map(|(id, _)| id).collect();
        objects.sort_unstable();
        objects
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn oid(n: u64) -> ObjectId {
        ObjectId::new(n).unwrap()
    }

    #[test]
    fn last_release_is_reported() {
        let mut refs = RemoteReferences::new();
        assert_eq!(refs.reference(oid(1)), 1);
        assert_eq!(refs.reference(oid(1)), 2);
        assert!(!refs.release(oid(1)).unwrap());
        assert_eq!(refs.count(oid(1)), 1);
        assert!(refs.release(oid(1)).unwrap());
        assert!(refs.is_empty());
    }

    #[test]
    fn releasing_unknown_objects_is_a_protocol_error() {
        let mut refs = RemoteReferences::new();
        assert!(matches!(refs.release(oid(5)), Err(FabricError::Protocol { .. })));
        refs.reference(oid(5));
        refs.reference(oid(2));
        assert_eq!(refs.drain(), vec![oid(2), oid(5)]);
        assert_eq!(refs.count(oid(5)), 0);
    }
}
