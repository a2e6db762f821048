//! Public API facade for the fabric engine.
//!
//! Re-exports the pieces an application needs: sites, branches and
//! transactions from `fabric-mvcc`, connections from `fabric-wire`, and the
//! shared vocabulary. The member crates stay reachable for anything more
//! specialized.

use std::sync::Arc;

pub use fabric_bits;
pub use fabric_error::{self, CommitStatus, ErrorCode, FabricError, Result};
pub use fabric_mvcc::{
    Branch, ClassDescriptor, ClassShape, CommitTicket, FabricConfig, Interceptor, MemoryStore,
    Merger, ObjectModel, RegistryModel, Site, Snapshot, StoreAcknowledger, TObject, Transaction,
    VersionMap, Walker,
};
pub use fabric_observability::{EventLog, FabricEvent, FabricObserver, NoOpObserver};
pub use fabric_types::{
    BranchId, CallId, ClassId, ConnectionId, InterceptionId, ObjectId, SiteId, TxnFlags, Value,
};
pub use fabric_wire::{
    AcceptAll, Authority, CallFuture, CallHandler, Connection, Loopback, ReplicationMode,
    Validator, WireConfig,
};
pub use fabric_mvcc;
pub use fabric_observability;
pub use fabric_types;
pub use fabric_wire;

/// Build a site over a [`RegistryModel`] holding `classes`.
pub fn site_with_classes(
    seed: &[u8],
    classes: impl IntoIterator<Item = ClassDescriptor>,
    config: FabricConfig,
) -> Result<Arc<Site>> {
    let model = RegistryModel::new();
    for class in classes {
        model.register(class)?;
    }
    let model: Arc<dyn ObjectModel> = Arc::new(model);
    Site::new(SiteId::derive(seed), model, config, None)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn site_with_classes_registers_every_class() {
        let site = site_with_classes(
            b"facade",
            [ClassDescriptor::new(ClassId::new(4), "Cell", ClassShape::Fields { count: 1 })],
            FabricConfig::default(),
        )
        .unwrap();
        let cell = site.create_object(ClassId::new(4), &[], 0).unwrap();
        assert_eq!(cell.class().name(), "Cell");
        assert!(site.create_object(ClassId::new(5), &[], 0).is_err());
    }
}
