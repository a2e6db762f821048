//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Instant;

use fabric::{
    ClassDescriptor, ClassId, ClassShape, Connection, ConnectionId, FabricConfig, Loopback,
    ReplicationMode, Site, WireConfig, site_with_classes,
};

/// Two indexed fields.
pub const POINT: ClassId = ClassId::new(1);

pub fn site(seed: &[u8]) -> Arc<Site> {
    site_with_config(seed, FabricConfig::default())
}

pub fn site_with_config(seed: &[u8], config: FabricConfig) -> Arc<Site> {
    site_with_classes(
        seed,
        [ClassDescriptor::new(POINT, "Point", ClassShape::Fields { count: 2 })],
        config,
    )
    .unwrap()
}

pub fn connection(site: &Arc<Site>, id: u64, now: Instant) -> Connection {
    connection_with(site, id, WireConfig::default(), now)
}

pub fn connection_with(site: &Arc<Site>, id: u64, config: WireConfig, now: Instant) -> Connection {
    Connection::new(ConnectionId::new(id).unwrap(), Arc::clone(site), config, now).unwrap()
}

/// `left` replicates to `right` in `mode`.
pub fn pair(
    left: &Arc<Site>,
    right: &Arc<Site>,
    mode: ReplicationMode,
    chunk: usize,
    now: Instant,
) -> Loopback {
    let l = connection(left, 1, now).with_replication(mode);
    let r = connection(right, 2, now);
    Loopback::new(l, r, chunk)
}
