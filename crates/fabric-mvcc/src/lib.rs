//! Snapshot-based MVCC for replicated objects.
//!
//! Each branch publishes an immutable [`Snapshot`] through a single atomic
//! pointer. Transactions read from the snapshot they started on, record
//! what they touched in private version maps, and commit by validating and
//! appending with a compare-and-swap. Acknowledger walks observe snapshot
//! growth asynchronously to feed stores, gate commits on external
//! authorities and fold acknowledged maps away.

pub mod acknowledger;
pub mod branch;
mod chain;
pub mod config;
pub mod interceptor;
pub mod merger;
pub mod object;
pub mod observability;
pub mod site;
pub mod snapshot;
pub mod store;
pub mod transaction;
pub mod version;
pub mod version_map;

pub use acknowledger::{AckSlot, AckVisitor, LastAcknowledged, Visit, WalkOutcome, Walker};
pub use branch::Branch;
pub use config::FabricConfig;
pub use interceptor::{Interception, Interceptor, Outbound};
pub use merger::{
    MERGE_BUSY_INTERVAL, MERGE_IDLE_INTERVAL, MergeScheduler, MergeTickResult, Merger,
    merge_backlog,
};
pub use object::{
    ClassDescriptor, ClassShape, ObjectModel, RegistryModel, TObject, builtin_descriptor,
};
pub use observability::{
    CasMetricsSnapshot, CasRetriesHistogram, CommitMetricsSnapshot, InterceptionMetricsSnapshot,
    SharedObserver, cas_metrics_snapshot, commit_metrics_snapshot, interception_metrics_snapshot,
    reset_cas_metrics, reset_commit_metrics, reset_interception_metrics,
};
pub use site::{LOCAL_DISTANCE, Site};
pub use snapshot::{SlowChanging, Snapshot};
pub use store::{
    FetchCallback, Fetched, InsertCallback, MemoryStore, Store, StoreAcknowledger, StoreKey,
};
pub use transaction::{CommitTicket, Transaction, TxnState};
pub use version::{Indexed, Keyed, Lookup, MergeFlags, Payload, Version, VersionKind, VersionRole};
pub use version_map::VersionMap;
