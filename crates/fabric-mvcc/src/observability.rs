//! MVCC observability integration.
//!
//! Helpers here emit engine events through both `tracing` and an optional
//! observer, and keep process-wide counters for commits, conflicts and CAS
//! retries. All functions are non-blocking.

use std::sync::Arc;
use std::sync::OnceLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use fabric_observability::{FabricEvent, FabricObserver};

/// Optional observer handle. When `None`, emitting costs one branch.
pub type SharedObserver = Option<Arc<dyn FabricObserver>>;

/// Monotonic nanosecond timestamp relative to the first call in this process.
pub fn now_ns() -> u64 {
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    fabric_observability::elapsed_ns(*EPOCH.get_or_init(Instant::now))
}

#[inline]
pub fn emit(observer: &SharedObserver, event: &FabricEvent) {
    if let Some(obs) = observer {
        obs.on_event(event);
    }
}

// ---------------------------------------------------------------------------
// Commit metrics
// ---------------------------------------------------------------------------

static FABRIC_COMMITS_TOTAL: AtomicU64 = AtomicU64::new(0);
static FABRIC_READ_ONLY_COMMITS_TOTAL: AtomicU64 = AtomicU64::new(0);
static FABRIC_CONFLICTS_TOTAL: AtomicU64 = AtomicU64::new(0);
static FABRIC_ABORTS_TOTAL: AtomicU64 = AtomicU64::new(0);
static FABRIC_REMOTE_APPLIES_TOTAL: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CommitMetricsSnapshot {
    pub commits_total: u64,
    pub read_only_commits_total: u64,
    pub conflicts_total: u64,
    pub aborts_total: u64,
    pub remote_applies_total: u64,
}

pub fn record_commit(read_only: bool) {
    if read_only {
        FABRIC_READ_ONLY_COMMITS_TOTAL.fetch_add(1, Ordering::Relaxed);
    } else {
        FABRIC_COMMITS_TOTAL.fetch_add(1, Ordering::Relaxed);
    }
}

pub fn record_conflict() {
    FABRIC_CONFLICTS_TOTAL.fetch_add(1, Ordering::Relaxed);
}

pub fn record_abort() {
    FABRIC_ABORTS_TOTAL.fetch_add(1, Ordering::Relaxed);
}

pub fn record_remote_apply() {
    FABRIC_REMOTE_APPLIES_TOTAL.fetch_add(1, Ordering::Relaxed);
}

#[must_use]
pub fn commit_metrics_snapshot() -> CommitMetricsSnapshot {
    CommitMetricsSnapshot {
        commits_total: FABRIC_COMMITS_TOTAL.load(Ordering::Relaxed),
        read_only_commits_total: FABRIC_READ_ONLY_COMMITS_TOTAL.load(Ordering::Relaxed),
        conflicts_total: FABRIC_CONFLICTS_TOTAL.load(Ordering::Relaxed),
        aborts_total: FABRIC_ABORTS_TOTAL.load(Ordering::Relaxed),
        remote_applies_total: FABRIC_REMOTE_APPLIES_TOTAL.load(Ordering::Relaxed),
    }
}

/// Reset commit metrics to zero (tests/diagnostics).
pub fn reset_commit_metrics() {
    FABRIC_COMMITS_TOTAL.store(0, Ordering::Relaxed);
    FABRIC_READ_ONLY_COMMITS_TOTAL.store(0, Ordering::Relaxed);
    FABRIC_CONFLICTS_TOTAL.store(0, Ordering::Relaxed);
    FABRIC_ABORTS_TOTAL.store(0, Ordering::Relaxed);
    FABRIC_REMOTE_APPLIES_TOTAL.store(0, Ordering::Relaxed);
}

// ---------------------------------------------------------------------------
// CAS metrics
// ---------------------------------------------------------------------------

static FABRIC_CAS_INSTALLS_TOTAL: AtomicU64 = AtomicU64::new(0);
static FABRIC_CAS_RETRIES_LE_1: AtomicU64 = AtomicU64::new(0);
static FABRIC_CAS_RETRIES_LE_2: AtomicU64 = AtomicU64::new(0);
static FABRIC_CAS_RETRIES_LE_4: AtomicU64 = AtomicU64::new(0);
static FABRIC_CAS_RETRIES_GT_4: AtomicU64 = AtomicU64::new(0);
static FABRIC_CAS_WALKER_GIVEUPS: AtomicU64 = AtomicU64::new(0);

/// Histogram of snapshot installs by attempts needed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CasRetriesHistogram {
    pub le_1: u64,
    pub le_2: u64,
    pub le_4: u64,
    pub gt_4: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CasMetricsSnapshot {
    pub installs_total: u64,
    pub retries: CasRetriesHistogram,
    /// Times a walker gave up closing an interception for this run.
    pub walker_giveups: u64,
}

/// Record one successful snapshot install that took `attempts` CAS tries.
pub fn record_cas_install(attempts: u32) {
    FABRIC_CAS_INSTALLS_TOTAL.fetch_add(1, Ordering::Relaxed);
    let bucket = match attempts {
        0 | 1 => &FABRIC_CAS_RETRIES_LE_1,
        2 => &FABRIC_CAS_RETRIES_LE_2,
        3 | 4 => &FABRIC_CAS_RETRIES_LE_4,
        _ => &FABRIC_CAS_RETRIES_GT_4,
    };
    bucket.fetch_add(1, Ordering::Relaxed);
}

pub fn record_walker_giveup() {
    FABRIC_CAS_WALKER_GIVEUPS.fetch_add(1, Ordering::Relaxed);
}

#[must_use]
pub fn cas_metrics_snapshot() -> CasMetricsSnapshot {
    CasMetricsSnapshot {
        installs_total: FABRIC_CAS_INSTALLS_TOTAL.load(Ordering::Relaxed),
        retries: CasRetriesHistogram {
            le_1: FABRIC_CAS_RETRIES_LE_1.load(Ordering::Relaxed),
            le_2: FABRIC_CAS_RETRIES_LE_2.load(Ordering::Relaxed),
            le_4: FABRIC_CAS_RETRIES_LE_4.load(Ordering::Relaxed),
            gt_4: FABRIC_CAS_RETRIES_GT_4.load(Ordering::Relaxed),
        },
        walker_giveups: FABRIC_CAS_WALKER_GIVEUPS.load(Ordering::Relaxed),
    }
}

/// Reset CAS metrics to zero (tests/diagnostics).
pub fn reset_cas_metrics() {
    FABRIC_CAS_INSTALLS_TOTAL.store(0, Ordering::Relaxed);
    FABRIC_CAS_RETRIES_LE_1.store(0, Ordering::Relaxed);
    FABRIC_CAS_RETRIES_LE_2.store(0, Ordering::Relaxed);
    FABRIC_CAS_RETRIES_LE_4.store(0, Ordering::Relaxed);
    FABRIC_CAS_RETRIES_GT_4.store(0, Ordering::Relaxed);
    FABRIC_CAS_WALKER_GIVEUPS.store(0, Ordering::Relaxed);
}

// ---------------------------------------------------------------------------
// Interception metrics
// ---------------------------------------------------------------------------

static FABRIC_INTERCEPTIONS_OPENED: AtomicU64 = AtomicU64::new(0);
static FABRIC_INTERCEPTIONS_ACKED: AtomicU64 = AtomicU64::new(0);
static FABRIC_INTERCEPTIONS_NACKED: AtomicU64 = AtomicU64::new(0);
static FABRIC_INTERCEPTIONS_ABORTED: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct InterceptionMetricsSnapshot {
    pub opened: u64,
    pub acked: u64,
    pub nacked: u64,
    /// Resolved as aborts because the branch disconnected.
    pub aborted: u64,
}

pub fn record_interception_opened() {
    FABRIC_INTERCEPTIONS_OPENED.fetch_add(1, Ordering::Relaxed);
}

pub fn record_interception_acked() {
    FABRIC_INTERCEPTIONS_ACKED.fetch_add(1, Ordering::Relaxed);
}

pub fn record_interception_nacked() {
    FABRIC_INTERCEPTIONS_NACKED.fetch_add(1, Ordering::Relaxed);
}

pub fn record_interception_aborted() {
    FABRIC_INTERCEPTIONS_ABORTED.fetch_add(1, Ordering::Relaxed);
}

#[must_use]
pub fn interception_metrics_snapshot() -> InterceptionMetricsSnapshot {
    InterceptionMetricsSnapshot {
        opened: FABRIC_INTERCEPTIONS_OPENED.load(Ordering::Relaxed),
        acked: FABRIC_INTERCEPTIONS_ACKED.load(Ordering::Relaxed),
        nacked: FABRIC_INTERCEPTIONS_NACKED.load(Ordering::Relaxed),
        aborted: FABRIC_INTERCEPTIONS_ABORTED.load(Ordering::Relaxed),
    }
}

pub fn reset_interception_metrics() {
    FABRIC_INTERCEPTIONS_OPENED.store(0, Ordering::Relaxed);
    FABRIC_INTERCEPTIONS_ACKED.store(0, Ordering::Relaxed);
    FABRIC_INTERCEPTIONS_NACKED.store(0, Ordering::Relaxed);
    FABRIC_INTERCEPTIONS_ABORTED.store(0, Ordering::Relaxed);
}

#[cfg(test)]
mod tests {
    use super::*;
    use fabric_observability::EventLog;
    use fabric_types::{BranchId, TxnId};

    #[test]
    fn cas_histogram_buckets() {
        let before = cas_metrics_snapshot();
        record_cas_install(1);
        record_cas_install(3);
        record_cas_install(9);
        let after = cas_metrics_snapshot();
        assert!(after.installs_total >= before.installs_total + 3);
        assert!(after.retries.le_4 > before.retries.le_4);
        assert!(after.retries.gt_4 > before.retries.gt_4);
    }

    #[test]
    fn emit_reaches_observer() {
        let log = Arc::new(EventLog::new(4));
        let observer: SharedObserver = Some(log.clone());
        emit(
            &observer,
            &FabricEvent::Conflict {
                branch: BranchId::new(1).unwrap(),
                txn: TxnId::new(1).unwrap(),
                object: None,
                timestamp_ns: now_ns(),
            },
        );
        assert_eq!(log.len(), 1);
        emit(&None, &log.snapshot()[0]);
    }
}
