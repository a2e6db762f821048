//! Replication event tracing and metrics aggregation.
//!
//! Observation is opt-in through the [`FabricObserver`] trait. Components
//! hold an `Option<Arc<dyn FabricObserver>>`; with no observer registered,
//! emitting an event is a branch on `None`.
//!
//! Observers run on commit, walker and connection paths. They must not
//! block and must not call back into the branch that emitted the event.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use fabric_types::{BranchId, ConnectionId, InterceptionId, ObjectId, TxnId};
use parking_lot::Mutex;
use serde::Serialize;

// ---------------------------------------------------------------------------
// FabricEvent
// ---------------------------------------------------------------------------

/// Why an interception was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum NackCategory {
    /// The authority refused the commit; waiters retry.
    Rejected,
    /// The branch lost its connection; waiters abort.
    Disconnected,
}

/// A single event emitted by the MVCC or wire layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum FabricEvent {
    /// A transaction appended its version map to a branch.
    Committed {
        branch: BranchId,
        txn: TxnId,
        /// Position of the new map in the branch history.
        seq: u64,
        /// Lost CAS races before the append succeeded.
        cas_retries: u32,
        timestamp_ns: u64,
    },

    /// Validation found a read overwritten by a concurrent commit.
    Conflict {
        branch: BranchId,
        txn: TxnId,
        object: Option<ObjectId>,
        timestamp_ns: u64,
    },

    /// The walker sealed an interception so it can be processed.
    InterceptionClosed {
        branch: BranchId,
        interception: InterceptionId,
        maps: usize,
        timestamp_ns: u64,
    },

    InterceptionAcked {
        branch: BranchId,
        interception: InterceptionId,
        timestamp_ns: u64,
    },

    InterceptionNacked {
        branch: BranchId,
        interception: InterceptionId,
        category: NackCategory,
        timestamp_ns: u64,
    },

    /// A branch was blocked because its connection went away.
    BranchDisconnected {
        branch: BranchId,
        cause: String,
        timestamp_ns: u64,
    },

    /// A connection stopped; pending calls were failed.
    ConnectionClosed {
        connection: ConnectionId,
        cause: String,
        failed_calls: usize,
        timestamp_ns: u64,
    },

    /// A validator refused remote input.
    ValidatorRejected {
        connection: ConnectionId,
        detail: String,
        timestamp_ns: u64,
    },

    /// Pending sends crossed the overload threshold (or drained below it).
    Overload {
        connection: ConnectionId,
        overloaded: bool,
        pending: u64,
        timestamp_ns: u64,
    },
}

impl FabricEvent {
    #[must_use]
    pub fn timestamp_ns(&self) -> u64 {
        match self {
            Self::Committed { timestamp_ns, .. }
            | Self::Conflict { timestamp_ns, .. }
            | Self::InterceptionClosed { timestamp_ns, .. }
            | Self::InterceptionAcked { timestamp_ns, .. }
            | Self::InterceptionNacked { timestamp_ns, .. }
            | Self::BranchDisconnected { timestamp_ns, .. }
            | Self::ConnectionClosed { timestamp_ns, .. }
            | Self::ValidatorRejected { timestamp_ns, .. }
            | Self::Overload { timestamp_ns, .. } => *timestamp_ns,
        }
    }

    /// Branch the event concerns, if it is branch-scoped.
    #[must_use]
    pub fn branch(&self) -> Option<BranchId> {
        match self {
            Self::Committed { branch, .. }
            | Self::Conflict { branch, .. }
            | Self::InterceptionClosed { branch, .. }
            | Self::InterceptionAcked { branch, .. }
            | Self::InterceptionNacked { branch, .. }
            | Self::BranchDisconnected { branch, .. } => Some(*branch),
            Self::ConnectionClosed { .. }
            | Self::ValidatorRejected { .. }
            | Self::Overload { .. } => None,
        }
    }

    /// Whether this event represents a failed commit path.
    #[must_use]
    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            Self::Conflict { .. }
                | Self::InterceptionNacked { .. }
                | Self::BranchDisconnected { .. }
                | Self::ValidatorRejected { .. }
        )
    }
}

// ---------------------------------------------------------------------------
// FabricObserver
// ---------------------------------------------------------------------------

/// Observer for engine events.
///
/// Implementations MUST be non-blocking.
pub trait FabricObserver: Send + Sync {
    fn on_event(&self, event: &FabricEvent);
}

/// Observer that discards everything.
#[derive(Debug, Clone, Copy)]
pub struct NoOpObserver;

impl FabricObserver for NoOpObserver {
    #[inline(always)]
    fn on_event(&self, _event: &FabricEvent) {}
}

/// Nanoseconds since `epoch`, saturating.
#[must_use]
pub fn elapsed_ns(epoch: Instant) -> u64 {
    u64::try_from(epoch.elapsed().as_nanos()).unwrap_or(u64::MAX)
}

// ---------------------------------------------------------------------------
// EventLog
// ---------------------------------------------------------------------------

/// Bounded in-memory event collector. The oldest event is overwritten once
/// the log is full.
pub struct EventLog {
    inner: Mutex<Ring>,
}

struct Ring {
    buf: Vec<FabricEvent>,
    capacity: usize,
    head: usize,
    len: usize,
}

impl Ring {
    fn push(&mut self, event: FabricEvent) {
        if self.capacity == 0 {
            return;
        }
        if self.buf.len() < self.capacity {
            self.buf.push(event);
            self.len += 1;
            return;
        }
        self.buf[self.head] = event;
        self.head = (self.head + 1) % self.capacity;
    }

    fn ordered(&self) -> Vec<FabricEvent> {
        (0..self.len)
            .map(|i| self.buf[(self.head + i) % self.capacity].clone())
            .collect()
    }
}

impl EventLog {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Ring {
                buf: Vec::with_capacity(capacity),
                capacity,
                head: 0,
                len: 0,
            }),
        }
    }

    pub fn push(&self, event: FabricEvent) {
        self.inner.lock().push(event);
    }

    /// All stored events, oldest first.
    #[must_use]
    pub fn snapshot(&self) -> Vec<FabricEvent> {
        self.inner.lock().ordered()
    }

    pub fn clear(&self) {
        let mut ring = self.inner.lock();
        ring.buf.clear();
        ring.head = 0;
        ring.len = 0;
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().len
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.inner.lock().capacity
    }
}

impl FabricObserver for EventLog {
    fn on_event(&self, event: &FabricEvent) {
        self.push(event.clone());
    }
}

// ---------------------------------------------------------------------------
// FabricMetrics
// ---------------------------------------------------------------------------

/// Event-driven counters, scoped to one observer instance.
pub struct FabricMetrics {
    pub commits: AtomicU64,
    pub conflicts: AtomicU64,
    pub cas_retries: AtomicU64,
    pub interceptions_closed: AtomicU64,
    pub acks: AtomicU64,
    pub nacks: AtomicU64,
    pub disconnects: AtomicU64,
    pub validator_rejections: AtomicU64,
    pub overload_transitions: AtomicU64,
    /// Conflicts per object (behind a mutex, off the hot path).
    object_hotspots: Mutex<HashMap<ObjectId, u64>>,
    created_at: Instant,
}

impl FabricMetrics {
    #[must_use]
    pub fn new() -> Self {
        Self {
            commits: AtomicU64::new(0),
            conflicts: AtomicU64::new(0),
            cas_retries: AtomicU64::new(0),
            interceptions_closed: AtomicU64::new(0),
            acks: AtomicU64::new(0),
            nacks: AtomicU64::new(0),
            disconnects: AtomicU64::new(0),
            validator_rejections: AtomicU64::new(0),
            overload_transitions: AtomicU64::new(0),
            object_hotspots: Mutex::new(HashMap::new()),
            created_at: Instant::now(),
        }
    }

    pub fn record(&self, event: &FabricEvent) {
        match event {
            FabricEvent::Committed { cas_retries, .. } => {
                self.commits.fetch_add(1, Ordering::Relaxed);
                self.cas_retries
                    .fetch_add(u64::from(*cas_retries), Ordering::Relaxed);
            }
            FabricEvent::Conflict { object, .. } => {
                self.conflicts.fetch_add(1, Ordering::Relaxed);
                if let Some(object) = object {
                    *self.object_hotspots.lock().entry(*object).or_insert(0) += 1;
                }
            }
            FabricEvent::InterceptionClosed { .. } => {
                self.interceptions_closed.fetch_add(1, Ordering::Relaxed);
            }
            FabricEvent::InterceptionAcked { .. } => {
                self.acks.fetch_add(1, Ordering::Relaxed);
            }
            FabricEvent::InterceptionNacked { .. } => {
                self.nacks.fetch_add(1, Ordering::Relaxed);
            }
            FabricEvent::BranchDisconnected { .. } => {
                self.disconnects.fetch_add(1, Ordering::Relaxed);
            }
            FabricEvent::ValidatorRejected { .. } => {
                self.validator_rejections.fetch_add(1, Ordering::Relaxed);
            }
            FabricEvent::Overload { .. } => {
                self.overload_transitions.fetch_add(1, Ordering::Relaxed);
            }
            FabricEvent::ConnectionClosed { .. } => {}
        }
    }

    pub fn reset(&self) {
        for counter in [
            &self.commits,
            &self.conflicts,
            &self.cas_retries,
            &self.interceptions_closed,
            &self.acks,
            &self.nacks,
            &self.disconnects,
            &self.validator_rejections,
            &self.overload_transitions,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
        self.object_hotspots.lock().clear();
    }

    /// Top `n` objects by conflict count.
    #[must_use]
    pub fn top_hotspots(&self, n: usize) -> Vec<(ObjectId, u64)> {
        let mut entries: Vec<(ObjectId, u64)> = {
            let map = self.object_hotspots.lock();
            map.iter().map(|(&k, &v)| (k, v)).collect()
        };
        entries.sort_by_key(|e| (std::cmp::Reverse(e.1), e.0));
        entries.truncate(n);
        entries
    }

    #[must_use]
    pub fn snapshot(&self) -> FabricMetricsSnapshot {
        FabricMetricsSnapshot {
            commits: self.commits.load(Ordering::Relaxed),
            conflicts: self.conflicts.load(Ordering::Relaxed),
            cas_retries: self.cas_retries.load(Ordering::Relaxed),
            interceptions_closed: self.interceptions_closed.load(Ordering::Relaxed),
            acks: self.acks.load(Ordering::Relaxed),
            nacks: self.nacks.load(Ordering::Relaxed),
            disconnects: self.disconnects.load(Ordering::Relaxed),
            validator_rejections: self.validator_rejections.load(Ordering::Relaxed),
            overload_transitions: self.overload_transitions.load(Ordering::Relaxed),
            elapsed_secs: self.created_at.elapsed().as_secs_f64(),
            top_hotspots: self.top_hotspots(10),
        }
    }
}

impl Default for FabricMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct FabricMetricsSnapshot {
    pub commits: u64,
    pub conflicts: u64,
    pub cas_retries: u64,
    pub interceptions_closed: u64,
    pub acks: u64,
    pub nacks: u64,
    pub disconnects: u64,
    pub validator_rejections: u64,
    pub overload_transitions: u64,
    pub elapsed_secs: f64,
    pub top_hotspots: Vec<(ObjectId, u64)>,
}

// ---------------------------------------------------------------------------
// MetricsObserver
// ---------------------------------------------------------------------------

/// Observer that aggregates into [`FabricMetrics`] and keeps the most recent
/// events in an [`EventLog`].
pub struct MetricsObserver {
    metrics: FabricMetrics,
    log: EventLog,
}

impl MetricsObserver {
    #[must_use]
    pub fn new(log_capacity: usize) -> Self {
        Self {
            metrics: FabricMetrics::new(),
            log: EventLog::new(log_capacity),
        }
    }

    #[must_use]
    pub fn metrics(&self) -> &FabricMetrics {
        &self.metrics
    }

    #[must_use]
    pub fn log(&self) -> &EventLog {
        &self.log
    }

    pub fn reset(&self) {
        self.metrics.reset();
        self.log.clear();
    }
}

impl FabricObserver for MetricsObserver {
    fn on_event(&self, event: &FabricEvent) {
        self.metrics.record(event);
        self.log.push(event.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn branch(n: u64) -> BranchId {
        BranchId::new(n).unwrap()
    }

    fn conflict(obj: u64, ts: u64) -> FabricEvent {
        FabricEvent::Conflict {
            branch: branch(1),
            txn: TxnId::new(9).unwrap(),
            object: ObjectId::new(obj),
            timestamp_ns: ts,
        }
    }

    #[test]
    fn noop_observer_accepts_events() {
        NoOpObserver.on_event(&conflict(1, 0));
    }

    #[test]
    fn event_log_wraps_oldest_first() {
        let log = EventLog::new(3);
        for ts in 0..5 {
            log.push(conflict(1, ts));
        }
        let stamps: Vec<u64> = log.snapshot().iter().map(FabricEvent::timestamp_ns).collect();
        assert_eq!(stamps, vec![2, 3, 4]);
        assert_eq!(log.len(), 3);
        log.clear();
        assert!(log.is_empty());
        log.push(conflict(1, 7));
        assert_eq!(log.snapshot()[0].timestamp_ns(), 7);
    }

    #[test]
    fn event_log_zero_capacity() {
        let log = EventLog::new(0);
        log.push(conflict(1, 0));
        assert!(log.is_empty());
    }

    #[test]
    fn metrics_count_by_kind() {
        let metrics = FabricMetrics::new();
        metrics.record(&FabricEvent::Committed {
            branch: branch(1),
            txn: TxnId::new(1).unwrap(),
            seq: 0,
            cas_retries: 3,
            timestamp_ns: 0,
        });
        metrics.record(&conflict(5, 1));
        metrics.record(&conflict(5, 2));
        metrics.record(&conflict(6, 3));
        let snap = metrics.snapshot();
        assert_eq!(snap.commits, 1);
        assert_eq!(snap.cas_retries, 3);
        assert_eq!(snap.conflicts, 3);
        assert_eq!(snap.top_hotspots[0], (ObjectId::new(5).unwrap(), 2));
        metrics.reset();
        assert_eq!(metrics.snapshot().conflicts, 0);
        assert!(metrics.top_hotspots(5).is_empty());
    }

    #[test]
    fn failure_classification() {
        assert!(conflict(1, 0).is_failure());
        let ack = FabricEvent::InterceptionAcked {
            branch: branch(2),
            interception: InterceptionId::new(1).unwrap(),
            timestamp_ns: 0,
        };
        assert!(!ack.is_failure());
        assert_eq!(ack.branch(), Some(branch(2)));
    }

    #[test]
    fn metrics_observer_records_both() {
        let obs = MetricsObserver::new(8);
        obs.on_event(&conflict(3, 0));
        assert_eq!(obs.log().len(), 1);
        assert_eq!(obs.metrics().conflicts.load(Ordering::Relaxed), 1);
        obs.reset();
        assert!(obs.log().is_empty());
    }

    #[test]
    fn snapshot_serializes() {
        let obs = MetricsObserver::new(1);
        obs.on_event(&conflict(3, 0));
        let json = serde_json::to_string(&obs.metrics().snapshot()).unwrap();
        assert!(json.contains("\"conflicts\":1"));
        let event_json = serde_json::to_string(&obs.log().snapshot()[0]).unwrap();
        assert!(event_json.contains("Conflict"));
    }
}
