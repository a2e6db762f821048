//! Wire-level counters.
//!
//! Process-wide, relaxed atomics; read them with [`wire_metrics_snapshot`].

use std::sync::atomic::{AtomicU64, Ordering};

static WIRE_BYTES_READ: AtomicU64 = AtomicU64::new(0);
static WIRE_BYTES_WRITTEN: AtomicU64 = AtomicU64::new(0);
static WIRE_FRAMES_READ: AtomicU64 = AtomicU64::new(0);
static WIRE_READ_SUSPENSIONS: AtomicU64 = AtomicU64::new(0);
static WIRE_WRITE_SUSPENSIONS: AtomicU64 = AtomicU64::new(0);
static WIRE_HEARTBEATS_SENT: AtomicU64 = AtomicU64::new(0);
static WIRE_OVERLOAD_TRANSITIONS: AtomicU64 = AtomicU64::new(0);
static WIRE_PROTOCOL_VIOLATIONS: AtomicU64 = AtomicU64::new(0);
static WIRE_VALIDATOR_REJECTIONS: AtomicU64 = AtomicU64::new(0);
static WIRE_CONNECTIONS_CLOSED: AtomicU64 = AtomicU64::new(0);
static WIRE_CALLS_FAILED_ON_CLOSE: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WireMetricsSnapshot {
    pub bytes_read: u64,
    pub bytes_written: u64,
    pub frames_read: u64,
    pub read_suspensions: u64,
    pub write_suspensions: u64,
    pub heartbeats_sent: u64,
    pub overload_transitions: u64,
    pub protocol_violations: u64,
    pub validator_rejections: u64,
    pub connections_closed: u64,
    pub calls_failed_on_close: u64,
}

pub fn record_bytes_read(n: usize) {
    WIRE_BYTES_READ.fetch_add(n as u64, Ordering::Relaxed);
}

pub fn record_bytes_written(n: usize) {
    WIRE_BYTES_WRITTEN.fetch_add(n as u64, Ordering::Relaxed);
}

pub fn record_frame_read() {
    WIRE_FRAMES_READ.fetch_add(1, Ordering::Relaxed);
}

pub fn record_read_suspension() {
    WIRE_READ_SUSPENSIONS.fetch_add(1, Ordering::Relaxed);
}

pub fn record_write_suspension() {
    WIRE_WRITE_SUSPENSIONS.fetch_add(1, Ordering::Relaxed);
}

pub fn record_heartbeat_sent() {
    WIRE_HEARTBEATS_SENT.fetch_add(1, Ordering::Relaxed);
}

pub fn record_overload_transition() {
    WIRE_OVERLOAD_TRANSITIONS.fetch_add(1, Ordering::Relaxed);
}

pub fn record_protocol_violation() {
    WIRE_PROTOCOL_VIOLATIONS.fetch_add(1, Ordering::Relaxed);
}

pub fn record_validator_rejection() {
    WIRE_VALIDATOR_REJECTIONS.fetch_add(1, Ordering::Relaxed);
}

pub fn record_connection_closed(failed_calls: usize) {
    WIRE_CONNECTIONS_CLOSED.fetch_add(1, Ordering::Relaxed);
    WIRE_CALLS_FAILED_ON_CLOSE.fetch_add(failed_calls as u64, Ordering::Relaxed);
}

#[must_use]
pub fn wire_metrics_snapshot() -> WireMetricsSnapshot {
    WireMetricsSnapshot {
        bytes_read: WIRE_BYTES_READ.load(Ordering::Relaxed),
        bytes_written: WIRE_BYTES_WRITTEN.load(Ordering::Relaxed),
        frames_read: WIRE_FRAMES_READ.load(Ordering::Relaxed),
        read_suspensions: WIRE_READ_SUSPENSIONS.load(Ordering::Relaxed),
        write_suspensions: WIRE_WRITE_SUSPENSIONS.load(Ordering::Relaxed),
        heartbeats_sent: WIRE_HEARTBEATS_SENT.load(Ordering::Relaxed),
        overload_transitions: WIRE_OVERLOAD_TRANSITIONS.load(Ordering::Relaxed),
        protocol_violations: WIRE_PROTOCOL_VIOLATIONS.load(Ordering::Relaxed),
        validator_rejections: WIRE_VALIDATOR_REJECTIONS.load(Ordering::Relaxed),
        connections_closed: WIRE_CONNECTIONS_CLOSED.load(Ordering::Relaxed),
        calls_failed_on_close: WIRE_CALLS_FAILED_ON_CLOSE.load(Ordering::Relaxed),
    }
}

/// Reset wire metrics to zero (tests/diagnostics).
pub fn reset_wire_metrics() {
    for counter in [
        &WIRE_BYTES_READ,
        &WIRE_BYTES_WRITTEN,
        &WIRE_FRAMES_READ,
        &WIRE_READ_SUSPENSIONS,
        &WIRE_WRITE_SUSPENSIONS,
        &WIRE_HEARTBEATS_SENT,
        &WIRE_OVERLOAD_TRANSITIONS,
        &WIRE_PROTOCOL_VIOLATIONS,
        &WIRE_VALIDATOR_REJECTIONS,
        &WIRE_CONNECTIONS_CLOSED,
        &WIRE_CALLS_FAILED_ON_CLOSE,
    ] {
        counter.store(0, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let before = wire_metrics_snapshot();
        record_bytes_written(10);
        record_connection_closed(3);
        let after = wire_metrics_snapshot();
        assert!(after.bytes_written >= before.bytes_written + 10);
        assert!(after.calls_failed_on_close >= before.calls_failed_on_close + 3);
    }
}
