//! Ambient runtime counters, modeled on the teacher's atomics-based
//! metrics struct: every counter is a relaxed `AtomicU64`, cheap to
//! bump from any worker thread, with a `rollup()` that snapshots them
//! into a plain struct for reporting.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Default)]
pub struct KernelMetrics {
    events_committed: AtomicU64,
    rollbacks: AtomicU64,
    antimessages_sent: AtomicU64,
    gvt_rounds: AtomicU64,
    fossil_collected_bytes: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub events_committed: u64,
    pub rollbacks: u64,
    pub antimessages_sent: u64,
    pub gvt_rounds: u64,
    pub fossil_collected_bytes: u64,
}

impl KernelMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_event_committed(&self) {
        self.events_committed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rollback(&self) {
        self.rollbacks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_antimessage_sent(&self, n: u64) {
        self.antimessages_sent.fetch_add(n, Ordering::Relaxed);
    }

    pub fn record_gvt_round(&self) {
        self.gvt_rounds.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_fossil_collected(&self, bytes: u64) {
        self.fossil_collected_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Snapshot all counters at once. Not atomic as a whole — callers
    /// that need a strictly consistent cross-field view should quiesce
    /// the workers first, same caveat as the teacher's `Metrics::rollup`.
    pub fn rollup(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            events_committed: self.events_committed.load(Ordering::Relaxed),
            rollbacks: self.rollbacks.load(Ordering::Relaxed),
            antimessages_sent: self.antimessages_sent.load(Ordering::Relaxed),
            gvt_rounds: self.gvt_rounds.load(Ordering::Relaxed),
            fossil_collected_bytes: self.fossil_collected_bytes.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rollup_reflects_recorded_counts() {
        let m = KernelMetrics::new();
        m.record_event_committed();
        m.record_event_committed();
        m.record_rollback();
        m.record_antimessage_sent(3);
        let snap = m.rollup();
        assert_eq!(snap.events_committed, 2);
        assert_eq!(snap.rollbacks, 1);
        assert_eq!(snap.antimessages_sent, 3);
    }
}
