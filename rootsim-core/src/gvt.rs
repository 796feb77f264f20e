//! C6: global virtual time reduction and fossil collection (§4.6).
//!
//! GVT is computed as `min` over every worker of `min(LVT, min
//! send-time of that worker's unconfirmed in-flight sends)`, reported
//! through plain atomics rather than a channel-based collection
//! protocol — the same technique `aika`'s `Galaxy::recalc_gvt` uses
//! for its send/recv counters, adapted here to per-worker cut reports
//! instead of a single shared ledger.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::time::{Duration, Instant};

use crate::event::VTime;
use crate::lp::Lp;

/// One worker's contribution to a GVT round: its minimum LVT across
/// owned LPs, and the minimum send-time of sends still in flight
/// (i.e. not yet acknowledged as received by their destination
/// worker).
pub struct WorkerCut {
    pub min_lvt: Arc<AtomicU64>,
    pub min_inflight_send: Arc<AtomicU64>,
    pub sends_in_flight: Arc<AtomicUsize>,
}

impl WorkerCut {
    pub fn new() -> Self {
        Self {
            min_lvt: Arc::new(AtomicU64::new(VTime::MAX)),
            min_inflight_send: Arc::new(AtomicU64::new(VTime::MAX)),
            sends_in_flight: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn report_lvt(&self, lvt: VTime) {
        self.min_lvt.fetch_min(lvt, Ordering::Relaxed);
    }

    pub fn report_send(&self, send_time: VTime) {
        self.sends_in_flight.fetch_add(1, Ordering::Relaxed);
        self.min_inflight_send.fetch_min(send_time, Ordering::Relaxed);
    }

    pub fn report_receive_ack(&self) {
        self.sends_in_flight.fetch_sub(1, Ordering::Relaxed);
    }

    fn cut(&self) -> VTime {
        self.min_lvt
            .load(Ordering::Relaxed)
            .min(self.min_inflight_send.load(Ordering::Relaxed))
    }

    fn reset(&self) {
        self.min_lvt.store(VTime::MAX, Ordering::Relaxed);
        self.min_inflight_send.store(VTime::MAX, Ordering::Relaxed);
    }
}

impl Default for WorkerCut {
    fn default() -> Self {
        Self::new()
    }
}

/// Coordinates a two-phase (red/white) GVT reduction across workers
/// and publishes the result. Read far more often than written, so the
/// published value lives behind a plain `AtomicU64` rather than a
/// mutex.
pub struct GvtCoordinator {
    published: Arc<AtomicU64>,
    round_color_is_red: std::sync::atomic::AtomicBool,
    timeout: Duration,
}

impl GvtCoordinator {
    pub fn new(timeout: Duration) -> Self {
        Self {
            published: Arc::new(AtomicU64::new(0)),
            round_color_is_red: std::sync::atomic::AtomicBool::new(true),
            timeout,
        }
    }

    pub fn published(&self) -> VTime {
        self.published.load(Ordering::Acquire)
    }

    pub fn published_handle(&self) -> Arc<AtomicU64> {
        self.published.clone()
    }

    /// Run one reduction round across `cuts`, one per worker. `barrier`
    /// synchronizes workers so every cut is reported before any is
    /// read (phase 1), then again before the next round may begin
    /// (phase 2), per §4.6's red/white coloring. Returns `None` if the
    /// round did not complete within `timeout` — safe, since GVT only
    /// ever advances and an aborted round just means workers keep
    /// running on the last published value (§4.6's cancellation
    /// clause).
    pub fn round(&self, cuts: &[Arc<WorkerCut>], barrier: &Barrier) -> Option<VTime> {
        let deadline = Instant::now() + self.timeout;
        self.round_color_is_red
            .fetch_xor(true, Ordering::AcqRel);

        barrier.wait();
        if Instant::now() > deadline {
            return None;
        }

        let min = cuts.iter().map(|c| c.cut()).min().unwrap_or(VTime::MAX);
        barrier.wait();
        if Instant::now() > deadline {
            return None;
        }

        for c in cuts {
            c.reset();
        }

        let prev = self.published.load(Ordering::Acquire);
        let next = min.max(prev);
        self.published.store(next, Ordering::Release);
        Some(next)
    }
}

/// The three fossil-collection actions of §4.6, applied to one LP once
/// its data is known safe to discard below `gvt`.
pub fn fossil_collect(lp: &mut Lp, gvt: VTime) {
    lp.snapshots.fossil_collect(gvt);
    lp.output.trim_below(gvt);
    lp.dispatched.trim_below(gvt);
    lp.fossil_collect_ecs_deps(gvt);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cut_is_min_of_lvt_and_inflight_send() {
        let cut = WorkerCut::new();
        cut.report_lvt(10);
        cut.report_send(7);
        assert_eq!(cut.cut(), 7);
    }

    #[test]
    fn round_publishes_min_across_workers_and_is_monotonic() {
        let coordinator = GvtCoordinator::new(Duration::from_secs(1));
        let cut_a = Arc::new(WorkerCut::new());
        let cut_b = Arc::new(WorkerCut::new());
        cut_a.report_lvt(20);
        cut_b.report_lvt(5);
        let barrier = Barrier::new(1);
        let gvt = coordinator
            .round(&[cut_a.clone(), cut_b.clone()], &barrier)
            .unwrap();
        assert_eq!(gvt, 5);

        cut_a.report_lvt(100);
        cut_b.report_lvt(2);
        // Even though the new cut is smaller, GVT must not regress.
        let gvt2 = coordinator.round(&[cut_a, cut_b], &barrier).unwrap();
        assert_eq!(gvt2, 5);
    }
}
