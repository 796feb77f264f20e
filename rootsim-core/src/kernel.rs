//! The top-level object a binary constructs and runs: owns the LP
//! table, spins up the worker pool, and drives GVT rounds until every
//! LP has terminated or a fatal error surfaces.

use std::sync::atomic::AtomicUsize;
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::{Duration, Instant};

use crate::abi::Model;
use crate::allocator::AllocatorArena;
use crate::config::SimConfig;
use crate::ecs::Ecs;
use crate::event::{Event, Mark, VTime, INIT_TYPE};
use crate::gvt::{GvtCoordinator, WorkerCut};
use crate::lp::Lp;
use crate::metrics::{KernelMetrics, MetricsSnapshot};
use crate::scheduler::{LpLocation, Worker};
use crate::wire::worker_mesh;
use crate::LpId;

pub struct Kernel {
    config: SimConfig,
    model: Arc<dyn Model>,
    metrics: Arc<KernelMetrics>,
    gvt: Arc<GvtCoordinator>,
}

impl Kernel {
    pub fn new(config: SimConfig, model: Arc<dyn Model>) -> Self {
        let gvt = Arc::new(GvtCoordinator::new(config.gvt_period()));
        Self {
            config,
            model,
            metrics: Arc::new(KernelMetrics::new()),
            gvt,
        }
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.rollup()
    }

    pub fn gvt(&self) -> VTime {
        self.gvt.published()
    }

    /// Partition `lp` logical processes across `np` workers, seed each
    /// with an `INIT_TYPE` event at t=0 carrying `init_payload`, and
    /// run every worker to completion (§6: one `run()` call per
    /// process, fed the argv tail verbatim as the INIT payload; the
    /// CLI owns the wall-clock deadline if any).
    pub fn run(&self, deadline: Option<Duration>, init_payload: &[u8]) {
        let n_lp = self.config.lp;
        let n_workers = self.config.np.max(1).min(n_lp.max(1));
        let arena = Arc::new(
            AllocatorArena::new(n_lp, self.config.region_len).expect("failed to reserve LP arena"),
        );

        let locations = Arc::new(
            (0..n_lp)
                .map(|i| LpLocation {
                    worker: i % n_workers,
                    local: i / n_workers,
                })
                .collect::<Vec<_>>(),
        );

        let mut lps_by_worker: Vec<Vec<Lp>> = (0..n_workers).map(|_| Vec::new()).collect();
        for i in 0..n_lp {
            let loc = &locations[i];
            let mut lp = Lp::new(i as LpId, i as u64, arena.region(i), self.config.ckpt_period);
            lp.pending.push(Event::new_positive(
                i as LpId,
                i as LpId,
                0,
                0,
                INIT_TYPE,
                init_payload.into(),
                Mark::new(i as LpId, 0),
            ));
            lps_by_worker[loc.worker].push(lp);
        }

        let mut mesh = worker_mesh(n_workers);
        // Each worker needs its own owned inbox (`Receiver` is not
        // `Sync`, so it cannot be shared behind the same `Arc` the
        // rest of this setup uses); claim them up front, in order,
        // before any worker thread is spawned.
        let inboxes: Vec<_> = (0..n_workers).map(|idx| mesh.take_inbox(idx)).collect();
        let senders = mesh.senders();
        let ecs = Arc::new(Ecs::new());
        let barrier = Arc::new(Barrier::new(n_workers));
        let deadline_at = deadline.map(|d| Instant::now() + d);
        // One cut per worker, shared so every worker can see every
        // other's contribution when it runs a GVT reduction round
        // (§4.6); only the owning worker ever writes its own entry.
        let cuts = Arc::new(
            (0..n_workers)
                .map(|_| Arc::new(WorkerCut::new()))
                .collect::<Vec<_>>(),
        );
        let total_terminated = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = lps_by_worker
            .into_iter()
            .zip(inboxes)
            .enumerate()
            .map(|(idx, (lps, inbox))| {
                let locations = locations.clone();
                let senders = senders.clone();
                let model = self.model.clone();
                let ecs = ecs.clone();
                let metrics = self.metrics.clone();
                let gvt = self.gvt.clone();
                let barrier = barrier.clone();
                let cuts = cuts.clone();
                let total_terminated = total_terminated.clone();
                // Each worker holds a clone so the arena outlives every
                // `LpAllocator` handed out from it, even though the
                // allocators themselves only carry a raw pointer.
                let arena_keepalive = arena.clone();
                thread::spawn(move || {
                    let _arena_keepalive = arena_keepalive;
                    let mut worker = Worker::new(
                        idx,
                        lps,
                        locations,
                        senders,
                        inbox,
                        model,
                        ecs,
                        metrics,
                        cuts,
                        gvt,
                        barrier,
                        16,
                        total_terminated,
                        n_lp,
                    );
                    worker.run_loop(deadline_at);
                })
            })
            .collect();

        for h in handles {
            let _ = h.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Noop;
    impl Model for Noop {
        fn process_event(
            &self,
            _ctx: &mut crate::abi::KernelCtx,
            _lp: LpId,
            _now: VTime,
            _ty: u32,
            _payload: &[u8],
        ) {
        }
        fn on_gvt(&self, _lp: LpId, _state: &[u8]) -> bool {
            true
        }
    }

    #[test]
    fn run_completes_within_deadline_for_a_small_config() {
        let config = SimConfig {
            np: 2,
            lp: 4,
            input: None,
            ckpt_period: 5,
            region_len: 4096,
            ..SimConfig::default()
        };
        let kernel = Kernel::new(config, Arc::new(Noop));
        kernel.run(Some(Duration::from_millis(50)), &[]);
        assert_eq!(kernel.metrics().rollbacks, 0);
    }
}
