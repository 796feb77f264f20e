//! C5: the worker pool. Each `Worker` owns a static partition of LPs
//! and runs the five-step loop of §4.5 on a native OS thread. A
//! dispatch that calls into C7's `ecs_read` runs on a short-lived
//! helper thread spawned just for that one event, not the worker's
//! own scheduling thread — the blocked helper parks on the
//! rendezvous's condvar while the worker loop keeps picking up other
//! ready LPs and applying whatever helper threads have since
//! finished, exactly the "no unsafe stack switching, no preemption
//! within a handler" contract §4.5/§5 ask for.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{Receiver, Sender};
use std::sync::{mpsc, Arc, Barrier};
use std::thread;
use std::time::{Duration, Instant};

use crate::abi::{KernelCtx, Model};
use crate::ecs::Ecs;
use crate::event::{Event, Mark, VTime};
use crate::gvt::{GvtCoordinator, WorkerCut};
use crate::lp::{EcsEdge, Lp, LpState};
use crate::metrics::KernelMetrics;
use crate::queue::OutputRecord;
use crate::rollback::rollback;
use crate::wire::{ControlMessage, WireMessage};
use crate::LpId;

/// Read-only routing table shared by every worker: which worker owns
/// each `LpId`, and that worker's local index within its `Vec<Lp>`.
pub struct LpLocation {
    pub worker: usize,
    pub local: usize,
}

/// What a helper thread hands back once a dispatch's model call
/// returns: the mutated RNG/uid-counter state, whatever the model
/// scheduled, and whatever cross-LP reads it made. Everything here is
/// `Copy` or owned, so sending it back across an `mpsc` channel needs
/// no synchronization beyond the channel itself.
struct DispatchResult {
    local: usize,
    rng: crate::rng::KernelRng,
    uid_counter: u64,
    scheduled: Vec<(LpId, VTime, u32, Box<[u8]>)>,
    ecs_reads: Vec<(LpId, VTime, Mark)>,
}

pub struct Worker {
    pub index: usize,
    pub lps: Vec<Lp>,
    pub locations: Arc<Vec<LpLocation>>,
    senders: Vec<Sender<WireMessage>>,
    inbox: Receiver<WireMessage>,
    pub model: Arc<dyn Model>,
    pub ecs: Arc<Ecs>,
    pub metrics: Arc<KernelMetrics>,
    /// Every worker's cut, indexed by worker id (`self.cuts[self.index]`
    /// is this worker's own). A GVT round needs the whole slice; each
    /// worker only ever writes its own entry.
    pub cuts: Arc<Vec<Arc<WorkerCut>>>,
    pub gvt: Arc<GvtCoordinator>,
    pub barrier: Arc<Barrier>,
    pub gvt_every: u64,
    /// Total LPs terminated (per §4.9's `on_gvt` predicate) across the
    /// whole kernel, and the count that means the simulation is done.
    /// Shared so a worker whose own LPs all terminate keeps
    /// participating in GVT rounds — and keeps the shared `Barrier`
    /// satisfiable — until every other worker's LPs have too.
    pub total_terminated: Arc<AtomicUsize>,
    pub n_lp_total: usize,
    dispatch_count: u64,
    result_tx: Sender<DispatchResult>,
    result_rx: Receiver<DispatchResult>,
}

impl Worker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        index: usize,
        lps: Vec<Lp>,
        locations: Arc<Vec<LpLocation>>,
        senders: Vec<Sender<WireMessage>>,
        inbox: Receiver<WireMessage>,
        model: Arc<dyn Model>,
        ecs: Arc<Ecs>,
        metrics: Arc<KernelMetrics>,
        cuts: Arc<Vec<Arc<WorkerCut>>>,
        gvt: Arc<GvtCoordinator>,
        barrier: Arc<Barrier>,
        gvt_every: u64,
        total_terminated: Arc<AtomicUsize>,
        n_lp_total: usize,
    ) -> Self {
        let (result_tx, result_rx) = mpsc::channel();
        Self {
            index,
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
            gvt_every,
            total_terminated,
            n_lp_total,
            dispatch_count: 0,
            result_tx,
            result_rx,
        }
    }

    /// §4.5's five steps, run until `deadline` or every local LP is
    /// terminated.
    pub fn run_loop(&mut self, deadline: Option<Instant>) {
        loop {
            if deadline.is_some_and(|d| Instant::now() >= d) {
                return;
            }

            // Step 1: drain inbound messages addressed to this worker,
            // and any dispatch helper threads that have finished.
            self.drain_inbound();
            self.drain_dispatch_results();

            // The simulation is done only once every LP across every
            // worker has satisfied `on_gvt` (§4.9/§5/§8) — not just
            // this worker's own. A worker that returned early here
            // while its own LPs were done but others' weren't would
            // stop calling `gvt.round()`, starving the shared
            // `Barrier` of a party and hanging every other worker.
            if self.total_terminated.load(Ordering::Relaxed) >= self.n_lp_total {
                return;
            }

            // Step 2: pick the local LP with the smallest next receive
            // time among those in `Ready`/`Idle` state.
            match self.pick_next_ready() {
                Some(local) => {
                    self.dispatch_one(local);
                    self.dispatch_count += 1;
                    self.maybe_participate_in_gvt();
                }
                None if self.has_dispatch_in_flight() => {
                    // Nothing locally ready, but a helper thread is
                    // still running one of this worker's LPs (or
                    // blocked on a rendezvous ack); wait briefly for
                    // it rather than spinning.
                    if let Ok(result) = self.result_rx.recv_timeout(Duration::from_millis(5)) {
                        self.apply_dispatch_result(result);
                    }
                    self.maybe_participate_in_gvt();
                }
                None => {
                    // Truly idle: no local work and nothing in flight.
                    // Still participate in GVT rounds (other workers
                    // may depend on this worker's barrier arrival) but
                    // don't spin the CPU doing it.
                    self.maybe_participate_in_gvt();
                    thread::sleep(Duration::from_millis(1));
                }
            }
        }
    }

    fn has_dispatch_in_flight(&self) -> bool {
        self.lps
            .iter()
            .any(|lp| matches!(lp.state, LpState::Running | LpState::BlockedForRendezvous { .. }))
    }

    /// Every `gvt_every` dispatches (or whenever this worker finds
    /// itself idle, so it doesn't starve the shared `Barrier`), report
    /// this worker's cut and run one round of the two-phase reduction
    /// (§4.6). A round that actually publishes a new GVT drives fossil
    /// collection and the `on_gvt` termination check for every local
    /// LP.
    fn maybe_participate_in_gvt(&mut self) {
        if self.dispatch_count % self.gvt_every.max(1) != 0 {
            return;
        }
        let lvt = self
            .lps
            .iter()
            .filter(|lp| !lp.is_terminated())
            .map(|lp| lp.lvt)
            .min()
            .unwrap_or(VTime::MAX);
        self.cuts[self.index].report_lvt(lvt);

        if let Some(gvt) = self.gvt.round(&self.cuts, &self.barrier) {
            self.metrics.record_gvt_round();
            self.on_gvt_advanced(gvt);
        }
    }

    /// Fossil-collect every local LP at the newly published GVT, then
    /// evaluate the model's termination predicate against each LP's
    /// state as of GVT (§4.9, §8). An LP whose predicate holds is
    /// marked `Terminated`; once every LP across every worker has
    /// reached that state the kernel's run loop exits (§5).
    fn on_gvt_advanced(&mut self, gvt: VTime) {
        for lp in &mut self.lps {
            crate::gvt::fossil_collect(lp, gvt);

            if lp.is_terminated() || lp.snapshots.is_empty() {
                continue;
            }
            if !matches!(lp.state, LpState::Idle | LpState::Ready) {
                continue;
            }
            let Some(plan) = lp.snapshots.restore(gvt) else {
                continue;
            };
            let state = crate::snapshot::reconstruct(&plan);
            if self.model.on_gvt(lp.id, &state) {
                lp.state = LpState::Terminated;
                self.total_terminated.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    fn pick_next_ready(&self) -> Option<usize> {
        self.lps
            .iter()
            .enumerate()
            .filter(|(_, lp)| matches!(lp.state, LpState::Idle | LpState::Ready))
            .filter_map(|(i, lp)| lp.pending.peek_next_receive_time().map(|t| (i, t)))
            .min_by_key(|(_, t)| *t)
            .map(|(i, _)| i)
    }

    /// Step 3-4: launch one LP's next event on a helper thread (or
    /// apply a rollback first if the event is a straggler). The LP is
    /// left in `Running` until `apply_dispatch_result` picks up the
    /// helper thread's output.
    fn dispatch_one(&mut self, local: usize) {
        let Some(next) = self.lps[local].pending.pop_min() else {
            return;
        };

        if next.is_antimessage() {
            self.handle_antimessage(local, next);
            return;
        }

        if next.receive_time < self.lps[local].lvt {
            self.run_rollback(local, next.receive_time);
            self.lps[local].pending.push(next);
            return;
        }

        // Record the event as dispatched before handing it to the
        // model: once consumed from the pending queue it would
        // otherwise be unrecoverable if a later rollback targets a
        // time before this one (§4.4 step 3).
        self.lps[local].dispatched.record(next.clone());

        self.lps[local].state = LpState::Running;
        self.lps[local].lvt = next.receive_time;
        self.service_pending_rendezvous(local);

        let receiver = next.receiver;
        let now = next.receive_time;
        let type_tag = next.type_tag;
        let payload = next.payload;
        let rng = self.lps[local].rng;
        let uid_counter = self.lps[local].uid_counter();
        let model = self.model.clone();
        let ecs = self.ecs.clone();
        let n_prc_tot = self.locations.len();
        let tx = self.result_tx.clone();

        thread::spawn(move || {
            let mut rng = rng;
            let mut uid = uid_counter;
            let mut ctx = KernelCtx::new(receiver, now, &mut rng, &mut uid, &ecs, n_prc_tot);
            model.process_event(&mut ctx, receiver, now, type_tag, &payload);
            let (scheduled, ecs_reads) = ctx.into_parts();
            let _ = tx.send(DispatchResult {
                local,
                rng,
                uid_counter: uid,
                scheduled,
                ecs_reads,
            });
        });
    }

    /// Fold a finished helper thread's output back into its LP: record
    /// the ECS dependencies it established, route whatever it
    /// scheduled, snapshot, and mark the LP ready again.
    fn apply_dispatch_result(&mut self, result: DispatchResult) {
        let DispatchResult {
            local,
            rng,
            uid_counter,
            scheduled,
            ecs_reads,
        } = result;

        self.lps[local].rng = rng;
        self.lps[local].set_uid_counter(uid_counter);
        for (on, at, mark) in ecs_reads {
            self.lps[local].record_ecs_dependency(EcsEdge { on, at, mark });
        }

        let receiver = self.lps[local].id;
        let now = self.lps[local].lvt;

        // Build outbound events before routing them: routing needs
        // `&mut self` as a whole (it may reach into another worker's
        // channel), so it can't run while `self.lps[local]` is
        // borrowed.
        let mut outgoing = Vec::with_capacity(scheduled.len());
        for (dest, at, ty, payload) in scheduled {
            let sender_mark = self.lps[local].next_mark();
            outgoing.push(Event::new_positive(receiver, dest, now, at, ty, payload, sender_mark));
        }
        for event in &outgoing {
            self.lps[local].output.record(OutputRecord::from_event(event));
        }
        for event in outgoing {
            self.route(event);
        }

        let lp = &mut self.lps[local];
        if lp.snapshots.should_snapshot_full() {
            lp.snapshots.record(crate::snapshot::Snapshot::Full {
                lvt: lp.lvt,
                rng: lp.rng,
                allocator_brk: lp.allocator.brk(),
                bytes: lp.allocator.as_slice().into(),
            });
        } else {
            let brk = lp.allocator.brk();
            let bytes = lp.allocator.as_slice();
            let dirty = lp
                .allocator
                .take_dirty_pages()
                .into_iter()
                .map(|p| {
                    let start = p * crate::allocator::PAGE_SIZE;
                    let end = (start + crate::allocator::PAGE_SIZE).min(bytes.len());
                    (start, bytes[start..end].to_vec().into_boxed_slice())
                })
                .collect();
            lp.snapshots.record(crate::snapshot::Snapshot::Incremental {
                lvt: lp.lvt,
                rng: lp.rng,
                allocator_brk: brk,
                dirty,
            });
        }

        lp.state = LpState::Ready;
        self.metrics.record_event_committed();
        self.service_pending_rendezvous(local);
    }

    fn drain_dispatch_results(&mut self) {
        while let Ok(result) = self.result_rx.try_recv() {
            self.apply_dispatch_result(result);
        }
    }

    /// Ack every rendezvous other LPs have parked on this LP for, now
    /// that its LVT may have reached (or passed) the requested time
    /// (§4.7 step 4). If this LP had already run ahead of the
    /// requested time, it is rolled back to it first so the ack
    /// reflects state as of exactly that time rather than whatever it
    /// has since computed. The ack carries this LP's state reconstructed
    /// as of that time (§2: the rendezvous exists precisely so A can
    /// read B's memory), not just a bare acknowledgement.
    fn service_pending_rendezvous(&mut self, local: usize) {
        let lp_id = self.lps[local].id;
        for (mark, state) in self.ecs.pending_for(lp_id) {
            let lvt = self.lps[local].lvt;
            if lvt < state.at {
                continue;
            }
            if lvt > state.at {
                self.run_rollback(local, state.at);
            }
            let bytes = self.lps[local]
                .snapshots
                .restore(state.at)
                .map(|plan| crate::snapshot::reconstruct(&plan).into_boxed_slice())
                .unwrap_or_default();
            self.ecs.ack_with_state(mark, bytes);
        }
    }

    fn handle_antimessage(&mut self, local: usize, anti: Event) {
        let lp = &mut self.lps[local];
        if !lp.pending.match_antimessage(anti.mark) {
            // twin already committed; roll back to strip its effects.
            self.run_rollback(local, anti.receive_time);
        }
    }

    /// The six-step rollback algorithm (§4.4), plus the ECS bookkeeping
    /// §4.7 step 6 requires: drop dependency edges this LP can no
    /// longer vouch for, and invalidate any rendezvous other LPs had
    /// acked against this LP's now-undone state.
    fn run_rollback(&mut self, local: usize, target: VTime) {
        let lp = &mut self.lps[local];
        lp.state = LpState::BlockedForRollback;
        let outcome = rollback(
            target,
            &mut lp.pending,
            &mut lp.output,
            &mut lp.dispatched,
            &lp.snapshots,
            &lp.allocator,
        );
        if let Some(outcome) = outcome {
            lp.lvt = outcome.restored_to;
            lp.drop_ecs_deps_after(outcome.restored_to);
            let lp_id = lp.id;
            let antis_to_send: Vec<Event> = outcome
                .antimessages_to_send
                .into_iter()
                .map(|mut e| {
                    e.sender = lp_id;
                    e
                })
                .collect();
            let n = antis_to_send.len() as u64;
            for e in antis_to_send {
                self.route(e);
            }
            self.metrics.record_antimessage_sent(n);
            self.metrics.record_rollback();
            for e in outcome.events_to_replay {
                self.lps[local].pending.push(e);
            }
            self.ecs.on_rollback_below(lp_id, outcome.restored_to);
        } else {
            // No snapshot at or before `target`: per §3/§8 this can
            // only happen if a straggler arrived below GVT, which is a
            // kernel invariant violation. Fatal per §7, but the worker
            // logs and parks the LP rather than unwinding the whole
            // process, so other LPs can still be inspected.
            log::error!(
                "LP {} straggler rollback to {target} has no applicable snapshot (fatal invariant violation)",
                self.lps[local].id
            );
        }
        self.lps[local].state = LpState::Ready;
    }

    /// Send an event to its destination's owning worker (or enqueue
    /// it locally if owned by this worker).
    fn route(&mut self, event: Event) {
        let loc = &self.locations[event.receiver as usize];
        if loc.worker == self.index {
            if event.is_antimessage() {
                self.lps[loc.local].pending.push(event);
            } else if self.lps[loc.local].pending.take_stray(event.mark) {
                // stray antimessage had already arrived; cancel silently.
            } else {
                self.lps[loc.local].pending.push(event);
            }
        } else {
            self.cuts[self.index].report_send(event.send_time);
            let _ = self.senders[loc.worker].send(WireMessage::Event(event));
        }
    }

    fn drain_inbound(&mut self) {
        while let Ok(msg) = self.inbox.try_recv() {
            match msg {
                WireMessage::Event(event) => {
                    self.cuts[self.index].report_receive_ack();
                    let loc = &self.locations[event.receiver as usize];
                    debug_assert_eq!(loc.worker, self.index);
                    if event.is_antimessage() {
                        self.lps[loc.local].pending.push(event);
                    } else if self.lps[loc.local].pending.take_stray(event.mark) {
                        // cancelled on arrival
                    } else {
                        self.lps[loc.local].pending.push(event);
                    }
                }
                // Rendezvous is driven entirely through the `Ecs`
                // table every worker shares via the same `Arc` in this
                // single-process kernel, so no worker-to-worker wire
                // message is needed to carry a rendezvous start/ack
                // across the mesh. This arm exists to match §6's wire
                // record and is the integration point a cluster-mode
                // transport would hook into (out of scope, §1
                // Non-goals).
                WireMessage::Control(ControlMessage { kind, .. }) => {
                    log::debug!("ignoring in-process control message of kind {kind:?}");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::abi::Model;
    use crate::allocator::AllocatorArena;
    use crate::event::Mark;
    use crate::wire::worker_mesh;

    struct Noop;
    impl Model for Noop {
        fn process_event(&self, _ctx: &mut KernelCtx, _lp: LpId, _now: VTime, _ty: u32, _payload: &[u8]) {}
        fn on_gvt(&self, _lp: LpId, _state: &[u8]) -> bool {
            true
        }
    }

    fn one_worker(n_lp: usize) -> Worker {
        let arena = AllocatorArena::new(n_lp, 4096).unwrap();
        let lps: Vec<Lp> = (0..n_lp)
            .map(|i| Lp::new(i as LpId, i as u64, arena.region(i), 10))
            .collect();
        std::mem::forget(arena);
        let locations = Arc::new(
            (0..n_lp)
                .map(|i| LpLocation { worker: 0, local: i })
                .collect(),
        );
        let mut mesh = worker_mesh(1);
        let senders = mesh.senders();
        let inbox = mesh.take_inbox(0);
        Worker::new(
            0,
            lps,
            locations,
            senders,
            inbox,
            Arc::new(Noop),
            Arc::new(Ecs::new()),
            Arc::new(KernelMetrics::new()),
            Arc::new(vec![Arc::new(WorkerCut::new())]),
            Arc::new(GvtCoordinator::new(Duration::from_millis(50))),
            Arc::new(Barrier::new(1)),
            1,
            Arc::new(AtomicUsize::new(0)),
            n_lp,
        )
    }

    #[test]
    fn run_loop_terminates_when_queues_are_empty() {
        let mut worker = one_worker(2);
        worker.run_loop(Some(Instant::now() + Duration::from_millis(20)));
    }

    #[test]
    fn dispatches_the_smallest_pending_receive_time_first() {
        let mut worker = one_worker(1);
        worker.lps[0].pending.push(Event::new_positive(0, 0, 0, 10, 0, Box::new([]), Mark::new(0, 1)));
        worker.lps[0].pending.push(Event::new_positive(0, 0, 0, 5, 0, Box::new([]), Mark::new(0, 2)));
        let next = worker.pick_next_ready().unwrap();
        assert_eq!(worker.lps[next].pending.peek_next_receive_time(), Some(5));
    }

    #[test]
    fn a_dispatched_event_eventually_commits_via_the_helper_thread() {
        let mut worker = one_worker(1);
        worker.lps[0].pending.push(Event::new_positive(0, 0, 0, 1, 0, Box::new([]), Mark::new(0, 1)));
        worker.run_loop(Some(Instant::now() + Duration::from_millis(200)));
        assert_eq!(worker.metrics.rollup().events_committed, 1);
        assert_eq!(worker.lps[0].lvt, 1);
    }
}
