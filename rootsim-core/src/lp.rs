//! The logical process: owns one partition's worth of queues,
//! snapshot log, allocator and RNG, and the state machine that drives
//! it through dispatch, rendezvous and rollback (§3).

use crate::allocator::LpAllocator;
use crate::event::{Mark, VTime};
use crate::queue::{DispatchLog, OutputQueue, PendingQueue};
use crate::rng::KernelRng;
use crate::snapshot::SnapshotLog;
use crate::LpId;

/// §3's LP state machine. `BlockedForRendezvous` and
/// `BlockedForRollback` are transient: the scheduler never leaves an
/// LP parked there across a `run_loop` iteration boundary without a
/// dispatch thread actively waiting on the corresponding condvar.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LpState {
    Idle,
    Ready,
    Running,
    BlockedForRendezvous { on: LpId },
    BlockedForRollback,
    Terminated,
}

/// A recorded ECS dependency: this LP read `on`'s state as of virtual
/// time `at`, tagged with the rendezvous mark so a later rollback on
/// `on` below `at` can find and invalidate it (§4.7 step 4).
#[derive(Debug, Clone, Copy)]
pub struct EcsEdge {
    pub on: LpId,
    pub at: VTime,
    pub mark: Mark,
}

pub struct Lp {
    pub id: LpId,
    pub lvt: VTime,
    pub state: LpState,
    pub pending: PendingQueue,
    pub output: OutputQueue,
    /// Events already dispatched by this LP, kept so rollback can
    /// recover and replay whichever of them land after a new target
    /// (§4.4 step 3) — see `queue::DispatchLog`.
    pub dispatched: DispatchLog,
    pub snapshots: SnapshotLog,
    pub allocator: LpAllocator,
    pub ecs_deps: Vec<EcsEdge>,
    pub rng: KernelRng,
    uid_counter: u64,
}

impl Lp {
    pub fn new(id: LpId, seed: u64, allocator: LpAllocator, ckpt_period: u32) -> Self {
        Self {
            id,
            lvt: 0,
            state: LpState::Idle,
            pending: PendingQueue::new(),
            output: OutputQueue::new(),
            dispatched: DispatchLog::new(),
            snapshots: SnapshotLog::new(ckpt_period),
            allocator,
            ecs_deps: Vec::new(),
            rng: KernelRng::seeded(seed),
            uid_counter: 0,
        }
    }

    /// Monotonic per-LP counter backing `Mark::new` for this LP's
    /// sends, and `KernelCtx::generate_unique_id` for model use.
    pub fn next_counter(&mut self) -> u64 {
        let c = self.uid_counter;
        self.uid_counter += 1;
        c
    }

    pub fn next_mark(&mut self) -> Mark {
        Mark::new(self.id, self.next_counter())
    }

    /// Current value of the monotonic counter backing both
    /// `next_mark` and `KernelCtx::generate_unique_id`/`ecs_read`'s
    /// mark minting, so a dispatch run on a helper thread can seed its
    /// own copy and hand the advanced value back when it commits.
    pub fn uid_counter(&self) -> u64 {
        self.uid_counter
    }

    pub fn set_uid_counter(&mut self, value: u64) {
        self.uid_counter = value;
    }

    /// Record that this dispatch read `on`'s state at `at` under
    /// `mark`, so a future rollback on `on` can find and invalidate
    /// the dependency (§4.7 step 4).
    pub fn record_ecs_dependency(&mut self, edge: EcsEdge) {
        self.ecs_deps.push(edge);
    }

    /// Drop every recorded dependency below `gvt`, mirroring fossil
    /// collection on the queues (§4.6).
    pub fn fossil_collect_ecs_deps(&mut self, gvt: VTime) {
        self.ecs_deps.retain(|e| e.at >= gvt);
    }

    /// Drop every recorded dependency rooted strictly after `target`,
    /// i.e. one this LP can no longer have relied on once it has
    /// rolled back to `target` (§4.4 step 5).
    pub fn drop_ecs_deps_after(&mut self, target: VTime) {
        self.ecs_deps.retain(|e| e.at <= target);
    }

    pub fn is_terminated(&self) -> bool {
        matches!(self.state, LpState::Terminated)
    }
}
