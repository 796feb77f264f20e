//! C4: the rollback algorithm (§4.4), applied to a single `Lp`'s
//! queues/snapshot log/allocator when a straggler or antimessage
//! arrives behind the LP's current LVT.

use crate::event::{Event, VTime};
use crate::queue::{DispatchLog, OutputQueue, PendingQueue};
use crate::snapshot::{Snapshot, SnapshotLog};

/// Why a rollback was triggered, for logging and for the GVT-invariant
/// check in step 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StragglerKind {
    /// A positive event arrived with `receive_time < lvt`.
    PastLvt,
    /// An antimessage arrived whose twin has already been committed
    /// (i.e. its receive time is `< lvt`).
    AntimessageBelowLvt,
}

/// Output of a completed rollback: the antimessages that must now be
/// sent to retract this LP's previously-sent events, and the events
/// that must be re-dispatched (coast-forward) to reach the straggler's
/// time.
pub struct RollbackOutcome {
    pub antimessages_to_send: Vec<Event>,
    pub restored_to: VTime,
    pub events_to_replay: Vec<Event>,
}

/// Run the six-step rollback algorithm against one LP's local state.
/// `target` is the straggler's receive time: the LP must be rewound to
/// a state at or before `target`.
pub fn rollback(
    target: VTime,
    pending: &mut PendingQueue,
    output: &mut OutputQueue,
    dispatched: &mut DispatchLog,
    snapshots: &SnapshotLog,
    allocator: &crate::allocator::LpAllocator,
) -> Option<RollbackOutcome> {
    // Step 1: find the restore point at or before target.
    let plan = snapshots.restore(target)?;

    // Step 2: retract every output record sent after the restore
    // point by turning it into an antimessage. `to_antimessage` can't
    // know the LP's own id, so the caller (the Lp/scheduler) fills in
    // `sender` before putting these on the wire.
    let retracted = output.antimessages_after(plan.restored_to);
    let antimessages_to_send = retracted.iter().map(|r| r.to_antimessage()).collect();

    // Step 3: pull back every pending event scheduled for dispatch
    // after the restore point (still sitting in the queue, never
    // dispatched) plus every event already dispatched/processed after
    // the restore point (recovered from the dispatch log) so both can
    // be coast-forwarded again.
    let mut events_to_replay = pending.cut_after(plan.restored_to);
    events_to_replay.extend(dispatched.cut_after(plan.restored_to));
    events_to_replay.sort_by_key(|e| (e.receive_time, e.sender, e.mark.raw()));

    // Step 1 (state): rewind the allocator's bump pointer to the
    // value recorded at the restore point (the last incremental in
    // the chain, or the full snapshot if there are none). The actual
    // byte restore (full snapshot bytes + incremental patches applied
    // in order) is the caller's job since it owns the model's state
    // buffer; this module only computes what to restore.
    let brk_at_restore = match plan.incrementals.last().unwrap_or(&plan.full) {
        Snapshot::Full { allocator_brk, .. } => *allocator_brk,
        Snapshot::Incremental { allocator_brk, .. } => *allocator_brk,
    };
    allocator.rewind(brk_at_restore);

    Some(RollbackOutcome {
        antimessages_to_send,
        restored_to: plan.restored_to,
        events_to_replay,
    })
}
