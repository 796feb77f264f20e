//! End-to-end scenarios, driving the production queue/snapshot/rollback/
//! allocator/ECS primitives the way a worker's dispatch loop does,
//! without spinning up the thread pool itself.

use rootsim_core::allocator::AllocatorArena;
use rootsim_core::ecs::Ecs;
use rootsim_core::event::{Event, Mark};
use rootsim_core::lp::Lp;
use rootsim_core::queue::OutputRecord;
use rootsim_core::rollback::rollback;
use rootsim_core::snapshot::Snapshot;

fn new_lp(id: u32, region_len: usize, ckpt_period: u32) -> Lp {
    let arena = AllocatorArena::new(1, region_len).unwrap();
    let alloc = arena.region(0);
    std::mem::forget(arena);
    Lp::new(id, id as u64, alloc, ckpt_period)
}

/// Scenario 1: single-LP ping. INIT at t=0 schedules {t=1, type=1};
/// the type-1 handler schedules {t=2, type=1}; two events commit and
/// the LP's LVT lands on 2.
#[test]
fn single_lp_ping() {
    let mut lp = new_lp(0, 4096, 10);

    lp.pending.push(Event::new_positive(0, 0, 0, 1, 1, Box::new([]), lp.next_mark()));
    let e1 = lp.pending.pop_min().unwrap();
    lp.lvt = e1.receive_time;
    lp.snapshots.record(Snapshot::Full {
        lvt: lp.lvt,
        rng: lp.rng,
        allocator_brk: lp.allocator.brk(),
        bytes: lp.allocator.as_slice().into(),
    });

    lp.pending.push(Event::new_positive(0, 0, 1, 2, 1, Box::new([]), lp.next_mark()));
    let e2 = lp.pending.pop_min().unwrap();
    lp.lvt = e2.receive_time;
    lp.snapshots.record(Snapshot::Full {
        lvt: lp.lvt,
        rng: lp.rng,
        allocator_brk: lp.allocator.brk(),
        bytes: lp.allocator.as_slice().into(),
    });

    assert_eq!(lp.lvt, 2);
    assert!(lp.pending.is_empty());
    assert!(!lp.snapshots.is_empty());
}

/// Scenario 2: two-LP antimessage. LP0 sends LP1 an event at t=5; a
/// straggler below LP0's LVT forces a rollback that retracts the send
/// as an antimessage, which cancels the still-pending positive at LP1.
#[test]
fn two_lp_antimessage_cancels_before_dispatch() {
    let mut lp0 = new_lp(0, 4096, 100);
    lp0.snapshots.record(Snapshot::Full {
        lvt: 0,
        rng: lp0.rng,
        allocator_brk: 0,
        bytes: Box::new([]),
    });

    lp0.lvt = 1;
    let mark = lp0.next_mark();
    let sent = Event::new_positive(0, 1, 1, 5, 0, Box::new([]), mark);
    lp0.output.record(OutputRecord::from_event(&sent));

    let mut lp1 = new_lp(1, 4096, 100);
    lp1.pending.push(sent.clone());

    let outcome = rollback(
        0,
        &mut lp0.pending,
        &mut lp0.output,
        &mut lp0.dispatched,
        &lp0.snapshots,
        &lp0.allocator,
    )
    .unwrap();
    assert_eq!(outcome.antimessages_to_send.len(), 1);
    let mut anti = outcome.antimessages_to_send[0].clone();
    anti.sender = lp0.id;

    assert!(lp1.pending.match_antimessage(anti.mark));
    assert!(lp1.pending.is_empty(), "the positive must be cancelled before GVT passes 5");
}

/// Scenario 2b: the ordinary rollback case, where the straggler targets
/// a time strictly before events the LP has *already dispatched and
/// committed* (not merely ones still sitting in the pending queue).
/// LVT=7, straggler arrives at t=4; the events already processed at
/// t=5 and t=7 must be recovered from the dispatch log and replayed,
/// not lost.
#[test]
fn rollback_replays_already_processed_events_not_just_pending_ones() {
    let mut lp = new_lp(0, 4096, 100);
    lp.snapshots.record(Snapshot::Full {
        lvt: 0,
        rng: lp.rng,
        allocator_brk: 0,
        bytes: Box::new([]),
    });

    // Simulate the scheduler's dispatch loop: each event is popped from
    // `pending` and recorded in `dispatched` before being processed, so
    // by the time LVT reaches 7 the pending queue is empty.
    for t in [5u64, 7u64] {
        let mark = lp.next_mark();
        lp.dispatched.record(Event::new_positive(0, 0, t - 1, t, 0, Box::new([]), mark));
        lp.lvt = t;
    }
    assert!(lp.pending.is_empty());

    let outcome = rollback(
        4,
        &mut lp.pending,
        &mut lp.output,
        &mut lp.dispatched,
        &lp.snapshots,
        &lp.allocator,
    )
    .unwrap();

    assert_eq!(
        outcome.events_to_replay.len(),
        2,
        "events committed at t=5 and t=7 must be recovered for replay, not dropped"
    );
    assert!(lp.dispatched.is_empty());
}

/// Scenario 3: ECS rendezvous. LP0 parks waiting on LP1's rendezvous
/// ack; a rollback on LP1 below the rendezvous time invalidates the
/// dependency and wakes LP0 instead of leaving it parked forever.
#[test]
fn ecs_rendezvous_invalidated_by_targets_rollback() {
    let ecs = Ecs::new();
    let mark = Mark::new(0, 7);
    let wait = ecs.start(mark, 0, 1, 3);

    let invalidated = ecs.on_rollback_below(1, 2);
    assert_eq!(invalidated, vec![mark]);
    wait.wait();
}

/// Scenario 4: GVT & fossil collection. After an 8-LP ring advances,
/// fossil collection at the reported GVT leaves no queue or snapshot
/// entry strictly below it except the anchor full snapshot.
#[test]
fn gvt_fossil_collection_clears_everything_below_gvt() {
    use rootsim_core::gvt::fossil_collect;

    let mut lp = new_lp(0, 4096, 100);
    lp.snapshots.record(Snapshot::Full {
        lvt: 0,
        rng: lp.rng,
        allocator_brk: 0,
        bytes: Box::new([]),
    });
    for t in [10, 20, 30] {
        lp.snapshots.record(Snapshot::Incremental {
            lvt: t,
            rng: lp.rng,
            allocator_brk: 0,
            dirty: Vec::new(),
        });
    }
    lp.output.record(OutputRecord {
        mark: Mark::new(0, 1),
        destination: 1,
        send_time: 5,
        receive_time: 6,
        type_tag: 0,
        payload: Box::new([]),
    });
    lp.output.record(OutputRecord {
        mark: Mark::new(0, 2),
        destination: 1,
        send_time: 25,
        receive_time: 26,
        type_tag: 0,
        payload: Box::new([]),
    });
    lp.record_ecs_dependency(rootsim_core::lp::EcsEdge { on: 1, at: 10, mark: Mark::new(0, 3) });
    lp.record_ecs_dependency(rootsim_core::lp::EcsEdge { on: 1, at: 30, mark: Mark::new(0, 4) });

    fossil_collect(&mut lp, 20);

    assert_eq!(lp.output.len(), 1, "only the send at t=25 should survive collection at G=20");
    assert_eq!(lp.ecs_deps.len(), 1);
    assert_eq!(lp.ecs_deps[0].at, 30);
    let restore_plan = lp.snapshots.restore(20).unwrap();
    assert!(restore_plan.full.lvt() <= 20);
}

/// Scenario 5: coast-forward fidelity. Rolling back to an earlier
/// checkpoint and replaying the same events must reproduce the same
/// RNG-derived byte state, since the RNG rides along in the snapshot.
#[test]
fn coast_forward_reproduces_rng_derived_state() {
    let mut lp = new_lp(0, 4096, 3);

    let mut draws_full_run = Vec::new();
    lp.snapshots.record(Snapshot::Full {
        lvt: 0,
        rng: lp.rng,
        allocator_brk: 0,
        bytes: Box::new([]),
    });
    for t in 1..=5u64 {
        lp.lvt = t;
        draws_full_run.push(lp.rng.gaussian(0.0, 1.0));
        lp.snapshots.record(Snapshot::Incremental {
            lvt: t,
            rng: lp.rng,
            allocator_brk: 0,
            dirty: Vec::new(),
        });
    }

    // Roll back to t=2 and coast-forward to t=5 again.
    let plan = lp.snapshots.restore(2).unwrap();
    let mut restored_rng = match &plan.incrementals.last().unwrap_or(&plan.full) {
        Snapshot::Full { rng, .. } => *rng,
        Snapshot::Incremental { rng, .. } => *rng,
    };
    let mut replayed = Vec::new();
    for _ in 3..=5u64 {
        replayed.push(restored_rng.gaussian(0.0, 1.0));
    }

    assert_eq!(&draws_full_run[2..5], replayed.as_slice());
}

/// Scenario 6: allocator exhaustion at the exact region boundary.
#[test]
fn allocator_exhaustion_at_exact_boundary() {
    let arena = AllocatorArena::new(1, 4096).unwrap();
    let alloc = arena.region(0);

    for _ in 0..4 {
        assert!(alloc.malloc(1024).is_some());
    }
    assert!(alloc.malloc(1).is_none(), "region is exactly exhausted");

    alloc.rewind(0);
    assert_eq!(alloc.brk(), 0);
    assert!(alloc.malloc(4096).is_some());
}
