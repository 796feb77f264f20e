//! C7: the Extended Cross-State (ECS) rendezvous protocol (§4.7),
//! letting one LP read another's memory safely under optimistic
//! execution by pausing the reader until the target has processed
//! past the requested time.

use std::collections::HashMap;
use std::sync::{Condvar, Mutex};

use crate::event::{Mark, VTime};
use crate::LpId;

/// One in-flight rendezvous: `requester` is blocked waiting on
/// `target` to reach `at` and ack. `state` carries `target`'s
/// reconstructed memory as of `at`, filled in once the ack arrives —
/// this is the actual cross-LP read C7 exists to serve (§2: "Detects
/// reads by LP A into LP B's memory").
#[derive(Debug, Clone)]
pub struct RendezvousState {
    pub requester: LpId,
    pub target: LpId,
    pub at: VTime,
    pub acked: bool,
    pub state: Option<Box<[u8]>>,
}

/// A per-dispatch-thread park/unpark slot. The helper thread running
/// a blocked dispatch waits on `cv` until `ready` flips true, at which
/// point the target's read has been safely serviced.
#[derive(Default)]
struct WaitSlot {
    ready: Mutex<bool>,
    cv: Condvar,
}

impl WaitSlot {
    fn wait(&self) {
        let mut ready = self.ready.lock().unwrap();
        while !*ready {
            ready = self.cv.wait(ready).unwrap();
        }
    }

    fn signal(&self) {
        let mut ready = self.ready.lock().unwrap();
        *ready = true;
        self.cv.notify_all();
    }
}

/// Per-kernel rendezvous table. Kept as a plain `Mutex<HashMap<_,_>>`
/// rather than a lock-free map: contention here is bounded by the
/// number of simultaneously blocked dispatch threads, not by the
/// steady-state event rate, so a lock-free structure buys nothing.
#[derive(Default)]
pub struct Ecs {
    table: Mutex<HashMap<Mark, RendezvousState>>,
    slots: Mutex<HashMap<Mark, std::sync::Arc<WaitSlot>>>,
}

impl Ecs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Step 1-2 of §4.7: record the rendezvous and return a handle the
    /// calling dispatch thread parks on until `ack_with_state` fires.
    pub fn start(&self, mark: Mark, requester: LpId, target: LpId, at: VTime) -> EcsWait {
        self.table.lock().unwrap().insert(
            mark,
            RendezvousState {
                requester,
                target,
                at,
                acked: false,
                state: None,
            },
        );
        let slot = std::sync::Arc::new(WaitSlot::default());
        self.slots.lock().unwrap().insert(mark, slot.clone());
        EcsWait { slot }
    }

    /// Step 3 of §4.7: the target LP has reached `at` (or beyond); the
    /// scheduler hands over `target`'s reconstructed state as of `at`
    /// so the blocked requester can actually complete its read once
    /// woken, then ack and wake it.
    pub fn ack_with_state(&self, mark: Mark, state: Box<[u8]>) {
        if let Some(s) = self.table.lock().unwrap().get_mut(&mark) {
            s.acked = true;
            s.state = Some(state);
        }
        if let Some(slot) = self.slots.lock().unwrap().remove(&mark) {
            slot.signal();
        }
    }

    /// Take the state bytes a completed `ack_with_state` deposited for
    /// `mark`, for the requester to consume after waking. `None` if the
    /// rendezvous was invalidated by a rollback instead of acked.
    pub fn take_state(&self, mark: Mark) -> Option<Box<[u8]>> {
        self.table.lock().unwrap().get_mut(&mark).and_then(|s| s.state.take())
    }

    /// Step 4-6 of §4.7: the target LP rolled back to before `at`. Any
    /// rendezvous recorded against a time `>= floor` is invalidated —
    /// its requester must be woken with a retry signal rather than a
    /// normal ack, since the read it was waiting on is no longer
    /// valid.
    pub fn on_rollback_below(&self, target: LpId, floor: VTime) -> Vec<Mark> {
        let mut invalidated = Vec::new();
        let mut table = self.table.lock().unwrap();
        table.retain(|mark, state| {
            if state.target == target && state.at >= floor {
                invalidated.push(*mark);
                false
            } else {
                true
            }
        });
        drop(table);
        let mut slots = self.slots.lock().unwrap();
        for mark in &invalidated {
            if let Some(slot) = slots.remove(mark) {
                slot.signal();
            }
        }
        invalidated
    }

    pub fn pending_for(&self, target: LpId) -> Vec<(Mark, RendezvousState)> {
        self.table
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, s)| s.target == target && !s.acked)
            .map(|(m, s)| (*m, s.clone()))
            .collect()
    }
}

/// Handle a blocked dispatch thread owns while waiting on a rendezvous
/// to resolve. `wait()` parks the calling thread; it returns once the
/// read has been serviced (normally) or invalidated by a rollback
/// (the caller distinguishes by re-checking the table, since an
/// invalidated wait simply means "retry the read").
pub struct EcsWait {
    slot: std::sync::Arc<WaitSlot>,
}

impl EcsWait {
    pub fn wait(&self) {
        self.slot.wait();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ack_wakes_blocked_waiter_and_carries_state() {
        let ecs = std::sync::Arc::new(Ecs::new());
        let mark = Mark::new(1, 1);
        let wait = ecs.start(mark, 1, 2, 10);

        let ecs2 = ecs.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(std::time::Duration::from_millis(10));
            ecs2.ack_with_state(mark, Box::new([1, 2, 3]));
        });

        wait.wait();
        handle.join().unwrap();
        assert!(ecs.table.lock().unwrap().get(&mark).unwrap().acked);
        assert_eq!(ecs.take_state(mark).as_deref(), Some([1, 2, 3].as_slice()));
    }

    #[test]
    fn rollback_below_rendezvous_time_invalidates_and_wakes() {
        let ecs = Ecs::new();
        let mark = Mark::new(1, 1);
        let wait = ecs.start(mark, 1, 2, 10);
        let invalidated = ecs.on_rollback_below(2, 5);
        assert_eq!(invalidated, vec![mark]);
        wait.wait();
    }

    #[test]
    fn rollback_above_rendezvous_time_leaves_it_pending() {
        let ecs = Ecs::new();
        let mark = Mark::new(1, 1);
        let _wait = ecs.start(mark, 1, 2, 10);
        let invalidated = ecs.on_rollback_below(2, 15);
        assert!(invalidated.is_empty());
        assert_eq!(ecs.pending_for(2).len(), 1);
    }
}
