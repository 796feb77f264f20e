//! C1: per-LP pending event queue and output (sent-event) queue.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashSet, VecDeque};

use crate::event::{Event, Mark, VTime};

/// A queued positive event, ordered by `(receive_time, sender, mark)`
/// so that equal receive times resolve deterministically across runs
/// (§4.1 tie-break rule).
#[derive(Debug, Clone)]
struct QueuedEvent(Event);

impl PartialEq for QueuedEvent {
    fn eq(&self, other: &Self) -> bool {
        self.sort_key() == other.sort_key()
    }
}
impl Eq for QueuedEvent {}

impl QueuedEvent {
    fn sort_key(&self) -> (VTime, u32, u64) {
        (self.0.receive_time, self.0.sender, self.0.mark.raw())
    }
}

impl PartialOrd for QueuedEvent {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedEvent {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.sort_key().cmp(&other.sort_key())
    }
}

/// Priority queue of events awaiting dispatch at this LP, plus the
/// "stray antimessage" set for antimessages that arrive before their
/// positive twin.
#[derive(Default)]
pub struct PendingQueue {
    heap: BinaryHeap<Reverse<QueuedEvent>>,
    strays: HashSet<Mark>,
}

impl PendingQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, event: Event) {
        self.heap.push(Reverse(QueuedEvent(event)));
    }

    pub fn peek_next_receive_time(&self) -> Option<VTime> {
        self.heap.peek().map(|Reverse(e)| e.0.receive_time)
    }

    pub fn pop_min(&mut self) -> Option<Event> {
        self.heap.pop().map(|Reverse(e)| e.0)
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    /// Remove and return every event with receive time strictly greater
    /// than `t` (used when restoring a rollback target, §4.4 step 3 —
    /// the caller reinserts processed ones it wants re-dispatched).
    pub fn cut_after(&mut self, t: VTime) -> Vec<Event> {
        let mut kept = BinaryHeap::new();
        let mut removed = Vec::new();
        for Reverse(qe) in self.heap.drain() {
            if qe.0.receive_time > t {
                removed.push(qe.0);
            } else {
                kept.push(Reverse(qe));
            }
        }
        self.heap = kept;
        removed
    }

    /// Try to annihilate an antimessage against a positive event still
    /// sitting in this queue. Returns `true` if a twin was found and
    /// removed; otherwise the mark is remembered as a stray so a later
    /// arrival of the positive twin cancels immediately (§4.1).
    pub fn match_antimessage(&mut self, mark: Mark) -> bool {
        let mut found = false;
        let mut kept = BinaryHeap::new();
        for Reverse(qe) in self.heap.drain() {
            if !found && qe.0.mark == mark && !qe.0.is_antimessage() {
                found = true;
            } else {
                kept.push(Reverse(qe));
            }
        }
        self.heap = kept;
        if !found {
            self.strays.insert(mark);
        }
        found
    }

    /// Check (and consume) whether `mark` was remembered as a stray
    /// antimessage; a positive arriving with a stray mark is cancelled
    /// on arrival instead of being enqueued.
    pub fn take_stray(&mut self, mark: Mark) -> bool {
        self.strays.remove(&mark)
    }
}

/// A shadow of a sent positive event, kept so rollback can retract it.
#[derive(Debug, Clone)]
pub struct OutputRecord {
    pub mark: Mark,
    pub destination: crate::LpId,
    pub send_time: VTime,
    pub receive_time: VTime,
    pub type_tag: u32,
    pub payload: Box<[u8]>,
}

impl OutputRecord {
    pub fn from_event(event: &Event) -> Self {
        Self {
            mark: event.mark,
            destination: event.receiver,
            send_time: event.send_time,
            receive_time: event.receive_time,
            type_tag: event.type_tag,
            payload: event.payload.clone(),
        }
    }

    pub fn to_antimessage(&self) -> Event {
        Event {
            sender: 0, // filled in by the caller, which knows its own id
            receiver: self.destination,
            send_time: self.send_time,
            receive_time: self.receive_time,
            kind: crate::event::EventKind::Antimessage,
            type_tag: self.type_tag,
            payload: Box::new([]),
            mark: self.mark,
        }
    }
}

/// A log of events this LP has already dispatched (consumed from the
/// pending queue and handed to the model), kept so a later rollback can
/// recover and re-enqueue whichever of them land after the new target
/// (§4.4 step 3: "for every event in the pending queue with receive
/// time > T_rb that was *processed*, reinsert it"). Once an event is
/// popped by `PendingQueue::pop_min` it is gone from that queue, so
/// without this log a rollback targeting a time before the LP's most
/// recent dispatches would lose them outright instead of replaying
/// them. Ordered by receive time, which is monotonic between rollbacks
/// since that's the order events are dispatched in.
#[derive(Default)]
pub struct DispatchLog {
    entries: VecDeque<Event>,
}

impl DispatchLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, event: Event) {
        self.entries.push_back(event);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Remove and return every dispatched event with receive time
    /// strictly greater than `t`, for the caller to requeue (§4.4 step
    /// 3).
    pub fn cut_after(&mut self, t: VTime) -> Vec<Event> {
        let mut kept = VecDeque::new();
        let mut removed = Vec::new();
        for e in self.entries.drain(..) {
            if e.receive_time > t {
                removed.push(e);
            } else {
                kept.push_back(e);
            }
        }
        self.entries = kept;
        removed
    }

    /// Drop every entry with receive time strictly less than GVT: once
    /// committed below GVT, a dispatched event can never again be
    /// rolled back into (§4.6, §8).
    pub fn trim_below(&mut self, gvt: VTime) {
        while self.entries.front().is_some_and(|e| e.receive_time < gvt) {
            self.entries.pop_front();
        }
    }
}

/// Output queue ordered by send time. A single LP's own sends are
/// already monotonic in send time between rollbacks, so this is a
/// plain `VecDeque` rather than a heap.
#[derive(Default)]
pub struct OutputQueue {
    records: VecDeque<OutputRecord>,
}

impl OutputQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, record: OutputRecord) {
        self.records.push_back(record);
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Enumerate (and remove) records with send time strictly greater
    /// than `t`, to retract via antimessage on rollback (§4.4 step 2).
    pub fn antimessages_after(&mut self, t: VTime) -> Vec<OutputRecord> {
        let mut kept = VecDeque::new();
        let mut removed = Vec::new();
        for record in self.records.drain(..) {
            if record.send_time > t {
                removed.push(record);
            } else {
                kept.push_back(record);
            }
        }
        self.records = kept;
        removed
    }

    /// Drop every record with send time strictly less than GVT (§4.6).
    pub fn trim_below(&mut self, gvt: VTime) {
        while self
            .records
            .front()
            .is_some_and(|r| r.send_time < gvt)
        {
            self.records.pop_front();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventKind;

    fn evt(sender: crate::LpId, receive_time: VTime, mark: Mark) -> Event {
        Event {
            sender,
            receiver: 0,
            send_time: 0,
            receive_time,
            kind: EventKind::Positive,
            type_tag: 0,
            payload: Box::new([]),
            mark,
        }
    }

    #[test]
    fn pops_in_receive_time_order() {
        let mut q = PendingQueue::new();
        q.push(evt(0, 10, Mark::new(0, 1)));
        q.push(evt(0, 5, Mark::new(0, 2)));
        q.push(evt(0, 7, Mark::new(0, 3)));
        assert_eq!(q.pop_min().unwrap().receive_time, 5);
        assert_eq!(q.pop_min().unwrap().receive_time, 7);
        assert_eq!(q.pop_min().unwrap().receive_time, 10);
    }

    #[test]
    fn ties_broken_by_sender_then_mark() {
        let mut q = PendingQueue::new();
        q.push(evt(2, 10, Mark::new(2, 1)));
        q.push(evt(1, 10, Mark::new(1, 1)));
        assert_eq!(q.pop_min().unwrap().sender, 1);
        assert_eq!(q.pop_min().unwrap().sender, 2);
    }

    #[test]
    fn cut_after_splits_queue() {
        let mut q = PendingQueue::new();
        q.push(evt(0, 1, Mark::new(0, 1)));
        q.push(evt(0, 5, Mark::new(0, 2)));
        q.push(evt(0, 10, Mark::new(0, 3)));
        let removed = q.cut_after(5);
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].receive_time, 10);
        assert_eq!(q.len(), 2);
    }

    #[test]
    fn antimessage_cancels_matching_positive() {
        let mut q = PendingQueue::new();
        let mark = Mark::new(0, 1);
        q.push(evt(0, 5, mark));
        assert!(q.match_antimessage(mark));
        assert!(q.is_empty());
    }

    #[test]
    fn antimessage_before_positive_is_remembered_as_stray() {
        let mut q = PendingQueue::new();
        let mark = Mark::new(0, 1);
        assert!(!q.match_antimessage(mark));
        assert!(q.take_stray(mark));
        assert!(!q.take_stray(mark), "stray should be consumed once");
    }

    #[test]
    fn output_queue_retracts_after_restore_point() {
        let mut oq = OutputQueue::new();
        oq.record(OutputRecord {
            mark: Mark::new(0, 1),
            destination: 1,
            send_time: 1,
            receive_time: 2,
            type_tag: 0,
            payload: Box::new([]),
        });
        oq.record(OutputRecord {
            mark: Mark::new(0, 2),
            destination: 1,
            send_time: 5,
            receive_time: 6,
            type_tag: 0,
            payload: Box::new([]),
        });
        let retracted = oq.antimessages_after(1);
        assert_eq!(retracted.len(), 1);
        assert_eq!(retracted[0].send_time, 5);
        assert_eq!(oq.len(), 1);
    }

    #[test]
    fn dispatch_log_recovers_events_processed_after_the_rollback_target() {
        let mut log = DispatchLog::new();
        log.record(evt(0, 5, Mark::new(0, 1)));
        log.record(evt(0, 7, Mark::new(0, 2)));
        let recovered = log.cut_after(4);
        assert_eq!(recovered.len(), 2, "both already-processed events must come back");
        assert!(log.is_empty());
    }

    #[test]
    fn dispatch_log_trims_below_gvt() {
        let mut log = DispatchLog::new();
        log.record(evt(0, 1, Mark::new(0, 1)));
        log.record(evt(0, 10, Mark::new(0, 2)));
        log.trim_below(5);
        assert_eq!(log.len(), 1);
    }

    #[test]
    fn output_queue_trims_below_gvt() {
        let mut oq = OutputQueue::new();
        for t in [1, 2, 3, 10] {
            oq.record(OutputRecord {
                mark: Mark::new(0, t),
                destination: 1,
                send_time: t,
                receive_time: t + 1,
                type_tag: 0,
                payload: Box::new([]),
            });
        }
        oq.trim_below(5);
        assert_eq!(oq.len(), 1);
    }
}
