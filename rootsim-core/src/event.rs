//! The model-agnostic event record and the antimessage mark.

use crate::LpId;

/// Virtual time. Fixed-point nanosecond-scale integer rather than a
/// float, so receive-time comparisons used for queue ordering and
/// rollback targets are exact.
pub type VTime = u64;

/// Unique identifier for a sent event, constructed by pairing the
/// sender's id with a per-sender monotonic counter. Kept as an opaque
/// 64-bit value per the DESIGN NOTES: the pairing formula must stay
/// exactly (sender id, per-sender counter) for antimessage matching to
/// stay deterministic across runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Mark(u64);

impl Mark {
    pub fn new(sender: LpId, counter: u64) -> Self {
        debug_assert!(counter <= u32::MAX as u64, "per-sender counter overflowed");
        Mark(((sender as u64) << 32) | (counter & 0xFFFF_FFFF))
    }

    pub fn sender(self) -> LpId {
        (self.0 >> 32) as LpId
    }

    pub fn counter(self) -> u64 {
        self.0 & 0xFFFF_FFFF
    }

    pub fn raw(self) -> u64 {
        self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Positive,
    Antimessage,
}

/// A scheduled event: either a positive send or its antimessage twin.
#[derive(Debug, Clone)]
pub struct Event {
    pub sender: LpId,
    pub receiver: LpId,
    pub send_time: VTime,
    pub receive_time: VTime,
    pub kind: EventKind,
    pub type_tag: u32,
    pub payload: Box<[u8]>,
    pub mark: Mark,
}

impl Event {
    pub fn new_positive(
        sender: LpId,
        receiver: LpId,
        send_time: VTime,
        receive_time: VTime,
        type_tag: u32,
        payload: Box<[u8]>,
        mark: Mark,
    ) -> Self {
        debug_assert!(
            send_time <= receive_time,
            "event scheduled to arrive before it was sent"
        );
        Self {
            sender,
            receiver,
            send_time,
            receive_time,
            kind: EventKind::Positive,
            type_tag,
            payload,
            mark,
        }
    }

    /// The antimessage twin of this event: same mark, same routing,
    /// empty payload (an antimessage only needs to match and cancel).
    pub fn antimessage(&self) -> Self {
        Self {
            sender: self.sender,
            receiver: self.receiver,
            send_time: self.send_time,
            receive_time: self.receive_time,
            kind: EventKind::Antimessage,
            type_tag: self.type_tag,
            payload: Box::new([]),
            mark: self.mark,
        }
    }

    pub fn is_antimessage(&self) -> bool {
        matches!(self.kind, EventKind::Antimessage)
    }
}

/// The initial event every LP receives at t=0; payload is the
/// argv-tail so the model can parse its own parameters (§6).
pub const INIT_TYPE: u32 = 0;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mark_roundtrips_sender_and_counter() {
        let m = Mark::new(7, 42);
        assert_eq!(m.sender(), 7);
        assert_eq!(m.counter(), 42);
    }

    #[test]
    fn marks_with_same_sender_differ_by_counter() {
        let a = Mark::new(1, 1);
        let b = Mark::new(1, 2);
        assert_ne!(a, b);
    }

    #[test]
    fn antimessage_preserves_mark_and_routing() {
        let e = Event::new_positive(1, 2, 10, 20, 5, Box::new([1, 2, 3]), Mark::new(1, 1));
        let anti = e.antimessage();
        assert_eq!(anti.mark, e.mark);
        assert_eq!(anti.sender, e.sender);
        assert_eq!(anti.receiver, e.receiver);
        assert!(anti.is_antimessage());
        assert_eq!(anti.payload.len(), 0);
    }
}
