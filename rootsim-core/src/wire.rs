//! §6: the record that crosses the inter-worker channel. Each worker
//! owns one receiver; senders are cloned into every other worker — a
//! plain `mpsc` per destination rather than the teacher's async
//! broadcast channel, since the kernel has no async runtime.

use std::sync::mpsc::{self, Receiver, Sender};

use crate::event::{Event, EventKind, Mark, VTime};
use crate::LpId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlKind {
    RendezvousStart,
    RendezvousAck,
}

/// A rendezvous control message, carried over the same channel as
/// events but never entering a `PendingQueue` (§4.1 note: control
/// messages are a sibling of events, not events themselves).
#[derive(Debug, Clone, Copy)]
pub struct ControlMessage {
    pub sender: LpId,
    pub receiver: LpId,
    pub at: VTime,
    pub mark: Mark,
    pub kind: ControlKind,
}

/// Everything that can cross a worker-to-worker channel.
pub enum WireMessage {
    Event(Event),
    Control(ControlMessage),
}

pub struct ControlHeader {
    pub sender: LpId,
    pub receiver: LpId,
    pub send_time: VTime,
    pub receive_time: VTime,
    pub kind: EventKind,
    pub type_tag: u32,
    pub mark: Mark,
    pub payload_len: u32,
}

impl ControlHeader {
    pub fn from_event(event: &Event) -> Self {
        Self {
            sender: event.sender,
            receiver: event.receiver,
            send_time: event.send_time,
            receive_time: event.receive_time,
            kind: event.kind,
            type_tag: event.type_tag,
            mark: event.mark,
            payload_len: event.payload.len() as u32,
        }
    }
}

/// The mesh of inter-worker channels. `senders[i]` is what any worker
/// uses to address worker `i`; `inboxes[i]` is worker `i`'s own
/// receiving end. Kept as two parallel `Vec`s rather than a single
/// `Vec<WorkerChannel>` struct: `mpsc::Receiver` is `Send` but not
/// `Sync`, so a `Vec` of receivers can only ever be *moved* into the
/// worker that owns each one, never shared behind an `Arc` the way the
/// senders are — each worker gets its own owned `Vec<Sender<_>>`
/// (cloned once up front) plus its own owned `Receiver<_>`, and no
/// `Arc` is needed for either half.
pub struct WorkerMesh {
    senders: Vec<Sender<WireMessage>>,
    inboxes: Vec<Receiver<WireMessage>>,
}

impl WorkerMesh {
    /// Build a full mesh for `n_workers`. Call `take_inbox(i)` exactly
    /// once per worker index to claim that worker's receiving end;
    /// `senders()` may be cloned freely since every worker needs its
    /// own copy of the full sender list to address any other worker.
    pub fn new(n_workers: usize) -> Self {
        let mut senders = Vec::with_capacity(n_workers);
        let mut inboxes = Vec::with_capacity(n_workers);
        for _ in 0..n_workers {
            let (tx, rx) = mpsc::channel();
            senders.push(tx);
            inboxes.push(rx);
        }
        Self { senders, inboxes }
    }

    pub fn senders(&self) -> Vec<Sender<WireMessage>> {
        self.senders.clone()
    }

    /// Take worker `idx`'s inbox. Panics if called twice for the same
    /// index (a worker's inbox is single-owner by construction).
    pub fn take_inbox(&mut self, idx: usize) -> Receiver<WireMessage> {
        std::mem::replace(&mut self.inboxes[idx], mpsc::channel().1)
    }
}

/// Build a full mesh of channels for `n_workers`: `senders[i]` is what
/// any worker uses to send to worker `i`; `inboxes[i]` belongs to
/// worker `i` alone and must be moved out, not shared.
pub fn worker_mesh(n_workers: usize) -> WorkerMesh {
    WorkerMesh::new(n_workers)
}
