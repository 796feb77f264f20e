//! C2: LP state checkpoint log. Periodic full snapshots anchor a chain
//! of incremental (dirty-byte) records; restore finds the latest
//! applicable full snapshot and replays incrementals up to it.

use crate::event::VTime;
use crate::rng::KernelRng;

#[derive(Debug, Clone)]
pub enum Snapshot {
    Full {
        lvt: VTime,
        rng: KernelRng,
        allocator_brk: usize,
        bytes: Box<[u8]>,
    },
    Incremental {
        lvt: VTime,
        rng: KernelRng,
        allocator_brk: usize,
        /// (offset, bytes) pairs of state that changed since the
        /// previous snapshot in the chain.
        dirty: Vec<(usize, Box<[u8]>)>,
    },
}

impl Snapshot {
    pub fn lvt(&self) -> VTime {
        match self {
            Snapshot::Full { lvt, .. } => *lvt,
            Snapshot::Incremental { lvt, .. } => *lvt,
        }
    }
}

/// What `restore` needs the caller to do: apply a full snapshot, then
/// replay a chain of incrementals on top of it, landing at some LVT
/// `restored_to`. Anything between `restored_to` and the original
/// rollback target is the caller's job (coast-forward, §4.4 step 4).
pub struct RestorePlan {
    pub full: Snapshot,
    pub incrementals: Vec<Snapshot>,
    pub restored_to: VTime,
}

/// Reconstruct the full state implied by a restore plan: the anchor
/// full snapshot's bytes with every incremental's dirty-byte patches
/// applied on top, in order. Read-only — unlike rollback's `restore`
/// (which rewinds the live allocator in place), this is for querying
/// state as of a given LVT without disturbing the LP, e.g. to serve
/// `on_gvt` a view of state as of GVT rather than the LP's live,
/// possibly-ahead-of-GVT buffer (§4.9, §8).
pub fn reconstruct(plan: &RestorePlan) -> Vec<u8> {
    let mut bytes = match &plan.full {
        Snapshot::Full { bytes, .. } => bytes.to_vec(),
        Snapshot::Incremental { .. } => unreachable!("RestorePlan::full is always Full"),
    };
    for entry in &plan.incrementals {
        if let Snapshot::Incremental { dirty, .. } = entry {
            for (offset, patch) in dirty {
                let end = offset + patch.len();
                if end > bytes.len() {
                    bytes.resize(end, 0);
                }
                bytes[*offset..end].copy_from_slice(patch);
            }
        }
    }
    bytes
}

/// Policy: snapshot every `period`-th dispatch is a full snapshot;
/// intermediate dispatches append incrementals. `period == 1` means
/// full snapshots every event (no replay ever needed).
pub struct SnapshotLog {
    period: u32,
    events_since_full: u32,
    entries: Vec<Snapshot>,
}

impl SnapshotLog {
    pub fn new(period: u32) -> Self {
        assert!(period >= 1, "snapshot period must be >= 1");
        Self {
            period,
            events_since_full: 0,
            entries: Vec::new(),
        }
    }

    /// Whether the dispatch about to happen should be preceded by a
    /// full snapshot rather than an incremental one.
    pub fn should_snapshot_full(&self) -> bool {
        self.entries.is_empty() || self.events_since_full + 1 >= self.period
    }

    pub fn record(&mut self, snapshot: Snapshot) {
        debug_assert!(
            self.entries.last().is_none_or(|last| last.lvt() <= snapshot.lvt()),
            "snapshots for an LP must be strictly ordered by LVT"
        );
        match &snapshot {
            Snapshot::Full { .. } => self.events_since_full = 0,
            Snapshot::Incremental { .. } => self.events_since_full += 1,
        }
        self.entries.push(snapshot);
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn earliest_full_lvt(&self) -> Option<VTime> {
        self.entries.iter().find_map(|s| match s {
            Snapshot::Full { lvt, .. } => Some(*lvt),
            _ => None,
        })
    }

    /// Find the latest full snapshot with `lvt <= target`, plus every
    /// incremental after it up to the largest snapshot still `<=
    /// target` (§4.2).
    pub fn restore(&self, target: VTime) -> Option<RestorePlan> {
        let full_idx = self
            .entries
            .iter()
            .enumerate()
            .rev()
            .find(|(_, s)| matches!(s, Snapshot::Full { .. }) && s.lvt() <= target)
            .map(|(idx, _)| idx)?;

        let mut incrementals = Vec::new();
        let mut restored_to = self.entries[full_idx].lvt();
        for s in &self.entries[full_idx + 1..] {
            if s.lvt() > target {
                break;
            }
            restored_to = s.lvt();
            incrementals.push(s.clone());
        }

        Some(RestorePlan {
            full: self.entries[full_idx].clone(),
            incrementals,
            restored_to,
        })
    }

    /// Drop every entry strictly below `gvt`, keeping the latest full
    /// snapshot with `lvt <= gvt` as the anchor (§4.6, §8).
    pub fn fossil_collect(&mut self, gvt: VTime) {
        let anchor_idx = self
            .entries
            .iter()
            .enumerate()
            .rev()
            .find(|(_, s)| matches!(s, Snapshot::Full { .. }) && s.lvt() <= gvt)
            .map(|(idx, _)| idx);

        let Some(anchor_idx) = anchor_idx else {
            return;
        };
        self.entries.drain(0..anchor_idx);
    }
}
