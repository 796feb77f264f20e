//! Kernel error taxonomy (§7). Fatal errors stop the simulation after
//! the kernel prints a diagnostic identifying the LP and event/invariant
//! involved; recoverable ones are handled locally by the caller.

use crate::event::VTime;
use crate::LpId;

#[derive(Debug, thiserror::Error)]
pub enum SimError {
    #[error("LP {lp} model handler failed: {detail}")]
    UserModelError { lp: LpId, detail: String },

    #[error("LP {lp} received a straggler at {target} strictly below GVT {gvt}")]
    StragglerBelowGvt {
        lp: LpId,
        target: VTime,
        gvt: VTime,
    },

    #[error("LP {lp} allocator exhausted: requested {requested} bytes")]
    AllocatorExhausted { lp: LpId, requested: usize },

    #[error("rendezvous target LP {target} does not exist")]
    RendezvousTargetMissing { target: LpId },

    #[error("payload size mismatch: expected {expected}, got {got}")]
    PayloadSizeMismatch { expected: usize, got: usize },

    #[error("GVT round timed out and was aborted")]
    GvtTimeout,

    #[error("foreign-memory trap at {addr:#x} from an LP the kernel cannot identify")]
    UnknownFaultSource { addr: usize },

    #[error("model ABI version mismatch: kernel expects {expected}, model exports {got}")]
    AbiVersionMismatch { expected: u32, got: u32 },

    #[error("failed to load model library: {0}")]
    ModelLoad(String),
}

impl SimError {
    /// Whether this error must stop the simulation (§7 propagation
    /// policy). Allocator exhaustion is surfaced to the model as a
    /// null pointer rather than this enum in normal operation; it is
    /// listed here for completeness and is not fatal. GVT timeout is
    /// handled locally by retrying the round.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, SimError::GvtTimeout | SimError::AllocatorExhausted { .. })
    }
}

pub type SimResult<T> = Result<T, SimError>;
