//! Time Warp optimistic-synchronization kernel.
//!
//! `rootsim-core` implements the event queues, checkpointed rollback,
//! GVT computation, and Extended Cross-State rendezvous protocol
//! described by the simulator's design notes. It has no required
//! async runtime and never initializes logging itself — that is left
//! to the embedding binary (`rootsim-cli` or a test harness).

pub mod abi;
pub mod allocator;
pub mod config;
pub mod ecs;
pub mod error;
pub mod event;
pub mod fault;
pub mod gvt;
pub mod kernel;
pub mod lp;
pub mod metrics;
pub mod queue;
pub mod rng;
pub mod rollback;
pub mod scheduler;
pub mod snapshot;
pub mod wire;

/// Logical process identifier. Dense and zero-based: valid ids are
/// `0..n_prc_tot`.
pub type LpId = u32;

pub use error::{SimError, SimResult};
pub use event::{Event, EventKind, Mark, VTime};
pub use kernel::Kernel;
