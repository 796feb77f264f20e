//! C8: the write-fault hook contract. The spec leaves the detection
//! mechanism platform-dependent; this module ships the contract plus
//! two implementors — an explicit-accessor default that needs no
//! platform support, and an optional `mprotect`/`SIGSEGV` path behind
//! a feature flag.

use crate::LpId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultAction {
    /// Service the read through the ECS rendezvous protocol.
    Rendezvous,
    /// The access is local or already safe; let it through untouched.
    Allow,
    /// The kernel cannot attribute this access to any known LP.
    Reject,
}

/// The contract C8 specifies: given a write (or cross-LP read) from
/// `from` touching `addr` that belongs to `to`, decide how the
/// scheduler should handle it.
pub trait WriteFaultHook: Send + Sync {
    fn on_foreign_access(&self, from: LpId, addr: usize, to: LpId) -> FaultAction;
}

/// Default hook: models never trap at the instruction level. They
/// call `KernelCtx::ecs_read(target)` (or `ecs_read_range` for a
/// sub-slice) explicitly, so by the time this hook would be consulted
/// the access has already been routed through ECS by the caller.
/// `on_foreign_access` always answers `Rendezvous` for a foreign LP
/// and `Allow` for the caller's own region.
pub struct AccessorHook;

impl WriteFaultHook for AccessorHook {
    fn on_foreign_access(&self, from: LpId, _addr: usize, to: LpId) -> FaultAction {
        if from == to {
            FaultAction::Allow
        } else {
            FaultAction::Rendezvous
        }
    }
}

/// `mprotect`-guarded regions plus a `SIGSEGV` handler, for models
/// that touch foreign memory directly instead of calling an
/// accessor. Off by default: installing a process-wide signal handler
/// is a real platform commitment the spec calls out as optional.
#[cfg(all(target_os = "linux", feature = "mprotect-fault"))]
pub mod signal_hook {
    use super::{FaultAction, WriteFaultHook};
    use crate::LpId;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Tracks the `[base, base+len)` ranges owned by each LP so the
    /// `SIGSEGV` handler can map a faulting address back to an owner.
    /// Installation of the handler itself is left to the embedding
    /// binary, since only one process-wide handler can be active and
    /// the kernel should not silently steal it from the host.
    pub struct SignalHook {
        region_base: AtomicUsize,
        region_len: usize,
        n_regions: usize,
    }

    impl SignalHook {
        pub fn new(region_base: usize, region_len: usize, n_regions: usize) -> Self {
            Self {
                region_base: AtomicUsize::new(region_base),
                region_len,
                n_regions,
            }
        }

        pub fn owner_of(&self, addr: usize) -> Option<LpId> {
            let base = self.region_base.load(Ordering::Relaxed);
            if addr < base {
                return None;
            }
            let idx = (addr - base) / self.region_len;
            if idx < self.n_regions {
                Some(idx as LpId)
            } else {
                None
            }
        }

        /// Re-arm `PROT_NONE` over another LP's region so its next
        /// touch traps again. Called by the handler after servicing
        /// one rendezvous read.
        ///
        /// # Safety
        /// `addr`/`len` must describe memory inside the arena this
        /// hook was constructed for.
        pub unsafe fn guard(&self, addr: *mut libc::c_void, len: usize) {
            libc::mprotect(addr, len, libc::PROT_NONE);
        }

        /// # Safety
        /// Same as `guard`.
        pub unsafe fn unguard(&self, addr: *mut libc::c_void, len: usize) {
            libc::mprotect(addr, len, libc::PROT_READ | libc::PROT_WRITE);
        }
    }

    impl WriteFaultHook for SignalHook {
        fn on_foreign_access(&self, from: LpId, addr: usize, to: LpId) -> FaultAction {
            match self.owner_of(addr) {
                Some(owner) if owner == to && from != to => FaultAction::Rendezvous,
                Some(_) => FaultAction::Allow,
                None => FaultAction::Reject,
            }
        }
    }
}
