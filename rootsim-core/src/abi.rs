//! C9: the model ABI. `Model` is the Rust-native trait statically
//! linked models implement (used by this crate's own integration
//! tests); `DynModel` adapts a `cdylib` loaded via `libloading` to the
//! same trait by calling its four exported C symbols.

use crate::ecs::Ecs;
use crate::event::VTime;
use crate::rng::KernelRng;
use crate::{LpId, SimError, SimResult};

/// The kernel ABI version `rootsim-cli` requires of a loaded model.
/// Bumped whenever the exported symbol set or its calling convention
/// changes.
pub const ROOTSIM_ABI_VERSION: u32 = 1;

/// The object a model's `process_event`/`on_gvt` implementation is
/// handed each call. Mediates every kernel service a model may need:
/// scheduling, unique ids, the deterministic RNG, and cross-LP reads.
pub struct KernelCtx<'a> {
    pub lp: LpId,
    pub now: VTime,
    rng: &'a mut KernelRng,
    uid_counter: &'a mut u64,
    scheduled: Vec<(LpId, VTime, u32, Box<[u8]>)>,
    ecs: &'a Ecs,
    /// Every successful `ecs_read` made during this dispatch, so the
    /// caller can fold each into an `EcsEdge` once the dispatch
    /// commits (§4.7 step 5 — the dependency is only recorded after
    /// the ack, which `ecs_read` already waited for by the time it
    /// returns).
    ecs_reads: Vec<(LpId, VTime, crate::event::Mark)>,
    n_prc_tot: usize,
}

impl<'a> KernelCtx<'a> {
    pub fn new(
        lp: LpId,
        now: VTime,
        rng: &'a mut KernelRng,
        uid_counter: &'a mut u64,
        ecs: &'a Ecs,
        n_prc_tot: usize,
    ) -> Self {
        Self {
            lp,
            now,
            rng,
            uid_counter,
            scheduled: Vec::new(),
            ecs,
            ecs_reads: Vec::new(),
            n_prc_tot,
        }
    }

    pub fn schedule_new_event(&mut self, receiver: LpId, at: VTime, type_tag: u32, payload: &[u8]) {
        debug_assert!(at >= self.now, "cannot schedule an event in this LP's own past");
        self.scheduled.push((receiver, at, type_tag, payload.into()));
    }

    pub fn generate_unique_id(&mut self) -> u64 {
        let id = *self.uid_counter;
        *self.uid_counter += 1;
        id
    }

    pub fn random(&mut self) -> f64 {
        self.rng.random()
    }

    pub fn random_range(&mut self, lo: f64, hi: f64) -> f64 {
        self.rng.random_range(lo, hi)
    }

    pub fn expent(&mut self, mean: f64) -> f64 {
        self.rng.expent(mean)
    }

    pub fn gaussian(&mut self, mean: f64, sd: f64) -> f64 {
        self.rng.gaussian(mean, sd)
    }

    pub fn n_prc_tot(&self) -> usize {
        self.n_prc_tot
    }

    /// The C7 accessor: block this dispatch until `target` has caught
    /// up to `self.now` (or beyond) and ack'd, then return `target`'s
    /// memory reconstructed as of that time — this is the actual
    /// cross-LP read C7 exists to serve (§2, §4.7 step 5). The mark is
    /// also returned since the caller folds it into an `EcsEdge` once
    /// the dispatch commits.
    pub fn ecs_read(&mut self, target: LpId) -> SimResult<(crate::event::Mark, Box<[u8]>)> {
        if target == self.lp {
            return Err(SimError::RendezvousTargetMissing { target });
        }
        let id = *self.uid_counter;
        *self.uid_counter += 1;
        let mark = crate::event::Mark::new(self.lp, id);
        let wait = self.ecs.start(mark, self.lp, target, self.now);
        wait.wait();
        let state = self.ecs.take_state(mark).unwrap_or_default();
        self.ecs_reads.push((target, self.now, mark));
        Ok((mark, state))
    }

    /// Convenience wrapper over `ecs_read` for a model that only wants
    /// `len` bytes at `offset` into `target`'s state rather than the
    /// whole reconstructed buffer.
    pub fn ecs_read_range(&mut self, target: LpId, offset: usize, len: usize) -> SimResult<Box<[u8]>> {
        let (_, state) = self.ecs_read(target)?;
        let end = offset
            .checked_add(len)
            .filter(|&end| end <= state.len())
            .ok_or(SimError::PayloadSizeMismatch {
                expected: offset + len,
                got: state.len(),
            })?;
        Ok(state[offset..end].into())
    }

    pub fn into_scheduled(self) -> Vec<(LpId, VTime, u32, Box<[u8]>)> {
        self.scheduled
    }

    /// Split the two side-channels a dispatch may have produced:
    /// events to route, and ECS dependency edges to record. Consuming
    /// by value since both belong to the caller once the dispatch is
    /// done.
    pub fn into_parts(
        self,
    ) -> (
        Vec<(LpId, VTime, u32, Box<[u8]>)>,
        Vec<(LpId, VTime, crate::event::Mark)>,
    ) {
        (self.scheduled, self.ecs_reads)
    }
}

/// What a model implements to be runnable, whether linked in
/// statically or loaded dynamically through `DynModel`.
pub trait Model: Send + Sync {
    fn process_event(&self, ctx: &mut KernelCtx, lp: LpId, now: VTime, ty: u32, payload: &[u8]);
    /// Whether `lp`'s state as of the last commit should be folded
    /// into the model's own GVT-triggered bookkeeping (fossil
    /// collection callback, §4.6).
    fn on_gvt(&self, lp: LpId, state: &[u8]) -> bool;
}

/// Adapts a dynamically loaded `cdylib` to `Model` by calling its four
/// exported C symbols. The library must export, with C linkage:
///
/// - `rootsim_model_abi_version() -> u32`
/// - `rootsim_n_prc_tot() -> u64`
/// - `rootsim_process_event(lp: u32, now: u64, ty: u32, payload: *const u8, len: usize)`
/// - `rootsim_on_gvt(lp: u32, state: *const u8, len: usize) -> bool`
pub struct DynModel {
    _lib: libloading::Library,
    process_event: unsafe extern "C" fn(u32, u64, u32, *const u8, usize),
    on_gvt: unsafe extern "C" fn(u32, *const u8, usize) -> bool,
    n_prc_tot: unsafe extern "C" fn() -> u64,
}

impl DynModel {
    /// # Safety
    /// `path` must name a shared library that actually exports the
    /// ABI symbols documented above with matching signatures; a
    /// mismatched library causes undefined behavior on the first call.
    pub unsafe fn load(path: &std::path::Path) -> SimResult<Self> {
        let lib = libloading::Library::new(path)
            .map_err(|e| SimError::ModelLoad(e.to_string()))?;

        let version_fn: libloading::Symbol<unsafe extern "C" fn() -> u32> = lib
            .get(b"rootsim_model_abi_version")
            .map_err(|e| SimError::ModelLoad(e.to_string()))?;
        let got = version_fn();
        if got != ROOTSIM_ABI_VERSION {
            return Err(SimError::AbiVersionMismatch {
                expected: ROOTSIM_ABI_VERSION,
                got,
            });
        }

        let process_event = *lib
            .get::<unsafe extern "C" fn(u32, u64, u32, *const u8, usize)>(b"rootsim_process_event")
            .map_err(|e| SimError::ModelLoad(e.to_string()))?;
        let on_gvt = *lib
            .get::<unsafe extern "C" fn(u32, *const u8, usize) -> bool>(b"rootsim_on_gvt")
            .map_err(|e| SimError::ModelLoad(e.to_string()))?;
        let n_prc_tot = *lib
            .get::<unsafe extern "C" fn() -> u64>(b"rootsim_n_prc_tot")
            .map_err(|e| SimError::ModelLoad(e.to_string()))?;

        Ok(Self {
            _lib: lib,
            process_event,
            on_gvt,
            n_prc_tot,
        })
    }

    pub fn n_prc_tot(&self) -> u64 {
        unsafe { (self.n_prc_tot)() }
    }
}

impl Model for DynModel {
    fn process_event(&self, _ctx: &mut KernelCtx, lp: LpId, now: VTime, ty: u32, payload: &[u8]) {
        unsafe {
            (self.process_event)(lp, now, ty, payload.as_ptr(), payload.len());
        }
    }

    fn on_gvt(&self, lp: LpId, state: &[u8]) -> bool {
        unsafe { (self.on_gvt)(lp, state.as_ptr(), state.len()) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Echo;
    impl Model for Echo {
        fn process_event(&self, ctx: &mut KernelCtx, _lp: LpId, now: VTime, ty: u32, payload: &[u8]) {
            ctx.schedule_new_event(ctx.lp, now + 1, ty, payload);
        }
        fn on_gvt(&self, _lp: LpId, _state: &[u8]) -> bool {
            true
        }
    }

    #[test]
    fn ctx_records_scheduled_events_for_the_scheduler_to_enqueue() {
        let ecs = Ecs::new();
        let mut rng = KernelRng::seeded(1);
        let mut uid = 0u64;
        let mut ctx = KernelCtx::new(0, 10, &mut rng, &mut uid, &ecs, 1);
        let model = Echo;
        model.process_event(&mut ctx, 0, 10, 7, &[1, 2, 3]);
        let scheduled = ctx.into_scheduled();
        assert_eq!(scheduled.len(), 1);
        assert_eq!(scheduled[0].1, 11);
        assert_eq!(scheduled[0].2, 7);
    }

    #[test]
    fn ecs_read_of_self_is_rejected() {
        let ecs = Ecs::new();
        let mut rng = KernelRng::seeded(1);
        let mut uid = 0u64;
        let mut ctx = KernelCtx::new(3, 0, &mut rng, &mut uid, &ecs, 4);
        assert!(matches!(
            ctx.ecs_read(3),
            Err(SimError::RendezvousTargetMissing { target: 3 })
        ));
    }
}
