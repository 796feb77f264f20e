//! C3: per-LP bump allocator over a slice of a single mmap'd arena,
//! with a dirty-page bitmap the snapshotter drains between dispatches.

use std::sync::atomic::{AtomicUsize, Ordering};

pub const PAGE_SIZE: usize = 4096;

/// One `N`-region arena, backed by a single `mmap` call so every LP's
/// slice lives in the same contiguous virtual range (§4.3).
pub struct AllocatorArena {
    base: *mut u8,
    total_len: usize,
    region_len: usize,
}

// SAFETY: the arena only ever hands out disjoint, non-overlapping
// slices to each `LpAllocator`; no two LPs' regions alias.
unsafe impl Send for AllocatorArena {}
unsafe impl Sync for AllocatorArena {}

impl AllocatorArena {
    /// Reserve `n_regions * region_len` bytes, rounded up to a whole
    /// number of pages, via an anonymous private mapping.
    pub fn new(n_regions: usize, region_len: usize) -> std::io::Result<Self> {
        let region_len = region_len.next_multiple_of(PAGE_SIZE);
        let total_len = region_len * n_regions;
        let base = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                total_len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if base == libc::MAP_FAILED {
            return Err(std::io::Error::last_os_error());
        }
        Ok(Self {
            base: base as *mut u8,
            total_len,
            region_len,
        })
    }

    pub fn region_len(&self) -> usize {
        self.region_len
    }

    /// Hand out the `idx`-th region as an `LpAllocator`. The caller is
    /// responsible for calling this at most once per index.
    pub fn region(&self, idx: usize) -> LpAllocator {
        assert!((idx + 1) * self.region_len <= self.total_len, "region index out of bounds");
        let base = unsafe { self.base.add(idx * self.region_len) };
        LpAllocator {
            base,
            region_len: self.region_len,
            brk: AtomicUsize::new(0),
            dirty: DirtyPageTracker::new(self.region_len),
        }
    }
}

impl Drop for AllocatorArena {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.base as *mut libc::c_void, self.total_len);
        }
    }
}

/// A bump-pointer allocator over one LP's slice of the arena. `malloc`
/// never frees; the region is reclaimed wholesale only by re-running
/// the model from a snapshot (§4.3: "no free; a model that needs more
/// than its region was sized for is a configuration error").
pub struct LpAllocator {
    base: *mut u8,
    region_len: usize,
    brk: AtomicUsize,
    dirty: DirtyPageTracker,
}

impl LpAllocator {
    pub fn malloc(&self, n: usize) -> Option<*mut u8> {
        let mut cur = self.brk.load(Ordering::Relaxed);
        loop {
            let next = cur.checked_add(n)?;
            if next > self.region_len {
                return None;
            }
            match self
                .brk
                .compare_exchange_weak(cur, next, Ordering::AcqRel, Ordering::Relaxed)
            {
                Ok(_) => {
                    let ptr = unsafe { self.base.add(cur) };
                    self.dirty.mark_range(cur, n);
                    return Some(ptr);
                }
                Err(observed) => cur = observed,
            }
        }
    }

    /// `free`/`realloc` are documented no-ops: this allocator only
    /// grows (§4.3).
    pub fn free(&self, _ptr: *mut u8) {}

    pub fn brk(&self) -> usize {
        self.brk.load(Ordering::Relaxed)
    }

    /// Rewind the bump pointer to a prior checkpoint's `brk` value, as
    /// part of rollback (§4.4 step 1). Does not zero memory; the
    /// snapshot restore overwrites whatever a later allocation left
    /// behind before the model reads it.
    pub fn rewind(&self, brk: usize) {
        self.brk.store(brk, Ordering::Relaxed);
    }

    pub fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.base, self.brk()) }
    }

    /// Drain (and clear) the set of pages touched since the last call,
    /// for C2's incremental snapshots.
    pub fn take_dirty_pages(&self) -> Vec<usize> {
        self.dirty.drain()
    }

    pub fn mark_dirty(&self, offset: usize, len: usize) {
        self.dirty.mark_range(offset, len);
    }
}

/// Page-granularity write tracker. A real `mprotect`-based hook would
/// set this from a `SIGSEGV` handler (see `fault::SignalHook`); the
/// default `AccessorHook` path marks pages directly from `malloc` and
/// from `KernelCtx` write accessors instead.
pub struct DirtyPageTracker {
    pages: Vec<std::sync::atomic::AtomicBool>,
}

impl DirtyPageTracker {
    fn new(region_len: usize) -> Self {
        let n_pages = region_len.div_ceil(PAGE_SIZE);
        let mut pages = Vec::with_capacity(n_pages);
        pages.resize_with(n_pages, || std::sync::atomic::AtomicBool::new(false));
        Self { pages }
    }

    fn mark_range(&self, offset: usize, len: usize) {
        if len == 0 {
            return;
        }
        let first = offset / PAGE_SIZE;
        let last = (offset + len - 1) / PAGE_SIZE;
        for page in &self.pages[first..=last.min(self.pages.len() - 1)] {
            page.store(true, Ordering::Relaxed);
        }
    }

    fn drain(&self) -> Vec<usize> {
        let mut dirty = Vec::new();
        for (i, page) in self.pages.iter().enumerate() {
            if page.swap(false, Ordering::Relaxed) {
                dirty.push(i);
            }
        }
        dirty
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn malloc_bumps_and_respects_region_bound() {
        let arena = AllocatorArena::new(1, PAGE_SIZE).unwrap();
        let alloc = arena.region(0);
        let a = alloc.malloc(PAGE_SIZE - 8).unwrap();
        assert!(!a.is_null());
        assert_eq!(alloc.brk(), PAGE_SIZE - 8);
        assert!(alloc.malloc(8).is_some(), "the remaining 8 bytes exactly fit");
        assert!(alloc.malloc(1).is_none(), "region should be exhausted");
    }

    #[test]
    fn rewind_restores_bump_pointer() {
        let arena = AllocatorArena::new(1, PAGE_SIZE).unwrap();
        let alloc = arena.region(0);
        alloc.malloc(64).unwrap();
        let mark = alloc.brk();
        alloc.malloc(64).unwrap();
        alloc.rewind(mark);
        assert_eq!(alloc.brk(), mark);
    }

    #[test]
    fn regions_are_disjoint() {
        let arena = AllocatorArena::new(2, PAGE_SIZE).unwrap();
        let a = arena.region(0);
        let b = arena.region(1);
        let pa = a.malloc(8).unwrap();
        let pb = b.malloc(8).unwrap();
        assert_ne!(pa as usize, pb as usize);
        assert!((pb as usize).abs_diff(pa as usize) >= PAGE_SIZE);
    }

    #[test]
    fn dirty_pages_are_tracked_and_drained_once() {
        let arena = AllocatorArena::new(1, 3 * PAGE_SIZE).unwrap();
        let alloc = arena.region(0);
        alloc.malloc(8).unwrap();
        let dirty = alloc.take_dirty_pages();
        assert_eq!(dirty, vec![0]);
        assert!(alloc.take_dirty_pages().is_empty());
    }
}
