//! Allocation counters backing the runtime memory gauges.
//!
//! [`CountingAllocator`] wraps the system allocator and keeps process-wide
//! atomic tallies. The agent binary installs it as `#[global_allocator]`;
//! without it every counter stays at zero.

use std::alloc::{GlobalAlloc, Layout, System};
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};

struct AllocCounters {
    live_bytes: AtomicU64,
    peak_bytes: AtomicU64,
    total_allocated: AtomicU64,
    total_freed: AtomicU64,
    mallocs: AtomicU64,
    frees: AtomicU64,
    reallocs: AtomicU64,
}

static COUNTERS: AllocCounters = AllocCounters {
    live_bytes: AtomicU64::new(0),
    peak_bytes: AtomicU64::new(0),
    total_allocated: AtomicU64::new(0),
    total_freed: AtomicU64::new(0),
    mallocs: AtomicU64::new(0),
    frees: AtomicU64::new(0),
    reallocs: AtomicU64::new(0),
};

impl AllocCounters {
    fn grow(&self, bytes: u64) {
        let live = self.live_bytes.fetch_add(bytes, AtomicOrdering::Relaxed) + bytes;
        self.total_allocated.fetch_add(bytes, AtomicOrdering::Relaxed);

        let mut peak = self.peak_bytes.load(AtomicOrdering::Relaxed);
        while live > peak {
            match self.peak_bytes.compare_exchange_weak(peak, live, AtomicOrdering::Relaxed, AtomicOrdering::Relaxed) {
                Ok(_) => break,
                Err(current) => peak = current,
            }
        }
    }

    fn shrink(&self, bytes: u64) {
        self.live_bytes.fetch_sub(bytes, AtomicOrdering::Relaxed);
        self.total_freed.fetch_add(bytes, AtomicOrdering::Relaxed);
    }
}

/// System allocator with allocation accounting. Never allocates itself.
#[derive(Debug, Default, Clone, Copy)]
pub struct CountingAllocator;

unsafe impl GlobalAlloc for CountingAllocator {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        let ptr = System.alloc(layout);
        if !ptr.is_null() {
            COUNTERS.mallocs.fetch_add(1, AtomicOrdering::Relaxed);
            COUNTERS.grow(layout.size() as u64);
        }
        ptr
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        let ptr = System.alloc_zeroed(layout);
        if !ptr.is_null() {
            COUNTERS.mallocs.fetch_add(1, AtomicOrdering::Relaxed);
            COUNTERS.grow(layout.size() as u64);
        }
        ptr
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        System.dealloc(ptr, layout);
        COUNTERS.frees.fetch_add(1, AtomicOrdering::Relaxed);
        COUNTERS.shrink(layout.size() as u64);
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        let new_ptr = System.realloc(ptr, layout, new_size);
        if !new_ptr.is_null() {
            COUNTERS.reallocs.fetch_add(1, AtomicOrdering::Relaxed);
            let old_size = layout.size();
            if new_size > old_size {
                COUNTERS.grow((new_size - old_size) as u64);
            } else {
                COUNTERS.shrink((old_size - new_size) as u64);
            }
        }
        new_ptr
    }
}

/// Point-in-time copy of the allocation counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AllocSnapshot {
    pub live_bytes: u64,
    pub peak_bytes: u64,
    pub total_allocated: u64,
    pub total_freed: u64,
    pub mallocs: u64,
    pub frees: u64,
    pub reallocs: u64,
}

impl AllocSnapshot {
    /// Allocations not yet freed
    pub fn live_objects(&self) -> u64 {
        self.mallocs.saturating_sub(self.frees)
    }
}

pub fn snapshot() -> AllocSnapshot {
    AllocSnapshot {
        live_bytes: COUNTERS.live_bytes.load(AtomicOrdering::Relaxed),
        peak_bytes: COUNTERS.peak_bytes.load(AtomicOrdering::Relaxed),
        total_allocated: COUNTERS.total_allocated.load(AtomicOrdering::Relaxed),
        total_freed: COUNTERS.total_freed.load(AtomicOrdering::Relaxed),
        mallocs: COUNTERS.mallocs.load(AtomicOrdering::Relaxed),
        frees: COUNTERS.frees.load(AtomicOrdering::Relaxed),
        reallocs: COUNTERS.reallocs.load(AtomicOrdering::Relaxed),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counts_direct_calls() {
        let allocator = CountingAllocator;
        let layout = Layout::from_size_align(4096, 8).unwrap();
        let before = snapshot();

        unsafe {
            let ptr = allocator.alloc(layout);
            assert!(!ptr.is_null());
            let ptr = allocator.realloc(ptr, layout, 8192);
            assert!(!ptr.is_null());
            allocator.dealloc(ptr, Layout::from_size_align(8192, 8).unwrap());
        }

        let after = snapshot();
        assert!(after.mallocs > before.mallocs);
        assert!(after.frees > before.frees);
        assert!(after.reallocs > before.reallocs);
        assert!(after.total_allocated >= before.total_allocated + 8192);
        assert!(after.total_freed >= before.total_freed + 8192);
        assert!(after.peak_bytes >= 8192);
    }

    #[test]
    fn test_live_objects_never_negative() {
        let snap = AllocSnapshot { mallocs: 1, frees: 3, ..Default::default() };
        assert_eq!(snap.live_objects(), 0);
    }
}
