//! Allocator metrics.
//!
//! Scalar counters in the same shape as the rest of the cache's stats:
//! relaxed atomics, incremented without backpressure, never under an arena
//! lock. The per-class histogram makes size-class skew visible without a
//! debug dump.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use ember_common::memory::CacheLineAligned;

use crate::config::AllocatorConfig;

/// Counters for allocator activity.
#[derive(Debug)]
pub struct AllocMetrics {
    allocations: CacheLineAligned<AtomicU64>,
    allocated_bytes: CacheLineAligned<AtomicU64>,
    deallocations: CacheLineAligned<AtomicU64>,
    deallocated_bytes: CacheLineAligned<AtomicU64>,
    arenas_materialized: CacheLineAligned<AtomicU64>,
    oom_events: CacheLineAligned<AtomicU64>,
    /// Allocation count per size class, indexed from `min_log2`.
    by_class: Box<[AtomicU64]>,
    min_log2: u32,
}

impl AllocMetrics {
    /// Creates counters covering size classes `min_log2..=max_log2`.
    #[must_use]
    pub fn for_classes(min_log2: u32, max_log2: u32) -> Self {
        let classes = (max_log2 - min_log2 + 1) as usize;
        Self {
            allocations: CacheLineAligned::new(AtomicU64::new(0)),
            allocated_bytes: CacheLineAligned::new(AtomicU64::new(0)),
            deallocations: CacheLineAligned::new(AtomicU64::new(0)),
            deallocated_bytes: CacheLineAligned::new(AtomicU64::new(0)),
            arenas_materialized: CacheLineAligned::new(AtomicU64::new(0)),
            oom_events: CacheLineAligned::new(AtomicU64::new(0)),
            by_class: (0..classes).map(|_| AtomicU64::new(0)).collect(),
            min_log2,
        }
    }

    /// Creates counters sized for a configuration.
    #[must_use]
    pub fn for_config(config: &AllocatorConfig) -> Self {
        Self::for_classes(config.min_log2(), config.max_log2())
    }

    /// Records `count` allocations of class `log2`.
    #[inline]
    pub fn record_allocations(&self, log2: u32, count: usize) {
        let count = count as u64;
        self.allocations.fetch_add(count, Ordering::Relaxed);
        self.allocated_bytes
            .fetch_add(count << log2, Ordering::Relaxed);
        let idx = (log2 - self.min_log2) as usize;
        debug_assert!(idx < self.by_class.len());
        if let Some(class) = self.by_class.get(idx) {
            class.fetch_add(count, Ordering::Relaxed);
        }
    }

    /// Records one deallocation of class `log2`.
    #[inline]
    pub fn record_deallocation(&self, log2: u32) {
        self.deallocations.fetch_add(1, Ordering::Relaxed);
        self.deallocated_bytes
            .fetch_add(1u64 << log2, Ordering::Relaxed);
    }

    /// Records one arena materialization.
    #[inline]
    pub fn record_arena_materialized(&self) {
        self.arenas_materialized.fetch_add(1, Ordering::Relaxed);
    }

    /// Records one failed (out-of-memory) allocation call.
    #[inline]
    pub fn record_oom(&self) {
        self.oom_events.fetch_add(1, Ordering::Relaxed);
    }

    /// Total buffers allocated.
    pub fn allocations(&self) -> u64 {
        self.allocations.load(Ordering::Relaxed)
    }

    /// Total bytes allocated.
    pub fn allocated_bytes(&self) -> u64 {
        self.allocated_bytes.load(Ordering::Relaxed)
    }

    /// Total buffers deallocated.
    pub fn deallocations(&self) -> u64 {
        self.deallocations.load(Ordering::Relaxed)
    }

    /// Total bytes deallocated.
    pub fn deallocated_bytes(&self) -> u64 {
        self.deallocated_bytes.load(Ordering::Relaxed)
    }

    /// Number of arenas materialized so far.
    pub fn arenas_materialized(&self) -> u64 {
        self.arenas_materialized.load(Ordering::Relaxed)
    }

    /// Number of out-of-memory failures.
    pub fn oom_events(&self) -> u64 {
        self.oom_events.load(Ordering::Relaxed)
    }

    /// Allocation count for one size class.
    pub fn class_allocations(&self, log2: u32) -> u64 {
        self.by_class
            .get((log2 - self.min_log2) as usize)
            .map_or(0, |c| c.load(Ordering::Relaxed))
    }
}

impl fmt::Display for AllocMetrics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "AllocMetrics {{ allocations: {}, bytes: {}, deallocations: {}, arenas: {}, oom: {} }}",
            self.allocations(),
            self.allocated_bytes(),
            self.deallocations(),
            self.arenas_materialized(),
            self.oom_events()
        )
    }
}
