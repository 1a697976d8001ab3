//! The buddy allocator.
//!
//! Coordinates a bounded pool of arenas: routes requests across them with a
//! rotating hint, grows the pool lazily against the memory manager's
//! budget, and rolls back partially-filled requests so failures are atomic.
//!
//! The arena array is pre-sized to its maximum and never reallocated or
//! reordered; a published arena count (release store, acquire load) is the
//! only synchronization a reader needs to index it.

use std::fmt::Write as _;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::arena::Arena;
use crate::config::AllocatorConfig;
use crate::error::{AllocError, AllocResult};
use crate::handle::{BlankFactory, BufferFactory, BufferHandle};
use crate::manager::MemoryManager;
use crate::metrics::AllocMetrics;

/// How many consecutive no-progress sweeps a request tolerates before it
/// reports the pool exhausted.
const MAX_STALLED_RETRIES: usize = 3;

/// Buddy allocator over a bounded pool of arenas.
///
/// All methods take `&self`; the allocator is meant to be shared across the
/// cache's worker threads behind an `Arc`.
pub struct BuddyAllocator {
    config: AllocatorConfig,
    /// Pre-sized arena slots; a slot is set exactly once, under `grow_lock`,
    /// before the count below publishes it.
    arenas: Box<[OnceLock<Arena>]>,
    /// Number of fully-built arenas; prefix of `arenas`.
    materialized: AtomicUsize,
    /// Serializes pool growth. Never held while serving buffers.
    grow_lock: Mutex<()>,
    manager: Arc<dyn MemoryManager>,
    factory: Arc<dyn BufferFactory>,
    metrics: Arc<AllocMetrics>,
    /// Rotating sweep start, bumped per call to spread lock traffic.
    next_hint: AtomicUsize,
}

impl BuddyAllocator {
    /// Creates an allocator and materializes its first arena.
    ///
    /// Registers `config.max_total` as the manager's ceiling. Fails with
    /// [`AllocError::Config`] if the configuration is invalid.
    pub fn new(
        config: AllocatorConfig,
        manager: Arc<dyn MemoryManager>,
        metrics: Arc<AllocMetrics>,
    ) -> AllocResult<Self> {
        config.validate().map_err(AllocError::config)?;
        manager.update_max_size(config.max_total);

        let arenas: Box<[OnceLock<Arena>]> =
            (0..config.max_arenas()).map(|_| OnceLock::new()).collect();

        let allocator = Self {
            config,
            arenas,
            materialized: AtomicUsize::new(0),
            grow_lock: Mutex::new(()),
            manager,
            factory: Arc::new(BlankFactory),
            metrics,
            next_hint: AtomicUsize::new(0),
        };
        {
            let _guard = allocator.grow_lock.lock();
            allocator.materialize_locked(1);
        }
        info!(
            min_alloc = allocator.config.min_alloc,
            max_alloc = allocator.config.max_alloc,
            arena_size = allocator.config.arena_size,
            max_total = allocator.config.max_total,
            "buddy allocator initialized"
        );
        Ok(allocator)
    }

    /// Replaces the factory used by [`allocate_buffers`](Self::allocate_buffers).
    #[must_use]
    pub fn with_factory(mut self, factory: Arc<dyn BufferFactory>) -> Self {
        self.factory = factory;
        self
    }

    /// Fills every handle in `handles` with a buffer of `size_bytes`
    /// rounded up to its size class.
    ///
    /// On success every handle points to a live allocation. On failure the
    /// call is atomic: any handle populated along the way is deallocated
    /// and reset, and the budget is exactly what it was before the call.
    pub fn allocate_multiple(
        &self,
        handles: &mut [BufferHandle],
        size_bytes: usize,
    ) -> AllocResult<()> {
        let log2 = self
            .config
            .class_for(size_bytes)
            .ok_or(AllocError::InvalidSize {
                requested: size_bytes,
            })?;
        if handles.is_empty() {
            return Ok(());
        }

        let need = handles.len();
        let mut served = 0usize;
        // Net bytes this call has reserved against the budget so far.
        let mut reserved = 0usize;
        let mut stalled = 0usize;

        loop {
            // Sweep the materialized arenas from the rotating hint. A
            // request may be satisfied across several arenas.
            let count = self.materialized.load(Ordering::Acquire);
            let start = self.next_hint.fetch_add(1, Ordering::Relaxed);
            let mut pass_served = 0usize;
            for i in 0..count {
                let idx = (start + i) % count;
                let Some(arena) = self.arenas[idx].get() else {
                    continue;
                };
                pass_served += arena.allocate_into(&mut handles[served + pass_served..], log2);
                if served + pass_served == need {
                    break;
                }
            }
            served += pass_served;
            if served == need {
                self.metrics.record_allocations(log2, need);
                return Ok(());
            }

            // Reserve the remaining shortfall. The manager may block here
            // while eviction makes room; a refusal is final.
            let remain = (need - served) << log2;
            if reserved < remain {
                let shortfall = remain - reserved;
                if !self.manager.reserve_memory(shortfall, true) {
                    debug!(bytes = shortfall, "memory manager refused reservation");
                    return Err(self.fail_oom(handles, served, reserved, need << log2));
                }
                reserved = remain;
            }

            // Grow the pool by the minimum number of arenas covering the
            // shortfall.
            let wanted = count + (remain + self.config.arena_size - 1) / self.config.arena_size;
            let grown_to = {
                let _guard = self.grow_lock.lock();
                self.materialize_locked(wanted)
            };

            // Retry is the next loop iteration. An iteration that neither
            // served a buffer nor saw the pool grow usually means the pool
            // is at its limit with every arena full, but a racing thread
            // can also drain a sweep and free the blocks again moments
            // later. Transient contention is not surfaced; a few stalled
            // iterations in a row are.
            if grown_to == count && pass_served == 0 {
                stalled += 1;
                if stalled >= MAX_STALLED_RETRIES {
                    return Err(self.fail_oom(handles, served, reserved, need << log2));
                }
            } else {
                stalled = 0;
            }
        }
    }

    /// Allocates `count` buffers of `size_bytes`, drawing blank handles
    /// from the configured factory.
    pub fn allocate_buffers(
        &self,
        count: usize,
        size_bytes: usize,
    ) -> AllocResult<Vec<BufferHandle>> {
        let mut handles: Vec<BufferHandle> =
            (0..count).map(|_| self.factory.create_blank()).collect();
        self.allocate_multiple(&mut handles, size_bytes)?;
        Ok(handles)
    }

    /// Returns a buffer to its owning arena and the budget.
    ///
    /// Consumes the handle; freeing the same buffer twice is therefore not
    /// expressible through this API.
    ///
    /// # Panics
    ///
    /// Panics if the handle is blank or references an arena this allocator
    /// never materialized.
    pub fn deallocate(&self, handle: BufferHandle) {
        assert!(
            handle.is_allocated(),
            "deallocate called with a blank buffer handle"
        );
        let log2 = u32::from(handle.size_class());
        let arena_index = handle.arena_index() as usize;
        let arena = self.arenas[arena_index]
            .get()
            .unwrap_or_else(|| panic!("buffer handle references unmaterialized arena {arena_index}"));
        arena.deallocate(handle.offset(), log2);
        self.manager.release_memory(1usize << log2);
        self.metrics.record_deallocation(log2);
    }

    /// Number of arenas materialized so far.
    pub fn materialized_arenas(&self) -> usize {
        self.materialized.load(Ordering::Acquire)
    }

    /// Returns true if every materialized arena is back in its initial
    /// state, i.e. no allocation is outstanding.
    pub fn is_fully_free(&self) -> bool {
        let count = self.materialized.load(Ordering::Acquire);
        self.arenas[..count]
            .iter()
            .filter_map(OnceLock::get)
            .all(Arena::is_fully_free)
    }

    /// The configuration this allocator was built with.
    pub fn config(&self) -> &AllocatorConfig {
        &self.config
    }

    /// The allocator's metrics counters.
    pub fn metrics(&self) -> &AllocMetrics {
        &self.metrics
    }

    /// Renders a per-arena free-list census for diagnostics.
    pub fn debug_dump(&self) -> String {
        let count = self.materialized.load(Ordering::Acquire);
        let mut out = format!(
            "buddy allocator: {} of {} arenas materialized, classes {}..={}\n",
            count,
            self.arenas.len(),
            self.config.min_log2(),
            self.config.max_log2(),
        );
        for (i, slot) in self.arenas[..count].iter().enumerate() {
            let Some(arena) = slot.get() else {
                continue;
            };
            let _ = write!(out, "arena {}: {} bytes free;", i, arena.free_bytes());
            for (log2, free) in arena.census() {
                let _ = write!(out, " c{}:{}", log2, free);
            }
            out.push('\n');
        }
        out
    }

    /// Builds arenas up to `target` (capped at the pool limit) and
    /// publishes the new count. Caller must hold `grow_lock`.
    fn materialize_locked(&self, target: usize) -> usize {
        let current = self.materialized.load(Ordering::Acquire);
        let target = target.min(self.arenas.len());
        if target <= current {
            return current;
        }
        for i in current..target {
            let arena = Arena::new(i as u32, &self.config);
            // The growth lock guarantees the slot is still empty.
            let _ = self.arenas[i].set(arena);
            self.metrics.record_arena_materialized();
            debug!(arena = i, "materialized arena");
        }
        // Publish only after every new arena is fully built.
        self.materialized.store(target, Ordering::Release);
        target
    }

    /// Undoes a failed call: returns every populated handle to its arena,
    /// gives back this call's net reservation, and builds the error.
    fn fail_oom(
        &self,
        handles: &mut [BufferHandle],
        served: usize,
        reserved: usize,
        requested: usize,
    ) -> AllocError {
        self.rollback(&mut handles[..served]);
        if reserved > 0 {
            self.manager.release_memory(reserved);
        }
        self.metrics.record_oom();
        let dump = self.manager.debug_dump_for_oom();
        warn!(requested, "cache allocation failed: out of memory");
        AllocError::OutOfMemory { requested, dump }
    }

    fn rollback(&self, handles: &mut [BufferHandle]) {
        for handle in handles {
            if !handle.is_allocated() {
                continue;
            }
            if let Some(arena) = self.arenas[handle.arena_index() as usize].get() {
                arena.deallocate(handle.offset(), u32::from(handle.size_class()));
            }
            handle.clear();
        }
    }
}

impl std::fmt::Debug for BuddyAllocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BuddyAllocator")
            .field("config", &self.config)
            .field("materialized", &self.materialized_arenas())
            .field("max_arenas", &self.arenas.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manager::BudgetManager;

    /// Grants everything, tracks nothing.
    struct Unbounded;

    impl MemoryManager for Unbounded {
        fn reserve_memory(&self, _bytes: usize, _wait: bool) -> bool {
            true
        }
        fn release_memory(&self, _bytes: usize) {}
        fn update_max_size(&self, _bytes: usize) {}
        fn debug_dump_for_oom(&self) -> String {
            String::new()
        }
    }

    /// Refuses every reservation.
    struct Refuse;

    impl MemoryManager for Refuse {
        fn reserve_memory(&self, _bytes: usize, _wait: bool) -> bool {
            false
        }
        fn release_memory(&self, _bytes: usize) {}
        fn update_max_size(&self, _bytes: usize) {}
        fn debug_dump_for_oom(&self) -> String {
            "refused".to_string()
        }
    }

    fn tiny_config() -> AllocatorConfig {
        AllocatorConfig::new()
            .with_min_alloc(8)
            .with_max_alloc(256)
            .with_arena_size(256)
            .with_max_total(1024)
    }

    fn tiny(manager: Arc<dyn MemoryManager>) -> BuddyAllocator {
        let config = tiny_config();
        let metrics = Arc::new(AllocMetrics::for_config(&config));
        BuddyAllocator::new(config, manager, metrics).unwrap()
    }

    #[test]
    fn test_invalid_config_rejected() {
        let config = tiny_config().with_min_alloc(24);
        let metrics = Arc::new(AllocMetrics::for_config(&tiny_config()));
        let err = BuddyAllocator::new(config, Arc::new(Unbounded), metrics).unwrap_err();
        assert!(matches!(err, AllocError::Config { .. }));
    }

    #[test]
    fn test_invalid_sizes_rejected() {
        let allocator = tiny(Arc::new(Unbounded));
        let mut handles = vec![BufferHandle::blank()];

        let err = allocator.allocate_multiple(&mut handles, 0).unwrap_err();
        assert!(matches!(err, AllocError::InvalidSize { requested: 0 }));

        let err = allocator.allocate_multiple(&mut handles, 257).unwrap_err();
        assert!(matches!(err, AllocError::InvalidSize { requested: 257 }));

        assert!(!handles[0].is_allocated());
    }

    #[test]
    fn test_allocate_rounds_up() {
        let allocator = tiny(Arc::new(Unbounded));
        let mut handles = vec![BufferHandle::blank()];
        allocator.allocate_multiple(&mut handles, 100).unwrap();
        assert_eq!(handles[0].len(), 128);
        allocator.deallocate(handles.pop().unwrap());
        assert!(allocator.is_fully_free());
    }

    #[test]
    fn test_first_arena_is_eager() {
        let allocator = tiny(Arc::new(Unbounded));
        assert_eq!(allocator.materialized_arenas(), 1);
        assert_eq!(allocator.metrics().arenas_materialized(), 1);
    }

    #[test]
    fn test_grows_across_arenas() {
        let allocator = tiny(Arc::new(Unbounded));
        // Three max-class buffers need three 256-byte arenas.
        let handles = allocator.allocate_buffers(3, 256).unwrap();
        assert_eq!(allocator.materialized_arenas(), 3);

        let distinct: std::collections::HashSet<u32> =
            handles.iter().map(BufferHandle::arena_index).collect();
        assert_eq!(distinct.len(), 3);

        for handle in handles {
            allocator.deallocate(handle);
        }
        assert!(allocator.is_fully_free());
    }

    #[test]
    fn test_pool_exhaustion_is_oom() {
        let allocator = tiny(Arc::new(Unbounded));
        // The pool holds 4 arenas of 256 bytes; a 5th max-class buffer
        // cannot exist even though the manager grants everything.
        let handles = allocator.allocate_buffers(4, 256).unwrap();
        let err = allocator.allocate_buffers(1, 256).unwrap_err();
        assert!(matches!(err, AllocError::OutOfMemory { .. }));

        for handle in handles {
            allocator.deallocate(handle);
        }
        assert!(allocator.is_fully_free());
    }

    #[test]
    fn test_refused_reservation_rolls_back() {
        let allocator = tiny(Arc::new(Refuse));
        // Fits in the eager arena: no reservation needed.
        let first = allocator.allocate_buffers(2, 128).unwrap();

        // Needs a second arena, so a reservation, which is refused. The
        // two buffers from this call's phase A must be rolled back.
        let census_before = allocator.debug_dump();
        let err = allocator.allocate_buffers(2, 128).unwrap_err();
        match err {
            AllocError::OutOfMemory { requested, dump } => {
                assert_eq!(requested, 256);
                assert_eq!(dump, "refused");
            }
            other => panic!("expected OutOfMemory, got {other:?}"),
        }
        assert_eq!(allocator.debug_dump(), census_before);
        assert_eq!(allocator.metrics().oom_events(), 1);

        for handle in first {
            allocator.deallocate(handle);
        }
        assert!(allocator.is_fully_free());
    }

    #[test]
    fn test_budget_manager_accounting() {
        let config = tiny_config();
        let manager = Arc::new(BudgetManager::new(0));
        let metrics = Arc::new(AllocMetrics::for_config(&config));
        let manager_dyn: Arc<dyn MemoryManager> = manager.clone();
        let allocator = BuddyAllocator::new(config, manager_dyn, metrics).unwrap();
        // Construction registered the real ceiling.
        assert_eq!(manager.max(), 1024);

        // Drain the eager arena, then force one reserved arena.
        let a = allocator.allocate_buffers(1, 256).unwrap();
        let b = allocator.allocate_buffers(1, 256).unwrap();
        assert_eq!(manager.used(), 256);

        for handle in a.into_iter().chain(b) {
            allocator.deallocate(handle);
        }
        // Releases saturate; nothing stays reserved.
        assert_eq!(manager.used(), 0);
        assert!(allocator.is_fully_free());
    }

    #[test]
    fn test_metrics_recorded() {
        let allocator = tiny(Arc::new(Unbounded));
        let handles = allocator.allocate_buffers(4, 8).unwrap();
        assert_eq!(allocator.metrics().allocations(), 4);
        assert_eq!(allocator.metrics().class_allocations(3), 4);

        for handle in handles {
            allocator.deallocate(handle);
        }
        assert_eq!(allocator.metrics().deallocations(), 4);
        assert_eq!(
            allocator.metrics().allocated_bytes(),
            allocator.metrics().deallocated_bytes()
        );
    }

    #[test]
    fn test_debug_dump_shape() {
        let allocator = tiny(Arc::new(Unbounded));
        let dump = allocator.debug_dump();
        assert!(dump.contains("1 of 4 arenas"));
        assert!(dump.contains("arena 0: 256 bytes free"));
    }

    #[test]
    #[should_panic(expected = "blank buffer handle")]
    fn test_deallocate_blank_panics() {
        let allocator = tiny(Arc::new(Unbounded));
        allocator.deallocate(BufferHandle::blank());
    }
}
