//! Allocator configuration.

use ember_common::constants::{
    DEFAULT_ARENA_SIZE_BYTES, DEFAULT_MAX_ALLOC_BYTES, DEFAULT_MAX_TOTAL_BYTES,
    DEFAULT_MIN_ALLOC_BYTES, MAX_ARENA_SIZE_BYTES, MIN_ALLOC_FLOOR,
};
use serde::{Deserialize, Serialize};

/// Configuration for the buddy allocator.
///
/// All four values are byte counts; `min_alloc`, `max_alloc` and
/// `arena_size` must be powers of two with
/// `min_alloc <= max_alloc <= arena_size`, and `max_total` must hold at
/// least one arena.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AllocatorConfig {
    /// Smallest allocation unit. Requests are rounded up to at least this.
    pub min_alloc: usize,
    /// Largest allocation unit. Larger requests are rejected.
    pub max_alloc: usize,
    /// Size of each arena region.
    pub arena_size: usize,
    /// Total memory budget; `max_total / arena_size` bounds the arena count.
    pub max_total: usize,
}

impl AllocatorConfig {
    /// Creates a configuration with the system defaults.
    pub fn new() -> Self {
        Self {
            min_alloc: DEFAULT_MIN_ALLOC_BYTES,
            max_alloc: DEFAULT_MAX_ALLOC_BYTES,
            arena_size: DEFAULT_ARENA_SIZE_BYTES,
            max_total: DEFAULT_MAX_TOTAL_BYTES,
        }
    }

    /// Sets the minimum allocation unit.
    pub fn with_min_alloc(mut self, bytes: usize) -> Self {
        self.min_alloc = bytes;
        self
    }

    /// Sets the maximum allocation unit.
    pub fn with_max_alloc(mut self, bytes: usize) -> Self {
        self.max_alloc = bytes;
        self
    }

    /// Sets the arena size.
    pub fn with_arena_size(mut self, bytes: usize) -> Self {
        self.arena_size = bytes;
        self
    }

    /// Sets the total memory budget.
    pub fn with_max_total(mut self, bytes: usize) -> Self {
        self.max_total = bytes;
        self
    }

    /// Validates the configuration.
    pub fn validate(&self) -> Result<(), &'static str> {
        if !self.min_alloc.is_power_of_two() {
            return Err("min_alloc must be a power of 2");
        }
        if self.min_alloc < MIN_ALLOC_FLOOR {
            return Err("min_alloc must be at least 8 bytes");
        }
        if !self.max_alloc.is_power_of_two() {
            return Err("max_alloc must be a power of 2");
        }
        if self.max_alloc < self.min_alloc {
            return Err("max_alloc must be at least min_alloc");
        }
        if !self.arena_size.is_power_of_two() {
            return Err("arena_size must be a power of 2");
        }
        if self.arena_size < self.max_alloc {
            return Err("arena_size must be at least max_alloc");
        }
        if self.arena_size > MAX_ARENA_SIZE_BYTES {
            return Err("arena_size must be at most 2 GiB");
        }
        if self.max_total < self.arena_size {
            return Err("max_total must hold at least one arena");
        }
        Ok(())
    }

    /// log2 of the minimum allocation unit.
    #[inline]
    pub fn min_log2(&self) -> u32 {
        self.min_alloc.trailing_zeros()
    }

    /// log2 of the maximum allocation unit.
    #[inline]
    pub fn max_log2(&self) -> u32 {
        self.max_alloc.trailing_zeros()
    }

    /// Number of size classes.
    #[inline]
    pub fn classes(&self) -> usize {
        (self.max_log2() - self.min_log2() + 1) as usize
    }

    /// Upper bound on the number of arenas.
    #[inline]
    pub fn max_arenas(&self) -> usize {
        self.max_total / self.arena_size
    }

    /// Maps a requested byte size to its size class.
    ///
    /// The size is rounded up to the next power of two and clamped below by
    /// `min_alloc`; zero and anything above `max_alloc` has no class.
    pub fn class_for(&self, size_bytes: usize) -> Option<u32> {
        if size_bytes == 0 || size_bytes > self.max_alloc {
            return None;
        }
        let rounded = size_bytes.next_power_of_two().max(self.min_alloc);
        Some(rounded.trailing_zeros())
    }
}

impl Default for AllocatorConfig {
    fn default() -> Self {
        Self::new()
    }
}
