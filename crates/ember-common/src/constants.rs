//! System-wide constants for EmberCache.
//!
//! Sizing defaults for the cache memory core. All allocation-related values
//! are powers of two; the allocator validates its configuration against the
//! limits defined here.

// =============================================================================
// Allocation Size Classes
// =============================================================================

/// Default minimum allocation unit (16 KiB).
///
/// Requests smaller than this are rounded up. Column chunks below this size
/// are rare enough that the internal fragmentation is a fair trade for a
/// shallower split tree.
pub const DEFAULT_MIN_ALLOC_BYTES: usize = 16 * 1024;

/// Default maximum allocation unit (16 MiB).
///
/// The largest buffer the cache hands out in one piece; larger reads are
/// split across multiple buffers by the caller.
pub const DEFAULT_MAX_ALLOC_BYTES: usize = 16 * 1024 * 1024;

/// Hard floor for the minimum allocation unit (8 bytes).
pub const MIN_ALLOC_FLOOR: usize = 8;

// =============================================================================
// Arenas and Budget
// =============================================================================

/// Default arena size (128 MiB).
///
/// Each arena is one contiguous mapping with its own lock, so arena count
/// also bounds allocation parallelism.
pub const DEFAULT_ARENA_SIZE_BYTES: usize = 128 * 1024 * 1024;

/// Largest supported arena (2 GiB). Block offsets within an arena are
/// tracked as 32-bit values.
pub const MAX_ARENA_SIZE_BYTES: usize = 2 * 1024 * 1024 * 1024;

/// Default total memory budget for the cache (1 GiB).
pub const DEFAULT_MAX_TOTAL_BYTES: usize = 1024 * 1024 * 1024;

// =============================================================================
// Memory Manager
// =============================================================================

/// How long a blocking reservation waits for eviction to free budget
/// before giving up.
pub const DEFAULT_RESERVE_TIMEOUT_MS: u64 = 10_000;
