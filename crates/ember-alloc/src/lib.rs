//! # ember-alloc
//!
//! Buddy allocator for the EmberCache in-process data cache.
//!
//! Cache consumers ask for power-of-two-sized buffers; the allocator serves
//! them out of fixed-size **arenas**, each a contiguous memory region with
//! per-size-class free lists and a free-block bitmap. Blocks split in half
//! on the way down and coalesce with their buddy (`offset ^ (1 << k)`) on
//! the way back up; neither operation moves bytes.
//!
//! - **Arenas** materialize lazily up to `max_total / arena_size`, each
//!   guarded by its own mutex so allocation and deallocation stay parallel
//! - **Budget** is negotiated with a [`MemoryManager`], which may trigger
//!   eviction and block, or refuse outright
//! - **Failures are atomic**: a multi-buffer request that cannot complete
//!   rolls back everything it allocated before surfacing the error
//!
//! ## Example
//!
//! ```rust
//! use std::sync::Arc;
//! use ember_alloc::{AllocMetrics, AllocatorConfig, BuddyAllocator, BudgetManager};
//!
//! let config = AllocatorConfig::new()
//!     .with_min_alloc(8)
//!     .with_max_alloc(256)
//!     .with_arena_size(512)
//!     .with_max_total(1024);
//! let manager = Arc::new(BudgetManager::new(1024));
//! let metrics = Arc::new(AllocMetrics::for_config(&config));
//! let allocator = BuddyAllocator::new(config, manager, metrics).unwrap();
//!
//! let mut buffers = allocator.allocate_buffers(2, 100).unwrap();
//! assert_eq!(buffers[0].len(), 128);
//! buffers[0].as_mut_slice()[0] = 42;
//!
//! for buffer in buffers {
//!     allocator.deallocate(buffer);
//! }
//! assert!(allocator.is_fully_free());
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod allocator;
pub mod arena;
mod bitmap;
pub mod config;
pub mod error;
pub mod handle;
pub mod manager;
pub mod metrics;

pub use allocator::BuddyAllocator;
pub use arena::Arena;
pub use config::AllocatorConfig;
pub use error::{AllocError, AllocResult};
pub use handle::{BlankFactory, BufferFactory, BufferHandle};
pub use manager::{BudgetManager, MemoryManager};
pub use metrics::AllocMetrics;
