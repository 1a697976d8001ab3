//! # ember-common
//!
//! Foundational utilities shared by EmberCache components:
//!
//! - **Constants**: system-wide sizing defaults and hard limits
//! - **Memory**: explicitly aligned heap regions and cache-line padding
//!
//! ## Example
//!
//! ```rust
//! use ember_common::memory::AlignedBuffer;
//!
//! let region = AlignedBuffer::new(4096, 4096);
//! assert!(region.is_aligned_to(4096));
//! assert_eq!(region.len(), 4096);
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod constants;
pub mod memory;

pub use memory::{AlignedBuffer, CacheLineAligned, CACHE_LINE_SIZE};
