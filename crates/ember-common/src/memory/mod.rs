//! Memory utilities for EmberCache.
//!
//! - **Aligned regions**: zero-initialized heap buffers with an explicit
//!   alignment, used as arena backing storage so that block offsets inherit
//!   address alignment
//! - **Cache-line padding**: a wrapper that keeps hot atomic counters on
//!   their own cache lines

mod aligned;

pub use aligned::{AlignedBuffer, CacheLineAligned, CACHE_LINE_SIZE};
