//! Allocator errors.

use thiserror::Error;

/// Result type for allocator operations.
pub type AllocResult<T> = Result<T, AllocError>;

/// Errors that can occur during allocator operations.
#[derive(Debug, Error)]
pub enum AllocError {
    /// The allocator configuration is invalid. Fatal at construction.
    #[error("invalid allocator configuration: {message}")]
    Config {
        /// Which constraint was violated.
        message: String,
    },

    /// The requested size cannot be served by any size class. The request
    /// is rejected before any state changes.
    #[error("invalid allocation size: {requested} bytes")]
    InvalidSize {
        /// The size the caller asked for.
        requested: usize,
    },

    /// The budget plus the arena pool cannot satisfy the request. Any
    /// partial allocations made by the failing call have been rolled back.
    #[error("out of cache memory allocating {requested} bytes; {dump}")]
    OutOfMemory {
        /// Total bytes the failing call asked for.
        requested: usize,
        /// The memory manager's diagnostic dump at the time of failure.
        dump: String,
    },
}

impl AllocError {
    /// Creates a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Returns true if this error indicates a caller bug rather than
    /// resource pressure.
    pub fn is_caller_bug(&self) -> bool {
        matches!(self, Self::InvalidSize { .. })
    }

    /// Returns true if this error is fatal for the component that hit it.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Config { .. })
    }
}
