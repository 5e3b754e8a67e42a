//! Error types for buffer construction.
//!
//! Only construction can fail with an error. Runtime producer misbehavior is
//! absorbed and counted instead (see [`BufferStats`](crate::BufferStats)), and
//! self-consistency violations are bugs that panic.

use thiserror::Error;

/// Errors that can occur while creating a [`TraceBuffer`](crate::TraceBuffer).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum BufferError {
    /// The requested size is zero or not a multiple of the system page size.
    #[error("buffer size {requested} is not a non-zero multiple of the page size {page_size}")]
    InvalidSize {
        /// The size passed to `create`.
        requested: usize,
        /// The system page size the ring must be a multiple of.
        page_size: usize,
    },

    /// The operating system refused the ring allocation.
    #[error("allocation of {requested} bytes for the trace buffer failed")]
    AllocationFailed {
        /// The size passed to `create`.
        requested: usize,
    },
}
