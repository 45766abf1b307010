// crates/aircast-core/src/error.rs

use thiserror::Error;

/// Why a `BoundedQueue::pop` returned without a shell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum PopError {
    /// Nothing arrived within the deadline. Transient; try again.
    #[error("timed out waiting for a buffer")]
    TimedOut,
    /// The ambient scope was cancelled. Workers treat this as an exit signal.
    #[error("cancelled")]
    Cancelled,
    /// The producer closed the queue. Workers treat this as an exit signal.
    #[error("queue is closed")]
    Closed,
}

/// Returned by `BoundedQueue::push` once the queue has been closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("queue is closed")]
pub struct QueueClosed;
