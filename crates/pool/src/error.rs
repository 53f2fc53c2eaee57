//! Setup and lifecycle errors.

use thiserror::Error;

/// Errors surfaced by [`WorkerPool`](crate::WorkerPool) lifecycle and push
/// operations. Runner failures are not here: those flow to the pool's error
/// handler.
#[derive(Debug, Error)]
pub enum PoolError {
    /// `start` was called while the pool is running.
    #[error("worker pool [{0}] is already running")]
    AlreadyRunning(String),

    /// Work was pushed before `start`, or the pool was never started.
    #[error("worker pool [{0}] is not running")]
    NotRunning(String),

    /// The job queue closed while a push was in flight.
    #[error("worker pool [{0}] job queue is closed")]
    QueueClosed(String),
}

/// Errors surfaced by [`Throttler`](crate::Throttler).
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ThrottleError {
    /// `wait_for_go` was called before `start`.
    #[error("throttler used before start")]
    NotStarted,

    /// The throttler (or its parent context) was cancelled while waiting.
    #[error("throttler stopped while waiting for a token")]
    Stopped,
}
