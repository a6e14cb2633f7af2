//! Error taxonomy for the batch engine

use thiserror::Error;

/// Errors surfaced across the engine's public API.
///
/// Per-tick metric read failures, callback panics, and individual job
/// failures are contained at their own boundary and never propagate as
/// errors; only configuration problems and re-entrancy reach the caller.
#[derive(Debug, Error)]
pub enum EngineError {
    /// A threshold, limit, or other configuration value was rejected.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A single OS or accelerator metric read failed. Always recoverable;
    /// the affected resource kind is omitted from that tick.
    #[error("resource query failed: {0}")]
    QueryFailure(String),

    /// `process_batch` was called while a batch is already running.
    #[error("a batch is already running")]
    AlreadyRunning,

    /// A single job failed. Captured into its `BatchResult`; never crosses
    /// the worker boundary as an error.
    #[error("job failed: {0}")]
    JobFailure(String),
}
