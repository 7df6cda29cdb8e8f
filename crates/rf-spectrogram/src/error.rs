//! Error types for the spectrogram pool

use thiserror::Error;

/// Spectrogram pool errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PoolError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Invalid batch {start}..{end}: {reason}")]
    InvalidBatch {
        start: usize,
        end: usize,
        reason: String,
    },

    #[error("Execution units not ready after {0} ms")]
    InitTimeout(u64),

    #[error("Pool terminated")]
    Terminated,

    #[error("Control thread unavailable")]
    ControlUnavailable,

    #[error("Blocking pool call from inside a pool callback")]
    Reentrant,

    #[error("Failed to spawn thread: {0}")]
    SpawnFailed(String),
}

/// Result type for pool operations
pub type PoolResult<T> = Result<T, PoolError>;
