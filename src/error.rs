use thiserror::Error;

/// Rejections at the ingest boundary. Never retried.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("missing required field: {0}")]
    MissingField(&'static str),
    #[error("non-finite value in {0}")]
    NonFinite(&'static str),
    #[error("invalid timestamp {value:?}: {reason}")]
    InvalidTimestamp { value: String, reason: String },
    #[error("duplicate pattern record: {id}")]
    Duplicate { id: String },
    #[error("invalid backtest window: start {start_ms} is after end {end_ms}")]
    InvalidWindow { start_ms: i64, end_ms: i64 },
}

/// Failures of the persisted store, surfaced after bounded retry.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StorageError {
    #[error("write conflict persisted after {attempts} attempts: {last}")]
    RetriesExhausted { attempts: u32, last: String },
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("corrupt row {id}: {reason}")]
    Corrupt { id: String, reason: String },
}

/// Invalid transitions of the backtest state machine.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExposureError {
    #[error("backtest session {session_id} is already active")]
    BacktestAlreadyActive { session_id: String },
    #[error("no backtest session is active")]
    BacktestNotActive,
}

#[derive(Debug, Error)]
pub enum MemoryError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Exposure(#[from] ExposureError),
    /// The record was accepted and is still buffered, but the batch flush it
    /// triggered failed. Do not store it again; flush or close to retry.
    #[error("pattern {id} buffered but batch flush failed: {source}")]
    FlushDeferred {
        id: String,
        #[source]
        source: StorageError,
    },
    #[error("pattern memory is not initialized")]
    NotInitialized,
    #[error("pattern memory is closed")]
    Closed,
}

pub type Result<T> = std::result::Result<T, MemoryError>;
