use chrono::{DateTime, Utc};
use thiserror::Error;

/// Failures reported by the store and the ingestion pipeline.
/// None of them are retried internally.
#[derive(Debug, Error)]
pub enum HistoryError {
    #[error("{0} already exists")]
    Conflict(String),
    #[error("{0} does not exist")]
    NotFound(String),
    #[error("capture at {attempted} is older than latest entry at {latest} for destination {destination_id}")]
    OutOfOrder {
        destination_id: i64,
        latest: DateTime<Utc>,
        attempted: DateTime<Utc>,
    },
    #[error("malformed capture: {0}")]
    MalformedCapture(String),
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("serialization error: {0}")]
    Serialization(String),
}

pub type Result<T, E = HistoryError> = std::result::Result<T, E>;
