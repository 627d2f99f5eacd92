//! Error types for the store.
//!
//! Expected data-shape problems (wrong-typed cells, writes rejected by a
//! schema or mutator) are never errors; they are routed to the invalid-cell
//! and invalid-value listeners. `StoreError` covers structural failures only.

use thiserror::Error;

/// Main error type for store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Malformed JSON: {0}")]
    MalformedJson(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Persister error: {0}")]
    Persister(String),
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::MalformedJson(e.to_string())
    }
}

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;
