//! Error types for the catalog.

use thiserror::Error;

/// Catalog errors.
#[derive(Error, Debug)]
pub enum Error {
    /// Missing ID, malformed field name, unrecognized table layout.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Lookup by ID found nothing.
    #[error("Not found: {0}")]
    NotFound(String),

    /// The embedded engine failed to initialize.
    #[error("Engine unavailable: {0}")]
    EngineUnavailable(String),

    /// A step of the replace protocol failed; the transaction was rolled back.
    #[error("Reconciliation of '{id}' failed at {step}: {source}")]
    ReconciliationPartialFailure {
        id: String,
        step: &'static str,
        #[source]
        source: rusqlite::Error,
    },

    /// Error reported by the embedded engine.
    #[error("Engine error: {0}")]
    Engine(#[from] rusqlite::Error),

    /// JSON encoding or decoding error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// IO error while staging snapshots or reading config.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Snapshot verification or restore failure.
    #[error("Snapshot error: {0}")]
    Snapshot(String),

    /// A blocking engine task panicked or was cancelled.
    #[error("Task error: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// Result type for catalog operations.
pub type Result<T> = std::result::Result<T, Error>;
