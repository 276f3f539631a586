//! Error types for trackwire-core
//!
//! Two layers of errors exist:
//! - [`Error`] is returned by fallible library operations (storage, config, setup).
//! - [`DispatchError`] is the request-level outcome delivered to completions.

use thiserror::Error;

/// Main error type for the trackwire-core library
#[derive(Error, Debug)]
pub enum Error {
    /// Database error
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON encoding/decoding error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Durable storage rejected an operation
    #[error("storage error: {0}")]
    Storage(String),
}

/// Result type alias for trackwire-core
pub type Result<T> = std::result::Result<T, Error>;

/// Outcome error attached to a single track or batch request.
///
/// Cloneable so one failure can be reported to every party waiting on it.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DispatchError {
    /// The tag management runtime failed to load or reload
    #[error("tag management runtime failed to load: {0}")]
    LoadFailure(String),

    /// The runtime accepted the request but reported an error
    #[error("runtime error: {0}")]
    Runtime(String),

    /// Network transport failure
    #[error("network error: {0}")]
    Network(String),

    /// The request could not be encoded or compressed
    #[error("serialization error: {0}")]
    Serialization(String),

    /// The request was discarded without being dispatched
    #[error("request dropped: {0}")]
    Dropped(String),
}
