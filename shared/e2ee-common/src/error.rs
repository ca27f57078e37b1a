//! Error types for shared protocol types.

use thiserror::Error;

/// Errors raised while validating identifiers or parsing events.
#[derive(Debug, Error)]
pub enum Error {
    /// An identifier did not have the expected shape.
    #[error("Invalid {kind} identifier: {value:?}")]
    InvalidId {
        /// Which identifier was being parsed.
        kind: &'static str,
        /// The rejected input.
        value: String,
    },

    /// A required event field was missing or had the wrong type.
    #[error("Missing or invalid event field: {0}")]
    MissingField(&'static str),

    /// JSON (de)serialization failed.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type for shared protocol types.
pub type Result<T> = std::result::Result<T, Error>;
