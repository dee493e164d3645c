//! Error types for the perception core.
//!
//! Uses thiserror for ergonomic error definition. Cache failures are `Clone`
//! because one rejected slot is delivered to every caller waiting on it.

use crate::expression::ExpressionError;
use crate::id::{IdError, ObjectId};
use crate::store::StoreError;

/// Main error type for the crate's outer surfaces (fixtures, front ends).
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Cache-related error
    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),

    /// Store-related error
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Malformed or illegal object id
    #[error("Id error: {0}")]
    Id(#[from] IdError),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// World fixture written by an incompatible version
    #[error("Fixture version mismatch: expected {expected}, found {found}")]
    VersionMismatch { expected: u32, found: u32 },

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Errors delivered through cache slots.
#[derive(Debug, Clone, thiserror::Error)]
pub enum CacheError {
    /// Nothing ever requested or set this key
    #[error("Unknown key in {cache}: {key}")]
    UnknownKey { cache: &'static str, key: String },

    /// A batched fetch did not account for a requested key
    #[error("Missing required key in {cache}: {key}")]
    MissingRequiredKey { cache: &'static str, key: String },

    /// The pending slot was dropped before anything resolved it
    #[error("Pending slot abandoned in {cache}: {key}")]
    Abandoned { cache: &'static str, key: String },

    /// Illegal or malformed object id
    #[error(transparent)]
    Id(#[from] IdError),

    /// Backing store failure
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Expression parse or evaluation failure
    #[error("Expression error: {0}")]
    Expression(#[from] ExpressionError),

    /// A store record could not be decoded into its typed form
    #[error("Could not decode record for {key}: {reason}")]
    Decode { key: String, reason: String },

    /// A computed value depends on itself
    #[error("Circular computed dependency through {0}")]
    CircularComputed(ObjectId),
}

impl CacheError {
    /// Wrap a serde_json decoding failure for `key`.
    pub fn decode(key: impl ToString, err: serde_json::Error) -> Self {
        CacheError::Decode {
            key: key.to_string(),
            reason: err.to_string(),
        }
    }
}

/// Result type alias for convenience
pub type Result<T> = std::result::Result<T, Error>;

/// Result type for cache operations
pub type CacheResult<T> = std::result::Result<T, CacheError>;
