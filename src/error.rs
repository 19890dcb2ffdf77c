//! Error types for rolecap

use thiserror::Error;

use crate::directory::DirectoryError;

/// The main error type for rolecap operations
#[derive(Debug, Error)]
pub enum Error {
    /// Unknown role or principal id. Never retried.
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    /// Incomplete or unknown capability keys, bad seed catalog, vocabulary drift.
    #[error("validation failed: {0}")]
    Validation(String),

    /// The hierarchy policy rejected the actor.
    #[error("authorization denied: {0}")]
    AuthorizationDenied(String),

    /// Compare-and-swap on a role edit failed; re-fetch and retry.
    #[error("role {role} was modified concurrently (base version {expected}, stored version {actual})")]
    ConcurrentModification { role: String, expected: u64, actual: u64 },

    #[error("directory: {0}")]
    Directory(#[from] DirectoryError),

    #[error("storage: {0}")]
    Storage(String),

    #[error("config: {0}")]
    Config(String),
}

impl Error {
    pub(crate) fn role_not_found(id: impl Into<String>) -> Self {
        Error::NotFound { kind: "role", id: id.into() }
    }

    pub(crate) fn principal_not_found(id: impl Into<String>) -> Self {
        Error::NotFound { kind: "principal", id: id.into() }
    }
}

impl From<heed::Error> for Error {
    fn from(e: heed::Error) -> Self {
        Error::Storage(e.to_string())
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Storage(e.to_string())
    }
}

/// Result type alias for rolecap operations
pub type Result<T> = std::result::Result<T, Error>;
