//! Error types for the identity service boundary and local storage.

use thiserror::Error;

/// Result of a call that went through the identity service.
pub type AuthResult<T> = Result<T, ServiceError>;

/// Failure reported by the external identity service (or its profile store).
///
/// Surfaced to callers verbatim; nothing in this crate retries.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ServiceError {
    /// Wrong email/password combination.
    #[error("invalid credentials: {0}")]
    InvalidCredentials(String),

    #[error("account already registered: {0}")]
    AlreadyRegistered(String),

    /// The service understood the request and refused it.
    #[error("request rejected: {0}")]
    Rejected(String),

    /// Network or availability problem.
    #[error("identity service unavailable: {0}")]
    Unavailable(String),
}

impl ServiceError {
    pub fn invalid_credentials(msg: impl Into<String>) -> Self {
        Self::InvalidCredentials(msg.into())
    }

    pub fn rejected(msg: impl Into<String>) -> Self {
        Self::Rejected(msg.into())
    }

    pub fn unavailable(msg: impl Into<String>) -> Self {
        Self::Unavailable(msg.into())
    }
}

/// Local key-value storage failure.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StorageError {
    #[error("storage io error: {0}")]
    Io(String),

    #[error("storage contents unreadable: {0}")]
    Serialization(String),

    #[error("storage lock poisoned")]
    Poisoned,
}

impl From<std::io::Error> for StorageError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}
