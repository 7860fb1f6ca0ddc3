//! # Store Errors
//!
//! Failure taxonomy shared by every secret store backend.

use std::fmt;
use thiserror::Error;

/// Classification of a store failure; drives the reconciler's retry policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreErrorKind {
    /// Credential missing, expired or rejected
    Unauthenticated,
    /// Store unreachable, overloaded, sealed, or the call timed out
    Unavailable,
    /// Remote value changed underneath us
    Conflict,
    /// Request can never succeed as written
    InvalidInput,
}

impl StoreErrorKind {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            StoreErrorKind::Unauthenticated => "Unauthenticated",
            StoreErrorKind::Unavailable => "Unavailable",
            StoreErrorKind::Conflict => "Conflict",
            StoreErrorKind::InvalidInput => "InvalidInput",
        }
    }
}

impl fmt::Display for StoreErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned by [`crate::provider::SecretStore`] operations
///
/// Messages never contain secret values.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{kind}: {message}")]
pub struct StoreError {
    pub kind: StoreErrorKind,
    pub message: String,
}

impl StoreError {
    pub fn new(kind: StoreErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn unauthenticated(message: impl Into<String>) -> Self {
        Self::new(StoreErrorKind::Unauthenticated, message)
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(StoreErrorKind::Unavailable, message)
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(StoreErrorKind::Conflict, message)
    }

    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::new(StoreErrorKind::InvalidInput, message)
    }
}
