//! Error types for idrecon.
//!
//! Errors are strongly typed using thiserror. Validation failures are kept
//! apart from store failures so the boundary layer can tell a bad request
//! from a failed reconciliation.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::storage::StorageError;

/// Validation errors raised before any store access.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("Either email or phoneNumber must be provided.")]
    MissingIdentifier,

    #[error("Field '{field}' exceeds maximum length of {max_length}")]
    FieldTooLong {
        field: &'static str,
        max_length: usize,
    },

    #[error("Invalid phone number: {reason}")]
    InvalidPhoneNumber {
        reason: String,
    },
}

/// Top-level error for a reconciliation request.
#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("Invalid input: {0}")]
    InvalidInput(#[from] ValidationError),

    #[error("Constraint violated: {message}")]
    Constraint {
        message: String,
    },

    #[error("Reconciliation failed: {message}")]
    ReconciliationFailed {
        message: String,
    },

    #[error("Reconciliation cancelled before commit")]
    Cancelled,
}

impl ReconcileError {
    /// Creates a generic reconciliation failure.
    #[must_use]
    pub fn failed(message: impl Into<String>) -> Self {
        Self::ReconciliationFailed {
            message: message.into(),
        }
    }

    /// Returns true if the caller sent a bad request.
    #[must_use]
    pub const fn is_client_error(&self) -> bool {
        matches!(self, Self::InvalidInput(_))
    }

    /// Returns true if resubmitting the same request may succeed.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::ReconciliationFailed { .. } | Self::Cancelled)
    }

    /// Body surfaced to the boundary layer.
    #[must_use]
    pub fn to_body(&self) -> ErrorBody {
        let error = match self {
            Self::InvalidInput(v) => v.to_string(),
            other => other.to_string(),
        };
        ErrorBody { error }
    }
}

impl From<StorageError> for ReconcileError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::Constraint(message) => Self::Constraint { message },
            other => Self::ReconciliationFailed {
                message: other.to_string(),
            },
        }
    }
}

/// `{ "error": "..." }` as returned to clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
}

/// Result type alias for reconciliation operations.
pub type ReconcileResult<T> = Result<T, ReconcileError>;
