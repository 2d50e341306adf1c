//! Ledger Error Types
//!
//! Every failure raised inside a storage transaction is one of these kinds.
//! The request layer maps each kind to a distinct response via [`LedgerError::code`]
//! and [`LedgerError::http_status`].

use serde::Serialize;
use thiserror::Error;

/// One disallowed field change between a stored transfer and a resubmission
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FieldChange {
    /// Dotted path into the transfer, e.g. `debits[0].amount`
    pub path: String,
    pub before: serde_json::Value,
    pub after: serde_json::Value,
}

/// Ledger error types
#[derive(Error, Debug, Clone)]
pub enum LedgerError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Unprocessable entity: {0}")]
    UnprocessableEntity(String),

    #[error("Insufficient funds in account {account}")]
    InsufficientFunds { account: String },

    #[error("Unmet condition: {0}")]
    UnmetCondition(String),

    #[error("Invalid modification: {message}")]
    InvalidModification {
        message: String,
        diff: Vec<FieldChange>,
    },

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    // === System Errors ===
    #[error("Database error: {0}")]
    Database(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, LedgerError>;

impl LedgerError {
    /// Shorthand for a modification error without a field diff
    pub fn invalid_modification(message: impl Into<String>) -> Self {
        LedgerError::InvalidModification {
            message: message.into(),
            diff: Vec::new(),
        }
    }

    /// Get the error code for API responses
    pub fn code(&self) -> &'static str {
        match self {
            LedgerError::NotFound(_) => "NOT_FOUND",
            LedgerError::UnprocessableEntity(_) => "UNPROCESSABLE_ENTITY",
            LedgerError::InsufficientFunds { .. } => "INSUFFICIENT_FUNDS",
            LedgerError::UnmetCondition(_) => "UNMET_CONDITION",
            LedgerError::InvalidModification { .. } => "INVALID_MODIFICATION",
            LedgerError::Unauthorized(_) => "UNAUTHORIZED",
            LedgerError::AlreadyExists(_) => "ALREADY_EXISTS",
            LedgerError::Database(_) => "DATABASE_ERROR",
            LedgerError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// Get HTTP status code suggestion
    pub fn http_status(&self) -> u16 {
        match self {
            LedgerError::NotFound(_) => 404,
            LedgerError::UnprocessableEntity(_)
            | LedgerError::InsufficientFunds { .. }
            | LedgerError::UnmetCondition(_) => 422,
            LedgerError::InvalidModification { .. } => 400,
            LedgerError::Unauthorized(_) => 403,
            LedgerError::AlreadyExists(_) => 409,
            LedgerError::Database(_) | LedgerError::Internal(_) => 500,
        }
    }

    /// Storage-level failures are the only kind that background loops treat as fatal
    pub fn is_storage_failure(&self) -> bool {
        matches!(self, LedgerError::Database(_))
    }
}

impl From<sqlx::Error> for LedgerError {
    fn from(e: sqlx::Error) -> Self {
        LedgerError::Database(e.to_string())
    }
}

impl From<serde_json::Error> for LedgerError {
    fn from(e: serde_json::Error) -> Self {
        LedgerError::Internal(e.to_string())
    }
}
