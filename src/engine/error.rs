//! Engine error taxonomy.

use thiserror::Error;

use crate::domain::{InvalidValue, TaskValidationError};
use crate::store::StoreError;

/// Errors returned by engine operations
#[derive(Debug, Error)]
pub enum EngineError {
    /// Bad caller parameters
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Not found: {0}")]
    NotFound(String),

    /// Store error, propagated without retry
    #[error("Store failure: {0}")]
    StoreFailure(#[from] StoreError),

    /// Chance agreement is total, so kappa has no value
    #[error("Kappa undefined: expected agreement is 1")]
    KappaUndefined,
}

impl EngineError {
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidInput(message.into())
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound(message.into())
    }
}

impl From<TaskValidationError> for EngineError {
    fn from(err: TaskValidationError) -> Self {
        Self::InvalidInput(err.to_string())
    }
}

impl From<InvalidValue> for EngineError {
    fn from(err: InvalidValue) -> Self {
        Self::InvalidInput(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
