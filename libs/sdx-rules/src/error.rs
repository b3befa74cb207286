//! Rule Manager Error Types

use thiserror::Error;

/// Result type for rule manager operations
pub type Result<T> = std::result::Result<T, RuleError>;

/// Rule manager errors
#[derive(Debug, Error)]
pub enum RuleError {
    /// Rule failed the validity inspector
    #[error("Rule cannot be validated: {0}")]
    Validation(String),

    /// Breakdown engine produced nothing for the rule
    #[error("Rule was not broken down: {0}")]
    Breakdown(String),

    /// Authorization denied, on admission or removal
    #[error("Not authorized: {0}")]
    Authorization(String),

    /// Malformed query argument (e.g. a filter that is not a mapping)
    #[error("Type error: {0}")]
    Type(String),

    /// Unknown rule hash
    #[error("Rule not found: {0}")]
    NotFound(String),

    /// Rule type hook refused the operation
    #[error("Rule rejected: {0}")]
    Rejected(String),

    /// Resource registry failure
    #[error("Resource error: {0}")]
    Resource(String),

    /// Dispatch sink failure
    #[error("Dispatch error: {0}")]
    Dispatch(String),

    /// Generic manager error (unknown callback, missing sink, broken invariant)
    #[error("Rule manager error: {0}")]
    Manager(String),

    /// Database error
    #[error("Database error: {0}")]
    Database(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),
}

impl From<sqlx::Error> for RuleError {
    fn from(err: sqlx::Error) -> Self {
        RuleError::Database(err.to_string())
    }
}

impl From<serde_json::Error> for RuleError {
    fn from(err: serde_json::Error) -> Self {
        RuleError::Serialization(err.to_string())
    }
}

impl From<figment::Error> for RuleError {
    fn from(err: figment::Error) -> Self {
        RuleError::Config(err.to_string())
    }
}
