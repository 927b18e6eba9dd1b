//! CLI Error Types
//!
//! Error types for the energy pool CLI application.

use energy_pool::{ErrorClass, PoolError};
use thiserror::Error;

/// CLI-specific errors
#[derive(Error, Debug)]
pub enum CliError {
    /// Configuration error
    #[error("Configuration error: {message}")]
    ConfigError { message: String },

    /// Invalid argument
    #[error("Invalid argument: {message}")]
    InvalidArgument { message: String },

    /// Entity not found
    #[error("Not found: {id}")]
    NotFound { id: String },

    /// JSON formatting error
    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// Pool error
    #[error("{0}")]
    PoolError(#[from] PoolError),
}

/// CLI result type
pub type CliResult<T> = Result<T, CliError>;

impl CliError {
    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        CliError::ConfigError {
            message: message.into(),
        }
    }

    /// Create an invalid argument error
    pub fn invalid_arg(message: impl Into<String>) -> Self {
        CliError::InvalidArgument {
            message: message.into(),
        }
    }

    /// Create a not found error
    pub fn not_found(id: impl Into<String>) -> Self {
        CliError::NotFound { id: id.into() }
    }

    /// Get exit code for this error
    pub fn exit_code(&self) -> i32 {
        match self {
            CliError::ConfigError { .. } => 1,
            CliError::InvalidArgument { .. } => 2,
            CliError::NotFound { .. } => 21,
            CliError::JsonError(_) => 6,
            CliError::IoError(_) => 5,
            CliError::PoolError(e) => match e.class() {
                ErrorClass::Validation => 10,
                ErrorClass::Capacity => 11,
                ErrorClass::ExternalService => 12,
                ErrorClass::Conflict => 13,
                ErrorClass::InvariantViolation => 14,
                ErrorClass::Internal => 30,
            },
        }
    }
}
