//! Error types for Tandem's ambient layer
//!
//! Engine modules define their own `thiserror` enums; this one covers
//! configuration, file I/O and the metrics endpoint.

use std::io;
use thiserror::Error;

/// Main error type for configuration, logging and metrics setup
#[derive(Error, Debug)]
pub enum TandemError {
    /// Configuration parsing or validation error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Underlying I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Metrics recorder or endpoint error
    #[error("Metrics error: {0}")]
    Metrics(String),

    /// Logging subscriber could not be installed
    #[error("Logging error: {0}")]
    Logging(String),
}

/// Result type alias for ambient operations
pub type Result<T> = std::result::Result<T, TandemError>;

impl TandemError {
    /// Returns true if the error was caused by invalid user input
    pub fn is_config(&self) -> bool {
        matches!(self, TandemError::Config(_))
    }
}
