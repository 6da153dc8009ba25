//! Error types for the engine.

use thiserror::Error;

/// Engine-wide error type.
#[derive(Error, Debug)]
pub enum Error {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid data error
    #[error("Invalid data: {0}")]
    InvalidData(String),

    /// Resource not found
    #[error("Resource not found: {0}")]
    NotFound(String),

    /// Value outside its permitted range
    #[error("Out of range: {0}")]
    OutOfRange(String),
}

/// Result type alias using our Error type.
pub type Result<T> = std::result::Result<T, Error>;
