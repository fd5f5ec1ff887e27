//! Error types for ZVE

use thiserror::Error;

/// Result type alias for ZVE operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for ZVE
#[derive(Error, Debug)]
pub enum Error {
    /// Malformed or truncated bitstream data
    #[error("Bitstream error: {0}")]
    Bitstream(String),

    /// Codec error
    #[error("Codec error: {0}")]
    Codec(String),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Invalid state
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Unsupported feature
    #[error("Unsupported: {0}")]
    Unsupported(String),
}

impl Error {
    /// Create a bitstream error
    pub fn bitstream<S: Into<String>>(msg: S) -> Self {
        Error::Bitstream(msg.into())
    }

    /// Create a codec error
    pub fn codec<S: Into<String>>(msg: S) -> Self {
        Error::Codec(msg.into())
    }

    /// Create an invalid input error
    pub fn invalid_input<S: Into<String>>(msg: S) -> Self {
        Error::InvalidInput(msg.into())
    }

    /// Create an invalid state error
    pub fn invalid_state<S: Into<String>>(msg: S) -> Self {
        Error::InvalidState(msg.into())
    }

    /// Create an unsupported error
    pub fn unsupported<S: Into<String>>(msg: S) -> Self {
        Error::Unsupported(msg.into())
    }
}
