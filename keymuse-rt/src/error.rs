//! Error types for keymuse-rt
//!
//! Defines module-specific error types using thiserror for clear error
//! propagation. Every variant that can surface on a live connection maps
//! to a stable machine-readable code carried in the protocol error frame.

use thiserror::Error;

/// Main error type for the realtime pipeline service
#[derive(Error, Debug)]
pub enum Error {
    /// Malformed or unknown inbound frame
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Structurally valid frame carrying an invalid event
    #[error("Invalid event: {0}")]
    Validation(String),

    /// Connection exceeded its sliding-window message budget
    #[error("Rate limit exceeded")]
    RateLimit,

    /// Handshake token rejected by the session validator
    #[error("Invalid session token")]
    InvalidToken,

    /// Session bookkeeping errors
    #[error("Session error: {0}")]
    Session(String),

    /// File I/O errors
    #[error("File I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP server errors
    #[error("HTTP server error: {0}")]
    Http(String),

    /// Other errors; converted to a generic error frame at task boundaries
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Stable machine-readable code surfaced in protocol error frames
    pub fn code(&self) -> &'static str {
        match self {
            Error::Protocol(_) => "protocol_error",
            Error::Validation(_) => "invalid_event",
            Error::RateLimit => "rate_limit_exceeded",
            Error::InvalidToken => "invalid_token",
            Error::Session(_) => "session_error",
            Error::Io(_) | Error::Http(_) | Error::Internal(_) => "internal_error",
        }
    }
}

/// Convenience Result type using the keymuse-rt Error
pub type Result<T> = std::result::Result<T, Error>;
