//! Stagehand error abstractions.

use thiserror::Error;

// Error messages.
pub const ERR_LOG_FLUSH: &str = "error flushing recovery log";
pub const ERR_LOG_LOCK: &str = "error acquiring exclusive lock on recovery log";
pub const ERR_BROKER_PUBLISH: &str = "error publishing message to broker";

/// Application error variants.
#[derive(Debug, Error)]
pub enum AppError {
    /// The given input was invalid.
    #[error("validation error: {0}")]
    InvalidInput(String),
    /// The named broker resource does not exist.
    #[error("broker resource not found: {0}")]
    ResourceNotFound(String),
}

/// Errors produced while decoding an envelope from the wire.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum EnvelopeError {
    /// The frame was empty.
    #[error("empty frame")]
    Empty,
    /// The frame's leading tag byte is unknown.
    #[error("unknown envelope tag {0:#04x}")]
    UnknownTag(u8),
    /// The frame was shorter than its variant's fixed layout.
    #[error("truncated envelope, needed {needed} bytes, got {got}")]
    Truncated { needed: usize, got: usize },
    /// The frame's record payload was invalid.
    #[error("invalid envelope payload: {0}")]
    InvalidPayload(String),
}

/// The error type used to indicate that a system shutdown is required.
#[derive(Debug, thiserror::Error)]
#[error("fatal error: {0}")]
pub struct ShutdownError(#[from] pub anyhow::Error);

/// A result type where the error is a `ShutdownError`.
pub type ShutdownResult<T> = ::std::result::Result<T, ShutdownError>;
