//! Error types for the multiplexer

use thiserror::Error;

/// Errors surfaced by [`Multiplexer`](crate::Multiplexer) operations
#[derive(Error, Debug)]
pub enum MuxError {
    /// Bad arguments or an operation invalid in the current state
    #[error("Validation error: {0}")]
    Validation(String),

    /// The multiplexer was used after it was disconnected
    #[error("Multiplexer disconnected: {0}")]
    Lifecycle(String),

    /// The event stream could not be opened or broke
    #[error("Transport error: {0}")]
    Transport(String),

    /// A frame did not have the expected shape
    #[error("Protocol error: {0}")]
    Protocol(String),
}

/// Result type for multiplexer operations
pub type Result<T> = std::result::Result<T, MuxError>;
