//! Error types for groupcast

use thiserror::Error;

/// Errors raised while building or decoding an event body
#[derive(Debug, Error)]
pub enum EventError {
    #[error("Invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Event body must be a JSON object")]
    NotAnObject,

    #[error("Event body has no eventType")]
    MissingEventType,
}
