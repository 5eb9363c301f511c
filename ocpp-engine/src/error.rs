//! Engine error type

use std::time::Duration;

use serde_json::Value;
use thiserror::Error;

use crate::ocpp::{DecodeError, ErrorCode};

/// Errors surfaced by the engine
#[derive(Debug, Error)]
pub enum OcppError {
    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("OCPP error from remote: {code} - {description}")]
    RemoteError {
        code: ErrorCode,
        description: String,
        details: Value,
    },

    #[error("{action} timed out after {elapsed:?}")]
    Timeout { action: String, elapsed: Duration },

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Handler already registered for action {0}")]
    DuplicateAction(String),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Invalid configuration: {0}")]
    Config(String),
}
