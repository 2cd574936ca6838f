//! Error types for Gatehouse

use thiserror::Error;

/// Main error type for Gatehouse operations
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("WebSocket error: {0}")]
    WebSocket(String),

    #[error("Server error: {0}")]
    Server(String),

    #[error("Store error: {0}")]
    Store(String),

    #[error("{0}")]
    Other(String),
}

/// Result type alias using Gatehouse's Error
pub type Result<T> = std::result::Result<T, Error>;
