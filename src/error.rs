//! Error types for axnc-rs.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid {field}: {message}")]
    Validation { field: String, message: String },

    #[error("unknown event code: {0}")]
    UnknownCode(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("{service} error: {message}")]
    Dependency {
        service: String,
        message: String,
        retryable: bool,
    },

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("deadline exceeded: {0}")]
    Timeout(String),

    #[error("{0}")]
    Other(String),
}

impl Error {
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Validation {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Whether a consumer should leave the message uncommitted and try again.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Transport(_) | Error::Database(_) | Error::Timeout(_) | Error::Io(_) => true,
            Error::Dependency { retryable, .. } => *retryable,
            Error::Http(e) => {
                e.is_timeout()
                    || e.is_connect()
                    || e.status().is_some_and(|s| s.is_server_error())
            }
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
