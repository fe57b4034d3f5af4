//! Error types.
//!
//! The connection handler is the only place that turns an error into a
//! response. It matches on [`HandlerError`]: transport failures drop the
//! connection silently, request errors become a status-coded error page.

use crate::http::response::StatusCode;

/// Socket-level failure. Fatal to the connection, never shown to the client.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("read timed out")]
    Timeout,
    #[error("connection closed by peer")]
    Closed,
    #[error("socket error: {0}")]
    Io(#[from] std::io::Error),
}

impl TransportError {
    /// Classifies an I/O error, folding resets and broken pipes into `Closed`.
    pub fn from_io(err: std::io::Error) -> Self {
        use std::io::ErrorKind;
        match err.kind() {
            ErrorKind::TimedOut | ErrorKind::WouldBlock => TransportError::Timeout,
            ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::BrokenPipe
            | ErrorKind::UnexpectedEof => TransportError::Closed,
            _ => TransportError::Io(err),
        }
    }
}

/// A failure that is answered with an HTTP error response.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{status}: {message}")]
pub struct RequestError {
    pub status: StatusCode,
    pub message: String,
}

impl RequestError {
    pub fn with_status(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::with_status(StatusCode::BAD_REQUEST, message)
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::with_status(StatusCode::UNAUTHORIZED, message)
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::with_status(StatusCode::FORBIDDEN, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::with_status(StatusCode::NOT_FOUND, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::with_status(StatusCode::INTERNAL_SERVER_ERROR, message)
    }

    pub fn max_size_exceeded(length: usize, limit: usize) -> Self {
        Self::internal(format!(
            "Content-Length {length} exceeds max size of {limit} bytes"
        ))
    }

    pub fn not_dispatched() -> Self {
        Self::internal("Request has not been dispatched")
    }
}

/// Invalid configuration, detected while a worker builds its pipeline.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read configuration: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse configuration: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("unknown module '{0}'")]
    UnknownModule(String),
    #[error("module '{module}' depends on '{dependency}' which is not configured")]
    MissingDependency {
        module: &'static str,
        dependency: &'static str,
    },
    #[error("invalid rewrite rule '{rule}': {reason}")]
    InvalidRule { rule: String, reason: String },
    #[error("invalid condition '{0}'")]
    InvalidCondition(String),
    #[error("invalid pattern '{pattern}': {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },
    #[error("invalid flag '{0}'")]
    InvalidFlag(String),
}

/// Everything that can end a single request cycle early.
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Request(#[from] RequestError),
}
