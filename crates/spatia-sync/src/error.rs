use std::time::Duration;

use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

pub type SyncResult<T> = Result<T, SyncError>;

/// Structured failure reported by the service body
/// `{"status":"error","error":{...}}`.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteError {
    pub status: u16,
    pub message: String,
    pub code: String,
    pub kind: String,
    pub details: Value,
}

impl std::fmt::Display for RemoteError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} (status={} code={} type={})",
            self.message, self.status, self.code, self.kind
        )
    }
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("network error: could not reach backend ({0})")]
    Network(String),
    #[error("request queue is full ({capacity} pending requests)")]
    QueueFull { capacity: usize },
    #[error("request timed out after {waited:?} while waiting for connection")]
    QueueTimeout { waited: Duration },
    #[error("{0}")]
    Remote(RemoteError),
    #[error("unexpected status: {status} body={body}")]
    UnexpectedStatus { status: u16, body: String },
    #[error("invalid response body: {0}")]
    InvalidResponse(String),
    #[error("id {0} is used by both a node and a zone")]
    IdCollision(String),
    #[error("client shut down before the call settled")]
    Shutdown,
    #[error("invalid configuration: {0}")]
    Config(String),
}

/// Stable error-kind codes surfaced to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Network,
    QueueFull,
    QueueTimeout,
    Remote,
    HttpStatus,
    InvalidResponse,
    IdCollision,
    Shutdown,
    Config,
}

impl ErrorKind {
    pub fn code(self) -> &'static str {
        match self {
            ErrorKind::Network => "NETWORK_ERROR",
            ErrorKind::QueueFull => "QUEUE_FULL",
            ErrorKind::QueueTimeout => "QUEUE_TIMEOUT",
            ErrorKind::Remote => "REMOTE_ERROR",
            ErrorKind::HttpStatus => "HTTP_STATUS",
            ErrorKind::InvalidResponse => "INVALID_RESPONSE",
            ErrorKind::IdCollision => "ID_COLLISION",
            ErrorKind::Shutdown => "SHUTDOWN",
            ErrorKind::Config => "CONFIG",
        }
    }
}

impl SyncError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SyncError::Network(_) => ErrorKind::Network,
            SyncError::QueueFull { .. } => ErrorKind::QueueFull,
            SyncError::QueueTimeout { .. } => ErrorKind::QueueTimeout,
            SyncError::Remote(_) => ErrorKind::Remote,
            SyncError::UnexpectedStatus { .. } => ErrorKind::HttpStatus,
            SyncError::InvalidResponse(_) => ErrorKind::InvalidResponse,
            SyncError::IdCollision(_) => ErrorKind::IdCollision,
            SyncError::Shutdown => ErrorKind::Shutdown,
            SyncError::Config(_) => ErrorKind::Config,
        }
    }

    /// Remote code for structured failures, otherwise the kind code.
    pub fn code(&self) -> &str {
        match self {
            SyncError::Remote(remote) => remote.code.as_str(),
            other => other.kind().code(),
        }
    }

    /// Classifies a non-2xx response body. Structured service failures are
    /// passed through, everything else keeps the raw body for diagnostics.
    pub fn from_status(status: u16, body: &str) -> SyncError {
        match serde_json::from_str::<ErrorEnvelope>(body) {
            Ok(envelope) if envelope.status == "error" => {
                let detail = envelope.error;
                SyncError::Remote(RemoteError {
                    status,
                    message: detail
                        .message
                        .unwrap_or_else(|| "Unknown Backend Error".to_string()),
                    code: detail.code.unwrap_or_default(),
                    kind: detail.r#type.unwrap_or_default(),
                    details: detail.details,
                })
            }
            _ => SyncError::UnexpectedStatus {
                status,
                body: body.to_string(),
            },
        }
    }
}

impl From<reqwest::Error> for SyncError {
    fn from(err: reqwest::Error) -> Self {
        // a response arrived but its body could not be read
        if err.is_body() || err.is_decode() {
            SyncError::InvalidResponse(err.to_string())
        } else {
            SyncError::Network(err.to_string())
        }
    }
}

impl From<config::ConfigError> for SyncError {
    fn from(err: config::ConfigError) -> Self {
        SyncError::Config(err.to_string())
    }
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    status: String,
    error: ErrorDetail,
}

#[derive(Debug, Deserialize)]
struct ErrorDetail {
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    r#type: Option<String>,
    #[serde(default)]
    details: Value,
}
