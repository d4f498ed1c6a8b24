//! Error taxonomy for the ingest and evaluation pipeline

use thiserror::Error;

/// Errors raised by the judge library
#[derive(Debug, Error)]
pub enum JudgeError {
    /// Sample rejected by the converter (bad metric name or tag key)
    #[error("invalid sample: {0}")]
    InvalidSample(String),

    /// Write queue is at capacity, the sample was dropped
    #[error("write queue full (capacity {capacity})")]
    QueueFull { capacity: usize },

    /// Network failure or 5xx from a remote-write target
    #[error("recoverable transport error from {target}: {message}")]
    RecoverableTransport { target: String, message: String },

    /// Non-400 4xx or malformed target URL
    #[error("fatal transport error from {target}: {message}")]
    FatalTransport { target: String, message: String },

    /// Remote-write target answered 400
    #[error("bad request rejected by {target}: {message}")]
    BadRequest { target: String, message: String },

    /// Backend query failed or returned an unusable payload
    #[error("query error: {0}")]
    Query(String),

    #[error("datasource not found: {0}")]
    DataSourceNotFound(String),

    /// Event queue push failed
    #[error("event queue full (capacity {capacity})")]
    StoreFull { capacity: usize },

    /// Hash ring has no live members
    #[error("no live instance owns key {0}")]
    RingUnassigned(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("rule {id}: {message}")]
    Rule { id: i64, message: String },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl JudgeError {
    /// Whether a remote-write attempt that failed with this error may be retried
    pub fn is_recoverable(&self) -> bool {
        matches!(self, JudgeError::RecoverableTransport { .. })
    }

    pub fn rule(id: i64, message: impl Into<String>) -> Self {
        JudgeError::Rule {
            id,
            message: message.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, JudgeError>;
