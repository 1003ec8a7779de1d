use std::time::Duration;

use thiserror::Error;

/// Errors raised by the pipeline engine and provider adapters.
///
/// Source errors from the HTTP/JSON layers are flattened to strings so the
/// enum stays cheap to clone into trace records and stream chunks.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum EngineError {
    /// A constructor parameter was out of range. Fatal for that constructor.
    #[error("invalid {field}: {message}")]
    Validation { field: &'static str, message: String },

    /// The pipeline stopped accepting work; submission was rejected before
    /// admission.
    #[error("pipeline is shutting down")]
    ShuttingDown,

    /// The admission acquire was cancelled or hit its deadline. No work was
    /// started.
    #[error("failed to acquire execution slot: {0}")]
    AcquireFailed(String),

    /// Shutdown waited longer than the configured grace period. In-flight
    /// executions may still be running.
    #[error("shutdown timed out after {0:?}")]
    ShutdownTimeout(Duration),

    /// A streaming-input session was used after `close`.
    #[error("session is closed")]
    SessionClosed,

    /// The provider answered with a non-OK HTTP status.
    #[error("provider returned HTTP {status}: {body}")]
    HttpStatus { status: u16, body: String },

    /// The provider answered OK but the payload carried an error message.
    #[error("provider API error: {0}")]
    Api(String),

    /// A streaming frame could not be parsed. Logged and skipped by the
    /// scanner; never fatal for the stream.
    #[error("malformed stream frame: {0}")]
    StreamParse(String),

    /// The caller cancelled mid-execution.
    #[error("execution cancelled")]
    Cancelled,

    /// Request construction or parameters were invalid.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Transport-level HTTP failure.
    #[error("HTTP error: {0}")]
    Http(String),

    /// JSON encode/decode failure.
    #[error("JSON error: {0}")]
    Json(String),

    /// Catch-all for provider-reported failures that are not HTTP errors.
    #[error("provider error: {0}")]
    Provider(String),

    /// The adapter does not implement the requested capability.
    #[error("not supported: {0}")]
    NotImplemented(String),
}

impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> Self {
        EngineError::Json(format!(
            "{} at line {} column {}",
            err,
            err.line(),
            err.column()
        ))
    }
}

impl From<url::ParseError> for EngineError {
    fn from(err: url::ParseError) -> Self {
        EngineError::InvalidRequest(format!("error parsing provided url: {err}"))
    }
}

impl From<http::Error> for EngineError {
    fn from(err: http::Error) -> Self {
        EngineError::Http(err.to_string())
    }
}

impl From<reqwest::Error> for EngineError {
    fn from(err: reqwest::Error) -> Self {
        EngineError::Http(err.to_string())
    }
}
