use thiserror::Error;

/// Errors raised by the voice session core.
#[derive(Debug, Error)]
pub enum VoiceError {
    /// A constructor parameter was out of range.
    #[error("invalid {field}: {message}")]
    Validation { field: &'static str, message: String },

    /// The session was used after `close`.
    #[error("session is closed")]
    SessionClosed,

    /// The caller cancelled the operation.
    #[error("operation cancelled")]
    Cancelled,

    /// Failure from the underlying provider session.
    #[error(transparent)]
    Engine(#[from] tandem::EngineError),
}
