use thiserror::Error;
use uuid::Uuid;

/// The error taxonomy shared by every component. Variants map 1:1 onto the
/// kinds described in the error handling design: recoverable errors are
/// handled locally with backoff by their caller, everything else surfaces to
/// the nearest boundary (HTTP edge or agent loop) carrying a stable `kind`.
#[derive(Error, Debug)]
pub enum CoreError {
    #[error("malformed input: {0}")]
    ParseError(String),

    #[error("validation failed: {0}")]
    ValidationError(String),

    #[error("no data found for {0}")]
    DataNotFound(String),

    #[error("conflicting write for key {0}")]
    ConflictError(String),

    #[error("transient store error: {0}")]
    StoreTransientError(String),

    #[error("transient LLM error: {0}")]
    LLMTransientError(String),

    #[error("LLM unavailable after retries: {0}")]
    LLMUnavailable(String),

    #[error("configuration error: {0}")]
    ConfigurationError(String),

    #[error("internal error [{correlation_id}]: {message}")]
    InternalError {
        message: String,
        correlation_id: Uuid,
    },

    #[error("serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("io error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("http error: {0}")]
    HttpError(#[from] reqwest::Error),
}

impl CoreError {
    /// Stable, machine-matchable error kind for API boundaries.
    pub fn kind(&self) -> &'static str {
        match self {
            CoreError::ParseError(_) => "ParseError",
            CoreError::ValidationError(_) => "ValidationError",
            CoreError::DataNotFound(_) => "DataNotFound",
            CoreError::ConflictError(_) => "ConflictError",
            CoreError::StoreTransientError(_) => "StoreTransientError",
            CoreError::LLMTransientError(_) => "LLMTransientError",
            CoreError::LLMUnavailable(_) => "LLMUnavailable",
            CoreError::ConfigurationError(_) => "ConfigurationError",
            CoreError::InternalError { .. } => "InternalError",
            CoreError::SerializationError(_) => "SerializationError",
            CoreError::IoError(_) => "IoError",
            CoreError::HttpError(_) => "HttpError",
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        CoreError::InternalError {
            message: message.into(),
            correlation_id: Uuid::new_v4(),
        }
    }

    /// Transient errors are the only ones a caller should retry with backoff.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            CoreError::StoreTransientError(_) | CoreError::LLMTransientError(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, CoreError>;
