//! Error types for the pipeline engine

use thiserror::Error;
use tower::BoxError;

/// Result type alias for the pipeline engine
pub type Result<T> = std::result::Result<T, PipelineError>;

/// Main error type for the pipeline engine
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Error from the OpenAI API
    #[error("OpenAI API error: {0}")]
    Upstream(#[from] async_openai::error::OpenAIError),

    /// Upstream call did not complete within the per-call timeout
    #[error("upstream call timed out after {seconds:.1}s")]
    Timeout { seconds: f64 },

    /// Upstream rejected the call because of rate or quota limits
    #[error("upstream rate limit: {message}")]
    RateLimited { message: String },

    /// Circuit breaker is open and no fallback was permitted
    #[error("circuit breaker is open")]
    CircuitOpen,

    /// Upstream answered but the answer could not be used
    #[error("invalid upstream response: {message}")]
    InvalidResponse { message: String },

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Configuration could not be loaded
    #[error("Configuration error: {message}")]
    Config { message: String },

    /// Other errors
    #[error("{0}")]
    Other(String),
}

impl PipelineError {
    /// Whether the engine should retry after this error.
    pub fn is_retryable(&self) -> bool {
        match self {
            PipelineError::Upstream(_) => true,
            PipelineError::Timeout { .. } => true,
            PipelineError::RateLimited { .. } => true,
            PipelineError::InvalidResponse { .. } => true,
            PipelineError::Other(_) => true,
            PipelineError::CircuitOpen => false,
            PipelineError::Serialization(_) => false,
            PipelineError::Config { .. } => false,
        }
    }

    /// Recover a `PipelineError` from a boxed Tower error.
    ///
    /// Errors produced outside this crate are kept as `Other` with their message.
    pub fn from_boxed(err: BoxError) -> Self {
        match err.downcast::<PipelineError>() {
            Ok(e) => *e,
            Err(err) => match err.downcast::<async_openai::error::OpenAIError>() {
                Ok(e) => classify_openai(*e),
                Err(err) => match err.downcast::<tower::timeout::error::Elapsed>() {
                    Ok(_) => PipelineError::Timeout { seconds: 0.0 },
                    Err(err) => PipelineError::Other(err.to_string()),
                },
            },
        }
    }
}

/// Map an OpenAI error onto the pipeline taxonomy; rate and quota errors get their own kind.
pub fn classify_openai(err: async_openai::error::OpenAIError) -> PipelineError {
    use async_openai::error::OpenAIError;

    if let OpenAIError::ApiError(api) = &err {
        let code = api.code.as_deref().unwrap_or_default();
        let kind = api.r#type.as_deref().unwrap_or_default();
        let rate_limited = ["rate_limit_exceeded", "insufficient_quota"]
            .iter()
            .any(|c| code == *c || kind == *c || kind == "requests" || kind == "tokens");
        if rate_limited {
            return PipelineError::RateLimited {
                message: api.message.clone(),
            };
        }
    }
    PipelineError::Upstream(err)
}
