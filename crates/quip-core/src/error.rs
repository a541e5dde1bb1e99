//! Error types for the card pipeline.
//!
//! `PipelineError` is what callers of the pipeline ever see. Lower layers keep
//! their own error types (`StorageError`, `ProviderError`, `NormalizeError`)
//! and convert at the boundary where the failure is classified.

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PipelineError {
    #[error("network unavailable: {0}")]
    NetworkUnavailable(String),

    #[error("provider returned error: status={status} body={body}")]
    Provider { status: u16, body: String },

    #[error("malformed model response: {0}")]
    MalformedResponse(String),

    #[error("model returned no usable cards")]
    EmptyResult,

    #[error("persistence error: {0}")]
    Persistence(String),
}

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("storage io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("storage backend unavailable")]
    Unavailable,

    #[error("stored value could not be decoded: {0}")]
    Decode(String),
}

impl From<StorageError> for PipelineError {
    fn from(err: StorageError) -> Self {
        PipelineError::Persistence(err.to_string())
    }
}

/// Which way a failure travels. Foreground failures are surfaced to the user
/// with a retry affordance; background failures (prefetch) are logged and
/// counted only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureChannel {
    Foreground,
    Background,
}
