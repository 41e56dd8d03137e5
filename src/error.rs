use thiserror::Error;

/// Failures raised by the detection pipeline.
///
/// Only `Persistence` (and anything unexpected while a job runs) moves a
/// file to the `error` status. The other kinds degrade to partial or empty
/// results at the point where they occur.
#[derive(Debug, Error)]
pub enum ScanError {
    #[error("failed to parse subtitle source {path}: {message}")]
    Parse { path: String, message: String },

    #[error("model {model} failed: {message}")]
    Model { model: String, message: String },

    #[error("subtitle extraction failed for {path}: {message}")]
    Extraction { path: String, message: String },

    #[error("persistence failed: {0}")]
    Persistence(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("queue error: {0}")]
    Queue(String),

    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("invalid job payload: {0}")]
    Payload(#[from] serde_json::Error),

    #[error("configuration error: {0}")]
    Config(String),
}

impl ScanError {
    pub fn model(model: &str, message: impl ToString) -> Self {
        ScanError::Model {
            model: model.to_string(),
            message: message.to_string(),
        }
    }

    /// True for failures that belong to the store rather than the job input.
    pub fn is_persistence(&self) -> bool {
        matches!(self, ScanError::Persistence(_) | ScanError::Database(_))
    }
}
