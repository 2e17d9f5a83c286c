use thiserror::Error;

#[derive(Error, Debug)]
pub enum QueueError {
    #[error("Job store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Job not found: {0}")]
    JobNotFound(String),

    #[error("Toolchain unavailable: {0}")]
    ToolchainUnavailable(String),

    #[error("Corrupt record for job {job_id}: {reason}")]
    CorruptRecord { job_id: String, reason: String },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<redis::RedisError> for QueueError {
    fn from(err: redis::RedisError) -> Self {
        QueueError::StoreUnavailable(err.to_string())
    }
}

impl From<serde_json::Error> for QueueError {
    fn from(err: serde_json::Error) -> Self {
        QueueError::Internal(format!("serialization failed: {}", err))
    }
}

pub type Result<T> = std::result::Result<T, QueueError>;
