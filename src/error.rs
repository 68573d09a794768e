use thiserror::Error;

#[derive(Error, Debug)]
pub enum ShardboxError {
    #[error("Typing error: {0}")]
    Typing(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Schema error: {0}")]
    Schema(String),

    #[error("Cache error: {0}")]
    Cache(String),

    #[error("Timed out after {0} ms waiting for scheduled tasks")]
    Timeout(u64),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, ShardboxError>;
