use thiserror::Error;

#[derive(Error, Debug)]
pub enum OxbullError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Job not found: {0}")]
    JobNotFound(u64),

    #[error("Job hash field '{0}' is missing or malformed")]
    MalformedField(&'static str),

    #[error("No subscribers on the new-job channel, nothing would wake a worker")]
    NoSubscribers,

    #[error("Lock for job {0} is held by another worker")]
    LockLost(u64),
}

pub type Result<T> = std::result::Result<T, OxbullError>;
