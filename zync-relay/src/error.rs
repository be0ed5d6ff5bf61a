//! Error types for the relay crate

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Relay is shut down")]
    Closed,
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<Error> for zync_core::Error {
    fn from(err: Error) -> Self {
        match err {
            Error::Serialization(e) => Self::Serialization(e),
            other => Self::Relay(other.to_string()),
        }
    }
}
