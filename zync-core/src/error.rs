use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    /// Control socket unreachable within the connect budget, or closed under us.
    #[error("Player channel unavailable: {0}")]
    ChannelUnavailable(String),

    #[error("Player request {request_id} timed out after {timeout_ms}ms")]
    RequestTimeout { request_id: u64, timeout_ms: u64 },

    /// The player answered the request with a non-success status.
    #[error("Player command failed: {0}")]
    Player(String),

    #[error("Stream not ready after {attempts} attempts")]
    StreamNotReady { attempts: u32 },

    #[error("Failed to apply sync event: {0}")]
    SyncApplyFailure(String),

    #[error("Room membership changed during countdown: {0}")]
    PartialMembership(String),

    #[error("Relay error: {0}")]
    Relay(String),

    #[error("Invalid state transition from {from} to {to}")]
    InvalidTransition { from: &'static str, to: &'static str },

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Whether the failure is transient and the operation may simply be retried
    /// on the next event (as opposed to a structural failure of the session).
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::RequestTimeout { .. } | Self::SyncApplyFailure(_) | Self::Relay(_) | Self::Http(_)
        )
    }

    /// Whether the error means the player connection is gone and must be re-established.
    #[must_use]
    pub const fn is_channel_loss(&self) -> bool {
        matches!(self, Self::ChannelUnavailable(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(Error::RequestTimeout { request_id: 1, timeout_ms: 3000 }.is_retryable());
        assert!(Error::SyncApplyFailure("down".to_string()).is_retryable());
        assert!(!Error::ChannelUnavailable("gone".to_string()).is_retryable());
        assert!(!Error::StreamNotReady { attempts: 100 }.is_retryable());
    }

    #[test]
    fn test_channel_loss() {
        assert!(Error::ChannelUnavailable("closed".to_string()).is_channel_loss());
        assert!(!Error::Player("property unavailable".to_string()).is_channel_loss());
    }

    #[test]
    fn test_display_messages() {
        let err = Error::RequestTimeout { request_id: 7, timeout_ms: 3000 };
        assert_eq!(err.to_string(), "Player request 7 timed out after 3000ms");

        let err = Error::StreamNotReady { attempts: 100 };
        assert_eq!(err.to_string(), "Stream not ready after 100 attempts");
    }
}
