//! Streaming backend client
//!
//! The backend turns torrents into HTTP streams. The party only tells it
//! when a stream is no longer needed.

use std::time::Duration;

use reqwest::Client;
use tracing::{debug, warn};

use crate::config::StreamingConfig;
use crate::{Error, Result};

#[derive(Debug, Clone)]
pub struct StreamingClient {
    client: Client,
    base_url: String,
}

impl StreamingClient {
    pub fn new(config: &StreamingConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_seconds))
            .build()?;

        Ok(Self {
            client,
            base_url: config.backend_url.trim_end_matches('/').to_string(),
        })
    }

    #[must_use]
    pub fn remove_url(&self, info_hash: &str) -> String {
        format!("{}/remove/{info_hash}", self.base_url)
    }

    /// Ask the backend to drop the media for `info_hash`
    pub async fn remove_media(&self, info_hash: &str) -> Result<()> {
        if info_hash.is_empty() {
            return Err(Error::InvalidInput("empty info hash".to_string()));
        }

        let response = self.client.delete(self.remove_url(info_hash)).send().await?;
        if !response.status().is_success() {
            return Err(Error::Internal(format!(
                "backend refused to remove {info_hash}: {}",
                response.status()
            )));
        }
        debug!(info_hash, "Removed media from streaming backend");
        Ok(())
    }

    /// Fire-and-forget removal; failures are only logged
    pub fn remove_media_in_background(&self, info_hash: String) {
        let client = self.clone();
        tokio::spawn(async move {
            if let Err(e) = client.remove_media(&info_hash).await {
                warn!(info_hash, error = %e, "Failed to remove media from streaming backend");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remove_url_trims_trailing_slash() {
        let config = StreamingConfig {
            backend_url: "http://localhost:8888/".to_string(),
            ..StreamingConfig::default()
        };
        let client = StreamingClient::new(&config).unwrap();
        assert_eq!(client.remove_url("abc123"), "http://localhost:8888/remove/abc123");
    }

    #[tokio::test]
    async fn test_empty_hash_rejected() {
        let client = StreamingClient::new(&StreamingConfig::default()).unwrap();
        assert!(matches!(client.remove_media("").await, Err(Error::InvalidInput(_))));
    }
}
