use async_trait::async_trait;
use futures::stream::StreamExt;
use redis::{AsyncCommands, Client as RedisClient};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::{timeout, Duration};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use zync_core::config::RelayConfig;
use zync_core::models::{PartyMessage, RoomId, UserId};
use zync_core::party::{Relay, RelayReceiver};

use crate::room_hub::RoomHub;
use crate::{Error, Result};

/// Timeout for Redis operations in seconds
const REDIS_TIMEOUT_SECS: u64 = 5;

/// Initial backoff delay for reconnection
const INITIAL_BACKOFF_SECS: u64 = 1;

/// Maximum backoff delay for reconnection
const MAX_BACKOFF_SECS: u64 = 30;

/// Wire envelope; `node_id` lets a process skip its own messages
#[derive(Debug, Clone, Serialize, Deserialize)]
struct Envelope {
    node_id: String,
    message: PartyMessage,
}

#[derive(Debug)]
struct Outbound {
    channel: String,
    payload: String,
    message_type: &'static str,
}

enum SubscriberExit {
    Disconnected,
    ConnectFailed(Error),
}

/// Maps room ids to Redis channel names and back
#[derive(Debug, Clone)]
struct Channels {
    prefix: String,
}

impl Channels {
    fn room(&self, room_id: &RoomId) -> String {
        format!("{}room:{}", self.prefix, room_id.as_str())
    }

    fn pattern(&self) -> String {
        format!("{}room:*", self.prefix)
    }

    fn room_id(&self, channel: &str) -> Option<RoomId> {
        channel
            .strip_prefix(&self.prefix)
            .and_then(|rest| rest.strip_prefix("room:"))
            .filter(|id| !id.is_empty())
            .map(|id| RoomId::from_string(id.to_string()))
    }
}

/// Relay spanning processes over Redis Pub/Sub
///
/// Published messages are delivered to local subscribers straight away and
/// forwarded to `{prefix}room:{room_id}`. Messages arriving from other nodes
/// are decoded, validated and handed to the local [`RoomHub`].
pub struct RedisRelay {
    hub: RoomHub,
    node_id: String,
    channels: Channels,
    publish_tx: mpsc::Sender<Outbound>,
    cancel_token: CancellationToken,
}

impl std::fmt::Debug for RedisRelay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisRelay")
            .field("node_id", &self.node_id)
            .field("prefix", &self.channels.prefix)
            .finish_non_exhaustive()
    }
}

impl RedisRelay {
    /// Capacity for the publish channel. Messages are dropped with a warning
    /// when full (e.g. during a prolonged Redis outage).
    pub const PUBLISH_CHANNEL_CAPACITY: usize = 1_000;

    /// Connect to Redis and start the publisher and subscriber tasks
    pub fn start(config: &RelayConfig, hub: RoomHub) -> Result<Arc<Self>> {
        if config.redis_url.is_empty() {
            return Err(Error::Configuration("relay.redis_url is empty".to_string()));
        }
        let client = RedisClient::open(config.redis_url.as_str())?;
        let node_id = nanoid::nanoid!(12);
        let channels = Channels { prefix: config.channel_prefix.clone() };
        let cancel_token = CancellationToken::new();
        let (publish_tx, publish_rx) = mpsc::channel(Self::PUBLISH_CHANNEL_CAPACITY);

        tokio::spawn(run_publisher(client.clone(), publish_rx, cancel_token.clone()));
        tokio::spawn(run_subscriber_loop(
            client,
            hub.clone(),
            node_id.clone(),
            channels.clone(),
            cancel_token.clone(),
        ));

        info!(node_id = %node_id, prefix = %channels.prefix, "Redis relay started");
        Ok(Arc::new(Self { hub, node_id, channels, publish_tx, cancel_token }))
    }

    #[must_use]
    pub fn hub(&self) -> &RoomHub {
        &self.hub
    }

    /// Stop the background tasks. Local delivery keeps working.
    pub fn shutdown(&self) {
        info!("Shutting down Redis relay");
        self.cancel_token.cancel();
    }

    fn enqueue(&self, room_id: &RoomId, message: &PartyMessage) -> Result<()> {
        let envelope = Envelope { node_id: self.node_id.clone(), message: message.clone() };
        let outbound = Outbound {
            channel: self.channels.room(room_id),
            payload: serde_json::to_string(&envelope)?,
            message_type: message.message_type(),
        };

        match self.publish_tx.try_send(outbound) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(outbound)) => {
                warn!(
                    channel = %outbound.channel,
                    message_type = outbound.message_type,
                    "Redis publish queue full, dropping message"
                );
                Ok(())
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(Error::Closed),
        }
    }
}

impl Drop for RedisRelay {
    fn drop(&mut self) {
        self.cancel_token.cancel();
    }
}

#[async_trait]
impl Relay for RedisRelay {
    async fn publish(&self, room_id: &RoomId, message: PartyMessage) -> zync_core::Result<()> {
        message.validate()?;
        self.hub.broadcast(room_id, &message);
        self.enqueue(room_id, &message)?;
        Ok(())
    }

    async fn subscribe(&self, room_id: &RoomId, user_id: &UserId) -> zync_core::Result<RelayReceiver> {
        self.hub.subscribe(room_id, user_id).await
    }

    async fn unsubscribe(&self, room_id: &RoomId, user_id: &UserId) -> zync_core::Result<()> {
        self.hub.unsubscribe(room_id, user_id).await
    }
}

fn next_backoff(backoff_secs: u64) -> u64 {
    (backoff_secs * 2).min(MAX_BACKOFF_SECS)
}

/// Decode one Pub/Sub delivery. Returns `None` for our own messages and for
/// anything malformed.
fn decode_delivery(channels: &Channels, node_id: &str, channel: &str, payload: &str) -> Option<(RoomId, PartyMessage)> {
    let Some(room_id) = channels.room_id(channel) else {
        warn!(channel = %channel, "Invalid channel format");
        return None;
    };

    let envelope = match serde_json::from_str::<Envelope>(payload) {
        Ok(envelope) => envelope,
        Err(e) => {
            warn!(error = %e, channel = %channel, "Failed to deserialize relay envelope");
            return None;
        }
    };
    if envelope.node_id == node_id {
        return None;
    }
    if let Err(e) = envelope.message.validate() {
        warn!(error = %e, channel = %channel, "Dropping invalid relay message");
        return None;
    }
    Some((room_id, envelope.message))
}

async fn run_publisher(client: RedisClient, mut publish_rx: mpsc::Receiver<Outbound>, cancel: CancellationToken) {
    let mut backoff_secs = INITIAL_BACKOFF_SECS;
    // A message whose publish failed, retried after reconnecting
    let mut retry: Option<Outbound> = None;

    loop {
        let connect = timeout(
            Duration::from_secs(REDIS_TIMEOUT_SECS),
            client.get_multiplexed_async_connection(),
        );
        let conn = tokio::select! {
            () = cancel.cancelled() => {
                info!("Redis publisher task cancelled");
                return;
            }
            conn = connect => conn,
        };

        let mut conn = match conn {
            Ok(Ok(conn)) => {
                backoff_secs = INITIAL_BACKOFF_SECS;
                conn
            }
            Ok(Err(e)) => {
                error!(error = %e, backoff_secs, "Failed to get Redis connection for publishing, retrying");
                tokio::time::sleep(Duration::from_secs(backoff_secs)).await;
                backoff_secs = next_backoff(backoff_secs);
                continue;
            }
            Err(_) => {
                error!(backoff_secs, "Timed out getting Redis connection for publishing, retrying");
                tokio::time::sleep(Duration::from_secs(backoff_secs)).await;
                backoff_secs = next_backoff(backoff_secs);
                continue;
            }
        };
        info!("Redis publisher (re)connected");

        loop {
            let outbound = match retry.take() {
                Some(outbound) => outbound,
                None => {
                    let next = tokio::select! {
                        () = cancel.cancelled() => {
                            info!("Redis publisher task cancelled");
                            return;
                        }
                        next = publish_rx.recv() => next,
                    };
                    let Some(outbound) = next else {
                        debug!("Redis publish channel closed, exiting");
                        return;
                    };
                    outbound
                }
            };

            let published = timeout(
                Duration::from_secs(REDIS_TIMEOUT_SECS),
                conn.publish::<_, _, usize>(&outbound.channel, &outbound.payload),
            )
            .await;
            match published {
                Ok(Ok(receivers)) => {
                    debug!(
                        channel = %outbound.channel,
                        message_type = outbound.message_type,
                        receivers,
                        "Message published to Redis"
                    );
                }
                Ok(Err(e)) => {
                    error!(error = %e, channel = %outbound.channel, "Failed to publish, retrying after reconnect");
                    retry = Some(outbound);
                    break;
                }
                Err(_) => {
                    error!(channel = %outbound.channel, "Timed out publishing, retrying after reconnect");
                    retry = Some(outbound);
                    break;
                }
            }
        }

        tokio::time::sleep(Duration::from_secs(backoff_secs)).await;
        backoff_secs = next_backoff(backoff_secs);
    }
}

async fn run_subscriber_loop(
    client: RedisClient,
    hub: RoomHub,
    node_id: String,
    channels: Channels,
    cancel: CancellationToken,
) {
    let mut backoff_secs = INITIAL_BACKOFF_SECS;

    loop {
        if cancel.is_cancelled() {
            info!("Redis subscriber task cancelled");
            return;
        }

        let exit = tokio::select! {
            () = cancel.cancelled() => {
                info!("Redis subscriber task cancelled");
                return;
            }
            exit = run_subscriber(&client, &hub, &node_id, &channels) => exit,
        };
        match exit {
            SubscriberExit::Disconnected => {
                // The server was reachable; start the backoff over
                error!("Redis subscriber stream ended (connection lost), reconnecting after {INITIAL_BACKOFF_SECS}s");
                backoff_secs = INITIAL_BACKOFF_SECS;
            }
            SubscriberExit::ConnectFailed(e) => {
                error!(error = %e, backoff_secs, "Redis subscriber failed to connect, retrying after backoff");
            }
        }

        tokio::select! {
            () = cancel.cancelled() => {
                info!("Redis subscriber task cancelled during backoff");
                return;
            }
            () = tokio::time::sleep(Duration::from_secs(backoff_secs)) => {}
        }
        backoff_secs = next_backoff(backoff_secs);
    }
}

async fn run_subscriber(client: &RedisClient, hub: &RoomHub, node_id: &str, channels: &Channels) -> SubscriberExit {
    let mut pubsub = match timeout(Duration::from_secs(REDIS_TIMEOUT_SECS), client.get_async_pubsub()).await {
        Ok(Ok(pubsub)) => pubsub,
        Ok(Err(e)) => return SubscriberExit::ConnectFailed(e.into()),
        Err(_) => {
            return SubscriberExit::ConnectFailed(Error::Configuration(
                "timed out getting Redis Pub/Sub connection".to_string(),
            ))
        }
    };

    let pattern = channels.pattern();
    match timeout(Duration::from_secs(REDIS_TIMEOUT_SECS), pubsub.psubscribe(&pattern)).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => return SubscriberExit::ConnectFailed(e.into()),
        Err(_) => {
            return SubscriberExit::ConnectFailed(Error::Configuration(format!(
                "timed out subscribing to {pattern}"
            )))
        }
    }
    info!(pattern = %pattern, "Redis subscriber connected");

    let mut stream = pubsub.on_message();
    while let Some(msg) = stream.next().await {
        let channel = msg.get_channel_name().to_string();
        let payload: String = match msg.get_payload() {
            Ok(payload) => payload,
            Err(e) => {
                warn!(error = %e, channel = %channel, "Invalid payload");
                continue;
            }
        };

        if let Some((room_id, message)) = decode_delivery(channels, node_id, &channel, &payload) {
            let sent = hub.broadcast(&room_id, &message);
            debug!(room_id = %room_id, local_subscribers = sent, "Forwarded Redis message to local subscribers");
        }
    }

    SubscriberExit::Disconnected
}

#[cfg(test)]
mod tests {
    use super::*;

    fn channels() -> Channels {
        Channels { prefix: "zync:".to_string() }
    }

    fn envelope(node_id: &str, message: PartyMessage) -> String {
        serde_json::to_string(&Envelope { node_id: node_id.to_string(), message }).unwrap()
    }

    fn start() -> PartyMessage {
        PartyMessage::StartPlayback { sender_id: UserId::from("host") }
    }

    #[test]
    fn test_channel_names() {
        let channels = channels();
        let room_id = RoomId::from_string("abc".to_string());

        assert_eq!(channels.room(&room_id), "zync:room:abc");
        assert_eq!(channels.pattern(), "zync:room:*");
        assert_eq!(channels.room_id("zync:room:abc"), Some(room_id));
        assert_eq!(channels.room_id("other:room:abc"), None);
        assert_eq!(channels.room_id("zync:room:"), None);
    }

    #[test]
    fn test_delivery_from_other_node() {
        let payload = envelope("node2", start());
        let (room_id, message) = decode_delivery(&channels(), "node1", "zync:room:abc", &payload).unwrap();

        assert_eq!(room_id.as_str(), "abc");
        assert_eq!(message, start());
    }

    #[test]
    fn test_own_delivery_skipped() {
        let payload = envelope("node1", start());
        assert!(decode_delivery(&channels(), "node1", "zync:room:abc", &payload).is_none());
    }

    #[test]
    fn test_invalid_delivery_dropped() {
        assert!(decode_delivery(&channels(), "node1", "zync:room:abc", "not json").is_none());

        let payload = envelope("node2", PartyMessage::MemberLeft { user_id: UserId::from("") });
        assert!(decode_delivery(&channels(), "node1", "zync:room:abc", &payload).is_none());
    }

    #[test]
    fn test_backoff_is_capped() {
        assert_eq!(next_backoff(1), 2);
        assert_eq!(next_backoff(16), 30);
        assert_eq!(next_backoff(30), 30);
    }

    #[test]
    fn test_start_requires_url() {
        let config = RelayConfig { redis_url: String::new(), ..RelayConfig::default() };
        assert!(matches!(RedisRelay::start(&config, RoomHub::new()), Err(Error::Configuration(_))));
    }

    // Integration tests require Redis running
    #[tokio::test]
    #[ignore = "Requires Redis server"]
    async fn test_relay_across_nodes() {
        let config = RelayConfig {
            redis_url: "redis://127.0.0.1:6379".to_string(),
            channel_prefix: format!("zync-test-{}:", nanoid::nanoid!(6)),
        };
        let node1 = RedisRelay::start(&config, RoomHub::new()).unwrap();
        let node2 = RedisRelay::start(&config, RoomHub::new()).unwrap();
        let room_id = RoomId::from_string("room1".to_string());

        let mut local = node1.subscribe(&room_id, &UserId::from("host")).await.unwrap();
        let mut remote = node2.subscribe(&room_id, &UserId::from("guest")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(500)).await;

        node1.publish(&room_id, start()).await.unwrap();

        assert_eq!(local.recv().await.unwrap(), start());
        let received = timeout(Duration::from_secs(2), remote.recv()).await.unwrap().unwrap();
        assert_eq!(received, start());
        // No duplicate from our own Redis echo
        assert!(timeout(Duration::from_millis(300), local.recv()).await.is_err());

        node1.shutdown();
        node2.shutdown();
    }
}
