use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use zync_core::models::{PartyMessage, RoomId, UserId};
use zync_core::party::{Relay, RelayReceiver};

/// Handle for one subscription
pub type ConnectionId = String;

#[derive(Debug, Clone)]
struct Subscriber {
    connection_id: ConnectionId,
    user_id: UserId,
    sender: mpsc::UnboundedSender<PartyMessage>,
}

/// In-memory hub routing party messages to the subscribers of each room.
/// A publisher subscribed to the room receives its own messages too.
#[derive(Debug, Clone, Default)]
pub struct RoomHub {
    /// room_id -> subscribers
    rooms: Arc<DashMap<RoomId, Vec<Subscriber>>>,

    /// connection_id -> (room_id, user_id) for cleanup
    connections: Arc<DashMap<ConnectionId, (RoomId, UserId)>>,
}

impl RoomHub {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe `user_id` to a room. One user may hold several subscriptions.
    pub fn join(&self, room_id: RoomId, user_id: UserId) -> (ConnectionId, RelayReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        let connection_id = nanoid::nanoid!(12);

        self.rooms.entry(room_id.clone()).or_default().push(Subscriber {
            connection_id: connection_id.clone(),
            user_id: user_id.clone(),
            sender: tx,
        });
        self.connections
            .insert(connection_id.clone(), (room_id.clone(), user_id.clone()));

        info!(
            room_id = %room_id,
            user_id = %user_id,
            connection_id = %connection_id,
            "Subscribed to room"
        );
        (connection_id, rx)
    }

    /// Drop one subscription
    pub fn leave(&self, connection_id: &str) {
        let Some((_, (room_id, user_id))) = self.connections.remove(connection_id) else {
            warn!(connection_id = %connection_id, "Attempted to unsubscribe unknown connection");
            return;
        };

        if let Some(mut subscribers) = self.rooms.get_mut(&room_id) {
            subscribers.retain(|sub| sub.connection_id != connection_id);
            if subscribers.is_empty() {
                drop(subscribers);
                self.rooms.remove_if(&room_id, |_, subs| subs.is_empty());
                debug!(room_id = %room_id, "Room has no more subscribers, removed");
            }
        }

        info!(
            room_id = %room_id,
            user_id = %user_id,
            connection_id = %connection_id,
            "Unsubscribed from room"
        );
    }

    /// Drop every subscription `user_id` holds in `room_id`
    pub fn leave_room(&self, room_id: &RoomId, user_id: &UserId) -> usize {
        let connections: Vec<ConnectionId> = self
            .rooms
            .get(room_id)
            .map(|subs| {
                subs.iter()
                    .filter(|sub| &sub.user_id == user_id)
                    .map(|sub| sub.connection_id.clone())
                    .collect()
            })
            .unwrap_or_default();

        for connection_id in &connections {
            self.leave(connection_id);
        }
        connections.len()
    }

    /// Deliver a message to every subscriber of a room. Subscribers whose
    /// receiver is gone are removed. Returns the number of deliveries.
    pub fn broadcast(&self, room_id: &RoomId, message: &PartyMessage) -> usize {
        let mut sent_count = 0;
        let mut failed_connections = Vec::new();

        if let Some(subscribers) = self.rooms.get(room_id) {
            for subscriber in subscribers.iter() {
                if subscriber.sender.send(message.clone()).is_ok() {
                    sent_count += 1;
                } else {
                    warn!(
                        room_id = %room_id,
                        user_id = %subscriber.user_id,
                        connection_id = %subscriber.connection_id,
                        "Subscriber receiver dropped, marking for cleanup"
                    );
                    failed_connections.push(subscriber.connection_id.clone());
                }
            }
        }

        for connection_id in failed_connections {
            self.leave(&connection_id);
        }

        debug!(
            room_id = %room_id,
            sent_count,
            message_type = message.message_type(),
            "Message broadcast complete"
        );
        sent_count
    }

    #[must_use]
    pub fn subscriber_count(&self, room_id: &RoomId) -> usize {
        self.rooms.get(room_id).map_or(0, |subs| subs.len())
    }

    #[must_use]
    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }
}

#[async_trait]
impl Relay for RoomHub {
    async fn publish(&self, room_id: &RoomId, message: PartyMessage) -> zync_core::Result<()> {
        message.validate()?;
        self.broadcast(room_id, &message);
        Ok(())
    }

    async fn subscribe(&self, room_id: &RoomId, user_id: &UserId) -> zync_core::Result<RelayReceiver> {
        Ok(self.join(room_id.clone(), user_id.clone()).1)
    }

    async fn unsubscribe(&self, room_id: &RoomId, user_id: &UserId) -> zync_core::Result<()> {
        self.leave_room(room_id, user_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn room(id: &str) -> RoomId {
        RoomId::from_string(id.to_string())
    }

    fn user(id: &str) -> UserId {
        UserId::from_string(id.to_string())
    }

    fn start(sender: &str) -> PartyMessage {
        PartyMessage::StartPlayback { sender_id: user(sender) }
    }

    #[tokio::test]
    async fn test_publisher_receives_own_message() {
        let hub = RoomHub::new();
        let mut host = hub.subscribe(&room("r1"), &user("host")).await.unwrap();
        let mut guest = hub.subscribe(&room("r1"), &user("guest")).await.unwrap();

        hub.publish(&room("r1"), start("host")).await.unwrap();

        assert_eq!(host.recv().await.unwrap(), start("host"));
        assert_eq!(guest.recv().await.unwrap(), start("host"));
    }

    #[tokio::test]
    async fn test_rooms_are_isolated() {
        let hub = RoomHub::new();
        let mut other = hub.subscribe(&room("r2"), &user("guest")).await.unwrap();

        assert_eq!(hub.broadcast(&room("r1"), &start("host")), 0);
        assert!(other.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_unsubscribe_removes_all_user_connections() {
        let hub = RoomHub::new();
        let _a = hub.subscribe(&room("r1"), &user("guest")).await.unwrap();
        let _b = hub.subscribe(&room("r1"), &user("guest")).await.unwrap();
        let _c = hub.subscribe(&room("r1"), &user("host")).await.unwrap();
        assert_eq!(hub.subscriber_count(&room("r1")), 3);

        hub.unsubscribe(&room("r1"), &user("guest")).await.unwrap();

        assert_eq!(hub.subscriber_count(&room("r1")), 1);
        assert_eq!(hub.connection_count(), 1);
    }

    #[tokio::test]
    async fn test_last_leave_removes_room() {
        let hub = RoomHub::new();
        let (connection_id, _rx) = hub.join(room("r1"), user("guest"));

        hub.leave(&connection_id);

        assert_eq!(hub.room_count(), 0);
        assert_eq!(hub.connection_count(), 0);
    }

    #[tokio::test]
    async fn test_dropped_receiver_is_cleaned_up() {
        let hub = RoomHub::new();
        let rx = hub.subscribe(&room("r1"), &user("gone")).await.unwrap();
        let _live = hub.subscribe(&room("r1"), &user("host")).await.unwrap();
        drop(rx);

        assert_eq!(hub.broadcast(&room("r1"), &start("host")), 1);
        assert_eq!(hub.subscriber_count(&room("r1")), 1);
    }

    #[tokio::test]
    async fn test_invalid_message_rejected() {
        let hub = RoomHub::new();
        let mut rx = hub.subscribe(&room("r1"), &user("host")).await.unwrap();

        let result = hub.publish(&room("r1"), PartyMessage::MemberLeft { user_id: user("") }).await;

        assert!(result.is_err());
        assert!(rx.try_recv().is_err());
    }
}
