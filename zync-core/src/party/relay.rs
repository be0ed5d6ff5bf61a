//! Relay seam
//!
//! A relay is a per-room publish/subscribe bus. Every subscriber of a room,
//! the publisher included, receives every message published to it.

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::models::{PartyMessage, RoomId, UserId};
use crate::Result;

pub type RelayReceiver = mpsc::UnboundedReceiver<PartyMessage>;

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Relay: Send + Sync {
    /// Deliver `message` to every subscriber of `room_id`
    async fn publish(&self, room_id: &RoomId, message: PartyMessage) -> Result<()>;

    /// Join a room's message stream as `user_id`
    async fn subscribe(&self, room_id: &RoomId, user_id: &UserId) -> Result<RelayReceiver>;

    /// Leave a room's message stream
    async fn unsubscribe(&self, room_id: &RoomId, user_id: &UserId) -> Result<()>;
}
