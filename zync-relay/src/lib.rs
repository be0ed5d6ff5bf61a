//! Room relays for watch parties
//!
//! [`RoomHub`] delivers messages between subscribers in one process.
//! [`RedisRelay`] layers Redis Pub/Sub on top of a hub so members on
//! different machines share a room.

pub mod error;
pub mod redis_pubsub;
pub mod room_hub;

pub use error::{Error, Result};
pub use redis_pubsub::RedisRelay;
pub use room_hub::{ConnectionId, RoomHub};
