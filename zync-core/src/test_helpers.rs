//! Test helpers and fixtures for zync-core tests
//!
//! [`FakePlayer`] stands in for an mpv process behind the `PlayerControl`
//! seam and [`LoopbackRelay`] for a room relay that echoes to every
//! subscriber.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;

use crate::models::{PartyMessage, RoomId, SyncEvent, SyncKind, UserId};
use crate::party::{Relay, RelayReceiver};
use crate::player::{Command, PlayerControl, PlayerEvent};
use crate::{Error, Result};

pub fn test_user_id(id: &str) -> UserId {
    UserId::from_string(id.to_string())
}

pub fn test_room_id(id: &str) -> RoomId {
    RoomId::from_string(id.to_string())
}

/// A sync event from `host` in `room1`
pub fn sync_event(kind: SyncKind, position: f64, is_playing: bool, sent_at_ms: i64) -> SyncEvent {
    SyncEvent {
        kind,
        position_seconds: position,
        is_playing,
        sender_send_time_ms: sent_at_ms,
        room_id: test_room_id("room1"),
        sender_id: test_user_id("host"),
        sender_username: "host".to_string(),
        is_own_event: false,
    }
}

/// In-memory player. Property writes are remembered and every command is
/// recorded for assertions.
#[derive(Debug)]
pub struct FakePlayer {
    properties: Mutex<HashMap<String, Value>>,
    commands: Mutex<Vec<Command>>,
    events: broadcast::Sender<PlayerEvent>,
    closed: CancellationToken,
    next_observer_id: AtomicU64,
    duration_polls: AtomicU32,
    /// Duration becomes this value after that many polls
    duration_ready: Mutex<Option<(u32, f64)>>,
}

impl Default for FakePlayer {
    fn default() -> Self {
        Self::new()
    }
}

impl FakePlayer {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(64);
        let properties = HashMap::from([
            // mpv starts unpaused
            ("pause".to_string(), Value::Bool(false)),
            ("time-pos".to_string(), Value::Null),
            ("duration".to_string(), Value::Null),
            ("pid".to_string(), Value::from(4242)),
        ]);
        Self {
            properties: Mutex::new(properties),
            commands: Mutex::new(Vec::new()),
            events,
            closed: CancellationToken::new(),
            next_observer_id: AtomicU64::new(1),
            duration_polls: AtomicU32::new(0),
            duration_ready: Mutex::new(None),
        }
    }

    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    pub fn set(&self, name: &str, value: impl Into<Value>) {
        self.properties.lock().insert(name.to_string(), value.into());
    }

    pub fn get(&self, name: &str) -> Value {
        self.properties.lock().get(name).cloned().unwrap_or(Value::Null)
    }

    pub fn position(&self) -> f64 {
        self.get("time-pos").as_f64().unwrap_or(0.0)
    }

    pub fn is_playing(&self) -> bool {
        !self.get("pause").as_bool().unwrap_or(true)
    }

    /// Report a positive duration only from the `polls`-th duration request on
    pub fn ready_after(&self, polls: u32, duration: f64) {
        *self.duration_ready.lock() = Some((polls, duration));
    }

    pub fn duration_polls(&self) -> u32 {
        self.duration_polls.load(Ordering::SeqCst)
    }

    pub fn emit(&self, event: PlayerEvent) {
        let _ = self.events.send(event);
    }

    /// Drop the connection for good, like a player process that died
    pub fn disconnect(&self) {
        self.closed.cancel();
    }

    pub fn commands(&self) -> Vec<Command> {
        self.commands.lock().clone()
    }

    pub fn clear_commands(&self) {
        self.commands.lock().clear();
    }

    /// Commands that write `name`
    pub fn writes_to(&self, name: &str) -> Vec<Value> {
        self.commands
            .lock()
            .iter()
            .filter(|c| c.verb() == "set_property" && c.args().get(1).and_then(Value::as_str) == Some(name))
            .filter_map(|c| c.args().get(2).cloned())
            .collect()
    }

    fn check_connected(&self) -> Result<()> {
        if !self.closed.is_cancelled() {
            Ok(())
        } else {
            Err(Error::ChannelUnavailable("fake player disconnected".to_string()))
        }
    }

    fn execute(&self, command: &Command) -> Result<Value> {
        self.check_connected()?;
        self.commands.lock().push(command.clone());

        let args = command.args();
        let name = args.get(1).and_then(Value::as_str).unwrap_or_default().to_string();
        match command.verb() {
            "get_property" if name == "duration" => {
                let polls = self.duration_polls.fetch_add(1, Ordering::SeqCst) + 1;
                match *self.duration_ready.lock() {
                    Some((after, duration)) if polls >= after => Ok(Value::from(duration)),
                    Some(_) => Ok(Value::from(0.0)),
                    None => Ok(self.get("duration")),
                }
            }
            "get_property" => Ok(self.get(&name)),
            "set_property" => {
                self.set(&name, args.get(2).cloned().unwrap_or(Value::Null));
                Ok(Value::Null)
            }
            "cycle" => {
                let current = self.get(&name).as_bool().unwrap_or(false);
                self.set(&name, !current);
                Ok(Value::Null)
            }
            _ => Ok(Value::Null),
        }
    }
}

#[async_trait]
impl PlayerControl for FakePlayer {
    async fn request(&self, command: Command) -> Result<Value> {
        self.execute(&command)
    }

    async fn request_with_timeout(&self, command: Command, _timeout: Duration) -> Result<Value> {
        self.execute(&command)
    }

    async fn send(&self, command: Command) -> Result<()> {
        self.execute(&command).map(|_| ())
    }

    async fn observe(&self, property: &str) -> Result<u64> {
        let id = self.next_observer_id.fetch_add(1, Ordering::SeqCst);
        self.execute(&Command::observe_property(id, property))?;
        Ok(id)
    }

    async fn unobserve(&self, observer_id: u64) -> Result<()> {
        self.execute(&Command::unobserve_property(observer_id)).map(|_| ())
    }

    fn subscribe(&self) -> broadcast::Receiver<PlayerEvent> {
        self.events.subscribe()
    }

    fn is_connected(&self) -> bool {
        !self.closed.is_cancelled()
    }

    fn closed(&self) -> CancellationToken {
        self.closed.clone()
    }
}

/// Relay that records every publish and echoes it to all subscribers of the room
#[derive(Debug, Default)]
pub struct LoopbackRelay {
    published: Mutex<Vec<PartyMessage>>,
    subscribers: Mutex<Vec<(RoomId, UserId, mpsc::UnboundedSender<PartyMessage>)>>,
}

impl LoopbackRelay {
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn published(&self) -> Vec<PartyMessage> {
        self.published.lock().clone()
    }

    pub fn clear(&self) {
        self.published.lock().clear();
    }

    /// Published sync payloads, in order
    pub fn sync_events(&self) -> Vec<crate::models::SyncPayload> {
        self.published
            .lock()
            .iter()
            .filter_map(|m| match m {
                PartyMessage::PartySyncData(p) => Some(p.clone()),
                _ => None,
            })
            .collect()
    }

    /// Published messages of one wire type
    pub fn of_type(&self, message_type: &str) -> Vec<PartyMessage> {
        self.published
            .lock()
            .iter()
            .filter(|m| m.message_type() == message_type)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl Relay for LoopbackRelay {
    async fn publish(&self, room_id: &RoomId, message: PartyMessage) -> Result<()> {
        self.published.lock().push(message.clone());
        self.subscribers
            .lock()
            .retain(|(room, _, tx)| room != room_id || tx.send(message.clone()).is_ok());
        Ok(())
    }

    async fn subscribe(&self, room_id: &RoomId, user_id: &UserId) -> Result<RelayReceiver> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.lock().push((room_id.clone(), user_id.clone(), tx));
        Ok(rx)
    }

    async fn unsubscribe(&self, room_id: &RoomId, user_id: &UserId) -> Result<()> {
        self.subscribers
            .lock()
            .retain(|(room, user, _)| !(room == room_id && user == user_id));
        Ok(())
    }
}
