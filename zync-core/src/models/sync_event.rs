//! Relay message types
//!
//! Everything that crosses the relay is a [`PartyMessage`]: a closed, tagged
//! union with a single decode/validate boundary. Payloads that fail to parse or
//! validate are rejected there and never reach the coordinator.

use serde::{Deserialize, Serialize};

use super::id::{RoomId, UserId};
use super::room::Member;
use crate::{Error, Result};

/// Kind of a sync event. Anything unrecognised is treated as a heartbeat.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncKind {
    Play,
    Pause,
    Seek,
    #[serde(other)]
    Heartbeat,
}

impl SyncKind {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Play => "play",
            Self::Pause => "pause",
            Self::Seek => "seek",
            Self::Heartbeat => "heartbeat",
        }
    }

    /// Kind for a discrete pause-state change
    #[must_use]
    pub const fn from_playing(is_playing: bool) -> Self {
        if is_playing {
            Self::Play
        } else {
            Self::Pause
        }
    }
}

impl std::fmt::Display for SyncKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Wire shape of `party_sync_data`.
///
/// `timestamp` is the playback position in seconds at send time and
/// `sync_time` is the sender's wall clock in epoch milliseconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncPayload {
    pub timestamp: f64,
    pub playing: bool,
    #[serde(rename = "syncTime")]
    pub sync_time: i64,
    #[serde(rename = "type", default = "default_kind")]
    pub kind: SyncKind,
    #[serde(rename = "roomId")]
    pub room_id: RoomId,
    #[serde(rename = "senderID")]
    pub sender_id: UserId,
    #[serde(rename = "senderUsername", default)]
    pub sender_username: String,
    #[serde(rename = "isOwnEvent", default, skip_serializing_if = "Option::is_none")]
    pub is_own_event: Option<bool>,
}

const fn default_kind() -> SyncKind {
    SyncKind::Heartbeat
}

/// A validated sync event, ready to be applied to the local player
#[derive(Debug, Clone, PartialEq)]
pub struct SyncEvent {
    pub kind: SyncKind,
    /// Position at the sender's send time
    pub position_seconds: f64,
    pub is_playing: bool,
    pub sender_send_time_ms: i64,
    pub room_id: RoomId,
    pub sender_id: UserId,
    pub sender_username: String,
    pub is_own_event: bool,
}

impl SyncEvent {
    /// One-way latency estimate for this event as seen at `now_ms`
    #[must_use]
    pub const fn latency_ms(&self, now_ms: i64) -> i64 {
        now_ms - self.sender_send_time_ms
    }

    /// Where the sender's player is expected to be at `now_ms`
    #[must_use]
    pub fn adjusted_position(&self, now_ms: i64) -> f64 {
        self.position_seconds + self.latency_ms(now_ms) as f64 / 1000.0
    }

    #[must_use]
    pub fn to_payload(&self) -> SyncPayload {
        SyncPayload {
            timestamp: self.position_seconds,
            playing: self.is_playing,
            sync_time: self.sender_send_time_ms,
            kind: self.kind,
            room_id: self.room_id.clone(),
            sender_id: self.sender_id.clone(),
            sender_username: self.sender_username.clone(),
            is_own_event: None,
        }
    }
}

impl SyncPayload {
    /// Check that the payload is usable. Positions must be finite and
    /// non-negative and the send time must be a real epoch timestamp.
    pub fn validate(&self) -> Result<()> {
        if !self.timestamp.is_finite() || self.timestamp < 0.0 {
            return Err(Error::InvalidInput(format!("invalid position {}", self.timestamp)));
        }
        if self.sync_time <= 0 {
            return Err(Error::InvalidInput(format!("invalid send time {}", self.sync_time)));
        }
        if self.sender_id.as_str().is_empty() {
            return Err(Error::InvalidInput("missing sender id".to_string()));
        }
        Ok(())
    }

    /// Turn the payload into an event as seen by `local_user`.
    ///
    /// An explicit `isOwnEvent` flag from the relay wins; otherwise ownership
    /// is derived from the sender id.
    pub fn into_event(self, local_user: &UserId) -> Result<SyncEvent> {
        self.validate()?;
        let is_own_event = self.is_own_event.unwrap_or(false) || &self.sender_id == local_user;
        Ok(SyncEvent {
            kind: self.kind,
            position_seconds: self.timestamp,
            is_playing: self.playing,
            sender_send_time_ms: self.sync_time,
            room_id: self.room_id,
            sender_id: self.sender_id,
            sender_username: self.sender_username,
            is_own_event,
        })
    }
}

/// Everything exchanged between room members over the relay
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum PartyMessage {
    /// Authoritative playback state from the host
    PartySyncData(SyncPayload),

    /// A member finished preparing its stream
    #[serde(rename = "watch_party_ready")]
    MemberReady {
        user_id: UserId,
        username: String,
        prepared: bool,
        timestamp: i64,
    },

    /// Countdown tick from the host (seconds remaining)
    #[serde(rename = "watch_party_countdown")]
    Countdown { countdown: u32, sender_id: UserId },

    /// The single start signal; every member starts playback on receipt
    #[serde(rename = "watch_party_start")]
    StartPlayback { sender_id: UserId },

    MemberJoined { user_id: UserId, username: String },

    MemberLeft { user_id: UserId },

    OwnershipTransferred { new_owner: UserId },

    /// The host's view of the room, sent whenever membership changes
    Roster { owner_id: UserId, members: Vec<Member> },

    /// A member asks the host for an immediate authoritative snapshot
    ManualSyncRequest { requester: UserId },
}

impl PartyMessage {
    /// Decode and validate a relay payload.
    pub fn decode(raw: &str) -> Result<Self> {
        let message: Self = serde_json::from_str(raw)?;
        message.validate()?;
        Ok(message)
    }

    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn validate(&self) -> Result<()> {
        match self {
            Self::PartySyncData(payload) => payload.validate(),
            Self::MemberReady { user_id, .. }
            | Self::MemberJoined { user_id, .. }
            | Self::MemberLeft { user_id } => non_empty(user_id),
            Self::Countdown { sender_id, .. } | Self::StartPlayback { sender_id } => non_empty(sender_id),
            Self::OwnershipTransferred { new_owner } => non_empty(new_owner),
            Self::Roster { owner_id, members } => {
                non_empty(owner_id)?;
                if members.iter().any(|m| &m.user_id == owner_id) {
                    Ok(())
                } else {
                    Err(Error::InvalidInput(format!("roster owner {owner_id} is not a member")))
                }
            }
            Self::ManualSyncRequest { requester } => non_empty(requester),
        }
    }

    /// Wire name of the message type
    #[must_use]
    pub const fn message_type(&self) -> &'static str {
        match self {
            Self::PartySyncData(_) => "party_sync_data",
            Self::MemberReady { .. } => "watch_party_ready",
            Self::Countdown { .. } => "watch_party_countdown",
            Self::StartPlayback { .. } => "watch_party_start",
            Self::MemberJoined { .. } => "member_joined",
            Self::MemberLeft { .. } => "member_left",
            Self::OwnershipTransferred { .. } => "ownership_transferred",
            Self::Roster { .. } => "roster",
            Self::ManualSyncRequest { .. } => "manual_sync_request",
        }
    }
}

fn non_empty(id: &UserId) -> Result<()> {
    if id.as_str().is_empty() {
        Err(Error::InvalidInput("empty user id".to_string()))
    } else {
        Ok(())
    }
}
