//! Per-connection party state
//!
//! One [`PartySession`] exists per active room on a player connection. The
//! host publisher, the sync applier and the readiness machine all share it
//! by `Arc` handle.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;

use crate::models::{PlaybackState, Room, RoomId, SyncEvent, SyncStatus, UserId};

/// Last state the host put on the relay
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Published {
    pub position_seconds: f64,
    pub is_playing: bool,
    pub at_ms: i64,
}

impl Published {
    /// Where the host's player should be at `now_ms` if nothing changed since
    #[must_use]
    pub fn expected_position(&self, now_ms: i64) -> f64 {
        if self.is_playing {
            self.position_seconds + (now_ms - self.at_ms).max(0) as f64 / 1000.0
        } else {
            self.position_seconds
        }
    }
}

#[derive(Debug)]
struct SessionState {
    is_host: bool,
    active: bool,
    room: Room,
    playback: PlaybackState,
    in_sync: bool,
    last_sync_time: i64,
    last_host_event: Option<SyncEvent>,
    newest_by_sender: HashMap<UserId, i64>,
    last_published: Option<Published>,
}

#[derive(Debug)]
pub struct PartySession {
    room_id: RoomId,
    user_id: UserId,
    username: String,
    state: RwLock<SessionState>,
}

impl PartySession {
    /// Open a session. The host's room starts with the host as owner; a
    /// member's room stays empty until the host's roster arrives.
    #[must_use]
    pub fn new(room_id: RoomId, user_id: UserId, username: String, is_host: bool) -> Self {
        let room = if is_host {
            Room::new(room_id.clone(), user_id.clone(), username.clone())
        } else {
            Room::awaiting_roster(room_id.clone())
        };

        Self {
            room_id,
            user_id,
            username,
            state: RwLock::new(SessionState {
                is_host,
                active: false,
                room,
                playback: PlaybackState::new(),
                in_sync: false,
                last_sync_time: 0,
                last_host_event: None,
                newest_by_sender: HashMap::new(),
                last_published: None,
            }),
        }
    }

    #[must_use]
    pub const fn room_id(&self) -> &RoomId {
        &self.room_id
    }

    #[must_use]
    pub const fn user_id(&self) -> &UserId {
        &self.user_id
    }

    #[must_use]
    pub fn username(&self) -> &str {
        &self.username
    }

    #[must_use]
    pub fn is_host(&self) -> bool {
        self.state.read().is_host
    }

    pub fn set_host(&self, is_host: bool) {
        self.state.write().is_host = is_host;
    }

    pub fn set_active(&self, active: bool) {
        self.state.write().active = active;
    }

    pub fn with_room<R>(&self, f: impl FnOnce(&Room) -> R) -> R {
        f(&self.state.read().room)
    }

    pub fn update_room<R>(&self, f: impl FnOnce(&mut Room) -> R) -> R {
        f(&mut self.state.write().room)
    }

    #[must_use]
    pub fn status(&self) -> SyncStatus {
        let state = self.state.read();
        SyncStatus {
            is_active: state.active,
            is_in_sync: state.in_sync,
            last_sync_time: state.last_sync_time,
            is_host: state.is_host,
        }
    }

    pub fn mark_synced(&self, now_ms: i64) {
        let mut state = self.state.write();
        state.in_sync = true;
        state.last_sync_time = now_ms;
    }

    pub fn mark_out_of_sync(&self) {
        self.state.write().in_sync = false;
    }

    /// Whether an event from `sender` sent at `send_time_ms` is older than
    /// one already applied from the same sender
    #[must_use]
    pub fn is_stale(&self, sender: &UserId, send_time_ms: i64) -> bool {
        self.state
            .read()
            .newest_by_sender
            .get(sender)
            .is_some_and(|newest| send_time_ms < *newest)
    }

    /// Record a successfully applied event
    pub fn record_applied(&self, event: &SyncEvent, corrected_position: Option<f64>, at: DateTime<Utc>) {
        let mut state = self.state.write();
        let newest = state
            .newest_by_sender
            .entry(event.sender_id.clone())
            .or_insert(event.sender_send_time_ms);
        *newest = (*newest).max(event.sender_send_time_ms);
        state.playback.record_applied(corrected_position, event.is_playing, at);
        state.in_sync = true;
        state.last_sync_time = at.timestamp_millis();
    }

    pub fn remember_host_event(&self, event: &SyncEvent) {
        let mut state = self.state.write();
        let newer = state
            .last_host_event
            .as_ref()
            .is_none_or(|last| last.sender_send_time_ms <= event.sender_send_time_ms);
        if newer {
            state.last_host_event = Some(event.clone());
        }
    }

    #[must_use]
    pub fn last_host_event(&self) -> Option<SyncEvent> {
        self.state.read().last_host_event.clone()
    }

    #[must_use]
    pub fn playback(&self) -> PlaybackState {
        self.state.read().playback.clone()
    }

    #[must_use]
    pub fn last_published(&self) -> Option<Published> {
        self.state.read().last_published
    }

    pub fn record_published(&self, published: Published) {
        self.state.write().last_published = Some(published);
    }

    /// Forget what the host last published
    pub fn clear_authority(&self) {
        self.state.write().last_published = None;
    }

    /// Start over for a new stream: playback and sync bookkeeping are cleared.
    pub fn reset_for_stream(&self) {
        let mut state = self.state.write();
        state.playback.reset();
        state.in_sync = false;
        state.last_host_event = None;
        state.newest_by_sender.clear();
        state.last_published = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::SyncKind;

    fn event(sender: &str, sent_at: i64) -> SyncEvent {
        SyncEvent {
            kind: SyncKind::Heartbeat,
            position_seconds: 10.0,
            is_playing: true,
            sender_send_time_ms: sent_at,
            room_id: RoomId::from("room1"),
            sender_id: UserId::from(sender),
            sender_username: sender.to_string(),
            is_own_event: false,
        }
    }

    fn session(is_host: bool) -> PartySession {
        PartySession::new(RoomId::from("room1"), UserId::from("alice"), "alice".to_string(), is_host)
    }

    #[test]
    fn test_host_owns_new_room() {
        let host = session(true);
        assert!(host.with_room(|room| room.is_owner(&UserId::from("alice"))));

        let member = session(false);
        assert_eq!(member.with_room(Room::total_members), 0);
    }

    #[test]
    fn test_stale_events_are_per_sender() {
        let session = session(false);
        session.record_applied(&event("host", 2000), None, Utc::now());

        assert!(session.is_stale(&UserId::from("host"), 1999));
        assert!(!session.is_stale(&UserId::from("host"), 2000));
        assert!(!session.is_stale(&UserId::from("other"), 1));
    }

    #[test]
    fn test_status_reflects_sync() {
        let session = session(true);
        session.set_active(true);
        session.mark_synced(1234);

        let status = session.status();
        assert!(status.is_active && status.is_in_sync && status.is_host);
        assert_eq!(status.last_sync_time, 1234);

        session.mark_out_of_sync();
        assert!(!session.status().is_in_sync);
    }

    #[test]
    fn test_last_host_event_keeps_newest() {
        let session = session(false);
        session.remember_host_event(&event("host", 2000));
        session.remember_host_event(&event("host", 1000));
        assert_eq!(session.last_host_event().unwrap().sender_send_time_ms, 2000);
    }

    #[test]
    fn test_expected_position_extrapolates_while_playing() {
        let playing = Published { position_seconds: 100.0, is_playing: true, at_ms: 0 };
        assert!((playing.expected_position(10_000) - 110.0).abs() < 1e-9);

        let paused = Published { is_playing: false, ..playing };
        assert!((paused.expected_position(10_000) - 100.0).abs() < 1e-9);
    }

    #[test]
    fn test_reset_for_stream_keeps_room() {
        let session = session(true);
        session.update_room(|room| room.mark_ready(&UserId::from("alice")));
        session.record_published(Published { position_seconds: 1.0, is_playing: true, at_ms: 1 });
        session.record_applied(&event("host", 5000), Some(3.0), Utc::now());

        session.reset_for_stream();

        assert_eq!(session.with_room(Room::ready_count), 1);
        assert!(!session.is_stale(&UserId::from("host"), 1));
        assert_eq!(session.playback(), PlaybackState::default());
        assert!(session.last_published().is_none());
        assert!(!session.status().is_in_sync);
    }
}
