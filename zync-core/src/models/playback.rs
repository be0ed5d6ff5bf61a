use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Last playback state this client applied to its own player.
///
/// Only the apply path writes here, after the player accepted the command.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PlaybackState {
    pub position_seconds: f64,
    pub is_playing: bool,
    pub last_applied_wall_clock: Option<DateTime<Utc>>,
}

impl PlaybackState {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a successfully applied position/playing pair.
    pub fn record_applied(&mut self, position_seconds: Option<f64>, is_playing: bool, at: DateTime<Utc>) {
        if let Some(position) = position_seconds {
            self.position_seconds = position;
        }
        self.is_playing = is_playing;
        self.last_applied_wall_clock = Some(at);
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// Snapshot of party sync health, as reported to the control surface
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatus {
    pub is_active: bool,
    pub is_in_sync: bool,
    /// Epoch milliseconds of the last successful sync, 0 if never
    pub last_sync_time: i64,
    pub is_host: bool,
}
