//! Player control seam and typed accessors
//!
//! [`PlayerControl`] is what the coordinator and the readiness machine talk
//! to. [`super::PlayerChannel`] implements it over the real socket; tests
//! substitute a mock or an in-memory fake.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use super::protocol::{property, Command, PlayerEvent};
use crate::{Error, Result};

/// Raw access to a player process
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PlayerControl: Send + Sync {
    /// Send a command and wait for its correlated reply
    async fn request(&self, command: Command) -> Result<Value>;

    /// Like [`PlayerControl::request`] with a caller-chosen timeout
    async fn request_with_timeout(&self, command: Command, timeout: Duration) -> Result<Value>;

    /// Fire-and-forget write
    async fn send(&self, command: Command) -> Result<()>;

    /// Start receiving `property-change` events for `property`. Returns the observer id.
    async fn observe(&self, property: &str) -> Result<u64>;

    async fn unobserve(&self, observer_id: u64) -> Result<()>;

    /// Receiver for every unsolicited player event
    fn subscribe(&self) -> broadcast::Receiver<PlayerEvent>;

    fn is_connected(&self) -> bool;

    /// Cancelled once the connection is gone; a closed connection never reopens
    fn closed(&self) -> CancellationToken;
}

/// Turn a request timeout into a default value; every other error passes through.
pub trait TimeoutDefault<T> {
    fn or_timeout_default(self, default: T) -> Result<T>;
}

impl<T> TimeoutDefault<T> for Result<T> {
    fn or_timeout_default(self, default: T) -> Result<T> {
        match self {
            Err(Error::RequestTimeout { request_id, timeout_ms }) => {
                tracing::debug!(request_id, timeout_ms, "Player request timed out, using default");
                Ok(default)
            }
            other => other,
        }
    }
}

/// Properties the control surface can fetch by name
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlayerQuery {
    IsPlaying,
    CurrentTime,
    Duration,
    Volume,
    IsFullscreen,
    CurrentSubtitle,
}

impl std::str::FromStr for PlayerQuery {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "isPlaying" => Ok(Self::IsPlaying),
            "currentTime" => Ok(Self::CurrentTime),
            "duration" => Ok(Self::Duration),
            "volume" => Ok(Self::Volume),
            "isFullscreen" => Ok(Self::IsFullscreen),
            "currentSubtitle" => Ok(Self::CurrentSubtitle),
            other => Err(Error::InvalidInput(format!("unknown player query: {other}"))),
        }
    }
}

/// Typed wrapper around a [`PlayerControl`]
#[derive(Clone)]
pub struct Player {
    control: Arc<dyn PlayerControl>,
}

impl std::fmt::Debug for Player {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Player")
            .field("connected", &self.control.is_connected())
            .finish()
    }
}

impl Player {
    #[must_use]
    pub fn new(control: Arc<dyn PlayerControl>) -> Self {
        Self { control }
    }

    #[must_use]
    pub fn control(&self) -> &Arc<dyn PlayerControl> {
        &self.control
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.control.is_connected()
    }

    #[must_use]
    pub fn closed(&self) -> CancellationToken {
        self.control.closed()
    }

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<PlayerEvent> {
        self.control.subscribe()
    }

    pub async fn observe(&self, property: &str) -> Result<u64> {
        self.control.observe(property).await
    }

    pub async fn unobserve(&self, observer_id: u64) -> Result<()> {
        self.control.unobserve(observer_id).await
    }

    pub async fn get_property(&self, name: &str) -> Result<Value> {
        self.control.request(Command::get_property(name)).await
    }

    /// Current position in seconds. An idle player reports `null`, read as 0.
    pub async fn position(&self) -> Result<f64> {
        let value = self.get_property(property::TIME_POS).await?;
        Ok(value.as_f64().unwrap_or(0.0))
    }

    pub async fn is_paused(&self) -> Result<bool> {
        let value = self.get_property(property::PAUSE).await?;
        value
            .as_bool()
            .ok_or_else(|| Error::Player(format!("unexpected pause value: {value}")))
    }

    /// Media duration in seconds; 0 while nothing is loaded.
    pub async fn duration(&self) -> Result<f64> {
        let value = self.get_property(property::DURATION).await?;
        Ok(value.as_f64().unwrap_or(0.0))
    }

    /// Duration with a short per-request timeout, for readiness polling
    pub async fn duration_within(&self, timeout: Duration) -> Result<f64> {
        let value = self
            .control
            .request_with_timeout(Command::get_property(property::DURATION), timeout)
            .await?;
        Ok(value.as_f64().unwrap_or(0.0))
    }

    pub async fn fetch(&self, query: PlayerQuery) -> Result<Value> {
        match query {
            PlayerQuery::IsPlaying => Ok(Value::Bool(!self.is_paused().await?)),
            PlayerQuery::CurrentTime => self.get_property(property::TIME_POS).await,
            PlayerQuery::Duration => self.get_property(property::DURATION).await,
            PlayerQuery::Volume => self.get_property(property::VOLUME).await,
            PlayerQuery::IsFullscreen => self.get_property(property::FULLSCREEN).await,
            PlayerQuery::CurrentSubtitle => self.get_property(property::SID).await,
        }
    }

    pub async fn set_position(&self, seconds: f64) -> Result<()> {
        self.control
            .send(Command::set_property(property::TIME_POS, seconds.max(0.0)))
            .await
    }

    pub async fn set_playing(&self, playing: bool) -> Result<()> {
        self.control.send(Command::set_property(property::PAUSE, !playing)).await
    }

    pub async fn toggle_pause(&self) -> Result<()> {
        self.control.send(Command::cycle(property::PAUSE)).await
    }

    pub async fn toggle_fullscreen(&self) -> Result<()> {
        self.control.send(Command::cycle(property::FULLSCREEN)).await
    }

    pub async fn set_volume(&self, volume: f64) -> Result<()> {
        self.control
            .send(Command::set_property(property::VOLUME, volume.clamp(0.0, 130.0)))
            .await
    }

    /// Select a subtitle track by id, or `"no"` to disable subtitles
    pub async fn set_subtitle(&self, sid: Value) -> Result<()> {
        self.control.send(Command::set_property(property::SID, sid)).await
    }

    pub async fn set_subtitle_delay(&self, seconds: f64) -> Result<()> {
        self.control.send(Command::set_property(property::SUB_DELAY, seconds)).await
    }

    pub async fn set_subtitle_scale(&self, scale: f64) -> Result<()> {
        self.control.send(Command::set_property(property::SUB_SCALE, scale)).await
    }

    pub async fn set_subtitle_visibility(&self, visible: bool) -> Result<()> {
        self.control
            .send(Command::set_property(property::SUB_VISIBILITY, visible))
            .await
    }

    pub async fn add_subtitle(&self, url: &str, title: Option<&str>) -> Result<()> {
        self.control.request(Command::sub_add(url, title)).await.map(|_| ())
    }

    pub async fn remove_subtitle(&self, id: Option<i64>) -> Result<()> {
        self.control.request(Command::sub_remove(id)).await.map(|_| ())
    }

    /// Show the video window and start loading `url`
    pub async fn load_file(&self, url: &str) -> Result<()> {
        self.control.send(Command::set_property(property::VID, "auto")).await?;
        self.control.send(Command::set_property(property::FORCE_WINDOW, "yes")).await?;
        self.control.send(Command::loadfile(url)).await
    }

    /// Load `url` held paused so nothing plays until [`Player::set_playing`]
    pub async fn load_file_paused(&self, url: &str) -> Result<()> {
        self.control.send(Command::set_property(property::PAUSE, true)).await?;
        self.load_file(url).await
    }

    /// Stop playback and hide the window, leaving the player idle
    pub async fn unload(&self) -> Result<()> {
        self.control.send(Command::new("stop")).await?;
        self.control.send(Command::set_property(property::FORCE_WINDOW, "no")).await
    }

    /// Round-trip a cheap property to confirm the player answers
    pub async fn ping(&self) -> Result<i64> {
        let value = self.get_property(property::PID).await?;
        value
            .as_i64()
            .ok_or_else(|| Error::Player(format!("unexpected pid value: {value}")))
    }
}
