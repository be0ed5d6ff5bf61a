//! Host side of party sync: watch the local player and publish its state

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::clock::Clock;
use super::relay::Relay;
use super::session::{PartySession, Published};
use crate::config::SyncConfig;
use crate::models::{PartyMessage, SyncKind, SyncPayload};
use crate::player::protocol::property;
use crate::player::{Player, PlayerEvent, TimeoutDefault};
use crate::Result;

/// Builds and publishes sync events from the local player's state
#[derive(Clone)]
struct Publisher {
    session: Arc<PartySession>,
    player: Player,
    relay: Arc<dyn Relay>,
    clock: Arc<dyn Clock>,
    config: SyncConfig,
}

impl Publisher {
    async fn publish(&self, kind: SyncKind, position_seconds: f64, is_playing: bool) -> Result<()> {
        let now_ms = self.clock.now_ms();
        let position_seconds = position_seconds.max(0.0);
        let payload = SyncPayload {
            timestamp: position_seconds,
            playing: is_playing,
            sync_time: now_ms,
            kind,
            room_id: self.session.room_id().clone(),
            sender_id: self.session.user_id().clone(),
            sender_username: self.session.username().to_string(),
            is_own_event: None,
        };

        self.relay
            .publish(self.session.room_id(), PartyMessage::PartySyncData(payload))
            .await?;

        self.session.record_published(Published { position_seconds, is_playing, at_ms: now_ms });
        debug!(
            room_id = %self.session.room_id(),
            kind = %kind,
            position = position_seconds,
            is_playing,
            "Published sync event"
        );
        Ok(())
    }

    /// Position to report when the player does not answer in time
    fn fallback_position(&self) -> f64 {
        self.session
            .last_published()
            .map_or(0.0, |last| last.expected_position(self.clock.now_ms()))
    }

    async fn on_pause_change(&self, paused: bool) -> Result<()> {
        let position = self.player.position().await.or_timeout_default(self.fallback_position())?;
        let is_playing = !paused;
        self.publish(SyncKind::from_playing(is_playing), position, is_playing).await
    }

    async fn on_seek(&self, cancel: &CancellationToken) -> Result<()> {
        // Let the player land before reading the position back
        tokio::select! {
            () = cancel.cancelled() => return Ok(()),
            () = tokio::time::sleep(self.config.seek_settle()) => {}
        }

        let position = self.player.position().await.or_timeout_default(self.fallback_position())?;
        let last_playing = self.session.last_published().is_some_and(|p| p.is_playing);
        let paused = self.player.is_paused().await.or_timeout_default(!last_playing)?;
        if cancel.is_cancelled() {
            return Ok(());
        }
        self.publish(SyncKind::Seek, position, !paused).await
    }

    async fn heartbeat(&self) -> Result<()> {
        // A heartbeat that cannot read the player is skipped, not defaulted
        let position = match self.player.position().await {
            Ok(position) => position,
            Err(e) if !e.is_channel_loss() => {
                debug!(error = %e, "Skipping heartbeat");
                return Ok(());
            }
            Err(e) => return Err(e),
        };
        let is_playing = match self.player.is_paused().await {
            Ok(paused) => !paused,
            Err(e) if !e.is_channel_loss() => {
                debug!(error = %e, "Skipping heartbeat");
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        if self.config.suppress_zero_heartbeat && position == 0.0 && !is_playing {
            debug!("Suppressing heartbeat from idle player at position 0");
            return Ok(());
        }

        if let Some(last) = self.session.last_published() {
            let drift = (position - last.expected_position(self.clock.now_ms())).abs();
            if last.is_playing == is_playing && drift <= self.config.publish_drift_threshold_secs {
                return Ok(());
            }
        }

        self.publish(SyncKind::Heartbeat, position, is_playing).await
    }

    async fn on_player_event(&self, event: &PlayerEvent, cancel: &CancellationToken) -> Result<()> {
        if event.is_property_change(property::PAUSE) {
            match event.data.as_bool() {
                Some(paused) => self.on_pause_change(paused).await,
                None => Ok(()),
            }
        } else if event.is_seek() {
            self.on_seek(cancel).await
        } else {
            Ok(())
        }
    }

    async fn run(self, mut events: broadcast::Receiver<PlayerEvent>, cancel: CancellationToken) {
        let period = self.config.heartbeat_interval();
        let mut heartbeat = tokio::time::interval_at(Instant::now() + period, period);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let result = tokio::select! {
                () = cancel.cancelled() => break,
                _ = heartbeat.tick() => self.heartbeat().await,
                event = events.recv() => match event {
                    Ok(event) => self.on_player_event(&event, &cancel).await,
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Host publisher lagged behind player events");
                        Ok(())
                    }
                    Err(RecvError::Closed) => break,
                },
            };

            if let Err(e) = result {
                warn!(room_id = %self.session.room_id(), error = %e, "Failed to publish sync event");
            }
        }

        debug!(room_id = %self.session.room_id(), "Host publisher stopped");
    }
}

struct Running {
    cancel: CancellationToken,
    observer_id: Option<u64>,
    _task: JoinHandle<()>,
}

/// Authoritative publisher for the room host
pub struct HostPublisher {
    publisher: Publisher,
    running: Mutex<Option<Running>>,
}

impl std::fmt::Debug for HostPublisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostPublisher")
            .field("room_id", self.publisher.session.room_id())
            .field("running", &self.is_running())
            .finish()
    }
}

impl HostPublisher {
    #[must_use]
    pub fn new(
        session: Arc<PartySession>,
        player: Player,
        relay: Arc<dyn Relay>,
        clock: Arc<dyn Clock>,
        config: SyncConfig,
    ) -> Self {
        Self {
            publisher: Publisher { session, player, relay, clock, config },
            running: Mutex::new(None),
        }
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.lock().is_some()
    }

    /// Watch pause changes and seeks and start the heartbeat. Starting an
    /// already running publisher does nothing.
    pub async fn start(&self) -> Result<()> {
        if self.is_running() {
            return Ok(());
        }

        // Subscribe before observing so the initial pause notification is not missed
        let events = self.publisher.player.subscribe();
        let observer_id = self.publisher.player.observe(property::PAUSE).await?;

        let cancel = CancellationToken::new();
        let task = tokio::spawn(self.publisher.clone().run(events, cancel.clone()));

        let previous = self.running.lock().replace(Running {
            cancel,
            observer_id: Some(observer_id),
            _task: task,
        });
        if let Some(previous) = previous {
            // Lost a start race; keep the newer task
            previous.cancel.cancel();
        }

        info!(
            room_id = %self.publisher.session.room_id(),
            heartbeat_ms = self.publisher.config.heartbeat_interval_ms,
            "Host publisher started"
        );
        Ok(())
    }

    /// Cancel the heartbeat, stop observing the player and forget what was
    /// published. In-flight player requests finish on their own.
    pub async fn stop(&self) {
        let Some(running) = self.running.lock().take() else {
            return;
        };
        running.cancel.cancel();
        self.publisher.session.clear_authority();

        if let Some(observer_id) = running.observer_id {
            if let Err(e) = self.publisher.player.unobserve(observer_id).await {
                debug!(observer_id, error = %e, "Failed to unobserve pause");
            }
        }
        info!(room_id = %self.publisher.session.room_id(), "Host publisher stopped");
    }

    /// Publish the current player state as an authoritative seek, ignoring
    /// the heartbeat thresholds
    pub async fn publish_snapshot(&self) -> Result<()> {
        let position = self.publisher.player.position().await?;
        let paused = self.publisher.player.is_paused().await?;
        self.publisher.publish(SyncKind::Seek, position, !paused).await
    }
}
