//! Member side of party sync: apply host events to the local player

use std::sync::Arc;

use tracing::{debug, warn};

use super::clock::Clock;
use super::session::PartySession;
use crate::config::SyncConfig;
use crate::models::{SyncEvent, SyncKind};
use crate::player::{Player, TimeoutDefault};
use crate::{Error, Result};

/// What applying an event did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// Our own event came back from the relay; bookkeeping only
    OwnEvent,
    /// Older than an event already applied from the same sender
    Stale,
    Applied { repositioned: bool },
}

/// Applies sync events with latency compensation and tiered drift thresholds
pub struct SyncApplier {
    session: Arc<PartySession>,
    player: Player,
    clock: Arc<dyn Clock>,
    config: SyncConfig,
}

impl std::fmt::Debug for SyncApplier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncApplier")
            .field("room_id", self.session.room_id())
            .finish_non_exhaustive()
    }
}

impl SyncApplier {
    #[must_use]
    pub fn new(session: Arc<PartySession>, player: Player, clock: Arc<dyn Clock>, config: SyncConfig) -> Self {
        Self { session, player, clock, config }
    }

    /// Bring the local player in line with `event`.
    ///
    /// A player failure marks the session out of sync and returns a retryable
    /// [`Error::SyncApplyFailure`]; the next successful apply heals it.
    pub async fn apply(&self, event: &SyncEvent) -> Result<ApplyOutcome> {
        let now_ms = self.clock.now_ms();

        if event.is_own_event {
            self.session.mark_synced(now_ms);
            return Ok(ApplyOutcome::OwnEvent);
        }

        if self.session.is_stale(&event.sender_id, event.sender_send_time_ms) {
            debug!(
                sender_id = %event.sender_id,
                sent_at = event.sender_send_time_ms,
                "Discarding stale sync event"
            );
            return Ok(ApplyOutcome::Stale);
        }
        self.session.remember_host_event(event);

        let latency_ms = event.latency_ms(now_ms);
        self.session
            .update_room(|room| room.record_latency(&event.sender_id, latency_ms));

        self.reconcile(event, latency_ms, event.adjusted_position(now_ms)).await
    }

    /// Drive the player to `adjusted` as `event` demands and record the result
    async fn reconcile(&self, event: &SyncEvent, latency_ms: i64, adjusted: f64) -> Result<ApplyOutcome> {
        match self.correct(event, latency_ms, adjusted).await {
            Ok(repositioned) => {
                let position = repositioned.then_some(adjusted);
                self.session.record_applied(event, position, self.clock.now());
                debug!(
                    kind = %event.kind,
                    latency_ms,
                    adjusted_position = adjusted,
                    repositioned,
                    is_playing = event.is_playing,
                    "Applied sync event"
                );
                Ok(ApplyOutcome::Applied { repositioned })
            }
            Err(e) => {
                self.session.mark_out_of_sync();
                warn!(kind = %event.kind, error = %e, "Failed to apply sync event");
                Err(Error::SyncApplyFailure(e.to_string()))
            }
        }
    }

    /// Issue the player commands for one event. Returns whether the position was set.
    async fn correct(&self, event: &SyncEvent, latency_ms: i64, adjusted: f64) -> Result<bool> {
        let reposition = match event.kind {
            SyncKind::Seek => true,
            SyncKind::Play | SyncKind::Pause => latency_ms.abs() > self.config.play_pause_latency_threshold_ms,
            SyncKind::Heartbeat => {
                // No answer means no evidence of drift
                let local = self.player.position().await.or_timeout_default(adjusted)?;
                (local - adjusted).abs() > self.config.heartbeat_drift_threshold_secs
            }
        };

        if reposition {
            self.player.set_position(adjusted).await?;
        }
        self.player.set_playing(event.is_playing).await?;
        Ok(reposition)
    }

    /// Re-apply the newest host state as an authoritative seek
    pub async fn resync(&self) -> Result<ApplyOutcome> {
        let Some(mut event) = self.session.last_host_event() else {
            return Err(Error::NotFound("no host state received yet".to_string()));
        };
        event.kind = SyncKind::Seek;

        // A paused host has not moved since it sent that state
        let now_ms = self.clock.now_ms();
        let target = if event.is_playing {
            event.adjusted_position(now_ms)
        } else {
            event.position_seconds
        };
        self.reconcile(&event, event.latency_ms(now_ms), target).await
    }
}
