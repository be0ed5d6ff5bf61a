//! Readiness and synchronized launch
//!
//! Every member prepares its stream and announces readiness. The host
//! counts down once everyone currently in the room is ready and then sends
//! one start signal. Nobody, the host included, starts playback before that
//! signal comes back over the relay.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::clock::Clock;
use super::relay::Relay;
use super::session::PartySession;
use crate::config::{ReadinessConfig, RetryPolicy};
use crate::models::{Departure, PartyMessage, PartyPhase, Room, UserId};
use crate::player::{Player, TimeoutDefault};
use crate::{Error, Result};

/// Result of a bounded wait for the stream to become playable
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Readiness {
    Ready { duration_seconds: f64 },
    TimedOut { attempts: u32 },
}

impl Readiness {
    #[must_use]
    pub const fn is_ready(&self) -> bool {
        matches!(self, Self::Ready { .. })
    }
}

/// Poll the player's duration until it is positive or the budget runs out.
///
/// A request that times out counts as "not yet"; losing the channel ends
/// the wait with an error.
pub async fn wait_for_duration(player: &Player, retry: RetryPolicy, request_timeout: Duration) -> Result<Readiness> {
    for attempt in 1..=retry.max_attempts {
        let duration = player.duration_within(request_timeout).await.or_timeout_default(0.0);
        match duration {
            Ok(duration) if duration > 0.0 => {
                debug!(attempt, duration, "Stream duration available");
                return Ok(Readiness::Ready { duration_seconds: duration });
            }
            Ok(_) => {}
            Err(e) if e.is_channel_loss() => return Err(e),
            Err(e) => debug!(attempt, error = %e, "Duration not available yet"),
        }
        if attempt < retry.max_attempts {
            tokio::time::sleep(retry.interval).await;
        }
    }
    Ok(Readiness::TimedOut { attempts: retry.max_attempts })
}

/// Something the owner of the machine has to act on
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadinessSignal {
    /// The start signal arrived; begin synchronized playback
    Start,
    /// The room owner changed; `is_local` if this client is now the host
    HostChanged { is_local: bool },
}

pub struct ReadinessMachine {
    session: Arc<PartySession>,
    player: Player,
    relay: Arc<dyn Relay>,
    clock: Arc<dyn Clock>,
    config: ReadinessConfig,
    phase: watch::Sender<PartyPhase>,
    countdown: Mutex<Option<CancellationToken>>,
    last_error: Mutex<Option<String>>,
}

impl std::fmt::Debug for ReadinessMachine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReadinessMachine")
            .field("room_id", self.session.room_id())
            .field("phase", &self.phase())
            .finish_non_exhaustive()
    }
}

impl Drop for ReadinessMachine {
    fn drop(&mut self) {
        self.cancel_countdown();
    }
}

impl ReadinessMachine {
    #[must_use]
    pub fn new(
        session: Arc<PartySession>,
        player: Player,
        relay: Arc<dyn Relay>,
        clock: Arc<dyn Clock>,
        config: ReadinessConfig,
    ) -> Self {
        let (phase, _) = watch::channel(PartyPhase::Initializing);
        Self {
            session,
            player,
            relay,
            clock,
            config,
            phase,
            countdown: Mutex::new(None),
            last_error: Mutex::new(None),
        }
    }

    #[must_use]
    pub fn phase(&self) -> PartyPhase {
        *self.phase.borrow()
    }

    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<PartyPhase> {
        self.phase.subscribe()
    }

    #[must_use]
    pub fn last_error(&self) -> Option<String> {
        self.last_error.lock().clone()
    }

    /// Whether everyone currently in the room is ready
    #[must_use]
    pub fn all_members_ready(&self) -> bool {
        self.session.with_room(Room::all_ready)
    }

    fn transition(&self, next: PartyPhase) -> Result<()> {
        let current = self.phase();
        if current == next {
            return Ok(());
        }
        if !current.can_transition_to(next) {
            return Err(Error::InvalidTransition { from: current.as_str(), to: next.as_str() });
        }
        self.phase.send_replace(next);
        info!(room_id = %self.session.room_id(), from = %current, to = %next, "Party phase changed");
        Ok(())
    }

    /// Enter `Error` with a human-readable reason
    pub fn fail(&self, reason: impl Into<String>) {
        let reason = reason.into();
        self.cancel_countdown();
        self.phase.send_replace(PartyPhase::Error);
        error!(room_id = %self.session.room_id(), %reason, "Watch party failed");
        *self.last_error.lock() = Some(reason);
    }

    /// Back to `Initializing`, cancelling any countdown and forgetting readiness
    pub fn reset(&self) {
        self.cancel_countdown();
        self.session.reset_for_stream();
        self.session.update_room(Room::reset_readiness);
        *self.last_error.lock() = None;
        let previous = self.phase.send_replace(PartyPhase::Initializing);
        info!(room_id = %self.session.room_id(), from = %previous, "Watch party reset");
    }

    /// Load `url`, wait until it is playable and announce readiness.
    pub async fn prepare_stream(&self, url: &str) -> Result<Readiness> {
        self.transition(PartyPhase::StreamPreparing)?;
        self.cancel_countdown();
        self.session.reset_for_stream();
        let user_id = self.session.user_id().clone();
        self.session.update_room(|room| room.unmark_ready(&user_id));

        // Held paused until the start signal arrives
        if let Err(e) = self.player.load_file_paused(url).await {
            self.fail(format!("failed to load stream: {e}"));
            return Err(e);
        }

        let readiness = match wait_for_duration(
            &self.player,
            self.config.duration_retry(),
            Duration::from_millis(self.config.duration_request_timeout_ms),
        )
        .await
        {
            Ok(readiness) => readiness,
            Err(e) => {
                self.fail(format!("player lost while preparing stream: {e}"));
                return Err(e);
            }
        };

        match readiness {
            Readiness::Ready { duration_seconds } => {
                self.transition(PartyPhase::ReadyWaiting)?;
                info!(room_id = %self.session.room_id(), duration_seconds, "Stream ready");
                self.announce_ready().await?;
                Ok(readiness)
            }
            Readiness::TimedOut { attempts } => {
                let err = Error::StreamNotReady { attempts };
                self.fail(err.to_string());
                Err(err)
            }
        }
    }

    async fn announce_ready(&self) -> Result<()> {
        let user_id = self.session.user_id().clone();
        self.session.update_room(|room| room.mark_ready(&user_id));

        self.relay
            .publish(
                self.session.room_id(),
                PartyMessage::MemberReady {
                    user_id,
                    username: self.session.username().to_string(),
                    prepared: true,
                    timestamp: self.clock.now_ms(),
                },
            )
            .await?;

        self.evaluate_gate()
    }

    /// Announce our presence so the host adds us and sends the roster
    pub async fn announce_join(&self) -> Result<()> {
        self.relay
            .publish(
                self.session.room_id(),
                PartyMessage::MemberJoined {
                    user_id: self.session.user_id().clone(),
                    username: self.session.username().to_string(),
                },
            )
            .await
    }

    async fn publish_roster(&self) -> Result<()> {
        if !self.session.is_host() {
            return Ok(());
        }
        let (owner_id, members) = self.session.with_room(|room| (room.owner_id.clone(), room.members.clone()));
        self.relay
            .publish(self.session.room_id(), PartyMessage::Roster { owner_id, members })
            .await
    }

    /// Host only: make the room match an externally known member list. The
    /// host itself is never removed.
    pub async fn sync_members(&self, members: &[(UserId, String)]) -> Result<()> {
        if !self.session.is_host() {
            return Err(Error::InvalidInput("only the host maintains the member list".to_string()));
        }

        let local = self.session.user_id().clone();
        let (added, removed) = self.session.update_room(|room| {
            let stale: Vec<UserId> = room
                .members
                .iter()
                .map(|m| m.user_id.clone())
                .filter(|id| id != &local && !members.iter().any(|(user_id, _)| user_id == id))
                .collect();
            for user_id in &stale {
                room.remove_member(user_id);
            }
            let added = members
                .iter()
                .filter(|(user_id, username)| room.add_member(user_id.clone(), username.clone()))
                .count();
            (added, stale.len())
        });

        if added + removed > 0 {
            info!(room_id = %self.session.room_id(), added, removed, "Member list updated");
            self.publish_roster().await?;
            self.on_membership_change()?;
        }
        Ok(())
    }

    /// Start the countdown if this client hosts and everyone is ready
    fn evaluate_gate(&self) -> Result<()> {
        if !self.session.is_host() || self.phase() != PartyPhase::ReadyWaiting {
            return Ok(());
        }
        let (ready, total) = self.session.with_room(|room| (room.ready_count(), room.total_members()));
        debug!(room_id = %self.session.room_id(), ready, total, "Readiness gate");
        if total > 0 && ready == total {
            self.start_countdown()?;
        }
        Ok(())
    }

    /// Membership changed: a countdown only survives if the gate still holds
    fn on_membership_change(&self) -> Result<()> {
        if self.phase() == PartyPhase::Countdown && self.session.is_host() && !self.all_members_ready() {
            self.cancel_countdown();
            self.transition(PartyPhase::ReadyWaiting)?;
            let (ready, total) = self.session.with_room(|room| (room.ready_count(), room.total_members()));
            warn!(
                room_id = %self.session.room_id(),
                error = %Error::PartialMembership(format!("{ready}/{total} members ready")),
                "Countdown aborted"
            );
        }
        self.evaluate_gate()
    }

    fn start_countdown(&self) -> Result<()> {
        self.transition(PartyPhase::Countdown)?;

        let token = CancellationToken::new();
        if let Some(previous) = self.countdown.lock().replace(token.clone()) {
            previous.cancel();
        }

        let relay = self.relay.clone();
        let room_id = self.session.room_id().clone();
        let sender_id = self.session.user_id().clone();
        let seconds = self.config.countdown_seconds;
        let tick = self.config.countdown_tick();

        info!(room_id = %room_id, seconds, "Starting countdown");
        tokio::spawn(async move {
            for remaining in (1..=seconds).rev() {
                if token.is_cancelled() {
                    return;
                }
                let message = PartyMessage::Countdown { countdown: remaining, sender_id: sender_id.clone() };
                if let Err(e) = relay.publish(&room_id, message).await {
                    warn!(room_id = %room_id, remaining, error = %e, "Failed to publish countdown tick");
                }
                tokio::select! {
                    () = token.cancelled() => return,
                    () = tokio::time::sleep(tick) => {}
                }
            }

            if token.is_cancelled() {
                return;
            }
            match relay.publish(&room_id, PartyMessage::StartPlayback { sender_id }).await {
                Ok(()) => info!(room_id = %room_id, "Start signal sent"),
                Err(e) => warn!(room_id = %room_id, error = %e, "Failed to publish start signal"),
            }
        });
        Ok(())
    }

    fn cancel_countdown(&self) {
        if let Some(token) = self.countdown.lock().take() {
            token.cancel();
        }
    }

    fn is_from_owner(&self, sender_id: &UserId) -> bool {
        self.session.with_room(|room| room.is_owner(sender_id))
    }

    fn host_changed(&self, new_owner: &UserId) -> Option<ReadinessSignal> {
        let is_local = new_owner == self.session.user_id();
        let was_host = self.session.is_host();
        self.session.set_host(is_local);

        // Whoever was counting down is no longer the authority
        if self.phase() == PartyPhase::Countdown {
            self.cancel_countdown();
            if let Err(e) = self.transition(PartyPhase::ReadyWaiting) {
                debug!(error = %e, "Could not leave countdown after owner change");
            }
        }

        (was_host != is_local).then_some(ReadinessSignal::HostChanged { is_local })
    }

    /// React to a readiness or membership message from the relay
    pub async fn handle_message(&self, message: &PartyMessage) -> Result<Option<ReadinessSignal>> {
        match message {
            PartyMessage::MemberReady { user_id, username, prepared, .. } => {
                if !prepared {
                    return Ok(None);
                }
                let is_host = self.session.is_host();
                let changed = self.session.update_room(|room| {
                    // A ready member is evidently present
                    let joined = is_host && room.add_member(user_id.clone(), username.clone());
                    room.mark_ready(user_id) || joined
                });
                if changed {
                    debug!(room_id = %self.session.room_id(), user_id = %user_id, "Member ready");
                    self.publish_roster().await?;
                }
                self.evaluate_gate()?;
                Ok(None)
            }

            PartyMessage::MemberJoined { user_id, username } => {
                if !self.session.is_host() {
                    return Ok(None);
                }
                let joined = self.session.update_room(|room| room.add_member(user_id.clone(), username.clone()));
                if joined {
                    info!(room_id = %self.session.room_id(), user_id = %user_id, "Member joined");
                }
                // Sent even for a rejoin so the newcomer learns the room
                self.publish_roster().await?;
                self.on_membership_change()?;
                Ok(None)
            }

            PartyMessage::MemberLeft { user_id } => {
                let departure = self.session.update_room(|room| room.remove_member(user_id));
                info!(room_id = %self.session.room_id(), user_id = %user_id, ?departure, "Member left");
                match departure {
                    Departure::OwnerReplaced { new_owner } => {
                        let signal = self.host_changed(&new_owner);
                        self.publish_roster().await?;
                        self.evaluate_gate()?;
                        Ok(signal)
                    }
                    Departure::Member => {
                        self.publish_roster().await?;
                        self.on_membership_change()?;
                        Ok(None)
                    }
                    Departure::Unknown | Departure::RoomEmptied => Ok(None),
                }
            }

            PartyMessage::OwnershipTransferred { new_owner } => {
                if let Err(e) = self.session.update_room(|room| room.transfer_ownership(new_owner)) {
                    warn!(new_owner = %new_owner, error = %e, "Ignoring ownership transfer");
                    return Ok(None);
                }
                let signal = self.host_changed(new_owner);
                self.evaluate_gate()?;
                Ok(signal)
            }

            PartyMessage::Roster { owner_id, members } => {
                if self.session.is_host() && owner_id == self.session.user_id() {
                    return Ok(None);
                }
                self.session.update_room(|room| room.apply_roster(owner_id.clone(), members.clone()));
                let is_local = owner_id == self.session.user_id();
                if is_local != self.session.is_host() {
                    return Ok(self.host_changed(owner_id));
                }
                // The host aborts its countdown when someone unready joins
                if self.phase() == PartyPhase::Countdown && !self.all_members_ready() {
                    self.transition(PartyPhase::ReadyWaiting)?;
                }
                Ok(None)
            }

            PartyMessage::Countdown { countdown, sender_id } => {
                if !self.is_from_owner(sender_id) {
                    warn!(sender_id = %sender_id, "Ignoring countdown from non-owner");
                    return Ok(None);
                }
                // The host's own phase follows its countdown task, not the echo
                if !self.session.is_host() && self.phase() == PartyPhase::ReadyWaiting {
                    self.transition(PartyPhase::Countdown)?;
                }
                debug!(room_id = %self.session.room_id(), remaining = countdown, "Countdown tick");
                Ok(None)
            }

            PartyMessage::StartPlayback { sender_id } => {
                if !self.is_from_owner(sender_id) {
                    warn!(sender_id = %sender_id, "Ignoring start signal from non-owner");
                    return Ok(None);
                }
                let phase = self.phase();
                if !phase.can_transition_to(PartyPhase::Playing) {
                    warn!(room_id = %self.session.room_id(), phase = %phase, "Start signal before stream was ready");
                    return Ok(None);
                }
                self.cancel_countdown();
                self.transition(PartyPhase::Playing)?;
                Ok(Some(ReadinessSignal::Start))
            }

            PartyMessage::PartySyncData(_) | PartyMessage::ManualSyncRequest { .. } => Ok(None),
        }
    }
}
