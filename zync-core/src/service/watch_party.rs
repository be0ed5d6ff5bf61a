//! Watch party service
//!
//! The control surface the rest of the application drives: join a room,
//! prepare the stream, start and stop party sync, and tear everything down
//! again. One [`WatchParty`] exists per local player.

use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::models::{PartyMessage, PartyPhase, RoomId, SyncPayload, SyncStatus, UserId};
use crate::party::{
    ApplyOutcome, Clock, HostPublisher, PartySession, ReadinessMachine, ReadinessSignal, Relay,
    RelayReceiver, SyncApplier, SystemClock,
};
use crate::player::{Player, PlayerSupervisor};
use crate::streaming::StreamingClient;
use crate::{Error, Result};

/// Reply to `prepare_stream`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PrepareOutcome {
    pub success: bool,
    pub ready: bool,
}

/// Media currently loaded in the player
#[derive(Debug, Clone, PartialEq)]
pub struct MediaInfo {
    pub info_hash: String,
    pub file_idx: u32,
    pub metadata: Option<Value>,
}

/// Everything that lives exactly as long as one room session
struct PartyRuntime {
    session: Arc<PartySession>,
    readiness: ReadinessMachine,
    host: HostPublisher,
    applier: SyncApplier,
    player: Player,
    listener: CancellationToken,
}

impl PartyRuntime {
    async fn start_sync(&self) -> Result<()> {
        self.session.set_active(true);
        if self.session.is_host() {
            self.host.start().await?;
        }
        info!(
            room_id = %self.session.room_id(),
            is_host = self.session.is_host(),
            "Party sync started"
        );
        Ok(())
    }

    async fn stop_sync(&self) {
        self.host.stop().await;
        self.session.set_active(false);
        info!(room_id = %self.session.room_id(), "Party sync stopped");
    }

    async fn begin_playback(&self) -> Result<()> {
        self.player.set_playing(true).await?;
        self.start_sync().await
    }

    async fn on_message(&self, message: PartyMessage) -> Result<()> {
        match message {
            PartyMessage::PartySyncData(payload) => {
                let event = payload.into_event(self.session.user_id())?;
                if !self.session.status().is_active {
                    debug!(kind = %event.kind, "Party sync inactive, ignoring sync event");
                    return Ok(());
                }
                if self.session.is_host() && !event.is_own_event {
                    debug!(sender_id = %event.sender_id, "Host ignores sync events from others");
                    return Ok(());
                }
                // Failures are recorded on the session; the loop keeps listening
                let _ = self.applier.apply(&event).await;
                Ok(())
            }
            PartyMessage::ManualSyncRequest { requester } => {
                if self.session.is_host() && self.session.status().is_active {
                    debug!(requester = %requester, "Publishing snapshot on request");
                    self.host.publish_snapshot().await?;
                }
                Ok(())
            }
            other => match self.readiness.handle_message(&other).await? {
                Some(ReadinessSignal::Start) => self.begin_playback().await,
                Some(ReadinessSignal::HostChanged { is_local }) => {
                    if self.session.status().is_active {
                        if is_local {
                            self.host.start().await?;
                        } else {
                            self.host.stop().await;
                        }
                    }
                    Ok(())
                }
                None => Ok(()),
            },
        }
    }

    /// The player process is gone and the loaded stream with it
    async fn on_player_lost(&self) {
        warn!(room_id = %self.session.room_id(), "Player connection lost");
        self.stop_sync().await;
        self.readiness
            .fail(Error::ChannelUnavailable("player connection lost".to_string()).to_string());
    }

    async fn listen(self: Arc<Self>, mut inbox: RelayReceiver) {
        let player_closed = self.player.closed();
        let mut player_lost = false;
        loop {
            let message = tokio::select! {
                biased;
                () = self.listener.cancelled() => break,
                () = player_closed.cancelled(), if !player_lost => {
                    player_lost = true;
                    self.on_player_lost().await;
                    continue;
                }
                message = inbox.recv() => message,
            };
            let Some(message) = message else {
                warn!(room_id = %self.session.room_id(), "Relay subscription closed");
                break;
            };

            let message_type = message.message_type();
            if let Err(e) = self.on_message(message).await {
                warn!(room_id = %self.session.room_id(), message_type, error = %e, "Failed to handle relay message");
            }
        }
    }
}

/// Watch party control surface for one local player
pub struct WatchParty {
    user_id: UserId,
    username: String,
    config: Config,
    player: RwLock<Player>,
    supervisor: Option<Arc<dyn PlayerSupervisor>>,
    relay: Arc<dyn Relay>,
    clock: Arc<dyn Clock>,
    streaming: StreamingClient,
    party: Mutex<Option<Arc<PartyRuntime>>>,
    media: Mutex<Option<MediaInfo>>,
}

impl std::fmt::Debug for WatchParty {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WatchParty")
            .field("user_id", &self.user_id)
            .field("phase", &self.phase())
            .finish_non_exhaustive()
    }
}

impl WatchParty {
    pub fn new(user_id: UserId, username: String, config: Config, player: Player, relay: Arc<dyn Relay>) -> Result<Self> {
        let streaming = StreamingClient::new(&config.streaming)?;
        Ok(Self {
            user_id,
            username,
            config,
            player: RwLock::new(player),
            supervisor: None,
            relay,
            clock: Arc::new(SystemClock),
            streaming,
            party: Mutex::new(None),
            media: Mutex::new(None),
        })
    }

    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Restart the player through `supervisor` when a session ends
    #[must_use]
    pub fn with_supervisor(mut self, supervisor: Arc<dyn PlayerSupervisor>) -> Self {
        self.supervisor = Some(supervisor);
        self
    }

    #[must_use]
    pub fn user_id(&self) -> &UserId {
        &self.user_id
    }

    /// Current player handle, for direct controls
    #[must_use]
    pub fn player(&self) -> Player {
        self.player.read().clone()
    }

    fn runtime(&self) -> Result<Arc<PartyRuntime>> {
        self.party
            .lock()
            .clone()
            .ok_or_else(|| Error::NotFound("no watch party initialized".to_string()))
    }

    /// Join `room_id` and start listening to the relay. Any previous party
    /// is left first.
    pub async fn init_watch_party(&self, room_id: RoomId, is_host: bool) -> Result<()> {
        let previous = self.party.lock().take();
        if let Some(previous) = previous {
            self.leave(&previous).await;
        }

        let player = self.player();
        let session = Arc::new(PartySession::new(
            room_id.clone(),
            self.user_id.clone(),
            self.username.clone(),
            is_host,
        ));
        let runtime = Arc::new(PartyRuntime {
            readiness: ReadinessMachine::new(
                session.clone(),
                player.clone(),
                self.relay.clone(),
                self.clock.clone(),
                self.config.readiness.clone(),
            ),
            host: HostPublisher::new(
                session.clone(),
                player.clone(),
                self.relay.clone(),
                self.clock.clone(),
                self.config.sync.clone(),
            ),
            applier: SyncApplier::new(session.clone(), player.clone(), self.clock.clone(), self.config.sync.clone()),
            session,
            player,
            listener: CancellationToken::new(),
        });

        let inbox = self.relay.subscribe(&room_id, &self.user_id).await?;
        tokio::spawn(runtime.clone().listen(inbox));
        *self.party.lock() = Some(runtime.clone());

        if !is_host {
            runtime.readiness.announce_join().await?;
        }
        info!(room_id = %room_id, user_id = %self.user_id, is_host, "Watch party initialized");
        Ok(())
    }

    /// Load the stream and wait until it can play. Preparation failures are
    /// reported in the outcome; the phase moves to `Error`.
    pub async fn prepare_stream(
        &self,
        url: &str,
        info_hash: &str,
        file_idx: u32,
        metadata: Option<Value>,
    ) -> Result<PrepareOutcome> {
        let runtime = self.runtime()?;
        *self.media.lock() = Some(MediaInfo {
            info_hash: info_hash.to_string(),
            file_idx,
            metadata,
        });

        match runtime.readiness.prepare_stream(url).await {
            Ok(readiness) => Ok(PrepareOutcome { success: true, ready: readiness.is_ready() }),
            Err(e) => {
                warn!(info_hash, file_idx, error = %e, "Stream preparation failed");
                Ok(PrepareOutcome { success: false, ready: false })
            }
        }
    }

    /// Begin publishing (host) or applying (member) sync events
    pub async fn start_party_sync(&self, room_id: RoomId, is_host: bool) -> Result<()> {
        let current = self.party.lock().clone();
        let runtime = match current {
            Some(runtime) if runtime.session.room_id() == &room_id => runtime,
            _ => {
                self.init_watch_party(room_id, is_host).await?;
                self.runtime()?
            }
        };
        runtime.start_sync().await
    }

    /// Stop publishing and applying. The relay subscription stays open.
    pub async fn stop_party_sync(&self) -> Result<()> {
        let current = self.party.lock().clone();
        if let Some(runtime) = current {
            runtime.stop_sync().await;
        }
        Ok(())
    }

    /// Apply a sync payload received out of band
    pub async fn apply_sync_update(&self, payload: SyncPayload) -> Result<ApplyOutcome> {
        let runtime = self.runtime()?;
        let event = payload.into_event(&self.user_id)?;
        runtime.applier.apply(&event).await
    }

    /// Host: publish the current state now. Member: ask the host for it and
    /// re-apply the last known host state meanwhile.
    pub async fn trigger_manual_sync(&self) -> Result<()> {
        let runtime = self.runtime()?;
        if runtime.session.is_host() {
            return runtime.host.publish_snapshot().await;
        }

        self.relay
            .publish(
                runtime.session.room_id(),
                PartyMessage::ManualSyncRequest { requester: self.user_id.clone() },
            )
            .await?;
        match runtime.applier.resync().await {
            Ok(_) | Err(Error::NotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    #[must_use]
    pub fn all_members_ready(&self) -> bool {
        self.party
            .lock()
            .as_ref()
            .is_some_and(|runtime| runtime.readiness.all_members_ready())
    }

    #[must_use]
    pub fn phase(&self) -> PartyPhase {
        self.party
            .lock()
            .as_ref()
            .map_or(PartyPhase::Initializing, |runtime| runtime.readiness.phase())
    }

    pub fn subscribe_phase(&self) -> Result<watch::Receiver<PartyPhase>> {
        Ok(self.runtime()?.readiness.subscribe())
    }

    #[must_use]
    pub fn get_sync_status(&self) -> SyncStatus {
        self.party
            .lock()
            .as_ref()
            .map(|runtime| runtime.session.status())
            .unwrap_or_default()
    }

    /// Host: replace the room's member list with an externally known one
    pub async fn update_party_members(&self, members: &[(UserId, String)]) -> Result<()> {
        self.runtime()?.readiness.sync_members(members).await
    }

    /// Leave the party and return the player to idle
    pub async fn reset_watch_party(&self) -> Result<()> {
        let current = self.party.lock().take();
        if let Some(runtime) = current {
            self.leave(&runtime).await;
        }
        self.exit_playback().await
    }

    /// Play a stream without any party gating
    pub async fn play_solo(&self, url: &str, info_hash: &str, file_idx: u32) -> Result<()> {
        if self.get_sync_status().is_active {
            return Err(Error::InvalidInput("leave the watch party before playing solo".to_string()));
        }
        *self.media.lock() = Some(MediaInfo {
            info_hash: info_hash.to_string(),
            file_idx,
            metadata: None,
        });
        let player = self.player();
        player.load_file(url).await?;
        player.set_playing(true).await?;
        info!(info_hash, file_idx, "Solo playback started");
        Ok(())
    }

    /// Drop the backing media and put the player back into idle
    pub async fn exit_playback(&self) -> Result<()> {
        let media = self.media.lock().take();
        if let Some(media) = media.filter(|m| !m.info_hash.is_empty()) {
            self.streaming.remove_media_in_background(media.info_hash);
        }

        match &self.supervisor {
            Some(supervisor) => {
                let player = supervisor.restart_idle().await?;
                *self.player.write() = player;
                info!("Player restarted idle");
            }
            None => self.player().unload().await?,
        }
        Ok(())
    }

    /// Leave the party and release the media before the process exits. The
    /// player is left as is.
    pub async fn shutdown(&self) -> Result<()> {
        let current = self.party.lock().take();
        if let Some(runtime) = current {
            self.leave(&runtime).await;
        }
        let media = self.media.lock().take();
        if let Some(media) = media.filter(|m| !m.info_hash.is_empty()) {
            self.streaming.remove_media(&media.info_hash).await?;
        }
        Ok(())
    }

    async fn leave(&self, runtime: &PartyRuntime) {
        runtime.stop_sync().await;
        runtime.readiness.reset();

        let room_id = runtime.session.room_id();
        let left = PartyMessage::MemberLeft { user_id: self.user_id.clone() };
        if let Err(e) = self.relay.publish(room_id, left).await {
            warn!(room_id = %room_id, error = %e, "Failed to announce departure");
        }
        if let Err(e) = self.relay.unsubscribe(room_id, &self.user_id).await {
            warn!(room_id = %room_id, error = %e, "Failed to leave relay room");
        }
        runtime.listener.cancel();
        info!(room_id = %room_id, "Left watch party");
    }
}

impl Drop for WatchParty {
    fn drop(&mut self) {
        if let Some(runtime) = self.party.lock().take() {
            runtime.listener.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::models::SyncKind;
    use crate::party::ManualClock;
    use crate::player::PlayerEvent;
    use crate::test_helpers::{test_room_id, test_user_id, FakePlayer, LoopbackRelay};

    struct Client {
        player: Arc<FakePlayer>,
        party: WatchParty,
    }

    fn client(relay: &Arc<LoopbackRelay>, clock: &Arc<ManualClock>, user: &str) -> Client {
        let player = FakePlayer::shared();
        let party = WatchParty::new(
            test_user_id(user),
            user.to_string(),
            Config::default(),
            Player::new(player.clone()),
            relay.clone(),
        )
        .unwrap()
        .with_clock(clock.clone());
        Client { player, party }
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_prepare_requires_party() {
        let relay = LoopbackRelay::shared();
        let clock = Arc::new(ManualClock::new(1000));
        let c = client(&relay, &clock, "solo");

        let result = c.party.prepare_stream("http://stream/1", "abc", 0, None).await;
        assert!(matches!(result, Err(Error::NotFound(_))));
        assert_eq!(c.party.phase(), PartyPhase::Initializing);
        assert_eq!(c.party.get_sync_status(), SyncStatus::default());
    }

    #[tokio::test(start_paused = true)]
    async fn test_prepare_failure_reported_in_outcome() {
        let relay = LoopbackRelay::shared();
        let clock = Arc::new(ManualClock::new(1000));
        let c = client(&relay, &clock, "guest");
        c.party.init_watch_party(test_room_id("room1"), false).await.unwrap();

        let outcome = c.party.prepare_stream("http://stream/1", "abc", 0, None).await.unwrap();

        assert_eq!(outcome, PrepareOutcome { success: false, ready: false });
        assert_eq!(c.party.phase(), PartyPhase::Error);
        assert_eq!(relay.of_type("member_joined").len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_party_flow() {
        let relay = LoopbackRelay::shared();
        let clock = Arc::new(ManualClock::new(1_000_000));
        let host = client(&relay, &clock, "host");
        let guest = client(&relay, &clock, "guest");
        let room = test_room_id("room1");

        host.party.init_watch_party(room.clone(), true).await.unwrap();
        guest.party.init_watch_party(room.clone(), false).await.unwrap();
        settle().await;

        guest.player.ready_after(1, 3600.0);
        host.player.ready_after(1, 3600.0);
        let outcome = guest.party.prepare_stream("http://stream/1", "abc", 0, None).await.unwrap();
        assert_eq!(outcome, PrepareOutcome { success: true, ready: true });
        settle().await;
        host.party.prepare_stream("http://stream/1", "abc", 0, None).await.unwrap();
        settle().await;

        assert!(host.party.all_members_ready());
        assert_eq!(host.party.phase(), PartyPhase::Countdown);
        assert!(!host.player.is_playing());
        assert!(!guest.player.is_playing());

        tokio::time::sleep(Duration::from_secs(6)).await;

        assert_eq!(relay.of_type("watch_party_start").len(), 1);
        assert_eq!(host.party.phase(), PartyPhase::Playing);
        assert_eq!(guest.party.phase(), PartyPhase::Playing);
        assert!(host.player.is_playing());
        assert!(guest.player.is_playing());
        assert!(host.party.get_sync_status().is_active);
        assert!(host.party.get_sync_status().is_host);

        // Host seeks; the member follows with latency compensation
        host.player.set("time-pos", 600.0);
        host.player.emit(PlayerEvent::seek());
        clock.advance(200);
        tokio::time::sleep(Duration::from_millis(150)).await;

        assert!((guest.player.position() - 600.0).abs() < 1.0);
        assert!(guest.party.get_sync_status().is_in_sync);
        // The host never re-applies its own echo
        assert!(host.player.writes_to("time-pos").is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_player_loss_mid_session_fails_party() {
        let relay = LoopbackRelay::shared();
        let clock = Arc::new(ManualClock::new(1000));
        let host = client(&relay, &clock, "host");
        host.party.init_watch_party(test_room_id("room1"), true).await.unwrap();
        host.player.ready_after(1, 3600.0);
        host.party.prepare_stream("http://stream/1", "abc", 0, None).await.unwrap();
        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(host.party.phase(), PartyPhase::Playing);
        assert!(host.party.get_sync_status().is_active);

        host.player.disconnect();
        settle().await;

        assert_eq!(host.party.phase(), PartyPhase::Error);
        assert!(!host.party.get_sync_status().is_active);

        // No heartbeat keeps hammering the dead player
        relay.clear();
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(relay.sync_events().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_apply_sync_update_latency() {
        let relay = LoopbackRelay::shared();
        let clock = Arc::new(ManualClock::new(1300));
        let c = client(&relay, &clock, "guest");
        c.party.init_watch_party(test_room_id("room1"), false).await.unwrap();

        let payload = SyncPayload {
            timestamp: 120.0,
            playing: true,
            sync_time: 1000,
            kind: SyncKind::Seek,
            room_id: test_room_id("room1"),
            sender_id: test_user_id("host"),
            sender_username: "host".to_string(),
            is_own_event: None,
        };
        let outcome = c.party.apply_sync_update(payload).await.unwrap();

        assert_eq!(outcome, ApplyOutcome::Applied { repositioned: true });
        assert!((c.player.position() - 120.3).abs() < 1e-9);
        assert!(c.player.is_playing());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stopped_member_ignores_relay_sync() {
        let relay = LoopbackRelay::shared();
        let clock = Arc::new(ManualClock::new(5000));
        let c = client(&relay, &clock, "guest");
        let room = test_room_id("room1");
        c.party.start_party_sync(room.clone(), false).await.unwrap();
        c.party.stop_party_sync().await.unwrap();

        let payload = SyncPayload {
            timestamp: 50.0,
            playing: true,
            sync_time: 5000,
            kind: SyncKind::Seek,
            room_id: room.clone(),
            sender_id: test_user_id("host"),
            sender_username: "host".to_string(),
            is_own_event: None,
        };
        relay.publish(&room, PartyMessage::PartySyncData(payload)).await.unwrap();
        settle().await;

        assert!(c.player.writes_to("time-pos").is_empty());
        assert!(!c.party.get_sync_status().is_active);
    }

    #[tokio::test(start_paused = true)]
    async fn test_member_manual_sync_asks_host() {
        let relay = LoopbackRelay::shared();
        let clock = Arc::new(ManualClock::new(1000));
        let host = client(&relay, &clock, "host");
        let guest = client(&relay, &clock, "guest");
        let room = test_room_id("room1");
        host.party.start_party_sync(room.clone(), true).await.unwrap();
        guest.party.start_party_sync(room.clone(), false).await.unwrap();
        settle().await;
        host.player.set("time-pos", 33.0);
        relay.clear();

        guest.party.trigger_manual_sync().await.unwrap();
        settle().await;

        assert_eq!(relay.of_type("manual_sync_request").len(), 1);
        let events = relay.sync_events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, SyncKind::Seek);
        assert!((guest.player.position() - 33.0).abs() < f64::EPSILON);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_leaves_room_and_idles_player() {
        let relay = LoopbackRelay::shared();
        let clock = Arc::new(ManualClock::new(1000));
        let c = client(&relay, &clock, "guest");
        c.party.start_party_sync(test_room_id("room1"), false).await.unwrap();

        c.party.reset_watch_party().await.unwrap();

        assert_eq!(relay.of_type("member_left").len(), 1);
        assert!(c.player.commands().iter().any(|cmd| cmd.verb() == "stop"));
        assert_eq!(c.party.get_sync_status(), SyncStatus::default());
        assert!(matches!(c.party.trigger_manual_sync().await, Err(Error::NotFound(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_solo_refused_during_party_sync() {
        let relay = LoopbackRelay::shared();
        let clock = Arc::new(ManualClock::new(1000));
        let c = client(&relay, &clock, "guest");
        c.party.start_party_sync(test_room_id("room1"), false).await.unwrap();

        assert!(c.party.play_solo("http://stream/1", "abc", 0).await.is_err());

        c.party.reset_watch_party().await.unwrap();
        c.party.play_solo("http://stream/1", "abc", 0).await.unwrap();
        assert!(c.player.is_playing());
    }
}
