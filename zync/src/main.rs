use anyhow::{Context, Result};
use clap::Parser;
use std::sync::Arc;
use tracing::{error, info, warn};

use zync_core::{
    logging,
    models::{RoomId, UserId},
    party::Relay,
    player::{ManagedPlayer, Player, PlayerChannel},
    service::WatchParty,
    Config,
};
use zync_relay::{RedisRelay, RoomHub};

/// Synchronized watch-party client for mpv
#[derive(Debug, Parser)]
#[command(name = "zync", version, about)]
struct Args {
    /// Configuration file (TOML, YAML or JSON)
    #[arg(short, long, env = "ZYNC_CONFIG")]
    config: Option<String>,

    /// Room to join; without it the stream plays solo
    #[arg(long, env = "ZYNC_ROOM")]
    room: Option<String>,

    #[arg(long, env = "ZYNC_USER_ID")]
    user_id: Option<String>,

    #[arg(long, env = "ZYNC_USERNAME", default_value = "guest")]
    username: String,

    /// Host the room instead of joining as a member
    #[arg(long)]
    host: bool,

    /// HTTP stream to play
    #[arg(long)]
    stream_url: Option<String>,

    /// Info hash of the torrent backing the stream
    #[arg(long, default_value = "")]
    info_hash: String,

    #[arg(long, default_value_t = 0)]
    file_idx: u32,

    /// Spawn an idle mpv instead of attaching to a running one
    #[arg(long)]
    spawn: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // 1. Load configuration
    let mut config = Config::load(args.config.as_deref()).context("Failed to load configuration")?;
    if args.spawn {
        config.player.spawn = true;
    }

    // 2. Validate (fail fast on misconfigurations)
    if let Err(errors) = config.validate() {
        for e in &errors {
            eprintln!("Config validation error: {e}");
        }
        return Err(anyhow::anyhow!(
            "Configuration validation failed with {} error(s)",
            errors.len()
        ));
    }

    // 3. Initialize logging
    logging::init_logging(&config.logging)?;
    info!("Zync starting...");

    // 4. Connect to the player
    let (managed, player) = if config.player.spawn {
        let (managed, player) = ManagedPlayer::launch(config.player.clone()).await?;
        (Some(managed), player)
    } else {
        let channel = PlayerChannel::connect(
            &config.player.socket_path,
            config.player.connect_retry(),
            config.player.request_timeout(),
        )
        .await?;
        (None, Player::new(Arc::new(channel)))
    };
    info!(socket = %config.player.socket_path, spawned = managed.is_some(), "Player connected");

    // 5. Initialize the relay
    let hub = RoomHub::new();
    let redis = if config.relay.redis_url.is_empty() {
        info!("Redis not configured, using in-process relay");
        None
    } else {
        Some(RedisRelay::start(&config.relay, hub.clone())?)
    };
    let relay: Arc<dyn Relay> = match &redis {
        Some(redis) => redis.clone() as Arc<dyn Relay>,
        None => Arc::new(hub) as Arc<dyn Relay>,
    };

    // 6. Build the watch party service
    let user_id = args.user_id.map_or_else(UserId::new, UserId::from_string);
    let mut party = WatchParty::new(user_id, args.username.clone(), config.clone(), player, relay)?;
    if let Some(managed) = &managed {
        party = party.with_supervisor(managed.clone());
    }
    let party = Arc::new(party);

    // 7. Join and prepare, or play solo
    match (args.room, args.stream_url) {
        (Some(room), stream_url) => {
            party.init_watch_party(RoomId::from_string(room), args.host).await?;

            let mut phases = party.subscribe_phase()?;
            tokio::spawn(async move {
                while phases.changed().await.is_ok() {
                    let phase = *phases.borrow_and_update();
                    info!(phase = %phase, "Watch party phase");
                }
            });

            if let Some(url) = stream_url {
                let outcome = party.prepare_stream(&url, &args.info_hash, args.file_idx, None).await?;
                info!(?outcome, "Stream prepared");
            }
        }
        (None, Some(url)) => party.play_solo(&url, &args.info_hash, args.file_idx).await?,
        (None, None) => warn!("Neither a room nor a stream was given; waiting idle"),
    }

    // 8. Wait for shutdown
    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    if let Err(e) = party.shutdown().await {
        error!("Failed to leave watch party: {}", e);
    }
    if let Some(redis) = &redis {
        redis.shutdown();
    }
    if let Some(managed) = &managed {
        if let Err(e) = managed.shutdown().await {
            warn!("Failed to stop player: {}", e);
        }
    }

    info!("Zync stopped");
    Ok(())
}
