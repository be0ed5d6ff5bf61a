use config::{Config as ConfigBuilder, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub logging: LoggingConfig,
    pub player: PlayerConfig,
    pub sync: SyncConfig,
    pub readiness: ReadinessConfig,
    pub relay: RelayConfig,
    pub streaming: StreamingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String, // "json" or "pretty"
    pub file_path: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            file_path: None,
        }
    }
}

/// Local player process and control socket settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PlayerConfig {
    /// Path of the mpv IPC socket (unix socket path)
    pub socket_path: String,
    /// mpv executable
    pub binary_path: String,
    /// Window title given to the spawned player
    pub window_title: String,
    /// Spawn the player ourselves instead of attaching to a running one
    pub spawn: bool,
    pub connect_poll_interval_ms: u64,
    pub connect_timeout_ms: u64,
    pub request_timeout_ms: u64,
    /// Pause between killing the player and starting it again in idle mode
    pub idle_restart_delay_ms: u64,
}

impl Default for PlayerConfig {
    fn default() -> Self {
        Self {
            socket_path: "/tmp/mpvpipe".to_string(),
            binary_path: "mpv".to_string(),
            window_title: "ZYNC-MPV".to_string(),
            spawn: false,
            connect_poll_interval_ms: 100,
            connect_timeout_ms: 5_000,
            request_timeout_ms: 3_000,
            idle_restart_delay_ms: 1_000,
        }
    }
}

impl PlayerConfig {
    #[must_use]
    pub const fn connect_retry(&self) -> RetryPolicy {
        RetryPolicy::from_budget(self.connect_poll_interval_ms, self.connect_timeout_ms)
    }

    #[must_use]
    pub const fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

/// Party synchronization thresholds and timers
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub heartbeat_interval_ms: u64,
    /// Delay after a seek notification before the position is read back
    pub seek_settle_ms: u64,
    /// Host publishes a heartbeat only when its position moved this far from the last published one
    pub publish_drift_threshold_secs: f64,
    /// Member corrects its position on heartbeat only beyond this drift
    pub heartbeat_drift_threshold_secs: f64,
    /// Member corrects its position on play/pause only beyond this latency
    pub play_pause_latency_threshold_ms: i64,
    /// Skip heartbeats reporting position 0 while paused
    pub suppress_zero_heartbeat: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: 10_000,
            seek_settle_ms: 100,
            publish_drift_threshold_secs: 2.0,
            heartbeat_drift_threshold_secs: 3.0,
            play_pause_latency_threshold_ms: 1_000,
            suppress_zero_heartbeat: true,
        }
    }
}

impl SyncConfig {
    #[must_use]
    pub const fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    #[must_use]
    pub const fn seek_settle(&self) -> Duration {
        Duration::from_millis(self.seek_settle_ms)
    }
}

/// Readiness and countdown settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReadinessConfig {
    pub duration_poll_interval_ms: u64,
    pub duration_poll_attempts: u32,
    /// Per-poll request timeout; a silent player counts as "not ready yet"
    pub duration_request_timeout_ms: u64,
    pub countdown_seconds: u32,
    pub countdown_tick_ms: u64,
}

impl Default for ReadinessConfig {
    fn default() -> Self {
        Self {
            duration_poll_interval_ms: 200,
            duration_poll_attempts: 100,
            duration_request_timeout_ms: 500,
            countdown_seconds: 5,
            countdown_tick_ms: 1_000,
        }
    }
}

impl ReadinessConfig {
    #[must_use]
    pub const fn duration_retry(&self) -> RetryPolicy {
        RetryPolicy {
            interval: Duration::from_millis(self.duration_poll_interval_ms),
            max_attempts: self.duration_poll_attempts,
        }
    }

    #[must_use]
    pub const fn countdown_tick(&self) -> Duration {
        Duration::from_millis(self.countdown_tick_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Empty means in-process relay only
    pub redis_url: String,
    pub channel_prefix: String,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            redis_url: String::new(),
            channel_prefix: "zync:".to_string(),
        }
    }
}

/// Streaming backend collaborator (torrent-to-HTTP)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamingConfig {
    pub backend_url: String,
    pub request_timeout_seconds: u64,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            backend_url: "http://localhost:8888".to_string(),
            request_timeout_seconds: 5,
        }
    }
}

/// Bounded retry schedule: `max_attempts` tries spaced `interval` apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub interval: Duration,
    pub max_attempts: u32,
}

impl RetryPolicy {
    /// Build a policy that polls every `interval_ms` until `budget_ms` is spent.
    #[must_use]
    pub const fn from_budget(interval_ms: u64, budget_ms: u64) -> Self {
        let attempts = if interval_ms == 0 { 1 } else { budget_ms / interval_ms };
        Self {
            interval: Duration::from_millis(interval_ms),
            max_attempts: if attempts == 0 { 1 } else { attempts as u32 },
        }
    }
}

impl Config {
    /// Load configuration from multiple sources with priority:
    /// 1. Environment variables (highest priority)
    /// 2. Config file (if provided)
    /// 3. Defaults (lowest priority)
    pub fn load(config_file: Option<&str>) -> Result<Self, ConfigError> {
        let mut builder = ConfigBuilder::builder();

        if let Some(path) = config_file {
            if Path::new(path).exists() {
                builder = builder.add_source(File::with_name(path));
            }
        }

        // ZYNC_PLAYER__SOCKET_PATH, ZYNC_SYNC__HEARTBEAT_INTERVAL_MS, ...
        builder = builder.add_source(
            Environment::with_prefix("ZYNC")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder.build()?;
        config.try_deserialize()
    }

    /// Load from environment variables only
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::load(None)
    }

    /// Load from file path
    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        Self::load(Some(path))
    }

    /// Check for misconfigurations. Returns every problem found, not just the first.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.player.socket_path.is_empty() {
            errors.push("player.socket_path must not be empty".to_string());
        }
        if self.player.connect_poll_interval_ms == 0 {
            errors.push("player.connect_poll_interval_ms must be positive".to_string());
        }
        if !(2_000..=3_000).contains(&self.player.request_timeout_ms) {
            errors.push(format!(
                "player.request_timeout_ms must be within 2000..=3000, got {}",
                self.player.request_timeout_ms
            ));
        }
        if self.sync.heartbeat_interval_ms == 0 {
            errors.push("sync.heartbeat_interval_ms must be positive".to_string());
        }
        if self.sync.heartbeat_drift_threshold_secs < 0.0 || self.sync.publish_drift_threshold_secs < 0.0 {
            errors.push("sync drift thresholds must not be negative".to_string());
        }
        if self.readiness.duration_poll_attempts == 0 {
            errors.push("readiness.duration_poll_attempts must be positive".to_string());
        }
        if self.readiness.countdown_seconds == 0 {
            errors.push("readiness.countdown_seconds must be positive".to_string());
        }
        if !matches!(self.logging.format.as_str(), "json" | "pretty") {
            errors.push(format!("logging.format must be json or pretty, got {}", self.logging.format));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}
