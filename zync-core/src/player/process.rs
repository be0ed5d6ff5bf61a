//! Idle player process lifecycle
//!
//! The player is kept running in idle mode with no window so that loading a
//! stream is instant. Hiding it means killing the process and starting a
//! fresh idle one once the old control socket is gone.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::control::Player;
use crate::config::{PlayerConfig, RetryPolicy};
use crate::{Error, Result};

/// Something that can put the local player back into idle after a session
#[async_trait]
pub trait PlayerSupervisor: Send + Sync {
    /// Restart the player idle and return a connection to the new instance
    async fn restart_idle(&self) -> Result<Player>;
}

/// Owns the child process of an idle player
#[derive(Debug)]
pub struct PlayerProcess {
    config: PlayerConfig,
    child: Option<Child>,
}

impl PlayerProcess {
    #[must_use]
    pub const fn new(config: PlayerConfig) -> Self {
        Self { config, child: None }
    }

    #[must_use]
    pub fn socket_path(&self) -> &Path {
        Path::new(&self.config.socket_path)
    }

    /// Command-line arguments for an idle, windowless player
    #[must_use]
    pub fn idle_args(config: &PlayerConfig) -> Vec<String> {
        vec![
            "--idle".to_string(),
            "--force-window=no".to_string(),
            "--no-video".to_string(),
            format!("--title={}", config.window_title),
            "--no-terminal".to_string(),
            "--hwdec=auto".to_string(),
            "--no-border".to_string(),
            "--no-osc".to_string(),
            "--no-osd-bar".to_string(),
            "--osd-level=0".to_string(),
            "--cursor-autohide=no".to_string(),
            format!("--input-ipc-server={}", config.socket_path),
        ]
    }

    /// Start the idle player. A previous process must be gone first, and its
    /// socket file removed, or the new instance would race the old one.
    pub async fn spawn(&mut self) -> Result<()> {
        if self.is_alive() {
            return Err(Error::Internal("player process already running".to_string()));
        }

        let retry = self.config.connect_retry();
        wait_for_socket_removal(self.socket_path(), retry).await?;

        let child = Command::new(&self.config.binary_path)
            .args(Self::idle_args(&self.config))
            .kill_on_drop(true)
            .spawn()?;

        info!(
            pid = child.id(),
            binary = %self.config.binary_path,
            socket = %self.config.socket_path,
            "Spawned idle player"
        );
        self.child = Some(child);
        Ok(())
    }

    pub fn is_alive(&mut self) -> bool {
        match self.child.as_mut() {
            Some(child) => matches!(child.try_wait(), Ok(None)),
            None => false,
        }
    }

    /// Kill the player and reap it. Not running is not an error.
    pub async fn kill(&mut self) -> Result<()> {
        let Some(mut child) = self.child.take() else {
            return Ok(());
        };

        let pid = child.id();
        if let Err(e) = child.kill().await {
            warn!(pid, error = %e, "Failed to kill player process");
            return Err(e.into());
        }
        info!(pid, "Player process stopped");
        Ok(())
    }

    /// Kill, wait the configured delay, then start a fresh idle instance
    pub async fn restart_idle(&mut self) -> Result<()> {
        self.kill().await?;
        tokio::time::sleep(Duration::from_millis(self.config.idle_restart_delay_ms)).await;
        self.spawn().await
    }
}

/// A player process this client spawned and reconnects to after restarts
#[derive(Debug)]
pub struct ManagedPlayer {
    process: Mutex<PlayerProcess>,
    config: PlayerConfig,
}

#[cfg(unix)]
impl ManagedPlayer {
    /// Spawn an idle player and connect to its control socket
    pub async fn launch(config: PlayerConfig) -> Result<(Arc<Self>, Player)> {
        let mut process = PlayerProcess::new(config.clone());
        process.spawn().await?;
        let managed = Arc::new(Self { process: Mutex::new(process), config });
        let player = managed.connect().await?;
        Ok((managed, player))
    }

    async fn connect(&self) -> Result<Player> {
        let channel = super::PlayerChannel::connect(
            &self.config.socket_path,
            self.config.connect_retry(),
            self.config.request_timeout(),
        )
        .await?;
        let player = Player::new(Arc::new(channel));
        let pid = player.ping().await?;
        debug!(pid, "Player answered ping");
        Ok(player)
    }

    pub async fn shutdown(&self) -> Result<()> {
        self.process.lock().await.kill().await
    }
}

#[cfg(unix)]
#[async_trait]
impl PlayerSupervisor for ManagedPlayer {
    async fn restart_idle(&self) -> Result<Player> {
        self.process.lock().await.restart_idle().await?;
        self.connect().await
    }
}

/// Poll until `path` no longer exists
pub async fn wait_for_socket_removal(path: impl AsRef<Path>, retry: RetryPolicy) -> Result<()> {
    let path: PathBuf = path.as_ref().to_path_buf();

    for attempt in 1..=retry.max_attempts {
        if !tokio::fs::try_exists(&path).await.unwrap_or(false) {
            return Ok(());
        }
        debug!(path = %path.display(), attempt, "Waiting for stale player socket to disappear");
        tokio::time::sleep(retry.interval).await;
    }

    // A leftover file from a crashed player blocks nothing once it is removed
    match tokio::fs::remove_file(&path).await {
        Ok(()) => {
            warn!(path = %path.display(), "Removed stale player socket");
            Ok(())
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(Error::ChannelUnavailable(format!(
            "stale socket {} could not be removed: {e}",
            path.display()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_idle_args_point_at_socket() {
        let config = PlayerConfig {
            socket_path: "/tmp/zync-test.sock".to_string(),
            window_title: "ZYNC".to_string(),
            ..PlayerConfig::default()
        };
        let args = PlayerProcess::idle_args(&config);

        assert_eq!(args[0], "--idle");
        assert!(args.contains(&"--force-window=no".to_string()));
        assert!(args.contains(&"--title=ZYNC".to_string()));
        assert_eq!(args.last().unwrap(), "--input-ipc-server=/tmp/zync-test.sock");
    }

    #[tokio::test]
    async fn test_kill_without_child_is_noop() {
        let mut process = PlayerProcess::new(PlayerConfig::default());
        assert!(!process.is_alive());
        process.kill().await.unwrap();
    }

    #[tokio::test]
    async fn test_missing_socket_needs_no_wait() {
        let dir = tempfile::tempdir().unwrap();
        let retry = RetryPolicy { interval: Duration::from_millis(1), max_attempts: 1 };
        wait_for_socket_removal(dir.path().join("absent"), retry).await.unwrap();
    }

    #[tokio::test]
    async fn test_stale_socket_is_removed_after_budget() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stale.sock");
        std::fs::write(&path, b"").unwrap();

        let retry = RetryPolicy { interval: Duration::from_millis(1), max_attempts: 3 };
        wait_for_socket_removal(&path, retry).await.unwrap();
        assert!(!path.exists());
    }
}
