//! Player Control Channel
//!
//! One connection per player process, shared by every consumer through a
//! single request-correlation table. A background reader task splits the
//! socket into lines, resolves pending requests by `request_id` and fans out
//! events to subscribers.

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite, ReadHalf, WriteHalf};
use tokio::sync::{broadcast, oneshot, Mutex};
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, info, warn};

use super::control::PlayerControl;
use super::protocol::{Command, Frame, PlayerCodec, PlayerEvent, PlayerMessage, Response};
use crate::config::RetryPolicy;
use crate::{Error, Result};

/// Capacity of the event fan-out; slow subscribers lag rather than block the reader
const EVENT_CHANNEL_CAPACITY: usize = 256;

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Outstanding request awaiting its reply
struct PendingRequest {
    resolver: oneshot::Sender<Result<Value>>,
    created_at: Instant,
    verb: String,
}

struct ChannelInner {
    writer: Mutex<FramedWrite<BoxedWriter, PlayerCodec>>,
    pending: DashMap<u64, PendingRequest>,
    next_request_id: AtomicU64,
    next_observer_id: AtomicU64,
    events: broadcast::Sender<PlayerEvent>,
    closed: CancellationToken,
    request_timeout: Duration,
}

impl ChannelInner {
    /// Resolve the pending entry for a reply. Removing the entry is what
    /// claims it, so a reply racing a timeout resolves at most once.
    fn resolve(&self, response: Response) {
        match self.pending.remove(&response.request_id) {
            Some((request_id, pending)) => {
                debug!(
                    request_id,
                    verb = %pending.verb,
                    elapsed_ms = pending.created_at.elapsed().as_millis() as u64,
                    "Player reply received"
                );
                let _ = pending.resolver.send(response.into_result());
            }
            None if response.request_id == 0 => {
                if !response.is_success() {
                    debug!(error = %response.error, "Fire-and-forget player command failed");
                }
            }
            None => {
                debug!(request_id = response.request_id, "Ignoring late or unknown player reply");
            }
        }
    }

    /// Mark the channel closed and reject everything still pending.
    fn shutdown(&self, reason: &str) {
        self.closed.cancel();

        let ids: Vec<u64> = self.pending.iter().map(|entry| *entry.key()).collect();
        let mut rejected = 0usize;
        for id in ids {
            if let Some((_, pending)) = self.pending.remove(&id) {
                let _ = pending
                    .resolver
                    .send(Err(Error::ChannelUnavailable(reason.to_string())));
                rejected += 1;
            }
        }

        info!(reason, rejected, "Player channel closed");
    }

    async fn write_line(&self, line: String) -> Result<()> {
        if self.closed.is_cancelled() {
            return Err(Error::ChannelUnavailable("channel closed".to_string()));
        }
        let mut writer = self.writer.lock().await;
        if let Err(e) = writer.send(line).await {
            drop(writer);
            self.shutdown("write failed");
            return Err(Error::ChannelUnavailable(format!("write failed: {e}")));
        }
        Ok(())
    }
}

/// Handle to a player control socket. Cheap to clone; the connection closes
/// when the last handle is dropped or [`PlayerChannel::close`] is called.
#[derive(Clone)]
pub struct PlayerChannel {
    inner: Arc<ChannelInner>,
    _close_on_drop: Arc<DropGuard>,
}

impl std::fmt::Debug for PlayerChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlayerChannel")
            .field("pending", &self.inner.pending.len())
            .field("closed", &self.inner.closed.is_cancelled())
            .finish()
    }
}

impl PlayerChannel {
    /// Connect to a player's unix control socket, polling until it accepts a
    /// connection or the retry budget runs out.
    #[cfg(unix)]
    pub async fn connect(
        address: impl AsRef<Path>,
        retry: RetryPolicy,
        request_timeout: Duration,
    ) -> Result<Self> {
        let address = address.as_ref();
        let mut last_error = None;

        for attempt in 1..=retry.max_attempts {
            match tokio::net::UnixStream::connect(address).await {
                Ok(stream) => {
                    info!(path = %address.display(), attempt, "Connected to player control socket");
                    return Ok(Self::from_stream(stream, request_timeout));
                }
                Err(e) => {
                    debug!(path = %address.display(), attempt, error = %e, "Player socket not ready");
                    last_error = Some(e);
                }
            }
            if attempt < retry.max_attempts {
                tokio::time::sleep(retry.interval).await;
            }
        }

        Err(Error::ChannelUnavailable(format!(
            "{} unreachable after {} attempts: {}",
            address.display(),
            retry.max_attempts,
            last_error.map_or_else(|| "no attempt made".to_string(), |e| e.to_string())
        )))
    }

    /// Wrap an already-connected stream and start the reader task.
    pub fn from_stream<S>(stream: S, request_timeout: Duration) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, write_half): (ReadHalf<S>, WriteHalf<S>) = tokio::io::split(stream);
        let writer: BoxedWriter = Box::new(write_half);
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let closed = CancellationToken::new();

        let inner = Arc::new(ChannelInner {
            writer: Mutex::new(FramedWrite::new(writer, PlayerCodec::new())),
            pending: DashMap::new(),
            // mpv answers id-less commands with request_id 0, so real ids start at 1
            next_request_id: AtomicU64::new(1),
            next_observer_id: AtomicU64::new(1),
            events,
            closed: closed.clone(),
            request_timeout,
        });

        tokio::spawn(Self::run_reader(inner.clone(), FramedRead::new(read_half, PlayerCodec::new())));

        Self {
            inner,
            _close_on_drop: Arc::new(closed.drop_guard()),
        }
    }

    async fn run_reader<R>(inner: Arc<ChannelInner>, mut frames: FramedRead<R, PlayerCodec>)
    where
        R: AsyncRead + Unpin,
    {
        let reason = loop {
            tokio::select! {
                () = inner.closed.cancelled() => break "closed locally",
                frame = frames.next() => match frame {
                    Some(Ok(Frame::Message(PlayerMessage::Response(response)))) => inner.resolve(response),
                    Some(Ok(Frame::Message(PlayerMessage::Event(event)))) => {
                        debug!(event = %event.event, name = ?event.name, "Player event");
                        // No subscribers is fine
                        let _ = inner.events.send(event);
                    }
                    Some(Ok(Frame::Malformed { line, reason })) => {
                        warn!(%reason, %line, "Dropping malformed player line");
                    }
                    Some(Err(e)) => {
                        warn!(error = %e, "Player socket read failed");
                        break "socket error";
                    }
                    None => break "socket closed by player",
                },
            }
        };

        inner.shutdown(reason);
    }

    /// Close the connection and reject all pending requests.
    pub fn close(&self) {
        self.inner.shutdown("closed locally");
    }

    #[must_use]
    pub fn pending_requests(&self) -> usize {
        self.inner.pending.len()
    }

    async fn request_inner(&self, command: Command, timeout: Duration) -> Result<Value> {
        let inner = &self.inner;
        if inner.closed.is_cancelled() {
            return Err(Error::ChannelUnavailable("channel closed".to_string()));
        }

        let request_id = inner.next_request_id.fetch_add(1, Ordering::Relaxed);
        let (tx, mut rx) = oneshot::channel();
        inner.pending.insert(
            request_id,
            PendingRequest {
                resolver: tx,
                created_at: Instant::now(),
                verb: command.to_string(),
            },
        );

        // Shutdown may have drained the table just before our insert
        if inner.closed.is_cancelled() {
            inner.pending.remove(&request_id);
            return Err(Error::ChannelUnavailable("channel closed".to_string()));
        }

        let line = match command.to_line(Some(request_id)) {
            Ok(line) => line,
            Err(e) => {
                inner.pending.remove(&request_id);
                return Err(e);
            }
        };
        if let Err(e) = inner.write_line(line).await {
            inner.pending.remove(&request_id);
            return Err(e);
        }

        match tokio::time::timeout(timeout, &mut rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(Error::ChannelUnavailable("channel closed".to_string())),
            Err(_) => {
                if inner.pending.remove(&request_id).is_some() {
                    warn!(request_id, command = %command, "Player request timed out");
                    Err(Error::RequestTimeout {
                        request_id,
                        timeout_ms: timeout.as_millis() as u64,
                    })
                } else {
                    // The reply claimed the entry between the deadline and our removal
                    rx.try_recv()
                        .unwrap_or_else(|_| Err(Error::ChannelUnavailable("channel closed".to_string())))
                }
            }
        }
    }
}

#[async_trait]
impl PlayerControl for PlayerChannel {
    async fn request(&self, command: Command) -> Result<Value> {
        self.request_inner(command, self.inner.request_timeout).await
    }

    async fn request_with_timeout(&self, command: Command, timeout: Duration) -> Result<Value> {
        self.request_inner(command, timeout).await
    }

    async fn send(&self, command: Command) -> Result<()> {
        let line = command.to_line(None)?;
        self.inner.write_line(line).await
    }

    async fn observe(&self, property: &str) -> Result<u64> {
        let observer_id = self.inner.next_observer_id.fetch_add(1, Ordering::Relaxed);
        self.request(Command::observe_property(observer_id, property)).await?;
        debug!(observer_id, property, "Observing player property");
        Ok(observer_id)
    }

    async fn unobserve(&self, observer_id: u64) -> Result<()> {
        self.request(Command::unobserve_property(observer_id)).await.map(|_| ())
    }

    fn subscribe(&self) -> broadcast::Receiver<PlayerEvent> {
        self.inner.events.subscribe()
    }

    fn is_connected(&self) -> bool {
        !self.inner.closed.is_cancelled()
    }

    fn closed(&self) -> CancellationToken {
        self.inner.closed.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream};

    const TIMEOUT: Duration = Duration::from_millis(3000);

    /// Fake player end of the socket
    struct FakePlayer {
        reader: BufReader<ReadHalf<DuplexStream>>,
        writer: WriteHalf<DuplexStream>,
    }

    impl FakePlayer {
        async fn next_request(&mut self) -> Value {
            let mut line = String::new();
            self.reader.read_line(&mut line).await.unwrap();
            serde_json::from_str(&line).unwrap()
        }

        async fn write(&mut self, raw: &str) {
            self.writer.write_all(raw.as_bytes()).await.unwrap();
            self.writer.flush().await.unwrap();
        }
    }

    fn pair() -> (PlayerChannel, FakePlayer) {
        let (client, server) = tokio::io::duplex(4096);
        let channel = PlayerChannel::from_stream(client, TIMEOUT);
        let (read, write) = tokio::io::split(server);
        (channel, FakePlayer { reader: BufReader::new(read), writer: write })
    }

    #[tokio::test]
    async fn test_request_correlates_by_id() {
        let (channel, mut player) = pair();

        let first = tokio::spawn({
            let channel = channel.clone();
            async move { channel.request(Command::get_property("time-pos")).await }
        });
        let req1 = player.next_request().await;

        let second = tokio::spawn({
            let channel = channel.clone();
            async move { channel.request(Command::get_property("pause")).await }
        });
        let req2 = player.next_request().await;

        let id1 = req1["request_id"].as_u64().unwrap();
        let id2 = req2["request_id"].as_u64().unwrap();
        assert!(id2 > id1, "request ids must increase");

        // Answer out of order, concatenated into one write
        player
            .write(&format!(
                "{{\"request_id\":{id2},\"error\":\"success\",\"data\":true}}\n{{\"request_id\":{id1},\"error\":\"success\",\"data\":12.5}}\n"
            ))
            .await;

        assert_eq!(first.await.unwrap().unwrap(), json!(12.5));
        assert_eq!(second.await.unwrap().unwrap(), json!(true));
        assert_eq!(channel.pending_requests(), 0);
    }

    #[tokio::test]
    async fn test_error_reply_surfaces_player_error() {
        let (channel, mut player) = pair();
        let task = tokio::spawn({
            let channel = channel.clone();
            async move { channel.request(Command::get_property("duration")).await }
        });
        let req = player.next_request().await;
        let id = req["request_id"].as_u64().unwrap();
        player
            .write(&format!("{{\"request_id\":{id},\"error\":\"property unavailable\"}}\n"))
            .await;

        assert!(matches!(task.await.unwrap(), Err(Error::Player(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_request_times_out_exactly_once() {
        let (channel, mut player) = pair();
        let task = tokio::spawn({
            let channel = channel.clone();
            async move { channel.request(Command::get_property("time-pos")).await }
        });
        let req = player.next_request().await;
        let id = req["request_id"].as_u64().unwrap();

        let result = task.await.unwrap();
        assert!(matches!(result, Err(Error::RequestTimeout { request_id, .. }) if request_id == id));
        assert_eq!(channel.pending_requests(), 0);

        // A late reply after cleanup is ignored and the channel keeps working
        player.write(&format!("{{\"request_id\":{id},\"error\":\"success\",\"data\":1}}\n")).await;
        assert!(channel.is_connected());
    }

    #[tokio::test]
    async fn test_events_are_broadcast_and_garbage_ignored() {
        let (channel, mut player) = pair();
        let mut events = channel.subscribe();

        player.write("garbage\n{\"event\":\"property-change\",\"id\":1,\"name\":\"pause\",\"data\":true}\n").await;

        let event = events.recv().await.unwrap();
        assert!(event.is_property_change("pause"));
        assert!(channel.is_connected());
    }

    #[tokio::test]
    async fn test_close_rejects_pending_immediately() {
        let (channel, mut player) = pair();
        let task = tokio::spawn({
            let channel = channel.clone();
            async move { channel.request(Command::get_property("time-pos")).await }
        });
        let _ = player.next_request().await;

        drop(player);

        let result = task.await.unwrap();
        assert!(matches!(result, Err(Error::ChannelUnavailable(_))));
        channel.closed().cancelled().await;
        assert!(!channel.is_connected());
        assert!(matches!(
            channel.send(Command::cycle("pause")).await,
            Err(Error::ChannelUnavailable(_))
        ));
    }

    #[tokio::test]
    async fn test_observe_registers_property() {
        let (channel, mut player) = pair();
        let task = tokio::spawn({
            let channel = channel.clone();
            async move { channel.observe("pause").await }
        });
        let req = player.next_request().await;
        assert_eq!(req["command"][0], "observe_property");
        assert_eq!(req["command"][2], "pause");
        let id = req["request_id"].as_u64().unwrap();
        player.write(&format!("{{\"request_id\":{id},\"error\":\"success\"}}\n")).await;

        assert_eq!(task.await.unwrap().unwrap(), req["command"][1].as_u64().unwrap());
    }

    #[tokio::test]
    async fn test_send_has_no_request_id() {
        let (channel, mut player) = pair();
        channel.send(Command::set_property("time-pos", 30.0)).await.unwrap();
        let req = player.next_request().await;
        assert!(req.get("request_id").is_none());
        assert_eq!(req["command"], json!(["set_property", "time-pos", 30.0]));
    }

    #[cfg(unix)]
    #[tokio::test(start_paused = true)]
    async fn test_connect_gives_up_after_budget() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing.sock");
        let retry = RetryPolicy { interval: Duration::from_millis(100), max_attempts: 50 };

        let result = PlayerChannel::connect(&path, retry, TIMEOUT).await;
        assert!(matches!(result, Err(Error::ChannelUnavailable(_))));
    }
}
