//! mpv JSON IPC wire format
//!
//! One JSON object per line in both directions. Requests carry a `command`
//! array and an optional `request_id`; replies echo the `request_id` together
//! with an `error` status, and unsolicited notifications carry an `event` name
//! instead.

use bytes::{Buf, BytesMut};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::codec::{Decoder, Encoder};

use crate::{Error, Result};

/// Longest line we are willing to buffer before giving up on it
pub const MAX_LINE_LENGTH: usize = 1 << 20;

/// Properties the rest of the crate reads or writes
pub mod property {
    pub const PAUSE: &str = "pause";
    pub const TIME_POS: &str = "time-pos";
    pub const DURATION: &str = "duration";
    pub const VOLUME: &str = "volume";
    pub const FULLSCREEN: &str = "fullscreen";
    pub const SID: &str = "sid";
    pub const SUB_DELAY: &str = "sub-delay";
    pub const SUB_SCALE: &str = "sub-scale";
    pub const SUB_VISIBILITY: &str = "sub-visibility";
    pub const PID: &str = "pid";
    pub const VID: &str = "vid";
    pub const FORCE_WINDOW: &str = "force-window";
}

/// A player command: a verb followed by its arguments
#[derive(Debug, Clone, PartialEq)]
pub struct Command {
    args: Vec<Value>,
}

impl Command {
    #[must_use]
    pub fn new(verb: &str) -> Self {
        Self {
            args: vec![Value::String(verb.to_string())],
        }
    }

    #[must_use]
    pub fn arg(mut self, value: impl Into<Value>) -> Self {
        self.args.push(value.into());
        self
    }

    #[must_use]
    pub fn get_property(name: &str) -> Self {
        Self::new("get_property").arg(name)
    }

    #[must_use]
    pub fn set_property(name: &str, value: impl Into<Value>) -> Self {
        Self::new("set_property").arg(name).arg(value)
    }

    #[must_use]
    pub fn cycle(name: &str) -> Self {
        Self::new("cycle").arg(name)
    }

    #[must_use]
    pub fn loadfile(url: &str) -> Self {
        Self::new("loadfile").arg(url)
    }

    /// Add an external subtitle file and select it
    #[must_use]
    pub fn sub_add(url: &str, title: Option<&str>) -> Self {
        let command = Self::new("sub-add").arg(url).arg("select");
        match title {
            Some(title) => command.arg(title),
            None => command,
        }
    }

    /// Remove a subtitle track (the current one when `id` is `None`)
    #[must_use]
    pub fn sub_remove(id: Option<i64>) -> Self {
        let command = Self::new("sub-remove");
        match id {
            Some(id) => command.arg(id),
            None => command,
        }
    }

    #[must_use]
    pub fn observe_property(observer_id: u64, name: &str) -> Self {
        Self::new("observe_property").arg(observer_id).arg(name)
    }

    #[must_use]
    pub fn unobserve_property(observer_id: u64) -> Self {
        Self::new("unobserve_property").arg(observer_id)
    }

    #[must_use]
    pub fn verb(&self) -> &str {
        self.args.first().and_then(Value::as_str).unwrap_or_default()
    }

    #[must_use]
    pub fn args(&self) -> &[Value] {
        &self.args
    }

    /// Serialize to a single wire line (without the trailing newline)
    pub fn to_line(&self, request_id: Option<u64>) -> Result<String> {
        let request = WireRequest {
            command: &self.args,
            request_id,
        };
        Ok(serde_json::to_string(&request)?)
    }
}

impl std::fmt::Display for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let parts: Vec<String> = self
            .args
            .iter()
            .map(|v| v.as_str().map_or_else(|| v.to_string(), str::to_string))
            .collect();
        write!(f, "{}", parts.join(" "))
    }
}

#[derive(Serialize)]
struct WireRequest<'a> {
    command: &'a [Value],
    #[serde(skip_serializing_if = "Option::is_none")]
    request_id: Option<u64>,
}

/// Reply to a command
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Response {
    /// mpv reports 0 for commands sent without an id
    #[serde(default)]
    pub request_id: u64,
    pub error: String,
    #[serde(default)]
    pub data: Value,
}

impl Response {
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.error == "success"
    }

    pub fn into_result(self) -> Result<Value> {
        if self.is_success() {
            Ok(self.data)
        } else {
            Err(Error::Player(self.error))
        }
    }
}

/// Unsolicited notification from the player
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct PlayerEvent {
    pub event: String,
    /// Observer id for `property-change`
    #[serde(default)]
    pub id: Option<u64>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub data: Value,
}

impl PlayerEvent {
    #[must_use]
    pub fn property_change(name: &str, data: impl Into<Value>) -> Self {
        Self {
            event: "property-change".to_string(),
            id: None,
            name: Some(name.to_string()),
            data: data.into(),
        }
    }

    #[must_use]
    pub fn seek() -> Self {
        Self {
            event: "seek".to_string(),
            id: None,
            name: None,
            data: Value::Null,
        }
    }

    #[must_use]
    pub fn is_property_change(&self, property: &str) -> bool {
        self.event == "property-change" && self.name.as_deref() == Some(property)
    }

    #[must_use]
    pub fn is_seek(&self) -> bool {
        self.event == "seek"
    }
}

/// A parsed line from the player
#[derive(Debug, Clone, PartialEq)]
pub enum PlayerMessage {
    Response(Response),
    Event(PlayerEvent),
}

impl PlayerMessage {
    /// Parse one line. Events are recognised by their `event` field; anything
    /// else must look like a reply.
    pub fn parse(line: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(line)?;
        if value.get("event").is_some() {
            Ok(Self::Event(serde_json::from_value(value)?))
        } else if value.get("error").is_some() {
            Ok(Self::Response(serde_json::from_value(value)?))
        } else {
            Err(Error::InvalidInput(format!("neither reply nor event: {line}")))
        }
    }
}

/// Decoded frame. Malformed lines are surfaced as frames rather than decoder
/// errors, so one bad line never terminates the stream.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Message(PlayerMessage),
    Malformed { line: String, reason: String },
}

/// Newline-delimited codec for the player socket.
///
/// Buffers partial input until a full line is available and yields one frame
/// per line when several arrive in a single read.
#[derive(Debug, Default)]
pub struct PlayerCodec {
    /// Buffered bytes already searched for a newline
    next_index: usize,
    /// Set while skipping the remainder of an over-long line
    discarding: bool,
}

impl PlayerCodec {
    #[must_use]
    pub const fn new() -> Self {
        Self { next_index: 0, discarding: false }
    }
}

impl Decoder for PlayerCodec {
    type Item = Frame;
    type Error = std::io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> std::io::Result<Option<Frame>> {
        loop {
            let scan_from = self.next_index.min(src.len());
            let Some(offset) = src[scan_from..].iter().position(|b| *b == b'\n') else {
                self.next_index = src.len();
                if src.len() > MAX_LINE_LENGTH {
                    src.clear();
                    self.next_index = 0;
                    if !self.discarding {
                        self.discarding = true;
                        return Ok(Some(Frame::Malformed {
                            line: String::new(),
                            reason: format!("line exceeds {MAX_LINE_LENGTH} bytes"),
                        }));
                    }
                }
                return Ok(None);
            };

            let newline = scan_from + offset;
            self.next_index = 0;
            let raw = src.split_to(newline);
            src.advance(1);

            if std::mem::take(&mut self.discarding) {
                // Tail of an over-long line that was already reported
                continue;
            }

            let line = String::from_utf8_lossy(&raw);
            let line = line.trim();
            if line.is_empty() {
                continue;
            }

            let frame = match PlayerMessage::parse(line) {
                Ok(message) => Frame::Message(message),
                Err(e) => Frame::Malformed {
                    line: line.to_string(),
                    reason: e.to_string(),
                },
            };
            return Ok(Some(frame));
        }
    }
}

impl Encoder<String> for PlayerCodec {
    type Error = std::io::Error;

    fn encode(&mut self, line: String, dst: &mut BytesMut) -> std::io::Result<()> {
        dst.reserve(line.len() + 1);
        dst.extend_from_slice(line.as_bytes());
        dst.extend_from_slice(b"\n");
        Ok(())
    }
}
