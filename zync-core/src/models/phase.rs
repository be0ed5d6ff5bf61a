use serde::{Deserialize, Serialize};

/// Lifecycle of a watch party as seen by one member
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PartyPhase {
    #[default]
    Initializing,
    StreamPreparing,
    ReadyWaiting,
    Countdown,
    Playing,
    Error,
}

impl PartyPhase {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Initializing => "initializing",
            Self::StreamPreparing => "stream_preparing",
            Self::ReadyWaiting => "ready_waiting",
            Self::Countdown => "countdown",
            Self::Playing => "playing",
            Self::Error => "error",
        }
    }

    /// Allowed edges of the lifecycle.
    ///
    /// `Countdown -> ReadyWaiting` is the abort edge taken when membership
    /// changes break the readiness gate. Any phase may fall into `Error`, and
    /// `Error` may restart preparation.
    #[must_use]
    pub const fn can_transition_to(&self, next: Self) -> bool {
        matches!(
            (self, next),
            (_, Self::Error)
                | (Self::Initializing | Self::Error | Self::ReadyWaiting, Self::StreamPreparing)
                | (Self::StreamPreparing, Self::ReadyWaiting)
                | (Self::ReadyWaiting, Self::Countdown)
                | (Self::Countdown, Self::ReadyWaiting)
                | (Self::ReadyWaiting | Self::Countdown, Self::Playing)
        )
    }

    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Playing | Self::Error)
    }
}

impl std::fmt::Display for PartyPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
