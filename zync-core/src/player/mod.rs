//! mpv control over its JSON IPC socket

pub mod channel;
pub mod control;
pub mod process;
pub mod protocol;

pub use channel::PlayerChannel;
#[cfg(test)]
pub use control::MockPlayerControl;
pub use control::{Player, PlayerControl, PlayerQuery, TimeoutDefault};
pub use process::{ManagedPlayer, PlayerProcess, PlayerSupervisor};
pub use protocol::{Command, PlayerCodec, PlayerEvent, PlayerMessage, Response};
