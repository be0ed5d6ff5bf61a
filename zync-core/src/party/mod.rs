//! Party coordination: host publishing, member applying and the readiness
//! state machine that gates the synchronized launch.

pub mod clock;
pub mod host;
pub mod member;
pub mod readiness;
pub mod relay;
pub mod session;

pub use clock::{Clock, ManualClock, SystemClock};
pub use host::HostPublisher;
pub use member::{ApplyOutcome, SyncApplier};
pub use readiness::{wait_for_duration, Readiness, ReadinessMachine, ReadinessSignal};
#[cfg(test)]
pub use relay::MockRelay;
pub use relay::{Relay, RelayReceiver};
pub use session::{PartySession, Published};
