pub mod watch_party;

pub use watch_party::{MediaInfo, PrepareOutcome, WatchParty};
