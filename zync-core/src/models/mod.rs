pub mod id;
pub mod phase;
pub mod playback;
pub mod room;
pub mod sync_event;

pub use id::{generate_id, RoomId, UserId};
pub use phase::PartyPhase;
pub use playback::{PlaybackState, SyncStatus};
pub use room::{Departure, Member, MemberRole, Room, RoomStatus};
pub use sync_event::{PartyMessage, SyncEvent, SyncKind, SyncPayload};
