use serde::{Deserialize, Serialize};

use super::id::{RoomId, UserId};
use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RoomStatus {
    /// Members are gathering and preparing the stream
    #[default]
    Pending,
    /// Synchronized playback has started
    Active,
    Closed,
}

impl RoomStatus {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Active => "active",
            Self::Closed => "closed",
        }
    }

    #[must_use]
    pub const fn is_active(&self) -> bool {
        matches!(self, Self::Active)
    }

    #[must_use]
    pub const fn is_closed(&self) -> bool {
        matches!(self, Self::Closed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemberRole {
    Owner,
    Member,
}

impl MemberRole {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Owner => "owner",
            Self::Member => "member",
        }
    }
}

impl std::fmt::Display for MemberRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Member {
    pub user_id: UserId,
    pub username: String,
    pub role: MemberRole,
    pub ready: bool,
    /// Latency observed on the most recent sync event from this member, in ms
    pub last_latency_ms: Option<i64>,
}

impl Member {
    #[must_use]
    pub const fn new(user_id: UserId, username: String, role: MemberRole) -> Self {
        Self {
            user_id,
            username,
            role,
            ready: false,
            last_latency_ms: None,
        }
    }

    #[must_use]
    pub const fn is_owner(&self) -> bool {
        matches!(self.role, MemberRole::Owner)
    }
}

/// Outcome of a member leaving the room
#[derive(Debug, Clone, PartialEq)]
pub enum Departure {
    /// The member was not in the room
    Unknown,
    /// A regular member left
    Member,
    /// The owner left and ownership passed to `new_owner`
    OwnerReplaced { new_owner: UserId },
    /// The last member left; the room is now closed
    RoomEmptied,
}

/// Live room membership.
///
/// Invariant: while the room has members, exactly one of them is the owner and
/// `owner_id` names that member.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Room {
    pub id: RoomId,
    pub owner_id: UserId,
    pub members: Vec<Member>,
    pub status: RoomStatus,
}

impl Room {
    /// Create a room owned by the user who performed the creating action.
    #[must_use]
    pub fn new(id: RoomId, owner_id: UserId, owner_username: String) -> Self {
        let owner = Member::new(owner_id.clone(), owner_username, MemberRole::Owner);
        Self {
            id,
            owner_id,
            members: vec![owner],
            status: RoomStatus::Pending,
        }
    }

    /// A member's view of a room before the host has sent its roster
    #[must_use]
    pub fn awaiting_roster(id: RoomId) -> Self {
        Self {
            id,
            owner_id: UserId::from_string(String::new()),
            members: Vec::new(),
            status: RoomStatus::Pending,
        }
    }

    /// Replace membership with the host's roster. Exactly one entry ends up
    /// as owner, whatever roles the roster carried.
    pub fn apply_roster(&mut self, owner_id: UserId, mut members: Vec<Member>) {
        for member in &mut members {
            member.role = if member.user_id == owner_id {
                MemberRole::Owner
            } else {
                MemberRole::Member
            };
        }
        self.owner_id = owner_id;
        self.members = members;
        self.status = RoomStatus::Active;
    }

    #[must_use]
    pub fn member(&self, user_id: &UserId) -> Option<&Member> {
        self.members.iter().find(|m| &m.user_id == user_id)
    }

    fn member_mut(&mut self, user_id: &UserId) -> Option<&mut Member> {
        self.members.iter_mut().find(|m| &m.user_id == user_id)
    }

    #[must_use]
    pub fn is_owner(&self, user_id: &UserId) -> bool {
        &self.owner_id == user_id && !self.members.is_empty()
    }

    #[must_use]
    pub fn owner(&self) -> Option<&Member> {
        self.members.iter().find(|m| m.is_owner())
    }

    /// Add a member. Joining twice only refreshes the username; the member
    /// keeps its role and readiness.
    ///
    /// Returns `true` if the member is new.
    pub fn add_member(&mut self, user_id: UserId, username: String) -> bool {
        if let Some(existing) = self.member_mut(&user_id) {
            existing.username = username;
            return false;
        }

        if self.members.is_empty() {
            // Re-opening an emptied room: the first member back owns it
            self.owner_id = user_id.clone();
            self.status = RoomStatus::Pending;
            self.members.push(Member::new(user_id, username, MemberRole::Owner));
        } else {
            self.members.push(Member::new(user_id, username, MemberRole::Member));
        }
        true
    }

    /// Remove a member, handing ownership to the longest-present remaining
    /// member if the owner leaves.
    pub fn remove_member(&mut self, user_id: &UserId) -> Departure {
        let Some(index) = self.members.iter().position(|m| &m.user_id == user_id) else {
            return Departure::Unknown;
        };

        let removed = self.members.remove(index);

        if self.members.is_empty() {
            self.status = RoomStatus::Closed;
            return Departure::RoomEmptied;
        }

        if removed.is_owner() {
            let new_owner = self.members[0].user_id.clone();
            self.members[0].role = MemberRole::Owner;
            self.owner_id = new_owner.clone();
            return Departure::OwnerReplaced { new_owner };
        }

        Departure::Member
    }

    /// Atomically demote the current owner and promote `new_owner`.
    pub fn transfer_ownership(&mut self, new_owner: &UserId) -> Result<()> {
        if self.member(new_owner).is_none() {
            return Err(Error::NotFound(format!("member {new_owner} is not in room {}", self.id)));
        }
        if &self.owner_id == new_owner {
            return Ok(());
        }

        for member in &mut self.members {
            member.role = if &member.user_id == new_owner {
                MemberRole::Owner
            } else {
                MemberRole::Member
            };
        }
        self.owner_id = new_owner.clone();
        Ok(())
    }

    /// Mark a member ready. Returns `true` if this changed its readiness.
    pub fn mark_ready(&mut self, user_id: &UserId) -> bool {
        match self.member_mut(user_id) {
            Some(member) if !member.ready => {
                member.ready = true;
                true
            }
            _ => false,
        }
    }

    pub fn unmark_ready(&mut self, user_id: &UserId) {
        if let Some(member) = self.member_mut(user_id) {
            member.ready = false;
        }
    }

    pub fn reset_readiness(&mut self) {
        for member in &mut self.members {
            member.ready = false;
        }
    }

    pub fn record_latency(&mut self, user_id: &UserId, latency_ms: i64) {
        if let Some(member) = self.member_mut(user_id) {
            member.last_latency_ms = Some(latency_ms);
        }
    }

    #[must_use]
    pub fn ready_count(&self) -> usize {
        self.members.iter().filter(|m| m.ready).count()
    }

    #[must_use]
    pub fn total_members(&self) -> usize {
        self.members.len()
    }

    /// Countdown gate: everyone currently in the room is ready, and the room is not empty.
    #[must_use]
    pub fn all_ready(&self) -> bool {
        let total = self.total_members();
        total > 0 && self.ready_count() == total
    }
}
