//! Durable store interface and implementations.
//!
//! Architecture:
//! ```text
//! ┌──────────────┐  rooms / operations /    ┌──────────────────────┐
//! │ CollabClient │  comments / invitations  │ dyn DurableStore     │
//! │              │ ───────────────────────► │  ├── MemoryStore     │
//! │              │                          │  └── RocksStore      │
//! │              │ ◄─────────────────────── │        │             │
//! └──────────────┘   CommentChange feed     │   ChangeFeed (push)  │
//!                    (per room, broadcast)  └──────────────────────┘
//! ```
//!
//! The store is the single source of truth for operations and comments.
//! It assigns operation timestamps (strictly increasing per store), runs
//! the atomic join/leave bookkeeping, and pushes comment changes to
//! subscribers of a room.
//!
//! Reference: Kleppmann — Designing Data-Intensive Applications, Chapter 3

pub mod feed;
pub mod memory;
pub mod rocks;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::model::{
    Comment, CommentChange, Invitation, InvitationStatus, JoinReceipt, NewComment,
    NewInvitation, NewOperation, NewRoom, Operation, ResourceType, Room, RoomId, UserId,
};

pub use feed::ChangeFeed;
pub use memory::MemoryStore;
pub use rocks::{RocksStore, StoreConfig};

/// Storage errors.
#[derive(Debug, Clone, PartialEq)]
pub enum StoreError {
    /// Backend failure
    DatabaseError(String),
    /// Record not found
    NotFound(String),
    /// Request violates a store invariant (duplicate resource room, bad parent)
    Invalid(String),
    /// Serialization failed
    SerializationError(String),
    /// Deserialization failed
    DeserializationError(String),
    /// Compression error
    CompressionError(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::DatabaseError(e) => write!(f, "Database error: {e}"),
            StoreError::NotFound(what) => write!(f, "Not found: {what}"),
            StoreError::Invalid(e) => write!(f, "Invalid request: {e}"),
            StoreError::SerializationError(e) => write!(f, "Serialization error: {e}"),
            StoreError::DeserializationError(e) => write!(f, "Deserialization error: {e}"),
            StoreError::CompressionError(e) => write!(f, "Compression error: {e}"),
        }
    }
}

impl std::error::Error for StoreError {}

impl StoreError {
    pub fn room_not_found(id: RoomId) -> Self {
        StoreError::NotFound(format!("room {id}"))
    }

    pub fn comment_not_found(id: Uuid) -> Self {
        StoreError::NotFound(format!("comment {id}"))
    }

    pub fn invitation_not_found(id: Uuid) -> Self {
        StoreError::NotFound(format!("invitation {id}"))
    }
}

/// The authoritative persistence layer consumed by the engine.
#[async_trait]
pub trait DurableStore: Send + Sync {
    // ─── Rooms ────────────────────────────────────────────────────────

    /// Fails with `Invalid` if a room already exists for the resource pair.
    async fn create_room(&self, room: NewRoom) -> Result<Room, StoreError>;

    async fn get_room(&self, room_id: RoomId) -> Result<Room, StoreError>;

    async fn find_room(
        &self,
        resource_type: &ResourceType,
        resource_id: &str,
    ) -> Result<Option<Room>, StoreError>;

    async fn update_room_settings(&self, room_id: RoomId, settings: Value) -> Result<Room, StoreError>;

    /// Removes the room with its operations, comments, invitations and
    /// participant records.
    async fn delete_room(&self, room_id: RoomId) -> Result<(), StoreError>;

    // ─── Membership bookkeeping ───────────────────────────────────────

    /// Atomic join procedure: registers the participant, assigns a color,
    /// returns the resulting participant count.
    async fn join_room(&self, room_id: RoomId, user_id: UserId) -> Result<JoinReceipt, StoreError>;

    /// Atomic leave procedure. Returns the remaining participant count.
    async fn leave_room(&self, room_id: RoomId, user_id: UserId) -> Result<u32, StoreError>;

    // ─── Operations ───────────────────────────────────────────────────

    /// Append with a store-assigned id and timestamp.
    async fn append_operation(&self, operation: NewOperation) -> Result<Operation, StoreError>;

    /// Operations with `timestamp > since`, ascending, at most `limit`.
    async fn operations_since(
        &self,
        room_id: RoomId,
        since: Option<u64>,
        limit: usize,
    ) -> Result<Vec<Operation>, StoreError>;

    // ─── Comments ─────────────────────────────────────────────────────

    async fn insert_comment(&self, comment: NewComment) -> Result<Comment, StoreError>;

    async fn get_comment(&self, comment_id: Uuid) -> Result<Comment, StoreError>;

    /// Top-level comments of a room, oldest first.
    async fn top_level_comments(&self, room_id: RoomId) -> Result<Vec<Comment>, StoreError>;

    /// Replies to one comment, oldest first.
    async fn replies(&self, parent_id: Uuid) -> Result<Vec<Comment>, StoreError>;

    /// Sets the resolved flag. Notifies subscribers only when it changed.
    async fn set_comment_resolved(&self, comment_id: Uuid, resolved: bool) -> Result<Comment, StoreError>;

    /// Push-style change notifications for one room's comments.
    fn comment_changes(&self, room_id: RoomId) -> broadcast::Receiver<CommentChange>;

    // ─── Invitations ──────────────────────────────────────────────────

    async fn create_invitation(&self, invitation: NewInvitation) -> Result<Invitation, StoreError>;

    async fn get_invitation(&self, invitation_id: Uuid) -> Result<Invitation, StoreError>;

    async fn invitations(&self, room_id: RoomId) -> Result<Vec<Invitation>, StoreError>;

    async fn set_invitation_status(
        &self,
        invitation_id: Uuid,
        status: InvitationStatus,
    ) -> Result<Invitation, StoreError>;
}

/// Shared check for reply nesting.
pub(crate) fn validate_parent(parent: &Comment, room_id: RoomId) -> Result<(), StoreError> {
    if parent.room_id != room_id {
        return Err(StoreError::Invalid(format!(
            "parent comment {} belongs to another room",
            parent.id
        )));
    }
    if parent.parent_id.is_some() {
        return Err(StoreError::Invalid(format!(
            "comment {} is a reply; threads are one level deep",
            parent.id
        )));
    }
    Ok(())
}

/// Strictly increasing millisecond timestamps for store-assigned stamps
/// (operation timestamps, comment and invitation creation times).
///
/// Two appends in the same millisecond still get distinct, ordered
/// timestamps, so `operations_since(last_seen)` never skips a record and
/// comments keep their insertion order.
pub(crate) struct ServerClock {
    last: std::sync::atomic::AtomicU64,
}

impl ServerClock {
    pub(crate) fn starting_after(last: u64) -> Self {
        Self {
            last: std::sync::atomic::AtomicU64::new(last),
        }
    }

    pub(crate) fn next(&self) -> u64 {
        use std::sync::atomic::Ordering;
        let now = crate::model::now_millis();
        let mut current = self.last.load(Ordering::SeqCst);
        loop {
            let candidate = now.max(current + 1);
            match self
                .last
                .compare_exchange(current, candidate, Ordering::SeqCst, Ordering::SeqCst)
            {
                Ok(_) => return candidate,
                Err(actual) => current = actual,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_clock_strictly_increasing() {
        let clock = ServerClock::starting_after(0);
        let mut prev = 0;
        for _ in 0..1000 {
            let t = clock.next();
            assert!(t > prev);
            prev = t;
        }
    }

    #[test]
    fn test_server_clock_resumes_after_recovered_value() {
        let far_future = crate::model::now_millis() + 60_000;
        let clock = ServerClock::starting_after(far_future);
        assert_eq!(clock.next(), far_future + 1);
    }

    #[test]
    fn test_store_error_display() {
        assert_eq!(
            StoreError::DatabaseError("io".into()).to_string(),
            "Database error: io"
        );
    }
}
