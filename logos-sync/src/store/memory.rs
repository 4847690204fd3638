//! In-memory durable store.
//!
//! Backs tests and single-process demos. Every call takes one write or
//! read lock for its whole critical section, which makes the join/leave
//! procedures atomic. Writes can be made to fail on demand to exercise
//! persistence-failure paths.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{broadcast, RwLock};
use uuid::Uuid;

use super::{validate_parent, ChangeFeed, DurableStore, ServerClock, StoreError};
use crate::model::{
    now_millis, Comment, CommentAction, CommentChange, Invitation, InvitationStatus,
    JoinReceipt, NewComment, NewInvitation, NewOperation, NewRoom, Operation, ResourceType,
    Room, RoomId, UserId,
};
use crate::presence::CursorColor;

#[derive(Default)]
struct Membership {
    /// user → palette slot
    members: HashMap<UserId, usize>,
    next_slot: usize,
}

#[derive(Default)]
struct MemoryState {
    rooms: HashMap<RoomId, Room>,
    operations: HashMap<RoomId, Vec<Operation>>,
    comments: HashMap<Uuid, Comment>,
    invitations: HashMap<Uuid, Invitation>,
    memberships: HashMap<RoomId, Membership>,
}

pub struct MemoryStore {
    state: RwLock<MemoryState>,
    feed: ChangeFeed,
    clock: ServerClock,
    fail_writes: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_feed_capacity(256)
    }

    /// `capacity` is how many comment changes a feed subscriber may fall
    /// behind before it lags.
    pub fn with_feed_capacity(capacity: usize) -> Self {
        Self {
            state: RwLock::new(MemoryState::default()),
            feed: ChangeFeed::new(capacity),
            clock: ServerClock::starting_after(0),
            fail_writes: AtomicBool::new(false),
        }
    }

    /// Make every subsequent write fail with `DatabaseError`.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    fn check_writable(&self) -> Result<(), StoreError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::DatabaseError("write rejected (store unavailable)".into()));
        }
        Ok(())
    }

    /// Number of persisted operations across all rooms.
    pub async fn operation_count(&self) -> usize {
        self.state.read().await.operations.values().map(Vec::len).sum()
    }

    /// Participants currently registered by the join procedure.
    pub async fn participant_count(&self, room_id: RoomId) -> u32 {
        self.state
            .read()
            .await
            .memberships
            .get(&room_id)
            .map_or(0, |m| m.members.len() as u32)
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn sorted_comments(mut comments: Vec<Comment>) -> Vec<Comment> {
    comments.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
    comments
}

#[async_trait]
impl DurableStore for MemoryStore {
    async fn create_room(&self, new: NewRoom) -> Result<Room, StoreError> {
        self.check_writable()?;
        let mut state = self.state.write().await;

        let duplicate = state
            .rooms
            .values()
            .any(|r| r.resource_type == new.resource_type && r.resource_id == new.resource_id);
        if duplicate {
            return Err(StoreError::Invalid(format!(
                "room already exists for {}/{}",
                new.resource_type, new.resource_id
            )));
        }

        let now = now_millis();
        let room = Room {
            id: Uuid::new_v4(),
            resource_type: new.resource_type,
            resource_id: new.resource_id,
            name: new.name,
            created_by: new.created_by,
            is_public: new.is_public,
            max_participants: new.max_participants,
            settings: new.settings,
            created_at: now,
            updated_at: now,
        };
        state.rooms.insert(room.id, room.clone());
        Ok(room)
    }

    async fn get_room(&self, room_id: RoomId) -> Result<Room, StoreError> {
        self.state
            .read()
            .await
            .rooms
            .get(&room_id)
            .cloned()
            .ok_or_else(|| StoreError::room_not_found(room_id))
    }

    async fn find_room(
        &self,
        resource_type: &ResourceType,
        resource_id: &str,
    ) -> Result<Option<Room>, StoreError> {
        Ok(self
            .state
            .read()
            .await
            .rooms
            .values()
            .find(|r| &r.resource_type == resource_type && r.resource_id == resource_id)
            .cloned())
    }

    async fn update_room_settings(&self, room_id: RoomId, settings: Value) -> Result<Room, StoreError> {
        self.check_writable()?;
        let mut state = self.state.write().await;
        let room = state
            .rooms
            .get_mut(&room_id)
            .ok_or_else(|| StoreError::room_not_found(room_id))?;
        room.settings = settings;
        room.updated_at = now_millis();
        Ok(room.clone())
    }

    async fn delete_room(&self, room_id: RoomId) -> Result<(), StoreError> {
        self.check_writable()?;
        let mut state = self.state.write().await;
        if state.rooms.remove(&room_id).is_none() {
            return Err(StoreError::room_not_found(room_id));
        }
        state.operations.remove(&room_id);
        state.memberships.remove(&room_id);
        state.comments.retain(|_, c| c.room_id != room_id);
        state.invitations.retain(|_, i| i.room_id != room_id);
        drop(state);
        self.feed.close(room_id);
        Ok(())
    }

    async fn join_room(&self, room_id: RoomId, user_id: UserId) -> Result<JoinReceipt, StoreError> {
        self.check_writable()?;
        let mut state = self.state.write().await;
        let max = state
            .rooms
            .get(&room_id)
            .ok_or_else(|| StoreError::room_not_found(room_id))?
            .max_participants;

        let membership = state.memberships.entry(room_id).or_default();
        let slot = match membership.members.get(&user_id) {
            Some(slot) => *slot,
            None => {
                if membership.members.len() as u32 >= max {
                    return Err(StoreError::Invalid(format!("room {room_id} is full ({max})")));
                }
                let slot = membership.next_slot;
                membership.next_slot += 1;
                membership.members.insert(user_id, slot);
                slot
            }
        };

        Ok(JoinReceipt {
            participant_count: membership.members.len() as u32,
            color: CursorColor::assign(slot, user_id),
        })
    }

    async fn leave_room(&self, room_id: RoomId, user_id: UserId) -> Result<u32, StoreError> {
        self.check_writable()?;
        let mut state = self.state.write().await;
        if !state.rooms.contains_key(&room_id) {
            return Err(StoreError::room_not_found(room_id));
        }
        let membership = state.memberships.entry(room_id).or_default();
        membership.members.remove(&user_id);
        Ok(membership.members.len() as u32)
    }

    async fn append_operation(&self, new: NewOperation) -> Result<Operation, StoreError> {
        self.check_writable()?;
        let mut state = self.state.write().await;
        if !state.rooms.contains_key(&new.room_id) {
            return Err(StoreError::room_not_found(new.room_id));
        }
        let room_id = new.room_id;
        let operation = Operation::from_new(new, Uuid::new_v4(), self.clock.next());
        state.operations.entry(room_id).or_default().push(operation.clone());
        Ok(operation)
    }

    async fn operations_since(
        &self,
        room_id: RoomId,
        since: Option<u64>,
        limit: usize,
    ) -> Result<Vec<Operation>, StoreError> {
        let state = self.state.read().await;
        if !state.rooms.contains_key(&room_id) {
            return Err(StoreError::room_not_found(room_id));
        }
        let since = since.unwrap_or(0);
        // Appends carry strictly increasing timestamps, so the vector is sorted.
        Ok(state
            .operations
            .get(&room_id)
            .map(|ops| {
                ops.iter()
                    .filter(|op| op.timestamp > since)
                    .take(limit)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn insert_comment(&self, new: NewComment) -> Result<Comment, StoreError> {
        self.check_writable()?;
        let mut state = self.state.write().await;
        if !state.rooms.contains_key(&new.room_id) {
            return Err(StoreError::room_not_found(new.room_id));
        }
        if let Some(parent_id) = new.parent_id {
            let parent = state
                .comments
                .get(&parent_id)
                .ok_or_else(|| StoreError::comment_not_found(parent_id))?;
            validate_parent(parent, new.room_id)?;
        }

        let now = self.clock.next();
        let comment = Comment {
            id: Uuid::new_v4(),
            room_id: new.room_id,
            author_id: new.author.user_id,
            author: new.author,
            content: new.content,
            position_data: new.position_data,
            parent_id: new.parent_id,
            resolved: false,
            created_at: now,
            updated_at: now,
        };
        state.comments.insert(comment.id, comment.clone());
        drop(state);

        self.feed.publish(
            comment.room_id,
            CommentChange {
                comment: comment.clone(),
                action: CommentAction::Created,
            },
        );
        Ok(comment)
    }

    async fn get_comment(&self, comment_id: Uuid) -> Result<Comment, StoreError> {
        self.state
            .read()
            .await
            .comments
            .get(&comment_id)
            .cloned()
            .ok_or_else(|| StoreError::comment_not_found(comment_id))
    }

    async fn top_level_comments(&self, room_id: RoomId) -> Result<Vec<Comment>, StoreError> {
        let state = self.state.read().await;
        Ok(sorted_comments(
            state
                .comments
                .values()
                .filter(|c| c.room_id == room_id && c.parent_id.is_none())
                .cloned()
                .collect(),
        ))
    }

    async fn replies(&self, parent_id: Uuid) -> Result<Vec<Comment>, StoreError> {
        let state = self.state.read().await;
        Ok(sorted_comments(
            state
                .comments
                .values()
                .filter(|c| c.parent_id == Some(parent_id))
                .cloned()
                .collect(),
        ))
    }

    async fn set_comment_resolved(&self, comment_id: Uuid, resolved: bool) -> Result<Comment, StoreError> {
        self.check_writable()?;
        let mut state = self.state.write().await;
        let comment = state
            .comments
            .get_mut(&comment_id)
            .ok_or_else(|| StoreError::comment_not_found(comment_id))?;
        if comment.resolved == resolved {
            return Ok(comment.clone());
        }
        comment.resolved = resolved;
        comment.updated_at = now_millis();
        let updated = comment.clone();
        drop(state);

        self.feed.publish(
            updated.room_id,
            CommentChange {
                comment: updated.clone(),
                action: CommentAction::Updated,
            },
        );
        Ok(updated)
    }

    fn comment_changes(&self, room_id: RoomId) -> broadcast::Receiver<CommentChange> {
        self.feed.subscribe(room_id)
    }

    async fn create_invitation(&self, new: NewInvitation) -> Result<Invitation, StoreError> {
        self.check_writable()?;
        let mut state = self.state.write().await;
        if !state.rooms.contains_key(&new.room_id) {
            return Err(StoreError::room_not_found(new.room_id));
        }
        let invitation = Invitation {
            id: Uuid::new_v4(),
            room_id: new.room_id,
            inviter_id: new.inviter_id,
            invitee: new.invitee,
            permission_level: new.permission_level,
            status: InvitationStatus::Pending,
            created_at: self.clock.next(),
            expires_at: new.expires_at,
        };
        state.invitations.insert(invitation.id, invitation.clone());
        Ok(invitation)
    }

    async fn get_invitation(&self, invitation_id: Uuid) -> Result<Invitation, StoreError> {
        self.state
            .read()
            .await
            .invitations
            .get(&invitation_id)
            .cloned()
            .ok_or_else(|| StoreError::invitation_not_found(invitation_id))
    }

    async fn invitations(&self, room_id: RoomId) -> Result<Vec<Invitation>, StoreError> {
        let state = self.state.read().await;
        let mut list: Vec<Invitation> = state
            .invitations
            .values()
            .filter(|i| i.room_id == room_id)
            .cloned()
            .collect();
        list.sort_by_key(|i| i.created_at);
        Ok(list)
    }

    async fn set_invitation_status(
        &self,
        invitation_id: Uuid,
        status: InvitationStatus,
    ) -> Result<Invitation, StoreError> {
        self.check_writable()?;
        let mut state = self.state.write().await;
        let invitation = state
            .invitations
            .get_mut(&invitation_id)
            .ok_or_else(|| StoreError::invitation_not_found(invitation_id))?;
        invitation.status = status;
        Ok(invitation.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::VectorClock;
    use crate::model::{AuthorProfile, Invitee, PermissionLevel};

    fn new_room(resource_id: &str) -> NewRoom {
        NewRoom {
            resource_type: ResourceType::Design,
            resource_id: resource_id.into(),
            name: "Landing page".into(),
            created_by: Uuid::new_v4(),
            is_public: false,
            max_participants: 3,
            settings: Value::Null,
        }
    }

    fn new_op(room_id: RoomId) -> NewOperation {
        NewOperation {
            room_id,
            user_id: Uuid::new_v4(),
            operation_type: "update".into(),
            target_type: "layer".into(),
            target_id: None,
            data: Value::Null,
            vector_clock: VectorClock::new(),
            client_timestamp: 0,
        }
    }

    fn author() -> AuthorProfile {
        AuthorProfile {
            user_id: Uuid::new_v4(),
            display_name: "Alice".into(),
            avatar_url: None,
        }
    }

    fn new_comment(room_id: RoomId, parent_id: Option<Uuid>) -> NewComment {
        NewComment {
            room_id,
            author: author(),
            content: "looks good".into(),
            position_data: None,
            parent_id,
        }
    }

    #[tokio::test]
    async fn test_room_per_resource_pair() {
        let store = MemoryStore::new();
        let room = store.create_room(new_room("design-1")).await.unwrap();

        let found = store.find_room(&ResourceType::Design, "design-1").await.unwrap();
        assert_eq!(found.map(|r| r.id), Some(room.id));
        assert!(store.find_room(&ResourceType::Template, "design-1").await.unwrap().is_none());
        assert!(matches!(
            store.create_room(new_room("design-1")).await,
            Err(StoreError::Invalid(_))
        ));
    }

    #[tokio::test]
    async fn test_join_assigns_palette_colors_in_order() {
        let store = MemoryStore::new();
        let room = store.create_room(new_room("d")).await.unwrap();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();

        let ra = store.join_room(room.id, a).await.unwrap();
        let rb = store.join_room(room.id, b).await.unwrap();
        let ra_again = store.join_room(room.id, a).await.unwrap();

        assert_eq!(ra.color, CursorColor::for_slot(0));
        assert_eq!(rb.color, CursorColor::for_slot(1));
        assert_eq!(ra_again.color, ra.color);
        assert_eq!(rb.participant_count, 2);
        assert_eq!(store.leave_room(room.id, a).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_join_rejects_full_room() {
        let store = MemoryStore::new();
        let room = store.create_room(new_room("d")).await.unwrap();
        for _ in 0..3 {
            store.join_room(room.id, Uuid::new_v4()).await.unwrap();
        }
        assert!(matches!(
            store.join_room(room.id, Uuid::new_v4()).await,
            Err(StoreError::Invalid(_))
        ));
    }

    #[tokio::test]
    async fn test_operations_ordered_and_paged() {
        let store = MemoryStore::new();
        let room = store.create_room(new_room("d")).await.unwrap();
        let mut stamps = Vec::new();
        for _ in 0..5 {
            stamps.push(store.append_operation(new_op(room.id)).await.unwrap().timestamp);
        }
        assert!(stamps.windows(2).all(|w| w[0] < w[1]));

        let page = store.operations_since(room.id, None, 3).await.unwrap();
        assert_eq!(page.len(), 3);
        let rest = store
            .operations_since(room.id, Some(page[2].timestamp), 100)
            .await
            .unwrap();
        assert_eq!(rest.len(), 2);
        assert_eq!(rest[0].timestamp, stamps[3]);
    }

    #[tokio::test]
    async fn test_failed_write_persists_nothing() {
        let store = MemoryStore::new();
        let room = store.create_room(new_room("d")).await.unwrap();
        store.set_fail_writes(true);
        assert!(store.append_operation(new_op(room.id)).await.is_err());
        store.set_fail_writes(false);
        assert_eq!(store.operation_count().await, 0);
    }

    #[tokio::test]
    async fn test_replies_one_level_only() {
        let store = MemoryStore::new();
        let room = store.create_room(new_room("d")).await.unwrap();
        let root = store.insert_comment(new_comment(room.id, None)).await.unwrap();
        let reply = store.insert_comment(new_comment(room.id, Some(root.id))).await.unwrap();

        assert!(matches!(
            store.insert_comment(new_comment(room.id, Some(reply.id))).await,
            Err(StoreError::Invalid(_))
        ));
        assert_eq!(store.top_level_comments(room.id).await.unwrap().len(), 1);
        assert_eq!(store.replies(root.id).await.unwrap(), vec![reply]);
    }

    #[tokio::test]
    async fn test_resolve_notifies_only_on_change() {
        let store = MemoryStore::new();
        let room = store.create_room(new_room("d")).await.unwrap();
        let mut changes = store.comment_changes(room.id);
        let c = store.insert_comment(new_comment(room.id, None)).await.unwrap();
        assert_eq!(changes.recv().await.unwrap().action, CommentAction::Created);

        store.set_comment_resolved(c.id, true).await.unwrap();
        store.set_comment_resolved(c.id, true).await.unwrap();

        assert_eq!(changes.recv().await.unwrap().action, CommentAction::Updated);
        assert!(changes.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_delete_room_cascades() {
        let store = MemoryStore::new();
        let room = store.create_room(new_room("d")).await.unwrap();
        store.append_operation(new_op(room.id)).await.unwrap();
        store.insert_comment(new_comment(room.id, None)).await.unwrap();
        store
            .create_invitation(NewInvitation {
                room_id: room.id,
                inviter_id: room.created_by,
                invitee: Invitee::Email("bob@example.com".into()),
                permission_level: PermissionLevel::Comment,
                expires_at: u64::MAX,
            })
            .await
            .unwrap();

        store.delete_room(room.id).await.unwrap();

        assert!(matches!(store.get_room(room.id).await, Err(StoreError::NotFound(_))));
        assert_eq!(store.operation_count().await, 0);
        assert!(store.top_level_comments(room.id).await.unwrap().is_empty());
        assert!(store.invitations(room.id).await.unwrap().is_empty());
    }
}
