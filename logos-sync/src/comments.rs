//! Comment thread helpers: input validation and the two-phase fetch.
//!
//! ```text
//! phase 1: top_level_comments(room)      → [root₁, root₂, …]   oldest first
//! phase 2: replies(rootᵢ) for each root  → [reply, …]          oldest first
//!          ──────────────────────────────────────────────────
//!          Vec<CommentThread { root, replies }>
//! ```
//!
//! Comment changes reach other clients through the store's change feed,
//! never through the room broadcast channel.

use serde_json::Value;
use uuid::Uuid;

use crate::error::CollabError;
use crate::model::{AuthorProfile, CommentThread, NewComment, RoomId};
use crate::store::DurableStore;

/// Trimmed, non-empty, bounded content.
pub fn validate_content(content: &str, max_len: usize) -> Result<String, CollabError> {
    let trimmed = content.trim();
    if trimmed.is_empty() {
        return Err(CollabError::Validation("comment content is empty".into()));
    }
    if trimmed.len() > max_len {
        return Err(CollabError::Validation(format!(
            "comment content exceeds {max_len} bytes"
        )));
    }
    Ok(trimmed.to_string())
}

/// Build the store request for a new comment or reply.
pub fn new_comment(
    room_id: RoomId,
    author: AuthorProfile,
    content: &str,
    position_data: Option<Value>,
    parent_id: Option<Uuid>,
    max_len: usize,
) -> Result<NewComment, CollabError> {
    Ok(NewComment {
        room_id,
        author,
        content: validate_content(content, max_len)?,
        position_data,
        parent_id,
    })
}

/// Fetch a room's threads: roots first, then each root's replies.
pub async fn load_threads(
    store: &dyn DurableStore,
    room_id: RoomId,
) -> Result<Vec<CommentThread>, CollabError> {
    let roots = store.top_level_comments(room_id).await?;
    let mut threads = Vec::with_capacity(roots.len());
    for root in roots {
        let replies = store.replies(root.id).await?;
        threads.push(CommentThread { root, replies });
    }
    Ok(threads)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{NewRoom, ResourceType};
    use crate::store::MemoryStore;

    fn author() -> AuthorProfile {
        AuthorProfile {
            user_id: Uuid::new_v4(),
            display_name: "Lee".into(),
            avatar_url: Some("https://avatars.example/lee.png".into()),
        }
    }

    #[test]
    fn test_content_trimmed() {
        assert_eq!(validate_content("  ship it \n", 100).unwrap(), "ship it");
    }

    #[test]
    fn test_empty_content_rejected() {
        assert!(matches!(
            validate_content("   ", 100),
            Err(CollabError::Validation(_))
        ));
    }

    #[test]
    fn test_long_content_rejected() {
        assert!(validate_content(&"x".repeat(11), 10).is_err());
    }

    #[tokio::test]
    async fn test_threads_assembled_in_order() {
        let store = MemoryStore::new();
        let room = store
            .create_room(NewRoom {
                resource_type: ResourceType::Design,
                resource_id: "poster".into(),
                name: "Poster".into(),
                created_by: Uuid::new_v4(),
                is_public: false,
                max_participants: 10,
                settings: Value::Null,
            })
            .await
            .unwrap();

        let first = store
            .insert_comment(new_comment(room.id, author(), "first", None, None, 100).unwrap())
            .await
            .unwrap();
        let second = store
            .insert_comment(new_comment(room.id, author(), "second", None, None, 100).unwrap())
            .await
            .unwrap();
        let reply = store
            .insert_comment(new_comment(room.id, author(), "reply", None, Some(first.id), 100).unwrap())
            .await
            .unwrap();

        let threads = load_threads(&store, room.id).await.unwrap();
        assert_eq!(threads.len(), 2);
        assert_eq!(threads[0].root.id, first.id);
        assert_eq!(threads[0].replies, vec![reply]);
        assert_eq!(threads[1].root.id, second.id);
        assert!(threads[1].replies.is_empty());
    }
}
