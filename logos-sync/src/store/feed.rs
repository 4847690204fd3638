//! Per-room push notifications for comment changes.
//!
//! One `tokio::sync::broadcast` channel per room, created lazily on first
//! subscribe. Publishing to a room nobody watches is a no-op.

use std::collections::HashMap;
use std::sync::Mutex;
use tokio::sync::broadcast;

use crate::model::{CommentChange, RoomId};

pub struct ChangeFeed {
    rooms: Mutex<HashMap<RoomId, broadcast::Sender<CommentChange>>>,
    capacity: usize,
}

impl ChangeFeed {
    pub fn new(capacity: usize) -> Self {
        Self {
            rooms: Mutex::new(HashMap::new()),
            capacity,
        }
    }

    pub fn subscribe(&self, room_id: RoomId) -> broadcast::Receiver<CommentChange> {
        let mut rooms = self.rooms.lock().unwrap_or_else(|e| e.into_inner());
        rooms
            .entry(room_id)
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe()
    }

    /// Returns the number of subscribers that received the change.
    pub fn publish(&self, room_id: RoomId, change: CommentChange) -> usize {
        let mut rooms = self.rooms.lock().unwrap_or_else(|e| e.into_inner());
        let Some(sender) = rooms.get(&room_id) else {
            return 0;
        };
        match sender.send(change) {
            Ok(n) => n,
            Err(_) => {
                // Every receiver is gone; drop the channel.
                rooms.remove(&room_id);
                0
            }
        }
    }

    /// Forget a deleted room.
    pub fn close(&self, room_id: RoomId) {
        let mut rooms = self.rooms.lock().unwrap_or_else(|e| e.into_inner());
        rooms.remove(&room_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{AuthorProfile, Comment, CommentAction};
    use uuid::Uuid;

    fn change(room_id: RoomId) -> CommentChange {
        let author = Uuid::new_v4();
        CommentChange {
            comment: Comment {
                id: Uuid::new_v4(),
                room_id,
                author_id: author,
                author: AuthorProfile {
                    user_id: author,
                    display_name: "Alice".into(),
                    avatar_url: None,
                },
                content: "hi".into(),
                position_data: None,
                parent_id: None,
                resolved: false,
                created_at: 1,
                updated_at: 1,
            },
            action: CommentAction::Created,
        }
    }

    #[tokio::test]
    async fn test_publish_reaches_room_subscribers_only() {
        let feed = ChangeFeed::new(16);
        let room_a = Uuid::new_v4();
        let room_b = Uuid::new_v4();
        let mut rx_a = feed.subscribe(room_a);
        let mut rx_b = feed.subscribe(room_b);

        assert_eq!(feed.publish(room_a, change(room_a)), 1);

        assert_eq!(rx_a.recv().await.unwrap().comment.room_id, room_a);
        assert!(rx_b.try_recv().is_err());
    }

    #[test]
    fn test_publish_without_subscribers() {
        let feed = ChangeFeed::new(16);
        let room = Uuid::new_v4();
        assert_eq!(feed.publish(room, change(room)), 0);
        let rx = feed.subscribe(room);
        drop(rx);
        assert_eq!(feed.publish(room, change(room)), 0);
    }
}
