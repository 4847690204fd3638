//! Multi-subscriber observer lists, one per event kind.
//!
//! Handlers run synchronously on the thread driving the session, in
//! subscription order. Any number of UI surfaces can observe the same
//! session; each holds a [`SubscriptionId`] to detach itself.

use serde_json::Value;
use uuid::Uuid;

use crate::error::CollabError;
use crate::model::{CommentAction, CommentChange, Operation, Participant, RoomId, UserId};

/// Handle returned by `subscribe`, used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type Handler<E> = Box<dyn FnMut(&E) + Send>;

/// Ordered list of handlers for one event kind.
pub struct Observers<E> {
    next_id: u64,
    handlers: Vec<(SubscriptionId, Handler<E>)>,
}

impl<E> Observers<E> {
    pub fn new() -> Self {
        Self {
            next_id: 0,
            handlers: Vec::new(),
        }
    }

    pub fn subscribe(&mut self, handler: impl FnMut(&E) + Send + 'static) -> SubscriptionId {
        self.next_id += 1;
        let id = SubscriptionId(self.next_id);
        self.handlers.push((id, Box::new(handler)));
        id
    }

    /// Returns `false` if the id was not subscribed.
    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        let before = self.handlers.len();
        self.handlers.retain(|(sid, _)| *sid != id);
        self.handlers.len() != before
    }

    pub fn notify(&mut self, event: &E) {
        for (_, handler) in self.handlers.iter_mut() {
            handler(event);
        }
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl<E> Default for Observers<E> {
    fn default() -> Self {
        Self::new()
    }
}

/// Activity broadcast from a remote participant.
#[derive(Debug, Clone, PartialEq)]
pub struct ActivityEvent {
    pub user_id: UserId,
    pub kind: String,
    pub detail: Value,
}

/// A remote participant hinted that a comment changed.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CommentHintEvent {
    pub user_id: UserId,
    pub comment_id: Uuid,
    pub action: CommentAction,
}

/// The comment feed overflowed and `missed` changes were never delivered.
///
/// Observers should refetch threads with `get_comments`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CommentResync {
    pub room_id: RoomId,
    pub missed: u64,
}

/// Two operations touched the same target with incomparable clocks.
///
/// Both have been (or will be) delivered; choosing a winner is left to
/// the observer.
#[derive(Debug, Clone, PartialEq)]
pub struct OperationConflict {
    pub known: Operation,
    pub incoming: Operation,
}

/// Every observer list exposed by a client.
#[derive(Default)]
pub struct SessionObservers {
    pub presence: Observers<Vec<Participant>>,
    pub operation: Observers<Operation>,
    pub conflict: Observers<OperationConflict>,
    pub comment: Observers<CommentChange>,
    pub comment_hint: Observers<CommentHintEvent>,
    pub comment_resync: Observers<CommentResync>,
    pub activity: Observers<ActivityEvent>,
    pub connection: Observers<bool>,
    pub error: Observers<CollabError>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[test]
    fn test_all_subscribers_notified_in_order() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut observers: Observers<u32> = Observers::new();

        let a = seen.clone();
        observers.subscribe(move |v| a.lock().unwrap().push(("a", *v)));
        let b = seen.clone();
        observers.subscribe(move |v| b.lock().unwrap().push(("b", *v)));

        observers.notify(&7);

        assert_eq!(*seen.lock().unwrap(), vec![("a", 7), ("b", 7)]);
    }

    #[test]
    fn test_unsubscribe() {
        let count = Arc::new(Mutex::new(0));
        let mut observers: Observers<()> = Observers::new();

        let c = count.clone();
        let id = observers.subscribe(move |_| *c.lock().unwrap() += 1);
        observers.notify(&());
        assert!(observers.unsubscribe(id));
        observers.notify(&());

        assert_eq!(*count.lock().unwrap(), 1);
        assert!(!observers.unsubscribe(id));
        assert!(observers.is_empty());
    }

    #[test]
    fn test_ids_are_unique() {
        let mut observers: Observers<()> = Observers::new();
        let a = observers.subscribe(|_| {});
        let b = observers.subscribe(|_| {});
        assert_ne!(a, b);
        assert_eq!(observers.len(), 2);
    }
}
