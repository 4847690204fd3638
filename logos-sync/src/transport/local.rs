//! In-process pub/sub hub: one broadcast group per room.
//!
//! Uses tokio broadcast channels for O(1) send to all subscribers. Each
//! channel gets an independent receiver that buffers up to `capacity`
//! frames; a lagging receiver drops the overflow (at-most-once delivery).
//! Presence is the exception: after a lag the channel yields a fresh
//! snapshot, since a missed leave would otherwise never be corrected.
//!
//! ```text
//! LocalChannel A ──┐                         ┌──► LocalChannel A
//!                  ├── RoomGroup(room_id) ───┼──► LocalChannel B
//! LocalChannel B ──┘   presence map          └──► LocalChannel C
//!                      broadcast::Sender<Arc<HubFrame>>
//! ```
//!
//! The relay server runs every WebSocket connection through a hub channel,
//! so the same fan-out code serves in-process tests and networked clients.
//!
//! Reference: Patterson & Hennessy, Section 6.4 — Interconnection Networks

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tokio::sync::{broadcast, watch, RwLock};

use super::{Channel, ChannelEvent, SubscribeOptions, Transport, TransportError};
use crate::model::{Participant, RoomId, UserId};

/// Frame fanned out inside a room group.
#[derive(Debug)]
enum HubFrame {
    Join(Participant),
    Leave(UserId),
    Sync(Vec<Participant>),
    Broadcast { sender: UserId, payload: Vec<u8> },
}

/// Hub-wide statistics.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HubStats {
    pub rooms: usize,
    pub connections: usize,
    pub messages_relayed: u64,
    pub messages_dropped: u64,
}

struct Connection {
    user_id: UserId,
    closed: watch::Sender<bool>,
}

/// Broadcast group for a single room.
struct RoomGroup {
    room_id: RoomId,
    sender: broadcast::Sender<Arc<HubFrame>>,
    presence: Mutex<HashMap<UserId, Participant>>,
    connections: Mutex<HashMap<u64, Connection>>,
    next_connection: AtomicU64,
    relayed: AtomicU64,
    dropped: AtomicU64,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

impl RoomGroup {
    fn new(room_id: RoomId, capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            room_id,
            sender,
            presence: Mutex::new(HashMap::new()),
            connections: Mutex::new(HashMap::new()),
            next_connection: AtomicU64::new(0),
            relayed: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    fn publish(&self, frame: HubFrame) -> usize {
        self.relayed.fetch_add(1, Ordering::Relaxed);
        // No receivers is not an error for fire-and-forget delivery
        self.sender.send(Arc::new(frame)).unwrap_or(0)
    }

    fn snapshot(presence: &HashMap<UserId, Participant>) -> Vec<Participant> {
        let mut list: Vec<Participant> = presence.values().cloned().collect();
        list.sort_by(|a, b| a.joined_at.cmp(&b.joined_at).then(a.user_id.cmp(&b.user_id)));
        list
    }

    fn presence_snapshot(&self) -> Vec<Participant> {
        Self::snapshot(&lock(&self.presence))
    }

    fn track(&self, participant: Participant) {
        let snapshot = {
            let mut presence = lock(&self.presence);
            presence.insert(participant.user_id, participant.clone());
            Self::snapshot(&presence)
        };
        self.publish(HubFrame::Join(participant));
        self.publish(HubFrame::Sync(snapshot));
    }

    fn untrack(&self, user_id: UserId) -> bool {
        let snapshot = {
            let mut presence = lock(&self.presence);
            if presence.remove(&user_id).is_none() {
                return false;
            }
            Self::snapshot(&presence)
        };
        self.publish(HubFrame::Leave(user_id));
        self.publish(HubFrame::Sync(snapshot));
        true
    }

    fn register(&self, user_id: UserId) -> (u64, watch::Receiver<bool>) {
        let id = self.next_connection.fetch_add(1, Ordering::Relaxed);
        let (closed, closed_rx) = watch::channel(false);
        lock(&self.connections).insert(id, Connection { user_id, closed });
        (id, closed_rx)
    }

    fn deregister(&self, connection_id: u64) {
        lock(&self.connections).remove(&connection_id);
    }

    /// Close every connection of `user_id` as if the network dropped it.
    fn disconnect(&self, user_id: UserId) -> usize {
        let closed = {
            let mut connections = lock(&self.connections);
            let ids: Vec<u64> = connections
                .iter()
                .filter(|(_, c)| c.user_id == user_id)
                .map(|(id, _)| *id)
                .collect();
            for id in &ids {
                if let Some(connection) = connections.remove(id) {
                    let _ = connection.closed.send(true);
                }
            }
            ids.len()
        };
        if closed > 0 {
            self.untrack(user_id);
        }
        closed
    }

    fn connection_count(&self) -> usize {
        lock(&self.connections).len()
    }
}

/// In-process transport. Cheap to clone; clones share rooms.
#[derive(Clone)]
pub struct LocalHub {
    rooms: Arc<RwLock<HashMap<RoomId, Arc<RoomGroup>>>>,
    capacity: usize,
}

impl LocalHub {
    /// `capacity` is the per-receiver buffer before lagging channels drop frames.
    pub fn new(capacity: usize) -> Self {
        Self {
            rooms: Arc::new(RwLock::new(HashMap::new())),
            capacity,
        }
    }

    async fn get_or_create(&self, room_id: RoomId) -> Arc<RoomGroup> {
        {
            let rooms = self.rooms.read().await;
            if let Some(room) = rooms.get(&room_id) {
                return room.clone();
            }
        }

        let mut rooms = self.rooms.write().await;
        if let Some(room) = rooms.get(&room_id) {
            return room.clone();
        }
        let room = Arc::new(RoomGroup::new(room_id, self.capacity));
        rooms.insert(room_id, room.clone());
        room
    }

    /// Open a channel with the concrete type.
    pub async fn open(&self, room_id: RoomId, user_id: UserId, options: SubscribeOptions) -> LocalChannel {
        let group = self.get_or_create(room_id).await;
        // Subscribe before snapshotting so no presence change falls in between
        let receiver = group.sender.subscribe();
        let (connection_id, closed) = group.register(user_id);
        let mut pending = VecDeque::new();
        pending.push_back(ChannelEvent::PresenceSync(group.presence_snapshot()));
        log::debug!("Channel {connection_id} opened on room {room_id} for {user_id}");

        LocalChannel {
            group,
            user_id,
            options,
            connection_id,
            receiver,
            closed,
            pending,
            tracked: false,
            finished: false,
        }
    }

    /// Simulate a network drop: every channel of `user_id` in the room
    /// yields `Closed`, and the user's presence is removed for everyone else.
    pub async fn drop_connection(&self, room_id: RoomId, user_id: UserId) -> usize {
        let group = self.rooms.read().await.get(&room_id).cloned();
        match group {
            Some(group) => {
                let closed = group.disconnect(user_id);
                log::info!("Dropped {closed} connection(s) of {user_id} in room {room_id}");
                closed
            }
            None => 0,
        }
    }

    /// Presence currently tracked in a room.
    pub async fn presence(&self, room_id: RoomId) -> Vec<Participant> {
        match self.rooms.read().await.get(&room_id) {
            Some(group) => group.presence_snapshot(),
            None => Vec::new(),
        }
    }

    /// Remove groups with no open channels. Returns how many were removed.
    pub async fn prune_idle(&self) -> usize {
        let mut rooms = self.rooms.write().await;
        let before = rooms.len();
        rooms.retain(|_, group| group.connection_count() > 0);
        before - rooms.len()
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    pub async fn stats(&self) -> HubStats {
        let rooms = self.rooms.read().await;
        rooms.values().fold(
            HubStats {
                rooms: rooms.len(),
                ..HubStats::default()
            },
            |mut stats, group| {
                stats.connections += group.connection_count();
                stats.messages_relayed += group.relayed.load(Ordering::Relaxed);
                stats.messages_dropped += group.dropped.load(Ordering::Relaxed);
                stats
            },
        )
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Default for LocalHub {
    fn default() -> Self {
        Self::new(256)
    }
}

#[async_trait]
impl Transport for LocalHub {
    async fn subscribe(
        &self,
        room_id: RoomId,
        user_id: UserId,
        options: SubscribeOptions,
    ) -> Result<Box<dyn Channel>, TransportError> {
        Ok(Box::new(self.open(room_id, user_id, options).await))
    }
}

/// A subscription to one hub room.
///
/// Dropping a tracked channel without unsubscribing untracks it, the same
/// way a server notices a vanished socket.
pub struct LocalChannel {
    group: Arc<RoomGroup>,
    user_id: UserId,
    options: SubscribeOptions,
    connection_id: u64,
    receiver: broadcast::Receiver<Arc<HubFrame>>,
    closed: watch::Receiver<bool>,
    pending: VecDeque<ChannelEvent>,
    tracked: bool,
    finished: bool,
}

impl LocalChannel {
    pub fn room_id(&self) -> RoomId {
        self.group.room_id
    }

    pub fn user_id(&self) -> UserId {
        self.user_id
    }

    fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    fn ensure_open(&self) -> Result<(), TransportError> {
        if self.finished || self.is_closed() {
            return Err(TransportError::Closed);
        }
        Ok(())
    }

    fn translate(&self, frame: &HubFrame) -> Option<ChannelEvent> {
        match frame {
            HubFrame::Join(p) => Some(ChannelEvent::PresenceJoin(p.clone())),
            HubFrame::Leave(id) => Some(ChannelEvent::PresenceLeave(*id)),
            HubFrame::Sync(list) => Some(ChannelEvent::PresenceSync(list.clone())),
            HubFrame::Broadcast { sender, payload } => {
                if *sender == self.user_id && !self.options.receive_own {
                    return None;
                }
                Some(ChannelEvent::Broadcast {
                    sender: *sender,
                    payload: payload.clone(),
                })
            }
        }
    }

    fn finish(&mut self) -> ChannelEvent {
        self.finished = true;
        self.tracked = false;
        self.group.deregister(self.connection_id);
        ChannelEvent::Closed
    }

    /// Count the loss and resync presence from the group's live map.
    fn lagged(&mut self, n: u64) -> ChannelEvent {
        self.group.dropped.fetch_add(n, Ordering::Relaxed);
        log::warn!(
            "Channel {} on room {} lagged by {n} frames, resyncing presence",
            self.connection_id,
            self.group.room_id
        );
        ChannelEvent::PresenceSync(self.group.presence_snapshot())
    }
}

#[async_trait]
impl Channel for LocalChannel {
    async fn track(&mut self, participant: &Participant) -> Result<(), TransportError> {
        self.ensure_open()?;
        if participant.user_id != self.user_id {
            return Err(TransportError::SendFailed(format!(
                "channel of {} cannot track {}",
                self.user_id, participant.user_id
            )));
        }
        self.group.track(participant.clone());
        self.tracked = true;
        Ok(())
    }

    async fn untrack(&mut self) -> Result<(), TransportError> {
        self.ensure_open()?;
        if self.tracked {
            self.group.untrack(self.user_id);
            self.tracked = false;
        }
        Ok(())
    }

    async fn send(&mut self, payload: Vec<u8>) -> Result<(), TransportError> {
        self.ensure_open()?;
        self.group.publish(HubFrame::Broadcast {
            sender: self.user_id,
            payload,
        });
        Ok(())
    }

    async fn recv(&mut self) -> Option<ChannelEvent> {
        if let Some(event) = self.pending.pop_front() {
            return Some(event);
        }
        loop {
            if self.finished {
                return None;
            }
            if self.is_closed() {
                return Some(self.finish());
            }
            tokio::select! {
                changed = self.closed.changed() => {
                    if changed.is_err() {
                        // Sender gone: the hub forgot this connection
                        return Some(self.finish());
                    }
                }
                frame = self.receiver.recv() => match frame {
                    Ok(frame) => {
                        if let Some(event) = self.translate(&frame) {
                            return Some(event);
                        }
                    }
                    Err(RecvError::Lagged(n)) => return Some(self.lagged(n)),
                    Err(RecvError::Closed) => return Some(self.finish()),
                },
            }
        }
    }

    fn try_recv(&mut self) -> Option<ChannelEvent> {
        if let Some(event) = self.pending.pop_front() {
            return Some(event);
        }
        loop {
            if self.finished {
                return None;
            }
            if self.is_closed() {
                return Some(self.finish());
            }
            match self.receiver.try_recv() {
                Ok(frame) => {
                    if let Some(event) = self.translate(&frame) {
                        return Some(event);
                    }
                }
                Err(TryRecvError::Lagged(n)) => return Some(self.lagged(n)),
                Err(TryRecvError::Empty) => return None,
                Err(TryRecvError::Closed) => return Some(self.finish()),
            }
        }
    }

    async fn unsubscribe(&mut self) -> Result<(), TransportError> {
        if self.tracked {
            self.group.untrack(self.user_id);
            self.tracked = false;
        }
        if !self.finished {
            self.finished = true;
            self.group.deregister(self.connection_id);
            log::debug!("Channel {} closed on room {}", self.connection_id, self.group.room_id);
        }
        self.pending.clear();
        Ok(())
    }
}

impl Drop for LocalChannel {
    fn drop(&mut self) {
        if self.tracked {
            self.group.untrack(self.user_id);
        }
        if !self.finished {
            self.group.deregister(self.connection_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Identity;
    use crate::presence::CursorColor;
    use uuid::Uuid;

    fn participant(name: &str) -> Participant {
        Participant::new(&Identity::new(Uuid::new_v4(), name), CursorColor::default())
    }

    fn drain(channel: &mut LocalChannel) -> Vec<ChannelEvent> {
        std::iter::from_fn(|| channel.try_recv()).collect()
    }

    #[tokio::test]
    async fn test_get_or_create_shares_room() {
        let hub = LocalHub::new(16);
        let room = Uuid::new_v4();
        let _a = hub.open(room, Uuid::new_v4(), SubscribeOptions::default()).await;
        let _b = hub.open(room, Uuid::new_v4(), SubscribeOptions::default()).await;
        assert_eq!(hub.room_count().await, 1);
        assert_eq!(hub.stats().await.connections, 2);
    }

    #[tokio::test]
    async fn test_subscribe_starts_with_snapshot() {
        let hub = LocalHub::new(16);
        let room = Uuid::new_v4();
        let alice = participant("Alice");
        let mut a = hub.open(room, alice.user_id, SubscribeOptions::default()).await;
        a.track(&alice).await.unwrap();

        let mut b = hub.open(room, Uuid::new_v4(), SubscribeOptions::default()).await;
        assert_eq!(b.try_recv(), Some(ChannelEvent::PresenceSync(vec![alice])));
    }

    #[tokio::test]
    async fn test_track_emits_join_then_sync() {
        let hub = LocalHub::new(16);
        let room = Uuid::new_v4();
        let mut observer = hub.open(room, Uuid::new_v4(), SubscribeOptions::default()).await;
        drain(&mut observer);

        let alice = participant("Alice");
        let mut a = hub.open(room, alice.user_id, SubscribeOptions::default()).await;
        a.track(&alice).await.unwrap();

        assert_eq!(
            drain(&mut observer),
            vec![
                ChannelEvent::PresenceJoin(alice.clone()),
                ChannelEvent::PresenceSync(vec![alice]),
            ]
        );
    }

    #[tokio::test]
    async fn test_own_broadcasts_filtered_unless_requested() {
        let hub = LocalHub::new(16);
        let room = Uuid::new_v4();
        let user = Uuid::new_v4();
        let mut quiet = hub.open(room, user, SubscribeOptions::default()).await;
        let mut echo = hub
            .open(room, user, SubscribeOptions { receive_own: true })
            .await;
        drain(&mut quiet);
        drain(&mut echo);

        quiet.send(vec![1, 2, 3]).await.unwrap();

        assert!(drain(&mut quiet).is_empty());
        assert_eq!(
            drain(&mut echo),
            vec![ChannelEvent::Broadcast {
                sender: user,
                payload: vec![1, 2, 3]
            }]
        );
    }

    #[tokio::test]
    async fn test_dropping_tracked_channel_emits_leave() {
        let hub = LocalHub::new(16);
        let room = Uuid::new_v4();
        let mut observer = hub.open(room, Uuid::new_v4(), SubscribeOptions::default()).await;

        let alice = participant("Alice");
        {
            let mut a = hub.open(room, alice.user_id, SubscribeOptions::default()).await;
            a.track(&alice).await.unwrap();
        }
        let events = drain(&mut observer);
        assert!(events.contains(&ChannelEvent::PresenceLeave(alice.user_id)));
        assert_eq!(events.last(), Some(&ChannelEvent::PresenceSync(vec![])));
    }

    #[tokio::test]
    async fn test_drop_connection_closes_channel() {
        let hub = LocalHub::new(16);
        let room = Uuid::new_v4();
        let alice = participant("Alice");
        let mut a = hub.open(room, alice.user_id, SubscribeOptions::default()).await;
        a.track(&alice).await.unwrap();
        drain(&mut a);

        assert_eq!(hub.drop_connection(room, alice.user_id).await, 1);

        assert_eq!(a.recv().await, Some(ChannelEvent::Closed));
        assert_eq!(a.recv().await, None);
        assert_eq!(a.send(vec![0]).await, Err(TransportError::Closed));
        assert!(hub.presence(room).await.is_empty());
    }

    #[tokio::test]
    async fn test_lagging_channel_drops_frames() {
        let hub = LocalHub::new(2);
        let room = Uuid::new_v4();
        let mut sender = hub.open(room, Uuid::new_v4(), SubscribeOptions::default()).await;
        let mut slow = hub.open(room, Uuid::new_v4(), SubscribeOptions::default()).await;
        drain(&mut slow);

        for i in 0..5u8 {
            sender.send(vec![i]).await.unwrap();
        }

        let received = drain(&mut slow);
        // The resync snapshot, then the two frames still buffered
        assert_eq!(received.len(), 3);
        assert_eq!(received[0], ChannelEvent::PresenceSync(vec![]));
        assert_eq!(hub.stats().await.messages_dropped, 3);
    }

    #[tokio::test]
    async fn test_lag_resyncs_missed_leave() {
        let hub = LocalHub::new(4);
        let room = Uuid::new_v4();
        let alice = participant("Alice");
        let bob = participant("Bob");
        let mut a = hub.open(room, alice.user_id, SubscribeOptions::default()).await;
        a.track(&alice).await.unwrap();
        let mut b = hub.open(room, bob.user_id, SubscribeOptions::default()).await;
        b.track(&bob).await.unwrap();
        let mut slow = hub.open(room, Uuid::new_v4(), SubscribeOptions::default()).await;
        drain(&mut slow);

        a.untrack().await.unwrap();
        for i in 0..10u8 {
            b.send(vec![i]).await.unwrap();
        }

        let events = drain(&mut slow);
        assert!(!events.contains(&ChannelEvent::PresenceLeave(alice.user_id)));
        assert_eq!(events[0], ChannelEvent::PresenceSync(vec![bob.clone()]));
        // Nothing after the resync puts the departed user back
        assert!(events[1..].iter().all(|e| !matches!(e, ChannelEvent::PresenceSync(_))));
    }

    #[tokio::test]
    async fn test_lag_resync_with_async_recv() {
        let hub = LocalHub::new(2);
        let room = Uuid::new_v4();
        let alice = participant("Alice");
        let mut a = hub.open(room, alice.user_id, SubscribeOptions::default()).await;
        a.track(&alice).await.unwrap();
        let mut slow = hub.open(room, Uuid::new_v4(), SubscribeOptions::default()).await;
        drain(&mut slow);

        for i in 0..5u8 {
            a.send(vec![i]).await.unwrap();
        }

        assert_eq!(slow.recv().await, Some(ChannelEvent::PresenceSync(vec![alice])));
        assert!(matches!(slow.recv().await, Some(ChannelEvent::Broadcast { .. })));
    }

    #[tokio::test]
    async fn test_prune_idle_rooms() {
        let hub = LocalHub::new(16);
        let room = Uuid::new_v4();
        let mut a = hub.open(room, Uuid::new_v4(), SubscribeOptions::default()).await;
        assert_eq!(hub.prune_idle().await, 0);
        a.unsubscribe().await.unwrap();
        assert_eq!(hub.prune_idle().await, 1);
        assert_eq!(hub.room_count().await, 0);
    }
}
