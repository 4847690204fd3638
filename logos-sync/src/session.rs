//! Collaboration client: one caller-owned handle, at most one active room.
//!
//! ```text
//!                       ┌─────────────────── CollabClient ───────────────────┐
//!  update_cursor ─────► │ Throttle ──(16ms window)──┐                        │
//!  update_selection ──► │ ──────────────────────────┼──► Channel::send ─────►│──► peers
//!  send_operation ────► │ OperationLog ──► DurableStore ──► (only on Ok) ──► │
//!                       │                                                    │
//!  process_next() ◄──── │ ◄── self filter ◄── Envelope::decode ◄── Channel ◄─│◄── peers
//!                       │ ◄── DurableStore::comment_changes ◄────────────────│
//!                       └────────────────────────────────────────────────────┘
//! ```
//!
//! The client never spawns tasks. The caller drives inbound traffic and
//! cursor flushes with [`CollabClient::process_next`] (or the synchronous
//! [`CollabClient::process_pending`] plus [`CollabClient::tick`]), so every
//! mutation of presence maps and of the vector clock happens on the
//! caller's task, one event at a time.
//!
//! Reference: Kleppmann — Designing Data-Intensive Applications, Chapter 5

use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::{self, error::RecvError, error::TryRecvError};
use tokio::time::Instant;
use uuid::Uuid;

use crate::clock::VectorClock;
use crate::comments;
use crate::config::SessionConfig;
use crate::error::CollabError;
use crate::identity::IdentityProvider;
use crate::model::{
    now_millis, Comment, CommentAction, CommentChange, CommentThread, CursorPosition, ElementId,
    Identity, Invitation, InvitationStatus, Invitee, NewInvitation, NewRoom, Operation,
    Participant, PermissionLevel, PresenceStatus, ResourceType, Room, RoomId, RoomOptions,
    SelectionRange, UserId,
};
use crate::observer::{
    ActivityEvent, CommentHintEvent, CommentResync, OperationConflict, SessionObservers,
};
use crate::oplog::OperationLog;
use crate::presence::PresenceTracker;
use crate::protocol::{BroadcastMessage, Envelope};
use crate::store::DurableStore;
use crate::throttle::Throttle;
use crate::transport::{Channel, ChannelEvent, SubscribeOptions, Transport};

// ───────────────────────────────────────────────────────────────────
// Room session
// ───────────────────────────────────────────────────────────────────

/// State owned while joined to one room. Dropped on leave.
pub struct RoomSession {
    room: Room,
    local: Participant,
    channel: Box<dyn Channel>,
    presence: PresenceTracker,
    oplog: OperationLog,
    cursor: Throttle<CursorPosition>,
    cursor_seq: u64,
    comment_feed: Option<broadcast::Receiver<CommentChange>>,
    connected: bool,
    participant_count: u32,
}

impl RoomSession {
    pub fn room(&self) -> &Room {
        &self.room
    }

    /// The presence payload this client tracks.
    pub fn local_participant(&self) -> &Participant {
        &self.local
    }

    pub fn presence(&self) -> &PresenceTracker {
        &self.presence
    }

    pub fn clock(&self) -> &VectorClock {
        self.oplog.clock()
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    /// Participant count reported by the store's join procedure.
    pub fn joined_count(&self) -> u32 {
        self.participant_count
    }

    /// Whether a coalesced cursor position is waiting for its window to close.
    pub fn cursor_pending(&self) -> bool {
        self.cursor.is_pending()
    }

    async fn broadcast(&mut self, message: BroadcastMessage) -> Result<(), CollabError> {
        let envelope = Envelope::new(self.local.user_id, self.room.id, message);
        envelope.validate()?;
        let payload = envelope.encode()?;
        self.channel.send(payload).await?;
        Ok(())
    }

    async fn send_cursor(&mut self, position: CursorPosition) -> Result<(), CollabError> {
        self.cursor_seq += 1;
        let seq = self.cursor_seq;
        log::trace!("Cursor ({}, {}) seq {seq} to room {}", position.x, position.y, self.room.id);
        self.broadcast(BroadcastMessage::Cursor { position, seq }).await
    }

    /// Send the pending cursor if its window has elapsed.
    async fn flush_due_cursor(&mut self, now: Instant) -> Result<bool, CollabError> {
        match self.cursor.poll(now) {
            Some(position) => self.send_cursor(position).await.map(|_| true),
            None => Ok(false),
        }
    }

    /// Comment hints are advisory; a failed send is only logged.
    async fn hint_comment(&mut self, comment_id: Uuid, action: CommentAction) {
        if let Err(e) = self
            .broadcast(BroadcastMessage::CommentHint { comment_id, action })
            .await
        {
            log::warn!("Comment hint for {comment_id} not sent: {e}");
        }
    }

    /// Next inbound item that is already buffered, if any.
    fn ready(&mut self) -> Option<Inbound> {
        if self.connected {
            if let Some(event) = self.channel.try_recv() {
                return Some(Inbound::Channel(Some(event)));
            }
        }
        let feed = self.comment_feed.as_mut()?;
        match feed.try_recv() {
            Ok(change) => Some(Inbound::Feed(FeedItem::Change(change))),
            Err(TryRecvError::Lagged(n)) => Some(Inbound::Feed(FeedItem::Lagged(n))),
            Err(TryRecvError::Closed) => Some(Inbound::Feed(FeedItem::Closed)),
            Err(TryRecvError::Empty) => None,
        }
    }
}

enum FeedItem {
    Change(CommentChange),
    Lagged(u64),
    Closed,
}

enum Inbound {
    Channel(Option<ChannelEvent>),
    Feed(FeedItem),
}

enum Wake {
    Inbound(Inbound),
    CursorDue,
}

async fn next_change(feed: &mut Option<broadcast::Receiver<CommentChange>>) -> FeedItem {
    match feed {
        Some(receiver) => match receiver.recv().await {
            Ok(change) => FeedItem::Change(change),
            Err(RecvError::Lagged(n)) => FeedItem::Lagged(n),
            Err(RecvError::Closed) => FeedItem::Closed,
        },
        None => std::future::pending().await,
    }
}

async fn sleep_until_due(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

// ───────────────────────────────────────────────────────────────────
// Client
// ───────────────────────────────────────────────────────────────────

/// Entry point for one user's collaboration traffic.
pub struct CollabClient {
    store: Arc<dyn DurableStore>,
    transport: Arc<dyn Transport>,
    identity: Arc<dyn IdentityProvider>,
    config: SessionConfig,
    observers: SessionObservers,
    session: Option<RoomSession>,
}

impl CollabClient {
    pub fn new(
        store: Arc<dyn DurableStore>,
        transport: Arc<dyn Transport>,
        identity: Arc<dyn IdentityProvider>,
    ) -> Self {
        Self::with_config(store, transport, identity, SessionConfig::default())
    }

    pub fn with_config(
        store: Arc<dyn DurableStore>,
        transport: Arc<dyn Transport>,
        identity: Arc<dyn IdentityProvider>,
        config: SessionConfig,
    ) -> Self {
        Self {
            store,
            transport,
            identity,
            config,
            observers: SessionObservers::default(),
            session: None,
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Observer lists; subscribe and unsubscribe through these.
    pub fn observers(&mut self) -> &mut SessionObservers {
        &mut self.observers
    }

    pub fn session(&self) -> Option<&RoomSession> {
        self.session.as_ref()
    }

    // ─── Read projections ─────────────────────────────────────────────

    pub fn active_room(&self) -> Option<&Room> {
        self.session.as_ref().map(|s| &s.room)
    }

    /// Live participants ordered by join time, local user included.
    pub fn participants(&self) -> Vec<Participant> {
        self.session
            .as_ref()
            .map(|s| s.presence.participants())
            .unwrap_or_default()
    }

    /// Latest remote cursor positions.
    pub fn cursors(&self) -> HashMap<UserId, CursorPosition> {
        self.session
            .as_ref()
            .map(|s| {
                s.presence
                    .cursors()
                    .iter()
                    .map(|(id, cursor)| (*id, cursor.position))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Remote selections; a `None` value is an explicitly cleared selection.
    pub fn selections(&self) -> HashMap<UserId, Option<SelectionRange>> {
        self.session
            .as_ref()
            .map(|s| s.presence.selections().clone())
            .unwrap_or_default()
    }

    /// Copy of the local vector clock; empty outside a room.
    pub fn clock(&self) -> VectorClock {
        self.session
            .as_ref()
            .map(|s| s.oplog.clock().clone())
            .unwrap_or_default()
    }

    pub fn is_connected(&self) -> bool {
        self.session.as_ref().is_some_and(|s| s.connected)
    }

    // ─── Rooms ────────────────────────────────────────────────────────

    pub async fn create_room(
        &mut self,
        resource_type: ResourceType,
        resource_id: &str,
        name: &str,
        options: RoomOptions,
    ) -> Result<Room, CollabError> {
        let result = self
            .try_create_room(resource_type, resource_id, name, options)
            .await;
        self.check(result)
    }

    /// Find the room for a resource, creating it on a miss.
    pub async fn get_or_create_room(
        &mut self,
        resource_type: ResourceType,
        resource_id: &str,
        name: &str,
    ) -> Result<Room, CollabError> {
        let result = self
            .try_get_or_create_room(resource_type, resource_id, name)
            .await;
        self.check(result)
    }

    /// Join a room, leaving the current one first.
    pub async fn join_room(&mut self, room_id: RoomId) -> Result<Room, CollabError> {
        let result = self.try_join_room(room_id).await;
        self.check(result)
    }

    /// Leave the active room. A no-op outside a room.
    pub async fn leave_room(&mut self) -> Result<(), CollabError> {
        let result = self.try_leave_room().await;
        self.check(result)
    }

    /// Delete a room and everything recorded in it. Creator only.
    pub async fn delete_room(&mut self, room_id: RoomId) -> Result<(), CollabError> {
        let result = self.try_delete_room(room_id).await;
        self.check(result)
    }

    /// Replace the active room's settings. Creator only.
    pub async fn update_room_settings(&mut self, settings: Value) -> Result<Room, CollabError> {
        let result = self.try_update_room_settings(settings).await;
        self.check(result)
    }

    // ─── Presence ─────────────────────────────────────────────────────

    /// Queue a cursor position. Positions offered within one window are
    /// coalesced and only the last is sent, when the window closes.
    pub fn update_cursor(&mut self, position: CursorPosition) -> Result<(), CollabError> {
        let result = self.try_update_cursor(position);
        self.check(result)
    }

    /// Send the pending cursor position now, ignoring the window.
    pub async fn flush_cursor(&mut self) -> Result<bool, CollabError> {
        let result = match self.session.as_mut() {
            Some(session) => match session.cursor.cancel() {
                Some(position) => session.send_cursor(position).await.map(|_| true),
                None => Ok(false),
            },
            None => Ok(false),
        };
        self.check(result)
    }

    /// Send the pending cursor position if its window has closed.
    pub async fn tick(&mut self) -> Result<bool, CollabError> {
        let result = match self.session.as_mut() {
            Some(session) => session.flush_due_cursor(Instant::now()).await,
            None => Ok(false),
        };
        self.check(result)
    }

    /// Broadcast a selection immediately; `None` clears it for peers.
    pub async fn update_selection(
        &mut self,
        selection: Option<SelectionRange>,
    ) -> Result<(), CollabError> {
        let result = self.try_update_selection(selection).await;
        self.check(result)
    }

    /// Re-track the current presence payload with a new status.
    pub async fn update_status(&mut self, status: PresenceStatus) -> Result<(), CollabError> {
        let result = self.try_update_status(status).await;
        self.check(result)
    }

    /// Fire-and-forget activity broadcast.
    pub async fn send_activity(&mut self, kind: &str, detail: Value) -> Result<(), CollabError> {
        let result = match self.member() {
            Ok(session) => {
                session
                    .broadcast(BroadcastMessage::Activity {
                        kind: kind.to_string(),
                        detail,
                    })
                    .await
            }
            Err(e) => Err(e),
        };
        self.check(result)
    }

    // ─── Operations ───────────────────────────────────────────────────

    /// Stamp, persist, then broadcast an operation.
    ///
    /// Nothing is broadcast unless the store accepted the operation. A
    /// broadcast failure after a successful write is reported to error
    /// observers but still returns the persisted operation; peers catch up
    /// through [`get_operation_history`](Self::get_operation_history).
    pub async fn send_operation(
        &mut self,
        operation_type: &str,
        target_type: &str,
        data: Value,
        target_id: Option<ElementId>,
    ) -> Result<Operation, CollabError> {
        let result = self
            .try_send_operation(operation_type, target_type, data, target_id)
            .await;
        self.check(result)
    }

    /// Operations after `since` (server timestamp), oldest first.
    ///
    /// Each clock is merged into the local one and operations authored by
    /// others are delivered to operation observers.
    pub async fn get_operation_history(
        &mut self,
        since: Option<u64>,
        limit: Option<usize>,
    ) -> Result<Vec<Operation>, CollabError> {
        let result = self.try_operation_history(since, limit).await;
        self.check(result)
    }

    // ─── Comments ─────────────────────────────────────────────────────

    pub async fn add_comment(
        &mut self,
        content: &str,
        position_data: Option<Value>,
        parent_id: Option<Uuid>,
    ) -> Result<Comment, CollabError> {
        let result = self.try_add_comment(content, position_data, parent_id).await;
        self.check(result)
    }

    pub async fn get_comments(&mut self) -> Result<Vec<CommentThread>, CollabError> {
        let store = self.store.clone();
        let result = match self.member() {
            Ok(session) => {
                let room_id = session.room.id;
                comments::load_threads(store.as_ref(), room_id).await
            }
            Err(e) => Err(e),
        };
        self.check(result)
    }

    /// Set a comment's resolved flag. Setting the current value is a no-op.
    pub async fn resolve_comment(
        &mut self,
        comment_id: Uuid,
        resolved: bool,
    ) -> Result<Comment, CollabError> {
        let result = self.try_resolve_comment(comment_id, resolved).await;
        self.check(result)
    }

    // ─── Invitations ──────────────────────────────────────────────────

    pub async fn invite(
        &mut self,
        invitee: Invitee,
        permission_level: PermissionLevel,
        ttl: Duration,
    ) -> Result<Invitation, CollabError> {
        let result = self.try_invite(invitee, permission_level, ttl).await;
        self.check(result)
    }

    /// Invitations for the active room. Pending ones past their expiry
    /// are marked expired on the way out.
    pub async fn list_invitations(&mut self) -> Result<Vec<Invitation>, CollabError> {
        let result = self.try_list_invitations().await;
        self.check(result)
    }

    pub async fn respond_to_invitation(
        &mut self,
        invitation_id: Uuid,
        accept: bool,
    ) -> Result<Invitation, CollabError> {
        let result = self.try_respond_to_invitation(invitation_id, accept).await;
        self.check(result)
    }

    // ─── Event loop ───────────────────────────────────────────────────

    /// Handle everything already buffered, without waiting. Returns the
    /// number of events handled.
    pub fn process_pending(&mut self) -> usize {
        let mut handled = 0;
        while let Some(inbound) = self.session.as_mut().and_then(RoomSession::ready) {
            self.apply(inbound);
            handled += 1;
        }
        handled
    }

    /// Wait for the next inbound event or cursor deadline and handle it.
    ///
    /// Returns `false` when there is nothing left to wait for: no active
    /// room, or a disconnected channel with no pending cursor or feed.
    pub async fn process_next(&mut self) -> bool {
        let wake = {
            let Some(session) = self.session.as_mut() else {
                return false;
            };
            let deadline = session.cursor.deadline();
            let connected = session.connected;
            let has_feed = session.comment_feed.is_some();

            tokio::select! {
                event = session.channel.recv(), if connected => Wake::Inbound(Inbound::Channel(event)),
                item = next_change(&mut session.comment_feed), if has_feed => Wake::Inbound(Inbound::Feed(item)),
                _ = sleep_until_due(deadline), if deadline.is_some() => Wake::CursorDue,
                else => return false,
            }
        };

        match wake {
            Wake::Inbound(inbound) => self.apply(inbound),
            Wake::CursorDue => {
                // Failures already reach error observers through check()
                let _ = self.tick().await;
            }
        }
        true
    }

    /// Drive the session for `duration`. Returns the number of wakeups handled.
    pub async fn run_for(&mut self, duration: Duration) -> usize {
        let deadline = Instant::now() + duration;
        let mut handled = 0;
        while let Ok(true) = tokio::time::timeout_at(deadline, self.process_next()).await {
            handled += 1;
        }
        handled
    }

    // ─── Internals ────────────────────────────────────────────────────

    fn signed_in(&self) -> Result<Identity, CollabError> {
        self.identity.current().ok_or_else(CollabError::not_signed_in)
    }

    /// The active session, provided the signed-in identity is its member.
    fn member(&mut self) -> Result<&mut RoomSession, CollabError> {
        let identity = self.signed_in()?;
        let session = self.session.as_mut().ok_or_else(CollabError::not_in_room)?;
        if session.local.user_id != identity.user_id {
            return Err(CollabError::Authentication(format!(
                "{} is not the member of room {}",
                identity.user_id, session.room.id
            )));
        }
        Ok(session)
    }

    fn report(&mut self, error: &CollabError) {
        match error {
            CollabError::Persistence(_) | CollabError::Transport(_) => {
                log::error!("{} failure: {error}", error.kind())
            }
            _ => log::warn!("{} failure: {error}", error.kind()),
        }
        self.observers.error.notify(error);
    }

    fn check<T>(&mut self, result: Result<T, CollabError>) -> Result<T, CollabError> {
        if let Err(e) = &result {
            self.report(e);
        }
        result
    }

    async fn try_create_room(
        &mut self,
        resource_type: ResourceType,
        resource_id: &str,
        name: &str,
        options: RoomOptions,
    ) -> Result<Room, CollabError> {
        let identity = self.signed_in()?;
        if resource_id.trim().is_empty() {
            return Err(CollabError::Validation("resource id is empty".into()));
        }
        if name.trim().is_empty() {
            return Err(CollabError::Validation("room name is empty".into()));
        }
        let max_participants = options
            .max_participants
            .unwrap_or(self.config.default_max_participants);
        if max_participants == 0 {
            return Err(CollabError::Validation("max participants must be positive".into()));
        }

        let room = self
            .store
            .create_room(NewRoom {
                resource_type,
                resource_id: resource_id.to_string(),
                name: name.trim().to_string(),
                created_by: identity.user_id,
                is_public: options.is_public,
                max_participants,
                settings: options.settings,
            })
            .await?;
        log::info!(
            "Room {} created for {} {}",
            room.id,
            room.resource_type,
            room.resource_id
        );
        Ok(room)
    }

    async fn try_get_or_create_room(
        &mut self,
        resource_type: ResourceType,
        resource_id: &str,
        name: &str,
    ) -> Result<Room, CollabError> {
        self.signed_in()?;
        if let Some(room) = self.store.find_room(&resource_type, resource_id).await? {
            return Ok(room);
        }
        match self
            .try_create_room(resource_type.clone(), resource_id, name, RoomOptions::default())
            .await
        {
            Ok(room) => Ok(room),
            // Another client created it between lookup and insert
            Err(CollabError::Validation(reason)) => {
                match self.store.find_room(&resource_type, resource_id).await? {
                    Some(room) => Ok(room),
                    None => Err(CollabError::Validation(reason)),
                }
            }
            Err(e) => Err(e),
        }
    }

    async fn try_join_room(&mut self, room_id: RoomId) -> Result<Room, CollabError> {
        let identity = self.signed_in()?;
        if self.session.is_some() {
            // Leave failures are reported by leave_room; joining proceeds
            let _ = self.leave_room().await;
        }

        let room = self.store.get_room(room_id).await?;
        let options = SubscribeOptions {
            receive_own: self.config.receive_own,
        };
        let mut channel = self
            .transport
            .subscribe(room_id, identity.user_id, options)
            .await?;
        let comment_feed = self.store.comment_changes(room_id);

        let receipt = match self.store.join_room(room_id, identity.user_id).await {
            Ok(receipt) => receipt,
            Err(e) => {
                let _ = channel.unsubscribe().await;
                return Err(e.into());
            }
        };

        let local = Participant::new(&identity, receipt.color);
        if let Err(e) = channel.track(&local).await {
            let _ = channel.unsubscribe().await;
            if let Err(undo) = self.store.leave_room(room_id, identity.user_id).await {
                log::warn!("Could not undo join of room {room_id}: {undo}");
            }
            return Err(e.into());
        }

        log::info!(
            "{} joined room {} as participant {} (color {})",
            identity.display_name,
            room_id,
            receipt.participant_count,
            receipt.color.to_hex()
        );
        self.session = Some(RoomSession {
            room: room.clone(),
            local,
            channel,
            presence: PresenceTracker::new(identity.user_id),
            oplog: OperationLog::new(identity.user_id),
            cursor: Throttle::new(self.config.cursor_interval),
            cursor_seq: 0,
            comment_feed: Some(comment_feed),
            connected: true,
            participant_count: receipt.participant_count,
        });
        self.observers.connection.notify(&true);
        self.process_pending();
        Ok(room)
    }

    async fn try_leave_room(&mut self) -> Result<(), CollabError> {
        let Some(mut session) = self.session.take() else {
            return Ok(());
        };
        let room_id = session.room.id;
        let user_id = session.local.user_id;
        if session.cursor.cancel().is_some() {
            log::trace!("Discarded pending cursor for room {room_id}");
        }

        let bookkeeping = self.store.leave_room(room_id, user_id).await;
        let untrack = if session.connected {
            session.channel.untrack().await
        } else {
            Ok(())
        };
        let unsubscribe = session.channel.unsubscribe().await;
        let was_connected = session.connected;
        session.presence.clear();
        session.oplog.clear();
        drop(session);

        if was_connected {
            self.observers.connection.notify(&false);
        }
        log::info!("Left room {room_id}");

        bookkeeping?;
        untrack?;
        unsubscribe?;
        Ok(())
    }

    async fn try_delete_room(&mut self, room_id: RoomId) -> Result<(), CollabError> {
        let identity = self.signed_in()?;
        let room = self.store.get_room(room_id).await?;
        if room.created_by != identity.user_id {
            return Err(CollabError::Authentication(format!(
                "only the creator may delete room {room_id}"
            )));
        }
        if self.session.as_ref().is_some_and(|s| s.room.id == room_id) {
            if let Err(e) = self.try_leave_room().await {
                log::warn!("Leaving room {room_id} before delete: {e}");
            }
        }
        self.store.delete_room(room_id).await?;
        log::info!("Room {room_id} deleted");
        Ok(())
    }

    async fn try_update_room_settings(&mut self, settings: Value) -> Result<Room, CollabError> {
        let store = self.store.clone();
        let session = self.member()?;
        if session.room.created_by != session.local.user_id {
            return Err(CollabError::Authentication(format!(
                "only the creator may change settings of room {}",
                session.room.id
            )));
        }
        let room = store.update_room_settings(session.room.id, settings).await?;
        session.room = room.clone();
        Ok(room)
    }

    fn try_update_cursor(&mut self, position: CursorPosition) -> Result<(), CollabError> {
        if !position.is_finite() {
            return Err(CollabError::Validation("cursor position is not finite".into()));
        }
        let session = self.member()?;
        session.local.cursor = Some(position);
        session.cursor.offer(position, Instant::now());
        Ok(())
    }

    async fn try_update_selection(
        &mut self,
        selection: Option<SelectionRange>,
    ) -> Result<(), CollabError> {
        let session = self.member()?;
        session.local.selection = selection.clone();
        session
            .broadcast(BroadcastMessage::Selection { selection })
            .await
    }

    async fn try_update_status(&mut self, status: PresenceStatus) -> Result<(), CollabError> {
        let session = self.member()?;
        let mut payload = session.local.clone();
        payload.status = status;
        payload.last_seen_at = now_millis();
        session.channel.track(&payload).await?;
        session.local = payload;
        Ok(())
    }

    async fn try_send_operation(
        &mut self,
        operation_type: &str,
        target_type: &str,
        data: Value,
        target_id: Option<ElementId>,
    ) -> Result<Operation, CollabError> {
        if operation_type.trim().is_empty() || target_type.trim().is_empty() {
            return Err(CollabError::Validation("operation type is empty".into()));
        }
        let store = self.store.clone();
        let session = self.member()?;

        // Clock bumped before the first await
        let room_id = session.room.id;
        let pending = session
            .oplog
            .prepare(room_id, operation_type, target_type, target_id, data);
        let operation = store.append_operation(pending).await?;
        session.oplog.record_local(&operation);
        log::debug!(
            "Operation {} ({} on {}) persisted at {}",
            operation.id,
            operation.operation_type,
            operation.target_type,
            operation.timestamp
        );

        let sent = session
            .broadcast(BroadcastMessage::Operation {
                operation: operation.clone(),
            })
            .await;
        if let Err(e) = sent {
            self.report(&e);
        }
        Ok(operation)
    }

    async fn try_operation_history(
        &mut self,
        since: Option<u64>,
        limit: Option<usize>,
    ) -> Result<Vec<Operation>, CollabError> {
        let store = self.store.clone();
        let limit = limit.unwrap_or(self.config.history_limit);
        let session = self.member()?;
        let room_id = session.room.id;
        let local_id = session.local.user_id;

        let operations = store.operations_since(room_id, since, limit).await?;
        session.oplog.absorb_history(&operations);
        log::debug!("Fetched {} operations of room {room_id}", operations.len());

        for operation in operations.iter().filter(|op| op.user_id != local_id) {
            self.observers.operation.notify(operation);
        }
        Ok(operations)
    }

    async fn try_add_comment(
        &mut self,
        content: &str,
        position_data: Option<Value>,
        parent_id: Option<Uuid>,
    ) -> Result<Comment, CollabError> {
        let identity = self.signed_in()?;
        let store = self.store.clone();
        let max_len = self.config.max_comment_len;
        let session = self.member()?;

        let request = comments::new_comment(
            session.room.id,
            identity.profile(),
            content,
            position_data,
            parent_id,
            max_len,
        )?;
        let comment = store.insert_comment(request).await?;
        log::debug!("Comment {} added to room {}", comment.id, comment.room_id);

        session.hint_comment(comment.id, CommentAction::Created).await;
        Ok(comment)
    }

    async fn try_resolve_comment(
        &mut self,
        comment_id: Uuid,
        resolved: bool,
    ) -> Result<Comment, CollabError> {
        let store = self.store.clone();
        let session = self.member()?;

        let current = store.get_comment(comment_id).await?;
        if current.room_id != session.room.id {
            return Err(CollabError::NotFound(format!(
                "comment {comment_id} in room {}",
                session.room.id
            )));
        }
        if current.resolved == resolved {
            return Ok(current);
        }

        let updated = store.set_comment_resolved(comment_id, resolved).await?;
        session.hint_comment(comment_id, CommentAction::Updated).await;
        Ok(updated)
    }

    async fn try_invite(
        &mut self,
        invitee: Invitee,
        permission_level: PermissionLevel,
        ttl: Duration,
    ) -> Result<Invitation, CollabError> {
        let store = self.store.clone();
        let session = self.member()?;
        match &invitee {
            Invitee::Email(address) if !address.contains('@') => {
                return Err(CollabError::Validation(format!(
                    "invalid email address {address:?}"
                )));
            }
            Invitee::User(user_id) if *user_id == session.local.user_id => {
                return Err(CollabError::Validation("cannot invite yourself".into()));
            }
            _ => {}
        }
        if ttl.is_zero() {
            return Err(CollabError::Validation("invitation ttl is zero".into()));
        }

        let ttl_ms = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX);
        let invitation = store
            .create_invitation(NewInvitation {
                room_id: session.room.id,
                inviter_id: session.local.user_id,
                invitee,
                permission_level,
                expires_at: now_millis().saturating_add(ttl_ms),
            })
            .await?;
        log::info!(
            "Invitation {} to room {} ({:?})",
            invitation.id,
            invitation.room_id,
            invitation.permission_level
        );
        Ok(invitation)
    }

    async fn try_list_invitations(&mut self) -> Result<Vec<Invitation>, CollabError> {
        let store = self.store.clone();
        let room_id = self.member()?.room.id;

        let now = now_millis();
        let mut invitations = store.invitations(room_id).await?;
        for invitation in invitations.iter_mut() {
            if invitation.status == InvitationStatus::Pending && invitation.is_expired_at(now) {
                *invitation = store
                    .set_invitation_status(invitation.id, InvitationStatus::Expired)
                    .await?;
            }
        }
        Ok(invitations)
    }

    async fn try_respond_to_invitation(
        &mut self,
        invitation_id: Uuid,
        accept: bool,
    ) -> Result<Invitation, CollabError> {
        let identity = self.signed_in()?;
        let invitation = self.store.get_invitation(invitation_id).await?;

        if let Invitee::User(user_id) = invitation.invitee {
            if user_id != identity.user_id {
                return Err(CollabError::Authentication(format!(
                    "invitation {invitation_id} is addressed to another user"
                )));
            }
        }
        if invitation.status != InvitationStatus::Pending {
            return Err(CollabError::Validation(format!(
                "invitation {invitation_id} is already {:?}",
                invitation.status
            )));
        }
        if invitation.is_expired_at(now_millis()) {
            self.store
                .set_invitation_status(invitation_id, InvitationStatus::Expired)
                .await?;
            return Err(CollabError::Validation(format!(
                "invitation {invitation_id} has expired"
            )));
        }

        let status = if accept {
            InvitationStatus::Accepted
        } else {
            InvitationStatus::Declined
        };
        let updated = self.store.set_invitation_status(invitation_id, status).await?;
        log::info!("Invitation {invitation_id} {:?} by {}", status, identity.user_id);
        Ok(updated)
    }

    // ─── Inbound handling ─────────────────────────────────────────────

    fn apply(&mut self, inbound: Inbound) {
        match inbound {
            Inbound::Channel(Some(ChannelEvent::Closed)) | Inbound::Channel(None) => {
                self.on_disconnect()
            }
            Inbound::Channel(Some(event)) => self.on_channel_event(event),
            Inbound::Feed(item) => self.on_feed_item(item),
        }
    }

    fn on_channel_event(&mut self, event: ChannelEvent) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        match event {
            ChannelEvent::PresenceSync(snapshot) => {
                let pruned = session.presence.apply_sync(snapshot);
                if !pruned.is_empty() {
                    log::debug!("Pruned state of {} departed participants", pruned.len());
                }
                self.observers.presence.notify(&session.presence.participants());
            }
            ChannelEvent::PresenceJoin(participant) => {
                log::debug!("{} joined room {}", participant.display_name, session.room.id);
                session.presence.apply_join(participant);
                self.observers.presence.notify(&session.presence.participants());
            }
            ChannelEvent::PresenceLeave(user_id) => {
                log::debug!("{user_id} left room {}", session.room.id);
                if session.presence.apply_leave(&user_id) {
                    self.observers.presence.notify(&session.presence.participants());
                }
            }
            ChannelEvent::Broadcast { sender, payload } => {
                if sender == session.local.user_id {
                    log::trace!("Dropping self-originated broadcast");
                    return;
                }
                let room_id = session.room.id;
                match Envelope::decode(&payload) {
                    Ok(envelope) if envelope.sender != sender || envelope.room_id != room_id => {
                        let error = CollabError::Validation(format!(
                            "envelope from {} in room {} arrived from {sender} in room {room_id}",
                            envelope.sender, envelope.room_id
                        ));
                        self.report(&error);
                    }
                    Ok(envelope) => self.on_message(sender, envelope.message),
                    Err(e) => {
                        let error = CollabError::from(e);
                        self.report(&error);
                    }
                }
            }
            ChannelEvent::Closed => self.on_disconnect(),
        }
    }

    fn on_message(&mut self, sender: UserId, message: BroadcastMessage) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        match message {
            BroadcastMessage::Cursor { position, seq } => {
                if session.presence.apply_cursor(sender, position, seq) {
                    self.observers.presence.notify(&session.presence.participants());
                }
            }
            BroadcastMessage::Selection { selection } => {
                if session.presence.apply_selection(sender, selection) {
                    self.observers.presence.notify(&session.presence.participants());
                }
            }
            BroadcastMessage::Operation { operation } => {
                let receipt = session.oplog.receive(&operation);
                log::debug!(
                    "Received {} on {} from {sender}",
                    operation.operation_type,
                    operation.target_type
                );
                if let Some(known) = receipt.conflict {
                    log::info!(
                        "Concurrent operations {} and {} on the same {}",
                        known.id,
                        operation.id,
                        operation.target_type
                    );
                    self.observers.conflict.notify(&OperationConflict {
                        known,
                        incoming: operation.clone(),
                    });
                }
                self.observers.operation.notify(&operation);
            }
            BroadcastMessage::Activity { kind, detail } => {
                self.observers.activity.notify(&ActivityEvent {
                    user_id: sender,
                    kind,
                    detail,
                });
            }
            BroadcastMessage::CommentHint { comment_id, action } => {
                self.observers.comment_hint.notify(&CommentHintEvent {
                    user_id: sender,
                    comment_id,
                    action,
                });
            }
        }
    }

    fn on_feed_item(&mut self, item: FeedItem) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        match item {
            FeedItem::Change(change) => {
                if change.comment.room_id == session.room.id {
                    self.observers.comment.notify(&change);
                }
            }
            FeedItem::Lagged(n) => {
                log::warn!("Comment feed of room {} lagged by {n} changes", session.room.id);
                self.observers.comment_resync.notify(&CommentResync {
                    room_id: session.room.id,
                    missed: n,
                });
            }
            FeedItem::Closed => {
                log::info!("Comment feed of room {} closed", session.room.id);
                session.comment_feed = None;
            }
        }
    }

    fn on_disconnect(&mut self) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        if !session.connected {
            return;
        }
        session.connected = false;
        session.cursor.cancel();
        log::warn!("Channel for room {} closed", session.room.id);
        self.observers.connection.notify(&false);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::StaticIdentity;
    use crate::store::MemoryStore;
    use crate::transport::LocalHub;
    use serde_json::json;
    use std::sync::Mutex;

    fn client(identity: StaticIdentity) -> CollabClient {
        CollabClient::new(
            Arc::new(MemoryStore::new()),
            Arc::new(LocalHub::default()),
            Arc::new(identity),
        )
    }

    fn signed_in(name: &str) -> (StaticIdentity, UserId) {
        let id = Uuid::new_v4();
        (StaticIdentity::new(Identity::new(id, name)), id)
    }

    #[tokio::test]
    async fn test_create_room_requires_identity() {
        let mut client = client(StaticIdentity::anonymous());
        let errors = Arc::new(Mutex::new(Vec::new()));
        let sink = errors.clone();
        client
            .observers()
            .error
            .subscribe(move |e: &CollabError| sink.lock().unwrap().push(e.kind()));

        let result = client
            .create_room(ResourceType::Design, "poster", "Poster", RoomOptions::default())
            .await;
        assert!(matches!(result, Err(CollabError::Authentication(_))));
        assert_eq!(*errors.lock().unwrap(), vec!["authentication"]);
    }

    #[tokio::test]
    async fn test_calls_outside_room_fail_not_found() {
        let (identity, _) = signed_in("Ada");
        let mut client = client(identity);

        assert!(matches!(
            client.update_cursor(CursorPosition::new(1.0, 2.0)),
            Err(CollabError::NotFound(_))
        ));
        assert!(matches!(
            client.send_operation("update", "shape", json!({}), None).await,
            Err(CollabError::NotFound(_))
        ));
        assert!(client.leave_room().await.is_ok());
        assert!(client.participants().is_empty());
        assert!(client.clock().is_empty());
    }

    #[tokio::test]
    async fn test_get_or_create_is_idempotent() {
        let (identity, _) = signed_in("Ada");
        let mut client = client(identity);

        let first = client
            .get_or_create_room(ResourceType::Design, "poster", "Poster")
            .await
            .unwrap();
        let second = client
            .get_or_create_room(ResourceType::Design, "poster", "Poster again")
            .await
            .unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(second.max_participants, 50);
    }

    #[tokio::test]
    async fn test_join_resets_clock_and_tracks_self() {
        let (identity, user_id) = signed_in("Ada");
        let mut client = client(identity);
        let room = client
            .create_room(ResourceType::Design, "poster", "Poster", RoomOptions::default())
            .await
            .unwrap();

        client.join_room(room.id).await.unwrap();
        assert_eq!(client.active_room().map(|r| r.id), Some(room.id));
        assert_eq!(client.clock().get(&user_id), 0);
        assert!(client.is_connected());

        let participants = client.participants();
        assert_eq!(participants.len(), 1);
        assert_eq!(participants[0].user_id, user_id);
    }

    #[tokio::test]
    async fn test_send_operation_increments_clock() {
        let (identity, user_id) = signed_in("Ada");
        let mut client = client(identity);
        let room = client
            .create_room(ResourceType::Design, "poster", "Poster", RoomOptions::default())
            .await
            .unwrap();
        client.join_room(room.id).await.unwrap();

        let first = client
            .send_operation("create", "shape", json!({"kind": "rect"}), None)
            .await
            .unwrap();
        let second = client
            .send_operation("update", "shape", json!({"x": 4}), None)
            .await
            .unwrap();

        assert_eq!(first.vector_clock.get(&user_id), 1);
        assert_eq!(second.vector_clock.get(&user_id), 2);
        assert!(second.timestamp > first.timestamp);
        assert_eq!(client.clock().get(&user_id), 2);
    }

    #[tokio::test]
    async fn test_non_finite_cursor_rejected() {
        let (identity, _) = signed_in("Ada");
        let mut client = client(identity);
        let room = client
            .create_room(ResourceType::Design, "poster", "Poster", RoomOptions::default())
            .await
            .unwrap();
        client.join_room(room.id).await.unwrap();

        assert!(matches!(
            client.update_cursor(CursorPosition::new(f32::NAN, 0.0)),
            Err(CollabError::Validation(_))
        ));
        assert!(!client.session().unwrap().cursor_pending());
    }

    #[tokio::test]
    async fn test_leave_clears_state_and_fires_connection() {
        let (identity, _) = signed_in("Ada");
        let mut client = client(identity);
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        client
            .observers()
            .connection
            .subscribe(move |up: &bool| sink.lock().unwrap().push(*up));

        let room = client
            .create_room(ResourceType::Design, "poster", "Poster", RoomOptions::default())
            .await
            .unwrap();
        client.join_room(room.id).await.unwrap();
        client.update_cursor(CursorPosition::new(3.0, 4.0)).unwrap();
        client.leave_room().await.unwrap();

        assert_eq!(*events.lock().unwrap(), vec![true, false]);
        assert!(client.active_room().is_none());
        assert!(client.cursors().is_empty());
        // Nothing left to flush
        assert!(!client.flush_cursor().await.unwrap());
    }
}
