//! Per-room pub/sub channel consumed by the session.
//!
//! ```text
//! CollabClient ── subscribe(room, user) ──► dyn Transport
//!      │                                        │
//!      │   track / untrack / send               ▼
//!      └──────────────────────────────────► dyn Channel ──► ChannelEvent stream
//!                                                          (presence sync/join/leave,
//!                                                           broadcasts, closed)
//! ```
//!
//! Delivery is at-most-once and unordered across senders. A channel never
//! retries or replays; when the underlying connection goes away it yields
//! [`ChannelEvent::Closed`] once and then nothing.

pub mod local;
pub mod ws;

use async_trait::async_trait;

use crate::model::{Participant, RoomId, UserId};

pub use local::{HubStats, LocalChannel, LocalHub};
pub use ws::WsTransport;

/// Transport failures.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportError {
    /// Could not open the channel
    SubscribeFailed(String),
    /// Could not hand a frame to the channel
    SendFailed(String),
    /// The channel is closed
    Closed,
    /// The remote side did not answer in time
    Timeout,
}

impl std::fmt::Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportError::SubscribeFailed(e) => write!(f, "Subscribe failed: {e}"),
            TransportError::SendFailed(e) => write!(f, "Send failed: {e}"),
            TransportError::Closed => write!(f, "Channel closed"),
            TransportError::Timeout => write!(f, "Timed out"),
        }
    }
}

impl std::error::Error for TransportError {}

/// Subscribe-time channel options.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SubscribeOptions {
    /// Deliver this subscriber's own broadcasts back to it.
    pub receive_own: bool,
}

/// Event delivered by a channel.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    /// Authoritative snapshot of every tracked participant.
    PresenceSync(Vec<Participant>),
    PresenceJoin(Participant),
    PresenceLeave(UserId),
    /// Opaque broadcast payload (an encoded `Envelope`).
    Broadcast { sender: UserId, payload: Vec<u8> },
    /// The connection is gone. Emitted once.
    Closed,
}

/// Opens channels.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn subscribe(
        &self,
        room_id: RoomId,
        user_id: UserId,
        options: SubscribeOptions,
    ) -> Result<Box<dyn Channel>, TransportError>;
}

/// One subscription to one room.
#[async_trait]
pub trait Channel: Send {
    /// Publish (or refresh) this subscriber's presence payload.
    async fn track(&mut self, participant: &Participant) -> Result<(), TransportError>;

    async fn untrack(&mut self) -> Result<(), TransportError>;

    /// Fire-and-forget broadcast to the room.
    async fn send(&mut self, payload: Vec<u8>) -> Result<(), TransportError>;

    /// Next event; `None` once the channel is finished.
    async fn recv(&mut self) -> Option<ChannelEvent>;

    /// Next already-buffered event, without waiting.
    fn try_recv(&mut self) -> Option<ChannelEvent>;

    async fn unsubscribe(&mut self) -> Result<(), TransportError>;
}
