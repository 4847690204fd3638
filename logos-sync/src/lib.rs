//! # logos-sync — Real-time collaboration sync engine for Logos
//!
//! Presence, coalesced cursors, a causally ordered operation log and
//! comment threads for rooms scoped to one design resource.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   Transport (broadcast)   ┌──────────────┐
//! │ CollabClient │ ◄───────────────────────► │ CollabClient │
//! │ (user X)     │   presence + envelopes    │ (user Y)     │
//! └──────┬───────┘                           └──────┬───────┘
//!        │ persist, then broadcast                  │
//!        ▼                                          ▼
//! ┌─────────────────────────────────────────────────────────┐
//! │ DurableStore: rooms, operations, comments, invitations  │
//! │ (comment changes pushed through a per-room ChangeFeed)  │
//! └─────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`session`] — `CollabClient` and the active `RoomSession`
//! - [`clock`] / [`oplog`] — vector clocks and causal operation tracking
//! - [`presence`] / [`throttle`] — presence maps and cursor coalescing
//! - [`protocol`] — bincode wire format for broadcasts and relay frames
//! - [`store`] — durable store trait, in-memory and RocksDB backends
//! - [`transport`] — channel trait, in-process hub and WebSocket client
//! - [`relay`] — WebSocket relay server

pub mod clock;
pub mod comments;
pub mod config;
pub mod error;
pub mod identity;
pub mod model;
pub mod observer;
pub mod oplog;
pub mod presence;
pub mod protocol;
pub mod relay;
pub mod session;
pub mod store;
pub mod throttle;
pub mod transport;

// Re-exports for convenience
pub use clock::{CausalOrder, VectorClock};
pub use config::{RelayConfig, SessionConfig};
pub use error::CollabError;
pub use identity::{IdentityProvider, StaticIdentity};
pub use model::{
    Comment, CommentAction, CommentChange, CommentThread, CursorPosition, Identity, Invitation,
    InvitationStatus, Invitee, Operation, Participant, PermissionLevel, PresenceStatus,
    ResourceType, Room, RoomId, RoomOptions, SelectionRange, UserId,
};
pub use observer::{
    ActivityEvent, CommentHintEvent, CommentResync, Observers, OperationConflict, SessionObservers,
    SubscriptionId,
};
pub use presence::{CursorColor, PresenceTracker};
pub use protocol::{BroadcastMessage, Envelope, ProtocolError};
pub use relay::{RelayServer, RelayStats};
pub use session::{CollabClient, RoomSession};
pub use store::{DurableStore, MemoryStore, RocksStore, StoreConfig, StoreError};
pub use throttle::Throttle;
pub use transport::{Channel, ChannelEvent, LocalHub, Transport, TransportError, WsTransport};
