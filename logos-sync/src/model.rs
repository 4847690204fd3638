//! Data model shared by the session, the wire protocol and the stores.
//!
//! Free-form JSON fields (`settings`, `data`, `position_data`) are carried
//! as JSON text on the wire so that the binary codec never has to handle
//! self-describing values.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::SystemTime;
use uuid::Uuid;

use crate::clock::VectorClock;
use crate::presence::CursorColor;

pub type UserId = Uuid;
pub type RoomId = Uuid;
pub type ElementId = Uuid;

/// Milliseconds since the Unix epoch.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Serde adapter storing a `serde_json::Value` as its JSON text.
pub(crate) mod json_text {
    use serde::{Deserialize, Deserializer, Serializer};
    use serde_json::Value;

    pub fn serialize<S: Serializer>(value: &Value, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&value.to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Value, D::Error> {
        let text = String::deserialize(deserializer)?;
        serde_json::from_str(&text).map_err(serde::de::Error::custom)
    }
}

/// Same as [`json_text`] for optional values.
pub(crate) mod json_text_opt {
    use serde::{Deserialize, Deserializer, Serializer};
    use serde_json::Value;

    pub fn serialize<S: Serializer>(value: &Option<Value>, serializer: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(v) => serializer.serialize_some(&v.to_string()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Value>, D::Error> {
        match Option::<String>::deserialize(deserializer)? {
            Some(text) => serde_json::from_str(&text)
                .map(Some)
                .map_err(serde::de::Error::custom),
            None => Ok(None),
        }
    }
}

// ───────────────────────────────────────────────────────────────────
// Identity
// ───────────────────────────────────────────────────────────────────

/// The authenticated actor bound to a client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub user_id: UserId,
    pub display_name: String,
    pub avatar_url: Option<String>,
}

impl Identity {
    pub fn new(user_id: UserId, display_name: impl Into<String>) -> Self {
        Self {
            user_id,
            display_name: display_name.into(),
            avatar_url: None,
        }
    }

    pub fn with_avatar(mut self, url: impl Into<String>) -> Self {
        self.avatar_url = Some(url.into());
        self
    }

    /// Author projection attached to comments.
    pub fn profile(&self) -> AuthorProfile {
        AuthorProfile {
            user_id: self.user_id,
            display_name: self.display_name.clone(),
            avatar_url: self.avatar_url.clone(),
        }
    }
}

// ───────────────────────────────────────────────────────────────────
// Rooms
// ───────────────────────────────────────────────────────────────────

/// Kind of design resource a room is scoped to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResourceType {
    Design,
    Template,
    Component,
    Custom(String),
}

impl ResourceType {
    pub fn as_str(&self) -> &str {
        match self {
            ResourceType::Design => "design",
            ResourceType::Template => "template",
            ResourceType::Component => "component",
            ResourceType::Custom(name) => name,
        }
    }
}

impl std::fmt::Display for ResourceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Optional parameters for room creation.
#[derive(Debug, Clone, PartialEq)]
pub struct RoomOptions {
    pub is_public: bool,
    pub max_participants: Option<u32>,
    pub settings: Value,
}

impl Default for RoomOptions {
    fn default() -> Self {
        Self {
            is_public: false,
            max_participants: None,
            settings: Value::Object(Default::default()),
        }
    }
}

/// Room creation request handed to the store.
#[derive(Debug, Clone)]
pub struct NewRoom {
    pub resource_type: ResourceType,
    pub resource_id: String,
    pub name: String,
    pub created_by: UserId,
    pub is_public: bool,
    pub max_participants: u32,
    pub settings: Value,
}

/// Collaboration scope, one per edited resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Room {
    pub id: RoomId,
    pub resource_type: ResourceType,
    pub resource_id: String,
    pub name: String,
    pub created_by: UserId,
    pub is_public: bool,
    pub max_participants: u32,
    #[serde(with = "json_text")]
    pub settings: Value,
    pub created_at: u64,
    pub updated_at: u64,
}

/// Result of the store's join bookkeeping procedure.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct JoinReceipt {
    pub participant_count: u32,
    pub color: CursorColor,
}

// ───────────────────────────────────────────────────────────────────
// Presence
// ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PresenceStatus {
    Active,
    Idle,
    Away,
}

/// Pointer position in canvas coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CursorPosition {
    pub x: f32,
    pub y: f32,
}

impl CursorPosition {
    pub fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }

    pub fn is_finite(&self) -> bool {
        self.x.is_finite() && self.y.is_finite()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

/// Selected elements plus their optional bounding box.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelectionRange {
    pub element_ids: Vec<ElementId>,
    pub bounds: Option<BoundingBox>,
}

impl SelectionRange {
    pub fn new(element_ids: Vec<ElementId>) -> Self {
        Self {
            element_ids,
            bounds: None,
        }
    }

    pub fn with_bounds(mut self, bounds: BoundingBox) -> Self {
        self.bounds = Some(bounds);
        self
    }
}

/// Ephemeral per-user state tracked on the transport. Never persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Participant {
    pub user_id: UserId,
    pub display_name: String,
    pub avatar_url: Option<String>,
    pub color: CursorColor,
    pub status: PresenceStatus,
    pub cursor: Option<CursorPosition>,
    pub selection: Option<SelectionRange>,
    pub joined_at: u64,
    pub last_seen_at: u64,
}

impl Participant {
    pub fn new(identity: &Identity, color: CursorColor) -> Self {
        let now = now_millis();
        Self {
            user_id: identity.user_id,
            display_name: identity.display_name.clone(),
            avatar_url: identity.avatar_url.clone(),
            color,
            status: PresenceStatus::Active,
            cursor: None,
            selection: None,
            joined_at: now,
            last_seen_at: now,
        }
    }
}

// ───────────────────────────────────────────────────────────────────
// Operations
// ───────────────────────────────────────────────────────────────────

/// An edit before the store has assigned its id and timestamp.
#[derive(Debug, Clone, PartialEq)]
pub struct NewOperation {
    pub room_id: RoomId,
    pub user_id: UserId,
    pub operation_type: String,
    pub target_type: String,
    pub target_id: Option<ElementId>,
    pub data: Value,
    pub vector_clock: VectorClock,
    pub client_timestamp: u64,
}

/// A persisted, immutable edit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    pub id: Uuid,
    pub room_id: RoomId,
    pub user_id: UserId,
    pub operation_type: String,
    pub target_type: String,
    pub target_id: Option<ElementId>,
    #[serde(with = "json_text")]
    pub data: Value,
    pub vector_clock: VectorClock,
    pub client_timestamp: u64,
    /// Assigned by the store; history is ordered by this field.
    pub timestamp: u64,
}

impl Operation {
    /// Attach store-assigned identity and timestamp to a pending edit.
    pub fn from_new(new: NewOperation, id: Uuid, timestamp: u64) -> Self {
        Self {
            id,
            room_id: new.room_id,
            user_id: new.user_id,
            operation_type: new.operation_type,
            target_type: new.target_type,
            target_id: new.target_id,
            data: new.data,
            vector_clock: new.vector_clock,
            client_timestamp: new.client_timestamp,
            timestamp,
        }
    }

    /// Key identifying what an operation touches, used for conflict detection.
    pub fn target_key(&self) -> Option<(String, ElementId)> {
        self.target_id.map(|id| (self.target_type.clone(), id))
    }
}

// ───────────────────────────────────────────────────────────────────
// Comments
// ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthorProfile {
    pub user_id: UserId,
    pub display_name: String,
    pub avatar_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewComment {
    pub room_id: RoomId,
    pub author: AuthorProfile,
    pub content: String,
    pub position_data: Option<Value>,
    pub parent_id: Option<Uuid>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Comment {
    pub id: Uuid,
    pub room_id: RoomId,
    pub author_id: UserId,
    pub author: AuthorProfile,
    pub content: String,
    #[serde(with = "json_text_opt")]
    pub position_data: Option<Value>,
    pub parent_id: Option<Uuid>,
    pub resolved: bool,
    pub created_at: u64,
    pub updated_at: u64,
}

impl Comment {
    pub fn is_top_level(&self) -> bool {
        self.parent_id.is_none()
    }
}

/// A top-level comment with its ordered replies.
#[derive(Debug, Clone, PartialEq)]
pub struct CommentThread {
    pub root: Comment,
    pub replies: Vec<Comment>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommentAction {
    Created,
    Updated,
}

/// Change notification pushed by the durable store.
#[derive(Debug, Clone, PartialEq)]
pub struct CommentChange {
    pub comment: Comment,
    pub action: CommentAction,
}

// ───────────────────────────────────────────────────────────────────
// Invitations
// ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Invitee {
    Email(String),
    User(UserId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum PermissionLevel {
    View,
    Comment,
    Edit,
    Admin,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InvitationStatus {
    Pending,
    Accepted,
    Declined,
    Expired,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewInvitation {
    pub room_id: RoomId,
    pub inviter_id: UserId,
    pub invitee: Invitee,
    pub permission_level: PermissionLevel,
    pub expires_at: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Invitation {
    pub id: Uuid,
    pub room_id: RoomId,
    pub inviter_id: UserId,
    pub invitee: Invitee,
    pub permission_level: PermissionLevel,
    pub status: InvitationStatus,
    pub created_at: u64,
    pub expires_at: u64,
}

impl Invitation {
    pub fn is_expired_at(&self, now: u64) -> bool {
        now >= self.expires_at
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Serialize, Deserialize, PartialEq, Debug)]
    struct Wrapper {
        #[serde(with = "json_text")]
        value: Value,
        #[serde(with = "json_text_opt")]
        maybe: Option<Value>,
    }

    #[test]
    fn test_json_text_survives_binary_codec() {
        let w = Wrapper {
            value: serde_json::json!({ "fill": "#ff0000", "opacity": 0.5 }),
            maybe: Some(serde_json::json!([1, 2, 3])),
        };
        let bytes = bincode::serde::encode_to_vec(&w, bincode::config::standard()).unwrap();
        let (back, _): (Wrapper, usize) =
            bincode::serde::decode_from_slice(&bytes, bincode::config::standard()).unwrap();
        assert_eq!(back, w);
    }

    #[test]
    fn test_json_text_none() {
        let w = Wrapper {
            value: Value::Null,
            maybe: None,
        };
        let bytes = bincode::serde::encode_to_vec(&w, bincode::config::standard()).unwrap();
        let (back, _): (Wrapper, usize) =
            bincode::serde::decode_from_slice(&bytes, bincode::config::standard()).unwrap();
        assert!(back.maybe.is_none());
    }

    #[test]
    fn test_resource_type_display() {
        assert_eq!(ResourceType::Design.to_string(), "design");
        assert_eq!(ResourceType::Custom("deck".into()).to_string(), "deck");
    }

    #[test]
    fn test_participant_from_identity() {
        let identity = Identity::new(Uuid::new_v4(), "Alice").with_avatar("https://a/x.png");
        let p = Participant::new(&identity, CursorColor::default());
        assert_eq!(p.user_id, identity.user_id);
        assert_eq!(p.status, PresenceStatus::Active);
        assert!(p.cursor.is_none());
        assert!(p.selection.is_none());
        assert_eq!(p.avatar_url.as_deref(), Some("https://a/x.png"));
    }

    #[test]
    fn test_invitation_expiry() {
        let inv = Invitation {
            id: Uuid::new_v4(),
            room_id: Uuid::new_v4(),
            inviter_id: Uuid::new_v4(),
            invitee: Invitee::Email("bob@example.com".into()),
            permission_level: PermissionLevel::Edit,
            status: InvitationStatus::Pending,
            created_at: 100,
            expires_at: 200,
        };
        assert!(!inv.is_expired_at(199));
        assert!(inv.is_expired_at(200));
    }
}
