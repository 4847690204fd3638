//! Error taxonomy exposed by the collaboration engine.
//!
//! Every fallible public call returns `Result<_, CollabError>`. Lower layers
//! (store, wire protocol, transport) carry their own error enums and convert
//! into this one at the session boundary.

use crate::protocol::ProtocolError;
use crate::store::StoreError;
use crate::transport::TransportError;

/// Errors surfaced by [`CollabClient`](crate::session::CollabClient).
#[derive(Debug, Clone, PartialEq)]
pub enum CollabError {
    /// No identity is bound, or the bound identity may not perform the call.
    Authentication(String),
    /// Room, comment or invitation does not exist.
    NotFound(String),
    /// Durable read or write failed.
    Persistence(String),
    /// Malformed payload or argument.
    Validation(String),
    /// Channel subscribe or send failed.
    Transport(String),
}

impl CollabError {
    pub fn not_signed_in() -> Self {
        CollabError::Authentication("no authenticated identity".to_string())
    }

    pub fn not_in_room() -> Self {
        CollabError::NotFound("not joined to any room".to_string())
    }

    /// Short name of the error kind, used in log lines.
    pub fn kind(&self) -> &'static str {
        match self {
            CollabError::Authentication(_) => "authentication",
            CollabError::NotFound(_) => "not_found",
            CollabError::Persistence(_) => "persistence",
            CollabError::Validation(_) => "validation",
            CollabError::Transport(_) => "transport",
        }
    }
}

impl std::fmt::Display for CollabError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CollabError::Authentication(e) => write!(f, "Authentication error: {e}"),
            CollabError::NotFound(e) => write!(f, "Not found: {e}"),
            CollabError::Persistence(e) => write!(f, "Persistence error: {e}"),
            CollabError::Validation(e) => write!(f, "Validation error: {e}"),
            CollabError::Transport(e) => write!(f, "Transport error: {e}"),
        }
    }
}

impl std::error::Error for CollabError {}

impl From<StoreError> for CollabError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(what) => CollabError::NotFound(what),
            StoreError::Invalid(why) => CollabError::Validation(why),
            other => CollabError::Persistence(other.to_string()),
        }
    }
}

impl From<ProtocolError> for CollabError {
    fn from(e: ProtocolError) -> Self {
        CollabError::Validation(e.to_string())
    }
}

impl From<TransportError> for CollabError {
    fn from(e: TransportError) -> Self {
        CollabError::Transport(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_not_found_maps_to_not_found() {
        let err: CollabError = StoreError::NotFound("room 42".into()).into();
        assert_eq!(err, CollabError::NotFound("room 42".into()));
        assert_eq!(err.kind(), "not_found");
    }

    #[test]
    fn test_store_database_error_maps_to_persistence() {
        let err: CollabError = StoreError::DatabaseError("disk full".into()).into();
        assert!(matches!(err, CollabError::Persistence(ref m) if m.contains("disk full")));
    }

    #[test]
    fn test_protocol_error_maps_to_validation() {
        let err: CollabError = ProtocolError::Invalid("bad cursor".into()).into();
        assert_eq!(err.kind(), "validation");
    }

    #[test]
    fn test_display() {
        assert_eq!(
            CollabError::not_signed_in().to_string(),
            "Authentication error: no authenticated identity"
        );
    }
}
