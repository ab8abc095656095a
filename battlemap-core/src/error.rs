use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

use crate::event::EntityClass;

/// Why the write gate refused a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DenyReason {
    /// The actor does not hold the turn.
    NotYourTurn,
    /// The actor holds the turn but the target belongs to another user.
    NotOwner,
    /// The operation is reserved for the room owner.
    NotAdmin,
    /// The room is locked and the actor is not already a member.
    RoomLocked,
}

impl fmt::Display for DenyReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DenyReason::NotYourTurn => write!(f, "not your turn"),
            DenyReason::NotOwner => write!(f, "entity belongs to another user"),
            DenyReason::NotAdmin => write!(f, "only the room admin may do this"),
            DenyReason::RoomLocked => write!(f, "room is locked"),
        }
    }
}

/// Error taxonomy shared by the gate, the store and the wire protocol.
///
/// Only [`SyncError::TransientIo`] is ever retried, and only for reads and
/// subscriptions. Writes surface every failure to the user.
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
pub enum SyncError {
    #[error("not authorized: {0}")]
    Authorization(DenyReason),

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("{class} not found: {id}")]
    NotFound { class: EntityClass, id: Uuid },

    #[error("transient I/O failure: {0}")]
    TransientIo(String),
}

impl SyncError {
    pub fn validation(msg: impl Into<String>) -> Self {
        SyncError::Validation(msg.into())
    }

    pub fn not_found(class: EntityClass, id: Uuid) -> Self {
        SyncError::NotFound { class, id }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, SyncError::TransientIo(_))
    }
}

impl From<DenyReason> for SyncError {
    fn from(reason: DenyReason) -> Self {
        SyncError::Authorization(reason)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_transient_is_retryable() {
        assert!(SyncError::TransientIo("socket".into()).is_retryable());
        assert!(!SyncError::Authorization(DenyReason::NotYourTurn).is_retryable());
        assert!(!SyncError::validation("bad").is_retryable());
        assert!(!SyncError::not_found(EntityClass::Unit, Uuid::nil()).is_retryable());
    }

    #[test]
    fn test_display_messages() {
        let err = SyncError::Authorization(DenyReason::NotYourTurn);
        assert_eq!(err.to_string(), "not authorized: not your turn");

        let id = Uuid::nil();
        let err = SyncError::not_found(EntityClass::Drawing, id);
        assert_eq!(err.to_string(), format!("drawing not found: {id}"));
    }
}
