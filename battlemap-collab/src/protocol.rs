//! Binary wire protocol between `SyncClient` and `SyncServer`.
//!
//! Every WebSocket binary frame carries one bincode-encoded message:
//! [`ClientMessage`] upstream, [`ServerMessage`] downstream. Requests that
//! expect an answer carry a client-chosen `request_id` that the server
//! echoes back; change events are pushed without one.
//!
//! ```text
//! client                                   server
//!   │ Join{request_id, user, room}  ───────►  │
//!   │ ◄─────── Joined{request_id, room, …}    │
//!   │ FetchSnapshot{request_id, echelon} ──►  │
//!   │ ◄─────── Snapshot{request_id, seq, …}   │
//!   │ Mutate{request_id, mutation}  ───────►  │
//!   │ ◄─────── MutationAccepted{request_id}   │
//!   │ ◄─────── Change(ChangeEvent)            │  (to every subscriber)
//! ```

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use battlemap_core::{
    ChangeEvent, Drawing, EchelonIndex, Mutation, Room, RoomMember, SyncError, Unit, UserId,
};

use crate::presence::MemberColor;

/// Member identity with display metadata.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PeerInfo {
    pub user_id: UserId,
    pub display_name: String,
    /// RGBA color for the member's marker tint
    pub color: [f32; 4],
}

impl PeerInfo {
    /// Color is derived from the user id, so it is stable across sessions.
    pub fn new(user_id: UserId, display_name: impl Into<String>) -> Self {
        Self {
            user_id,
            display_name: display_name.into(),
            color: MemberColor::from_uuid(user_id).to_array(),
        }
    }

    pub fn from_member(member: &RoomMember) -> Self {
        Self::new(member.user_id, member.display_name.clone())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ClientMessage {
    /// Create a room owned by `user_id`. The creator still has to `Join`.
    CreateRoom {
        request_id: u64,
        user_id: UserId,
        display_name: String,
        name: String,
        map_id: String,
    },
    Join {
        request_id: u64,
        user_id: UserId,
        display_name: String,
        room_id: Uuid,
    },
    Leave,
    Heartbeat,
    FetchSnapshot {
        request_id: u64,
        echelon: EchelonIndex,
    },
    Mutate {
        request_id: u64,
        mutation: Mutation,
    },
    Ping {
        nonce: u64,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ServerMessage {
    RoomCreated {
        request_id: u64,
        room: Room,
    },
    Joined {
        request_id: u64,
        room: Room,
        members: Vec<RoomMember>,
        /// Feed sequence at join time.
        seq: u64,
    },
    JoinRejected {
        request_id: u64,
        error: SyncError,
    },
    Snapshot {
        request_id: u64,
        room: Room,
        echelon: EchelonIndex,
        /// Feed sequence the snapshot is consistent with. Events with
        /// `seq <= this` are already reflected.
        seq: u64,
        units: Vec<Unit>,
        drawings: Vec<Drawing>,
    },
    MutationAccepted {
        request_id: u64,
        /// The write was folded into a pending throttled write and will be
        /// committed when its interval elapses.
        coalesced: bool,
    },
    MutationRejected {
        request_id: u64,
        error: SyncError,
    },
    Change(ChangeEvent),
    /// The subscriber fell behind and lost events. Refetch every snapshot.
    ResyncRequired {
        room_id: Uuid,
        missed: u64,
    },
    Pong {
        nonce: u64,
    },
    Error {
        request_id: Option<u64>,
        error: SyncError,
    },
}

impl ServerMessage {
    /// Request id this message answers, if any.
    pub fn request_id(&self) -> Option<u64> {
        match self {
            ServerMessage::RoomCreated { request_id, .. }
            | ServerMessage::Joined { request_id, .. }
            | ServerMessage::JoinRejected { request_id, .. }
            | ServerMessage::Snapshot { request_id, .. }
            | ServerMessage::MutationAccepted { request_id, .. }
            | ServerMessage::MutationRejected { request_id, .. } => Some(*request_id),
            ServerMessage::Error { request_id, .. } => *request_id,
            ServerMessage::Change(_)
            | ServerMessage::ResyncRequired { .. }
            | ServerMessage::Pong { .. } => None,
        }
    }
}

impl ClientMessage {
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        encode(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        decode(bytes)
    }
}

impl ServerMessage {
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        encode(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        decode(bytes)
    }
}

fn encode<T: Serialize>(msg: &T) -> Result<Vec<u8>, ProtocolError> {
    bincode::serde::encode_to_vec(msg, bincode::config::standard())
        .map_err(|e| ProtocolError::SerializationError(e.to_string()))
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, ProtocolError> {
    let (msg, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
    Ok(msg)
}

/// Wire and connection errors.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ProtocolError {
    #[error("Serialization error: {0}")]
    SerializationError(String),
    #[error("Deserialization error: {0}")]
    DeserializationError(String),
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),
    #[error("Connection closed")]
    ConnectionClosed,
    #[error("Request timed out")]
    Timeout,
    /// The server answered with a message of the wrong kind.
    #[error("Unexpected response: {0}")]
    UnexpectedResponse(String),
}

impl From<ProtocolError> for SyncError {
    fn from(e: ProtocolError) -> Self {
        SyncError::TransientIo(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use battlemap_core::{ChangeKind, ChangePayload, DenyReason, UnitPatch};

    #[test]
    fn test_mutate_roundtrip() {
        let msg = ClientMessage::Mutate {
            request_id: 7,
            mutation: Mutation::UpdateUnit {
                id: Uuid::new_v4(),
                patch: UnitPatch::position(12.5, -3.0),
            },
        };
        let bytes = msg.encode().unwrap();
        assert_eq!(ClientMessage::decode(&bytes).unwrap(), msg);
    }

    #[test]
    fn test_change_event_roundtrip() {
        let room_id = Uuid::new_v4();
        let unit = Unit::new(room_id, EchelonIndex::new(2).unwrap(), "arty", "arty-bty", 1.0, 2.0)
            .owned_by(Uuid::new_v4(), Some(4));
        let msg = ServerMessage::Change(ChangeEvent {
            seq: 99,
            room_id,
            kind: ChangeKind::Insert,
            payload: ChangePayload::Unit(unit),
            committed_at: 1_700_000_000_000,
        });
        let bytes = msg.encode().unwrap();
        assert_eq!(ServerMessage::decode(&bytes).unwrap(), msg);
        assert_eq!(msg.request_id(), None);
    }

    #[test]
    fn test_rejection_carries_reason() {
        let msg = ServerMessage::MutationRejected {
            request_id: 3,
            error: SyncError::Authorization(DenyReason::NotYourTurn),
        };
        let decoded = ServerMessage::decode(&msg.encode().unwrap()).unwrap();
        assert_eq!(decoded.request_id(), Some(3));
        match decoded {
            ServerMessage::MutationRejected { error, .. } => {
                assert_eq!(error, SyncError::Authorization(DenyReason::NotYourTurn))
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_decode_rejects_out_of_range_echelon() {
        // FetchSnapshot is variant 4; request_id 1; echelon 9
        let bytes = vec![4u8, 1, 9];
        assert!(ClientMessage::decode(&bytes).is_err());
        let ok = vec![4u8, 1, 2];
        assert_eq!(
            ClientMessage::decode(&ok).unwrap(),
            ClientMessage::FetchSnapshot {
                request_id: 1,
                echelon: EchelonIndex::new(2).unwrap()
            }
        );
    }

    #[test]
    fn test_decode_invalid_bytes() {
        let garbage = vec![0xFF, 0xFE, 0xFD];
        assert!(ClientMessage::decode(&garbage).is_err());
        assert!(ServerMessage::decode(&garbage).is_err());
    }

    #[test]
    fn test_peer_info_stable_color() {
        let id = Uuid::parse_str("550e8400-e29b-41d4-a716-446655440000").unwrap();
        let a = PeerInfo::new(id, "Test");
        let b = PeerInfo::new(id, "Other name");
        assert_eq!(a.color, b.color);
    }

    #[test]
    fn test_protocol_error_is_transient() {
        let err: SyncError = ProtocolError::Timeout.into();
        assert!(err.is_retryable());
        assert_eq!(ProtocolError::ConnectionClosed.to_string(), "Connection closed");
        let boxed: Box<dyn std::error::Error + Send + Sync> =
            Box::new(ProtocolError::UnexpectedResponse("Pong".into()));
        assert_eq!(boxed.to_string(), "Unexpected response: Pong");
    }
}
