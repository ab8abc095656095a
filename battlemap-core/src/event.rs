//! Change events published by the change feed.
//!
//! The payload is a closed sum over the entity classes, so a subscriber
//! matches on a variant instead of probing optional fields.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::echelon::EchelonIndex;
use crate::model::{Drawing, Room, RoomMember, Unit};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntityClass {
    Unit,
    Drawing,
    Room,
    Member,
}

impl fmt::Display for EntityClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EntityClass::Unit => "unit",
            EntityClass::Drawing => "drawing",
            EntityClass::Room => "room",
            EntityClass::Member => "member",
        };
        f.write_str(name)
    }
}

/// Row image carried by an event. For deletes this is the last known row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ChangePayload {
    Unit(Unit),
    Drawing(Drawing),
    Room(Room),
    Member(RoomMember),
}

impl ChangePayload {
    pub fn class(&self) -> EntityClass {
        match self {
            ChangePayload::Unit(_) => EntityClass::Unit,
            ChangePayload::Drawing(_) => EntityClass::Drawing,
            ChangePayload::Room(_) => EntityClass::Room,
            ChangePayload::Member(_) => EntityClass::Member,
        }
    }

    pub fn entity_id(&self) -> Uuid {
        match self {
            ChangePayload::Unit(u) => u.id,
            ChangePayload::Drawing(d) => d.id,
            ChangePayload::Room(r) => r.id,
            ChangePayload::Member(m) => m.user_id,
        }
    }

    /// Echelon of map entities. Room and member rows are echelon-less.
    pub fn echelon(&self) -> Option<EchelonIndex> {
        match self {
            ChangePayload::Unit(u) => Some(u.echelon),
            ChangePayload::Drawing(d) => Some(d.echelon),
            ChangePayload::Room(_) | ChangePayload::Member(_) => None,
        }
    }
}

/// One committed change. `seq` is monotonic per room and lets a
/// subscriber notice gaps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub seq: u64,
    pub room_id: Uuid,
    pub kind: ChangeKind,
    pub payload: ChangePayload,
    pub committed_at: u64,
}

impl ChangeEvent {
    /// Whether a view of `echelon` should apply this event. Room-level
    /// events are relevant to every echelon.
    pub fn is_for_echelon(&self, echelon: EchelonIndex) -> bool {
        self.payload.echelon().map_or(true, |e| e == echelon)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Point, ShapeType};

    fn event(payload: ChangePayload) -> ChangeEvent {
        ChangeEvent {
            seq: 1,
            room_id: Uuid::nil(),
            kind: ChangeKind::Insert,
            payload,
            committed_at: 0,
        }
    }

    #[test]
    fn test_echelon_filter() {
        let e1 = EchelonIndex::new(1).unwrap();
        let e2 = EchelonIndex::new(2).unwrap();
        let unit = Unit::new(Uuid::nil(), e1, "inf", "inf", 0.0, 0.0);
        let ev = event(ChangePayload::Unit(unit));
        assert!(ev.is_for_echelon(e1));
        assert!(!ev.is_for_echelon(e2));
    }

    #[test]
    fn test_room_events_reach_every_echelon() {
        let room = Room::new("r", Uuid::new_v4(), "m");
        let ev = event(ChangePayload::Room(room));
        assert!(EchelonIndex::all().all(|e| ev.is_for_echelon(e)));
    }

    #[test]
    fn test_payload_identity() {
        let d = Drawing::new(
            Uuid::nil(),
            EchelonIndex::FIRST,
            ShapeType::Circle,
            vec![Point::default(), Point::new(2.0, 0.0)],
        );
        let id = d.id;
        let payload = ChangePayload::Drawing(d);
        assert_eq!(payload.class(), EntityClass::Drawing);
        assert_eq!(payload.entity_id(), id);
        assert_eq!(payload.class().to_string(), "drawing");
    }
}
