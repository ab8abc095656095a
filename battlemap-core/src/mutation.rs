//! Every write a client can ask the room to commit.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::echelon::EchelonIndex;
use crate::error::SyncError;
use crate::model::{Drawing, DrawingPatch, Unit, UnitPatch, UserId};
use crate::plan::PlanSnapshot;
use crate::throttle::Coalesce;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Mutation {
    CreateUnit(Unit),
    CreateDrawing(Drawing),
    UpdateUnit { id: Uuid, patch: UnitPatch },
    UpdateDrawing { id: Uuid, patch: DrawingPatch },
    DeleteUnit { id: Uuid },
    DeleteDrawing { id: Uuid },
    /// "Clear front" is `drawings` only; "clear map" is both.
    Clear {
        echelon: EchelonIndex,
        units: bool,
        drawings: bool,
    },
    CopyEchelon { from: EchelonIndex, to: EchelonIndex },
    /// Replace the plan's echelon with the plan's contents.
    ImportPlan(PlanSnapshot),
    GrantTurn { user_id: UserId },
    RevokeTurn,
    ToggleLock,
    ChangeMap { map_id: String },
    KickMember { user_id: UserId },
    DeleteRoom,
}

impl Mutation {
    /// Shape checks that need no room state.
    pub fn validate(&self) -> Result<(), SyncError> {
        match self {
            Mutation::CreateUnit(unit) => unit.validate(),
            Mutation::CreateDrawing(drawing) => drawing.validate(),
            Mutation::UpdateUnit { patch, .. } => {
                if patch.is_empty() {
                    return Err(SyncError::validation("empty unit patch"));
                }
                patch.validate()
            }
            Mutation::UpdateDrawing { patch, .. } => {
                if patch.points.is_none() && patch.style.is_none() {
                    return Err(SyncError::validation("empty drawing patch"));
                }
                patch.validate()
            }
            Mutation::Clear { units, drawings, .. } if !units && !drawings => {
                Err(SyncError::validation("clear selects nothing"))
            }
            Mutation::CopyEchelon { from, to } if from == to => Err(SyncError::validation(
                format!("cannot copy echelon {from} onto itself"),
            )),
            Mutation::ImportPlan(plan) => plan.validate(),
            Mutation::ChangeMap { map_id } if map_id.is_empty() => {
                Err(SyncError::validation("map id must not be empty"))
            }
            _ => Ok(()),
        }
    }

    pub fn is_admin_only(&self) -> bool {
        matches!(
            self,
            Mutation::GrantTurn { .. }
                | Mutation::RevokeTurn
                | Mutation::ToggleLock
                | Mutation::ChangeMap { .. }
                | Mutation::KickMember { .. }
                | Mutation::DeleteRoom
        )
    }

    /// Entity id used to rate-limit in-place updates. Other mutations are
    /// never coalesced.
    pub fn throttle_key(&self) -> Option<Uuid> {
        match self {
            Mutation::UpdateUnit { id, .. } | Mutation::UpdateDrawing { id, .. } => Some(*id),
            _ => None,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Mutation::CreateUnit(_) => "create_unit",
            Mutation::CreateDrawing(_) => "create_drawing",
            Mutation::UpdateUnit { .. } => "update_unit",
            Mutation::UpdateDrawing { .. } => "update_drawing",
            Mutation::DeleteUnit { .. } => "delete_unit",
            Mutation::DeleteDrawing { .. } => "delete_drawing",
            Mutation::Clear { .. } => "clear",
            Mutation::CopyEchelon { .. } => "copy_echelon",
            Mutation::ImportPlan(_) => "import_plan",
            Mutation::GrantTurn { .. } => "grant_turn",
            Mutation::RevokeTurn => "revoke_turn",
            Mutation::ToggleLock => "toggle_lock",
            Mutation::ChangeMap { .. } => "change_map",
            Mutation::KickMember { .. } => "kick_member",
            Mutation::DeleteRoom => "delete_room",
        }
    }
}

impl Coalesce for Mutation {
    fn coalesce(&mut self, newer: Self) {
        match (self, newer) {
            (
                Mutation::UpdateUnit { id, patch },
                Mutation::UpdateUnit {
                    id: newer_id,
                    patch: newer_patch,
                },
            ) if *id == newer_id => patch.merge(newer_patch),
            (
                Mutation::UpdateDrawing { id, patch },
                Mutation::UpdateDrawing {
                    id: newer_id,
                    patch: newer_patch,
                },
            ) if *id == newer_id => patch.merge(newer_patch),
            (current, newer) => *current = newer,
        }
    }
}

impl Coalesce for UnitPatch {
    fn coalesce(&mut self, newer: Self) {
        self.merge(newer);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Point, ShapeType};

    #[test]
    fn test_validate_rejects_degenerate_requests() {
        let e0 = EchelonIndex::FIRST;
        assert!(Mutation::Clear {
            echelon: e0,
            units: false,
            drawings: false
        }
        .validate()
        .is_err());
        assert!(Mutation::CopyEchelon { from: e0, to: e0 }.validate().is_err());
        assert!(Mutation::UpdateUnit {
            id: Uuid::nil(),
            patch: UnitPatch::default()
        }
        .validate()
        .is_err());
        assert!(Mutation::ChangeMap {
            map_id: String::new()
        }
        .validate()
        .is_err());

        let line = Drawing::new(Uuid::nil(), e0, ShapeType::Line, vec![Point::default()]);
        assert!(Mutation::CreateDrawing(line).validate().is_err());
    }

    #[test]
    fn test_admin_only_classification() {
        assert!(Mutation::RevokeTurn.is_admin_only());
        assert!(Mutation::DeleteRoom.is_admin_only());
        assert!(!Mutation::DeleteUnit { id: Uuid::nil() }.is_admin_only());
        assert!(!Mutation::CopyEchelon {
            from: EchelonIndex::FIRST,
            to: EchelonIndex::new(1).unwrap()
        }
        .is_admin_only());
    }

    #[test]
    fn test_only_updates_are_throttled() {
        let id = Uuid::new_v4();
        let update = Mutation::UpdateUnit {
            id,
            patch: UnitPatch::position(1.0, 1.0),
        };
        assert_eq!(update.throttle_key(), Some(id));
        assert_eq!(Mutation::DeleteUnit { id }.throttle_key(), None);
    }

    #[test]
    fn test_coalesce_merges_same_unit() {
        let id = Uuid::new_v4();
        let mut m = Mutation::UpdateUnit {
            id,
            patch: UnitPatch::tint("#ffffff"),
        };
        m.coalesce(Mutation::UpdateUnit {
            id,
            patch: UnitPatch::position(3.0, 4.0),
        });
        match m {
            Mutation::UpdateUnit { patch, .. } => {
                assert_eq!(patch.tint.as_deref(), Some("#ffffff"));
                assert_eq!((patch.x, patch.y), (Some(3.0), Some(4.0)));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_coalesce_replaces_other_kinds() {
        let id = Uuid::new_v4();
        let mut m = Mutation::UpdateUnit {
            id,
            patch: UnitPatch::position(1.0, 1.0),
        };
        m.coalesce(Mutation::DeleteUnit { id });
        assert_eq!(m, Mutation::DeleteUnit { id });
    }
}
