//! Write authorization.
//!
//! A write is allowed when the actor is the room admin, or when the actor
//! holds the turn and the target is unowned or owned by the actor.
//! These are pure functions of the room row; callers re-run them inside
//! the room's commit section so a revoke cannot race a commit.

use crate::error::{DenyReason, SyncError};
use crate::model::{Room, UserId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Allow,
    Deny(DenyReason),
}

impl Decision {
    pub fn is_allowed(self) -> bool {
        matches!(self, Decision::Allow)
    }

    pub fn into_result(self) -> Result<(), SyncError> {
        match self {
            Decision::Allow => Ok(()),
            Decision::Deny(reason) => Err(SyncError::Authorization(reason)),
        }
    }
}

pub fn authorize(actor: UserId, room: &Room, target_owner: Option<UserId>) -> Decision {
    if room.is_admin(actor) {
        return Decision::Allow;
    }
    if room.current_turn_user_id != Some(actor) {
        return Decision::Deny(DenyReason::NotYourTurn);
    }
    match target_owner {
        Some(owner) if owner != actor => Decision::Deny(DenyReason::NotOwner),
        _ => Decision::Allow,
    }
}

/// Gate for operations reserved to the room owner.
pub fn authorize_admin(actor: UserId, room: &Room) -> Decision {
    if room.is_admin(actor) {
        Decision::Allow
    } else {
        Decision::Deny(DenyReason::NotAdmin)
    }
}

/// Gate for bulk operations touching several entities. The first denial
/// wins; an empty set is checked like an unowned target.
pub fn authorize_all<I>(actor: UserId, room: &Room, owners: I) -> Decision
where
    I: IntoIterator<Item = Option<UserId>>,
{
    let base = authorize(actor, room, None);
    if !base.is_allowed() {
        return base;
    }
    owners
        .into_iter()
        .map(|owner| authorize(actor, room, owner))
        .find(|d| !d.is_allowed())
        .unwrap_or(Decision::Allow)
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn room_with_turn(holder: Option<UserId>) -> (Room, UserId) {
        let admin = Uuid::new_v4();
        let mut room = Room::new("gate", admin, "m");
        room.current_turn_user_id = holder;
        (room, admin)
    }

    #[test]
    fn test_admin_always_allowed() {
        let other = Uuid::new_v4();
        let (room, admin) = room_with_turn(Some(other));
        assert_eq!(authorize(admin, &room, Some(other)), Decision::Allow);
        assert_eq!(authorize(admin, &room, None), Decision::Allow);
        assert_eq!(authorize_admin(admin, &room), Decision::Allow);
    }

    #[test]
    fn test_non_holder_denied() {
        let b = Uuid::new_v4();
        let (room, _admin) = room_with_turn(None);
        assert_eq!(
            authorize(b, &room, None),
            Decision::Deny(DenyReason::NotYourTurn)
        );
        assert_eq!(
            authorize(b, &room, Some(b)),
            Decision::Deny(DenyReason::NotYourTurn)
        );
    }

    #[test]
    fn test_holder_cannot_touch_foreign_units() {
        let b = Uuid::new_v4();
        let c = Uuid::new_v4();
        let (room, _admin) = room_with_turn(Some(b));
        assert_eq!(authorize(b, &room, Some(b)), Decision::Allow);
        assert_eq!(authorize(b, &room, None), Decision::Allow);
        assert_eq!(
            authorize(b, &room, Some(c)),
            Decision::Deny(DenyReason::NotOwner)
        );
    }

    #[test]
    fn test_admin_only_operations() {
        let b = Uuid::new_v4();
        let (room, _admin) = room_with_turn(Some(b));
        assert_eq!(
            authorize_admin(b, &room),
            Decision::Deny(DenyReason::NotAdmin)
        );
        assert_eq!(
            authorize_admin(b, &room).into_result(),
            Err(SyncError::Authorization(DenyReason::NotAdmin))
        );
    }

    #[test]
    fn test_bulk_checks_every_owner() {
        let b = Uuid::new_v4();
        let c = Uuid::new_v4();
        let (room, admin) = room_with_turn(Some(b));
        assert!(authorize_all(b, &room, [None, Some(b)]).is_allowed());
        assert_eq!(
            authorize_all(b, &room, [Some(b), Some(c)]),
            Decision::Deny(DenyReason::NotOwner)
        );
        assert!(authorize_all(admin, &room, [Some(c)]).is_allowed());
        assert_eq!(
            authorize_all(c, &room, std::iter::empty()),
            Decision::Deny(DenyReason::NotYourTurn)
        );
    }
}
