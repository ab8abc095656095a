//! Room turn state machine.
//!
//! ```text
//!            grant_turn(u)              grant_turn(v)
//!  Unassigned ───────────► Held(u) ─────────────────► Held(v)
//!      ▲                      │
//!      └──── revoke_turn ─────┘
//! ```
//!
//! Every transition is admin-only. A room starts as `Held(owner)`.

use log::debug;

use crate::error::{DenyReason, SyncError};
use crate::model::{Room, UserId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnState {
    Unassigned,
    Held(UserId),
}

impl Room {
    pub fn turn_state(&self) -> TurnState {
        match self.current_turn_user_id {
            Some(user) => TurnState::Held(user),
            None => TurnState::Unassigned,
        }
    }

    pub fn holds_turn(&self, user_id: UserId) -> bool {
        self.current_turn_user_id == Some(user_id)
    }

    fn require_admin(&self, actor: UserId) -> Result<(), SyncError> {
        if self.is_admin(actor) {
            Ok(())
        } else {
            Err(SyncError::Authorization(DenyReason::NotAdmin))
        }
    }

    /// Hand the turn to `user_id`, replacing any current holder.
    pub fn grant_turn(&mut self, actor: UserId, user_id: UserId) -> Result<(), SyncError> {
        self.require_admin(actor)?;
        debug!("room {}: turn granted to {}", self.id, user_id);
        self.current_turn_user_id = Some(user_id);
        Ok(())
    }

    /// Take the turn away. Idempotent on an unassigned room.
    pub fn revoke_turn(&mut self, actor: UserId) -> Result<(), SyncError> {
        self.require_admin(actor)?;
        if let Some(holder) = self.current_turn_user_id.take() {
            debug!("room {}: turn revoked from {}", self.id, holder);
        }
        Ok(())
    }

    /// Flip the join lock. Returns the new value.
    pub fn toggle_lock(&mut self, actor: UserId) -> Result<bool, SyncError> {
        self.require_admin(actor)?;
        self.is_locked = !self.is_locked;
        Ok(self.is_locked)
    }

    pub fn change_map(&mut self, actor: UserId, map_id: impl Into<String>) -> Result<(), SyncError> {
        self.require_admin(actor)?;
        let map_id = map_id.into();
        if map_id.is_empty() {
            return Err(SyncError::validation("map id must not be empty"));
        }
        debug!("room {}: map {} -> {}", self.id, self.current_map_id, map_id);
        self.current_map_id = map_id;
        Ok(())
    }
}
