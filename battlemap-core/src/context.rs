use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::model::UserId;

/// Identity of one connected session, passed explicitly to every gate and
/// store call on behalf of that session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionContext {
    pub user_id: UserId,
    pub display_name: String,
    pub room_id: Uuid,
}

impl SessionContext {
    pub fn new(user_id: UserId, display_name: impl Into<String>, room_id: Uuid) -> Self {
        Self {
            user_id,
            display_name: display_name.into(),
            room_id,
        }
    }
}
