//! Plan snapshot: the JSON boundary object for exporting and importing
//! one echelon of one room.

use log::{debug, warn};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::echelon::EchelonIndex;
use crate::error::SyncError;
use crate::model::{now_millis, Drawing, Unit};

pub const PLAN_SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanSnapshot {
    pub schema_version: u32,
    pub room_id: Uuid,
    pub echelon: EchelonIndex,
    pub units: Vec<Unit>,
    pub drawings: Vec<Drawing>,
}

impl PlanSnapshot {
    pub fn export(
        room_id: Uuid,
        echelon: EchelonIndex,
        units: Vec<Unit>,
        drawings: Vec<Drawing>,
    ) -> Self {
        Self {
            schema_version: PLAN_SCHEMA_VERSION,
            room_id,
            echelon,
            units,
            drawings,
        }
    }

    pub fn to_json(&self) -> Result<String, SyncError> {
        serde_json::to_string(self).map_err(|e| SyncError::validation(e.to_string()))
    }

    pub fn to_json_pretty(&self) -> Result<String, SyncError> {
        serde_json::to_string_pretty(self).map_err(|e| SyncError::validation(e.to_string()))
    }

    /// Parse and validate. Missing style fields take the default palette;
    /// missing required fields or an out-of-range echelon are rejected.
    pub fn from_json(json: &str) -> Result<Self, SyncError> {
        let plan: PlanSnapshot = serde_json::from_str(json).map_err(|e| {
            warn!("rejected plan import: {}", e);
            SyncError::validation(format!("invalid plan: {e}"))
        })?;
        plan.validate()?;
        debug!(
            "parsed plan for echelon {}: {} units, {} drawings",
            plan.echelon,
            plan.units.len(),
            plan.drawings.len()
        );
        Ok(plan)
    }

    pub fn validate(&self) -> Result<(), SyncError> {
        if self.schema_version == 0 || self.schema_version > PLAN_SCHEMA_VERSION {
            return Err(SyncError::validation(format!(
                "unsupported plan schema version {}",
                self.schema_version
            )));
        }
        for unit in &self.units {
            unit.validate()?;
        }
        for drawing in &self.drawings {
            drawing.validate()?;
        }
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty() && self.drawings.is_empty()
    }

    /// Copies of the plan's entities placed into `room_id`/`echelon` with
    /// fresh ids.
    pub fn rebind(&self, room_id: Uuid, echelon: EchelonIndex) -> (Vec<Unit>, Vec<Drawing>) {
        let now = now_millis();
        let units = self
            .units
            .iter()
            .map(|u| Unit {
                id: Uuid::new_v4(),
                room_id,
                echelon,
                updated_at: now,
                ..u.clone()
            })
            .collect();
        let drawings = self
            .drawings
            .iter()
            .map(|d| Drawing {
                id: Uuid::new_v4(),
                room_id,
                echelon,
                updated_at: now,
                ..d.clone()
            })
            .collect();
        (units, drawings)
    }

    /// Same multiset of entity values, ignoring ids, placement and
    /// timestamps.
    pub fn equivalent(&self, other: &PlanSnapshot) -> bool {
        same_multiset(
            self.units.iter().map(Unit::without_identity).collect(),
            other.units.iter().map(Unit::without_identity).collect(),
        ) && same_multiset(
            self.drawings.iter().map(Drawing::without_identity).collect(),
            other.drawings.iter().map(Drawing::without_identity).collect(),
        )
    }
}

/// Multiset equality for values that are only `PartialEq` (they carry floats).
pub fn same_multiset<T: PartialEq>(left: Vec<T>, mut right: Vec<T>) -> bool {
    if left.len() != right.len() {
        return false;
    }
    for item in &left {
        match right.iter().position(|r| r == item) {
            Some(i) => {
                right.swap_remove(i);
            }
            None => return false,
        }
    }
    true
}
