//! Rooms, members and the two entity classes placed on the map.
//!
//! Units are point markers that may be owned by a user; drawings are
//! unowned shapes (front lines, arrows, areas). Both are scoped to one
//! room and one [`EchelonIndex`].

use serde::{Deserialize, Serialize};
use std::time::SystemTime;
use uuid::Uuid;

use crate::echelon::EchelonIndex;
use crate::error::SyncError;
use crate::event::EntityClass;

/// Opaque user identifier supplied by the identity provider.
pub type UserId = Uuid;

/// Minimum number of points a drawing needs to be renderable.
pub const MIN_SHAPE_POINTS: usize = 2;

/// Milliseconds since the Unix epoch.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

// ───────────────────────────────────────────────────────────────────
// Rooms and members
// ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Room {
    pub id: Uuid,
    pub name: String,
    /// The room admin. Only the owner may change the turn holder.
    pub owner_id: UserId,
    pub current_turn_user_id: Option<UserId>,
    pub current_map_id: String,
    pub is_locked: bool,
    pub created_at: u64,
}

impl Room {
    /// Create a room owned by `owner_id`. The owner starts with the turn.
    pub fn new(name: impl Into<String>, owner_id: UserId, map_id: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            owner_id,
            current_turn_user_id: Some(owner_id),
            current_map_id: map_id.into(),
            is_locked: false,
            created_at: now_millis(),
        }
    }

    pub fn is_admin(&self, user_id: UserId) -> bool {
        self.owner_id == user_id
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoomMember {
    pub id: Uuid,
    pub room_id: Uuid,
    pub user_id: UserId,
    pub display_name: String,
    pub joined_at: u64,
    pub last_seen_at: u64,
    pub is_active: bool,
}

impl RoomMember {
    pub fn new(room_id: Uuid, user_id: UserId, display_name: impl Into<String>) -> Self {
        let now = now_millis();
        Self {
            id: Uuid::new_v4(),
            room_id,
            user_id,
            display_name: display_name.into(),
            joined_at: now,
            last_seen_at: now,
            is_active: true,
        }
    }
}

// ───────────────────────────────────────────────────────────────────
// Units
// ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Unit {
    #[serde(default)]
    pub id: Uuid,
    #[serde(default)]
    pub room_id: Uuid,
    #[serde(default)]
    pub echelon: EchelonIndex,
    pub kind: String,
    pub x: f32,
    pub y: f32,
    #[serde(default)]
    pub z_order: i32,
    pub symbol_key: String,
    #[serde(default)]
    pub owner_user_id: Option<UserId>,
    /// Small slot number used by the UI to color owned units.
    #[serde(default)]
    pub owner_slot: Option<u8>,
    #[serde(default)]
    pub tint: Option<String>,
    #[serde(default)]
    pub updated_at: u64,
}

impl Unit {
    pub fn new(
        room_id: Uuid,
        echelon: EchelonIndex,
        kind: impl Into<String>,
        symbol_key: impl Into<String>,
        x: f32,
        y: f32,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            room_id,
            echelon,
            kind: kind.into(),
            x,
            y,
            z_order: 0,
            symbol_key: symbol_key.into(),
            owner_user_id: None,
            owner_slot: None,
            tint: None,
            updated_at: now_millis(),
        }
    }

    pub fn owned_by(mut self, user_id: UserId, slot: Option<u8>) -> Self {
        self.owner_user_id = Some(user_id);
        self.owner_slot = slot;
        self
    }

    pub fn validate(&self) -> Result<(), SyncError> {
        if !self.x.is_finite() || !self.y.is_finite() {
            return Err(SyncError::validation(format!(
                "unit {} has a non-finite position",
                self.id
            )));
        }
        if self.symbol_key.is_empty() {
            return Err(SyncError::validation(format!("unit {} has no symbol", self.id)));
        }
        Ok(())
    }

    /// Same unit with identity, placement and timestamps cleared, for
    /// value comparison across rooms and echelons.
    pub fn without_identity(&self) -> Unit {
        Unit {
            id: Uuid::nil(),
            room_id: Uuid::nil(),
            echelon: EchelonIndex::FIRST,
            updated_at: 0,
            ..self.clone()
        }
    }
}

/// Partial update of a unit. `None` fields are left untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UnitPatch {
    pub x: Option<f32>,
    pub y: Option<f32>,
    pub z_order: Option<i32>,
    pub symbol_key: Option<String>,
    pub tint: Option<String>,
}

impl UnitPatch {
    pub fn position(x: f32, y: f32) -> Self {
        Self {
            x: Some(x),
            y: Some(y),
            ..Self::default()
        }
    }

    pub fn tint(color: impl Into<String>) -> Self {
        Self {
            tint: Some(color.into()),
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        *self == UnitPatch::default()
    }

    pub fn validate(&self) -> Result<(), SyncError> {
        let finite = |v: Option<f32>| v.map_or(true, f32::is_finite);
        if !finite(self.x) || !finite(self.y) {
            return Err(SyncError::validation("unit patch has a non-finite position"));
        }
        if self.symbol_key.as_deref() == Some("") {
            return Err(SyncError::validation("unit patch clears the symbol"));
        }
        Ok(())
    }

    pub fn apply(&self, unit: &mut Unit) {
        if let Some(x) = self.x {
            unit.x = x;
        }
        if let Some(y) = self.y {
            unit.y = y;
        }
        if let Some(z) = self.z_order {
            unit.z_order = z;
        }
        if let Some(ref key) = self.symbol_key {
            unit.symbol_key = key.clone();
        }
        if let Some(ref tint) = self.tint {
            unit.tint = Some(tint.clone());
        }
    }

    /// Fold a newer patch into this one; newer fields win.
    pub fn merge(&mut self, newer: UnitPatch) {
        self.x = newer.x.or(self.x);
        self.y = newer.y.or(self.y);
        self.z_order = newer.z_order.or(self.z_order);
        self.symbol_key = newer.symbol_key.or(self.symbol_key.take());
        self.tint = newer.tint.or(self.tint.take());
    }
}

// ───────────────────────────────────────────────────────────────────
// Drawings
// ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ShapeType {
    Freehand,
    Line,
    Arrow,
    Circle,
    Polygon,
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Point {
    pub x: f32,
    pub y: f32,
}

impl Point {
    pub fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }
}

fn default_color() -> String {
    StrokeStyle::DEFAULT_COLOR.to_string()
}

fn default_stroke_width() -> f32 {
    StrokeStyle::DEFAULT_WIDTH
}

fn default_alpha() -> f32 {
    StrokeStyle::DEFAULT_ALPHA
}

/// Stroke style. Fields missing from imported plans fall back to the
/// fixed palette.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrokeStyle {
    #[serde(default = "default_color")]
    pub color: String,
    #[serde(default = "default_stroke_width")]
    pub stroke_width: f32,
    #[serde(default = "default_alpha")]
    pub alpha: f32,
    #[serde(default)]
    pub arrow_head: Option<bool>,
}

impl StrokeStyle {
    pub const DEFAULT_COLOR: &'static str = "#d62828";
    pub const DEFAULT_WIDTH: f32 = 3.0;
    pub const DEFAULT_ALPHA: f32 = 1.0;

    pub fn validate(&self) -> Result<(), SyncError> {
        if !(self.stroke_width.is_finite() && self.stroke_width > 0.0) {
            return Err(SyncError::validation("stroke width must be positive"));
        }
        if !(0.0..=1.0).contains(&self.alpha) {
            return Err(SyncError::validation("alpha must be within 0..=1"));
        }
        Ok(())
    }
}

impl Default for StrokeStyle {
    fn default() -> Self {
        Self {
            color: default_color(),
            stroke_width: default_stroke_width(),
            alpha: default_alpha(),
            arrow_head: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Drawing {
    #[serde(default)]
    pub id: Uuid,
    #[serde(default)]
    pub room_id: Uuid,
    #[serde(default)]
    pub echelon: EchelonIndex,
    pub shape: ShapeType,
    pub points: Vec<Point>,
    #[serde(default)]
    pub style: StrokeStyle,
    #[serde(default)]
    pub updated_at: u64,
}

impl Drawing {
    pub fn new(room_id: Uuid, echelon: EchelonIndex, shape: ShapeType, points: Vec<Point>) -> Self {
        Self {
            id: Uuid::new_v4(),
            room_id,
            echelon,
            shape,
            points,
            style: StrokeStyle::default(),
            updated_at: now_millis(),
        }
    }

    pub fn with_style(mut self, style: StrokeStyle) -> Self {
        self.style = style;
        self
    }

    pub fn validate(&self) -> Result<(), SyncError> {
        validate_points(&self.points)?;
        self.style.validate()
    }

    pub fn without_identity(&self) -> Drawing {
        Drawing {
            id: Uuid::nil(),
            room_id: Uuid::nil(),
            echelon: EchelonIndex::FIRST,
            updated_at: 0,
            ..self.clone()
        }
    }
}

fn validate_points(points: &[Point]) -> Result<(), SyncError> {
    if points.len() < MIN_SHAPE_POINTS {
        return Err(SyncError::validation(format!(
            "shape needs at least {MIN_SHAPE_POINTS} points, got {}",
            points.len()
        )));
    }
    if points.iter().any(|p| !p.x.is_finite() || !p.y.is_finite()) {
        return Err(SyncError::validation("shape has a non-finite point"));
    }
    Ok(())
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DrawingPatch {
    pub points: Option<Vec<Point>>,
    pub style: Option<StrokeStyle>,
}

impl DrawingPatch {
    pub fn validate(&self) -> Result<(), SyncError> {
        if let Some(ref points) = self.points {
            validate_points(points)?;
        }
        if let Some(ref style) = self.style {
            style.validate()?;
        }
        Ok(())
    }

    pub fn apply(&self, drawing: &mut Drawing) {
        if let Some(ref points) = self.points {
            drawing.points = points.clone();
        }
        if let Some(ref style) = self.style {
            drawing.style = style.clone();
        }
    }

    pub fn merge(&mut self, newer: DrawingPatch) {
        self.points = newer.points.or(self.points.take());
        self.style = newer.style.or(self.style.take());
    }
}

// ───────────────────────────────────────────────────────────────────
// Entity sum types
// ───────────────────────────────────────────────────────────────────

/// The two entity classes held by the entity store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntityKind {
    Unit,
    Drawing,
}

impl From<EntityKind> for EntityClass {
    fn from(kind: EntityKind) -> Self {
        match kind {
            EntityKind::Unit => EntityClass::Unit,
            EntityKind::Drawing => EntityClass::Drawing,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Entity {
    Unit(Unit),
    Drawing(Drawing),
}

impl Entity {
    pub fn id(&self) -> Uuid {
        match self {
            Entity::Unit(u) => u.id,
            Entity::Drawing(d) => d.id,
        }
    }

    pub fn room_id(&self) -> Uuid {
        match self {
            Entity::Unit(u) => u.room_id,
            Entity::Drawing(d) => d.room_id,
        }
    }

    pub fn echelon(&self) -> EchelonIndex {
        match self {
            Entity::Unit(u) => u.echelon,
            Entity::Drawing(d) => d.echelon,
        }
    }

    pub fn kind(&self) -> EntityKind {
        match self {
            Entity::Unit(_) => EntityKind::Unit,
            Entity::Drawing(_) => EntityKind::Drawing,
        }
    }

    /// Owner used by the write gate. Drawings are never owned.
    pub fn owner(&self) -> Option<UserId> {
        match self {
            Entity::Unit(u) => u.owner_user_id,
            Entity::Drawing(_) => None,
        }
    }

    pub fn validate(&self) -> Result<(), SyncError> {
        match self {
            Entity::Unit(u) => u.validate(),
            Entity::Drawing(d) => d.validate(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum EntityPatch {
    Unit(UnitPatch),
    Drawing(DrawingPatch),
}

impl EntityPatch {
    pub fn kind(&self) -> EntityKind {
        match self {
            EntityPatch::Unit(_) => EntityKind::Unit,
            EntityPatch::Drawing(_) => EntityKind::Drawing,
        }
    }

    pub fn validate(&self) -> Result<(), SyncError> {
        match self {
            EntityPatch::Unit(p) => p.validate(),
            EntityPatch::Drawing(p) => p.validate(),
        }
    }

    /// Apply to a matching entity. Returns `false` on a class mismatch.
    pub fn apply(&self, entity: &mut Entity) -> bool {
        match (self, entity) {
            (EntityPatch::Unit(p), Entity::Unit(u)) => {
                p.apply(u);
                true
            }
            (EntityPatch::Drawing(p), Entity::Drawing(d)) => {
                p.apply(d);
                true
            }
            _ => false,
        }
    }
}
