//! Entity store: rooms, members, units and drawings.
//!
//! ```text
//! ┌─────────────┐   MapStore   ┌──────────────┐
//! │  RoomHub    │ ───────────► │ MemoryStore  │  (default)
//! │ (commit     │              └──────────────┘
//! │  section)   │              ┌──────────────┐
//! └─────────────┘ ───────────► │ RocksStore   │  CF rooms / members /
//!                              │ (RocksDB)    │     units / drawings
//!                              └──────────────┘
//! ```
//!
//! Adapters implement a handful of row primitives. The map operations
//! (`create`, `update`, `delete`, `list_by_echelon`, `clear`,
//! `copy_echelon`) are provided on top of them, so both adapters share
//! one set of semantics. Nothing here is transactional across classes.

pub mod memory;
pub mod rocks;

pub use memory::MemoryStore;
pub use rocks::{RocksStore, StoreConfig};

use battlemap_core::{
    now_millis, Drawing, EchelonIndex, Entity, EntityClass, EntityKind, EntityPatch, Room,
    RoomMember, SyncError, Unit, UserId,
};
use thiserror::Error;
use uuid::Uuid;

/// Adapter failures. All of them surface as `SyncError::TransientIo`.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(String),
    #[error("column family '{0}' not found")]
    MissingColumnFamily(String),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("deserialization error: {0}")]
    Deserialization(String),
    #[error("compression error: {0}")]
    Compression(String),
    #[error("store lock poisoned")]
    Poisoned,
}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

impl From<StoreError> for SyncError {
    fn from(e: StoreError) -> Self {
        SyncError::TransientIo(e.to_string())
    }
}

/// Rows removed by [`MapStore::clear`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ClearReport {
    pub units: Vec<Unit>,
    pub drawings: Vec<Drawing>,
}

impl ClearReport {
    pub fn is_empty(&self) -> bool {
        self.units.is_empty() && self.drawings.is_empty()
    }
}

/// Outcome of copying one entity class. `created` holds what was written
/// before `error` stopped the class.
#[derive(Debug, Clone, PartialEq)]
pub struct ClassCopy<T> {
    pub created: Vec<T>,
    pub error: Option<SyncError>,
}

impl<T> Default for ClassCopy<T> {
    fn default() -> Self {
        Self {
            created: Vec::new(),
            error: None,
        }
    }
}

/// Per-class result of [`MapStore::copy_echelon`]. Partial copies are
/// not rolled back.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CopyReport {
    pub units: ClassCopy<Unit>,
    pub drawings: ClassCopy<Drawing>,
}

impl CopyReport {
    pub fn is_complete(&self) -> bool {
        self.units.error.is_none() && self.drawings.error.is_none()
    }

    pub fn first_error(&self) -> Option<&SyncError> {
        self.units.error.as_ref().or(self.drawings.error.as_ref())
    }
}

pub trait MapStore: Send + Sync {
    // ─── Rooms ────────────────────────────────────────────────────────

    fn get_room(&self, id: Uuid) -> Result<Option<Room>, StoreError>;
    fn put_room(&self, room: &Room) -> Result<(), StoreError>;
    fn list_rooms(&self) -> Result<Vec<Room>, StoreError>;
    /// Delete a room with its members, units and drawings.
    fn delete_room(&self, id: Uuid) -> Result<Option<Room>, StoreError>;

    // ─── Members ──────────────────────────────────────────────────────

    fn upsert_member(&self, member: &RoomMember) -> Result<(), StoreError>;
    fn remove_member(&self, room_id: Uuid, user_id: UserId)
        -> Result<Option<RoomMember>, StoreError>;
    fn list_members(&self, room_id: Uuid) -> Result<Vec<RoomMember>, StoreError>;

    // ─── Entity rows ──────────────────────────────────────────────────

    fn put_unit(&self, unit: &Unit) -> Result<(), StoreError>;
    fn get_unit(&self, room_id: Uuid, id: Uuid) -> Result<Option<Unit>, StoreError>;
    fn remove_unit(&self, room_id: Uuid, id: Uuid) -> Result<Option<Unit>, StoreError>;
    fn list_units(&self, room_id: Uuid, echelon: EchelonIndex) -> Result<Vec<Unit>, StoreError>;

    fn put_drawing(&self, drawing: &Drawing) -> Result<(), StoreError>;
    fn get_drawing(&self, room_id: Uuid, id: Uuid) -> Result<Option<Drawing>, StoreError>;
    fn remove_drawing(&self, room_id: Uuid, id: Uuid) -> Result<Option<Drawing>, StoreError>;
    fn list_drawings(
        &self,
        room_id: Uuid,
        echelon: EchelonIndex,
    ) -> Result<Vec<Drawing>, StoreError>;

    // ─── Provided map operations ──────────────────────────────────────

    /// Insert a new room. Fails if the id is taken.
    fn insert_room(&self, room: &Room) -> Result<(), SyncError> {
        if self.get_room(room.id)?.is_some() {
            return Err(SyncError::validation(format!("room {} already exists", room.id)));
        }
        Ok(self.put_room(room)?)
    }

    fn get_entity(&self, room_id: Uuid, kind: EntityKind, id: Uuid) -> Result<Option<Entity>, SyncError> {
        Ok(match kind {
            EntityKind::Unit => self.get_unit(room_id, id)?.map(Entity::Unit),
            EntityKind::Drawing => self.get_drawing(room_id, id)?.map(Entity::Drawing),
        })
    }

    /// Insert a new entity. Fails if the id is already used by a unit or
    /// drawing anywhere in the room, on any echelon.
    fn create(&self, entity: Entity) -> Result<Entity, SyncError> {
        entity.validate()?;
        let (room_id, id) = match &entity {
            Entity::Unit(u) => (u.room_id, u.id),
            Entity::Drawing(d) => (d.room_id, d.id),
        };
        if self.get_unit(room_id, id)?.is_some() || self.get_drawing(room_id, id)?.is_some() {
            return Err(SyncError::validation(format!("entity {id} already exists")));
        }
        match &entity {
            Entity::Unit(u) => self.put_unit(u)?,
            Entity::Drawing(d) => self.put_drawing(d)?,
        }
        Ok(entity)
    }

    /// Patch an entity in place. A missing id is `NotFound`.
    fn update(&self, room_id: Uuid, id: Uuid, patch: &EntityPatch) -> Result<Entity, SyncError> {
        patch.validate()?;
        let kind = patch.kind();
        let mut entity = self
            .get_entity(room_id, kind, id)?
            .ok_or_else(|| SyncError::not_found(EntityClass::from(kind), id))?;
        patch.apply(&mut entity);
        entity.validate()?;
        match &mut entity {
            Entity::Unit(u) => {
                u.updated_at = now_millis();
                self.put_unit(u)?;
            }
            Entity::Drawing(d) => {
                d.updated_at = now_millis();
                self.put_drawing(d)?;
            }
        }
        Ok(entity)
    }

    /// Delete an entity. A missing id is a successful no-op.
    fn delete(&self, room_id: Uuid, kind: EntityKind, id: Uuid) -> Result<Option<Entity>, SyncError> {
        Ok(match kind {
            EntityKind::Unit => self.remove_unit(room_id, id)?.map(Entity::Unit),
            EntityKind::Drawing => self.remove_drawing(room_id, id)?.map(Entity::Drawing),
        })
    }

    fn list_by_echelon(
        &self,
        room_id: Uuid,
        echelon: EchelonIndex,
    ) -> Result<(Vec<Unit>, Vec<Drawing>), SyncError> {
        Ok((
            self.list_units(room_id, echelon)?,
            self.list_drawings(room_id, echelon)?,
        ))
    }

    /// Remove the selected classes from one echelon of one room.
    fn clear(
        &self,
        room_id: Uuid,
        echelon: EchelonIndex,
        units: bool,
        drawings: bool,
    ) -> Result<ClearReport, SyncError> {
        let mut report = ClearReport::default();
        if units {
            for unit in self.list_units(room_id, echelon)? {
                if let Some(removed) = self.remove_unit(room_id, unit.id)? {
                    report.units.push(removed);
                }
            }
        }
        if drawings {
            for drawing in self.list_drawings(room_id, echelon)? {
                if let Some(removed) = self.remove_drawing(room_id, drawing.id)? {
                    report.drawings.push(removed);
                }
            }
        }
        Ok(report)
    }

    /// Duplicate every unit and drawing of `from` into `to` with fresh ids.
    /// Each class stops at its first failure; the other class still runs.
    fn copy_echelon(&self, room_id: Uuid, from: EchelonIndex, to: EchelonIndex) -> CopyReport {
        let mut report = CopyReport::default();
        let now = now_millis();

        match self.list_units(room_id, from) {
            Ok(units) => {
                for unit in units {
                    let copy = Unit {
                        id: Uuid::new_v4(),
                        echelon: to,
                        updated_at: now,
                        ..unit
                    };
                    if let Err(e) = self.put_unit(&copy) {
                        report.units.error = Some(e.into());
                        break;
                    }
                    report.units.created.push(copy);
                }
            }
            Err(e) => report.units.error = Some(e.into()),
        }

        match self.list_drawings(room_id, from) {
            Ok(drawings) => {
                for drawing in drawings {
                    let copy = Drawing {
                        id: Uuid::new_v4(),
                        echelon: to,
                        updated_at: now,
                        ..drawing
                    };
                    if let Err(e) = self.put_drawing(&copy) {
                        report.drawings.error = Some(e.into());
                        break;
                    }
                    report.drawings.created.push(copy);
                }
            }
            Err(e) => report.drawings.error = Some(e.into()),
        }

        report
    }
}
