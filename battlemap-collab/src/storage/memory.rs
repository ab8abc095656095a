//! In-process store used when no storage path is configured.

use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use battlemap_core::{Drawing, EchelonIndex, Room, RoomMember, Unit, UserId};
use uuid::Uuid;

use super::{MapStore, StoreError};

#[derive(Default)]
struct Tables {
    rooms: HashMap<Uuid, Room>,
    members: HashMap<(Uuid, UserId), RoomMember>,
    units: HashMap<(Uuid, Uuid), Unit>,
    drawings: HashMap<(Uuid, Uuid), Drawing>,
}

/// Hash-map tables behind one lock. Listings are sorted by
/// `(z_order, updated_at, id)` for units and `(updated_at, id)` for
/// drawings so callers see a stable order.
#[derive(Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, Tables>, StoreError> {
        self.tables.read().map_err(|_| StoreError::Poisoned)
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Tables>, StoreError> {
        self.tables.write().map_err(|_| StoreError::Poisoned)
    }
}

impl MapStore for MemoryStore {
    fn get_room(&self, id: Uuid) -> Result<Option<Room>, StoreError> {
        Ok(self.read()?.rooms.get(&id).cloned())
    }

    fn put_room(&self, room: &Room) -> Result<(), StoreError> {
        self.write()?.rooms.insert(room.id, room.clone());
        Ok(())
    }

    fn list_rooms(&self) -> Result<Vec<Room>, StoreError> {
        let mut rooms: Vec<Room> = self.read()?.rooms.values().cloned().collect();
        rooms.sort_by_key(|r| (r.created_at, r.id));
        Ok(rooms)
    }

    fn delete_room(&self, id: Uuid) -> Result<Option<Room>, StoreError> {
        let mut t = self.write()?;
        let removed = t.rooms.remove(&id);
        t.members.retain(|(room, _), _| *room != id);
        t.units.retain(|(room, _), _| *room != id);
        t.drawings.retain(|(room, _), _| *room != id);
        Ok(removed)
    }

    fn upsert_member(&self, member: &RoomMember) -> Result<(), StoreError> {
        self.write()?
            .members
            .insert((member.room_id, member.user_id), member.clone());
        Ok(())
    }

    fn remove_member(
        &self,
        room_id: Uuid,
        user_id: UserId,
    ) -> Result<Option<RoomMember>, StoreError> {
        Ok(self.write()?.members.remove(&(room_id, user_id)))
    }

    fn list_members(&self, room_id: Uuid) -> Result<Vec<RoomMember>, StoreError> {
        let mut members: Vec<RoomMember> = self
            .read()?
            .members
            .values()
            .filter(|m| m.room_id == room_id)
            .cloned()
            .collect();
        members.sort_by_key(|m| (m.joined_at, m.user_id));
        Ok(members)
    }

    fn put_unit(&self, unit: &Unit) -> Result<(), StoreError> {
        self.write()?
            .units
            .insert((unit.room_id, unit.id), unit.clone());
        Ok(())
    }

    fn get_unit(&self, room_id: Uuid, id: Uuid) -> Result<Option<Unit>, StoreError> {
        Ok(self.read()?.units.get(&(room_id, id)).cloned())
    }

    fn remove_unit(&self, room_id: Uuid, id: Uuid) -> Result<Option<Unit>, StoreError> {
        Ok(self.write()?.units.remove(&(room_id, id)))
    }

    fn list_units(&self, room_id: Uuid, echelon: EchelonIndex) -> Result<Vec<Unit>, StoreError> {
        let mut units: Vec<Unit> = self
            .read()?
            .units
            .values()
            .filter(|u| u.room_id == room_id && u.echelon == echelon)
            .cloned()
            .collect();
        units.sort_by_key(|u| (u.z_order, u.updated_at, u.id));
        Ok(units)
    }

    fn put_drawing(&self, drawing: &Drawing) -> Result<(), StoreError> {
        self.write()?
            .drawings
            .insert((drawing.room_id, drawing.id), drawing.clone());
        Ok(())
    }

    fn get_drawing(&self, room_id: Uuid, id: Uuid) -> Result<Option<Drawing>, StoreError> {
        Ok(self.read()?.drawings.get(&(room_id, id)).cloned())
    }

    fn remove_drawing(&self, room_id: Uuid, id: Uuid) -> Result<Option<Drawing>, StoreError> {
        Ok(self.write()?.drawings.remove(&(room_id, id)))
    }

    fn list_drawings(
        &self,
        room_id: Uuid,
        echelon: EchelonIndex,
    ) -> Result<Vec<Drawing>, StoreError> {
        let mut drawings: Vec<Drawing> = self
            .read()?
            .drawings
            .values()
            .filter(|d| d.room_id == room_id && d.echelon == echelon)
            .cloned()
            .collect();
        drawings.sort_by_key(|d| (d.updated_at, d.id));
        Ok(drawings)
    }
}
