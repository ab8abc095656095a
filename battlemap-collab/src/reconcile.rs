//! Client-side view of one (room, echelon).
//!
//! The view keeps the local entity cache, applies local edits
//! optimistically (with an undo entry per edit until the server answers),
//! applies remote change events as authoritative, and computes where each
//! unit should be drawn right now.
//!
//! ```text
//!  snapshot ──► cache (replace wholesale, last_seq = snapshot.seq)
//!  local edit ──► gate pre-check ──► cache + undo[edit] ──► Mutation
//!                                    confirm(edit) drops undo / reject(edit) restores
//!  event seq == last_seq + 1 ──► cache (authoritative) ──► tween rendered → new
//!  event seq >  last_seq + 1 ──► stale, refetch snapshot
//! ```
//!
//! Time is passed in by the caller (frame clock), nothing here sleeps.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::{Duration, Instant};
use uuid::Uuid;

use battlemap_core::{
    authorize, authorize_all, Admission, ChangeEvent, ChangeKind, ChangePayload, Drawing,
    EchelonIndex, Entity, EntityClass, EntityKind, Mutation, Room, SyncError, Unit, UnitPatch,
    UserId, WriteThrottle, DEFAULT_WRITE_INTERVAL,
};

use crate::room::RoomSnapshot;

/// Duration of the glide from the last rendered position to a remote update.
pub const UPDATE_TWEEN: Duration = Duration::from_millis(250);
/// Fade-in of a remotely inserted entity.
pub const ENTRANCE_DURATION: Duration = Duration::from_millis(200);

/// 2D position in map coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Vec2 {
    pub x: f32,
    pub y: f32,
}

impl Vec2 {
    pub const ZERO: Vec2 = Vec2 { x: 0.0, y: 0.0 };

    pub fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }

    /// Euclidean distance to another point.
    pub fn distance(&self, other: &Vec2) -> f32 {
        let dx = self.x - other.x;
        let dy = self.y - other.y;
        (dx * dx + dy * dy).sqrt()
    }

    /// Linear interpolation toward `target` by factor `t` ∈ [0, 1].
    pub fn lerp(&self, target: &Vec2, t: f32) -> Vec2 {
        Vec2 {
            x: self.x + (target.x - self.x) * t,
            y: self.y + (target.y - self.y) * t,
        }
    }
}

impl From<&Unit> for Vec2 {
    fn from(unit: &Unit) -> Self {
        Vec2::new(unit.x, unit.y)
    }
}

fn ease_out_cubic(t: f32) -> f32 {
    1.0 - (1.0 - t).powi(3)
}

fn progress(started: Instant, duration: Duration, now: Instant) -> f32 {
    let elapsed = now.saturating_duration_since(started).as_secs_f32();
    (elapsed / duration.as_secs_f32()).clamp(0.0, 1.0)
}

#[derive(Debug, Clone, Copy)]
struct Tween {
    from: Vec2,
    to: Vec2,
    started: Instant,
}

impl Tween {
    fn sample(&self, now: Instant) -> Vec2 {
        let t = ease_out_cubic(progress(self.started, UPDATE_TWEEN, now));
        self.from.lerp(&self.to, t)
    }

    fn is_done(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.started) >= UPDATE_TWEEN
    }
}

/// Handle of one optimistic local edit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EditId(u64);

#[derive(Debug, Clone)]
enum Undo {
    Restore(Entity),
    Remove(EntityKind, Uuid),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventOutcome {
    Applied,
    /// Other room, other echelon, membership, or already in the snapshot.
    Ignored,
    /// A sequence gap was detected; the view is stale until a new snapshot.
    ResyncRequired,
}

/// One unit as it should be drawn this frame.
#[derive(Debug, Clone, PartialEq)]
pub struct RenderedUnit {
    pub id: Uuid,
    pub position: Vec2,
    pub opacity: f32,
    pub z_order: i32,
    pub selected: bool,
}

#[derive(Debug, Clone, Copy)]
struct DragState {
    unit_id: Uuid,
    origin: Vec2,
    position: Vec2,
}

pub struct MapView {
    room_id: Uuid,
    echelon: EchelonIndex,
    user_id: UserId,
    room: Option<Room>,
    units: HashMap<Uuid, Unit>,
    drawings: HashMap<Uuid, Drawing>,
    tweens: HashMap<Uuid, Tween>,
    entrances: HashMap<Uuid, Instant>,
    selection: HashSet<Uuid>,
    pending: BTreeMap<EditId, Vec<Undo>>,
    next_edit: u64,
    drag: Option<DragState>,
    throttle: WriteThrottle<Uuid, UnitPatch>,
    /// Edit ids of drag releases waiting in the throttle, by unit.
    deferred_edits: HashMap<Uuid, EditId>,
    last_seq: u64,
    stale: bool,
}

impl MapView {
    pub fn new(room_id: Uuid, echelon: EchelonIndex, user_id: UserId) -> Self {
        Self::with_write_interval(room_id, echelon, user_id, DEFAULT_WRITE_INTERVAL)
    }

    pub fn with_write_interval(
        room_id: Uuid,
        echelon: EchelonIndex,
        user_id: UserId,
        interval: Duration,
    ) -> Self {
        Self {
            room_id,
            echelon,
            user_id,
            room: None,
            units: HashMap::new(),
            drawings: HashMap::new(),
            tweens: HashMap::new(),
            entrances: HashMap::new(),
            selection: HashSet::new(),
            pending: BTreeMap::new(),
            next_edit: 1,
            drag: None,
            throttle: WriteThrottle::new(interval),
            deferred_edits: HashMap::new(),
            last_seq: 0,
            stale: true,
        }
    }

    // ─── Snapshot / staleness ─────────────────────────────────────────

    /// Replace the cache wholesale. In-flight animations, drags and
    /// optimistic edits are discarded; selection keeps surviving ids.
    pub fn load_snapshot(&mut self, snapshot: RoomSnapshot) -> Result<(), SyncError> {
        if snapshot.room.id != self.room_id || snapshot.echelon != self.echelon {
            return Err(SyncError::validation(format!(
                "snapshot of {}/{} loaded into view of {}/{}",
                snapshot.room.id, snapshot.echelon, self.room_id, self.echelon
            )));
        }
        self.discard_in_flight();
        self.units = snapshot.units.into_iter().map(|u| (u.id, u)).collect();
        self.drawings = snapshot.drawings.into_iter().map(|d| (d.id, d)).collect();
        let (units, drawings) = (&self.units, &self.drawings);
        self.selection
            .retain(|id| units.contains_key(id) || drawings.contains_key(id));
        self.room = Some(snapshot.room);
        self.last_seq = snapshot.seq;
        self.stale = false;
        log::debug!(
            "view {}/{} loaded at seq {} ({} units, {} drawings)",
            self.room_id,
            self.echelon,
            self.last_seq,
            self.units.len(),
            self.drawings.len()
        );
        Ok(())
    }

    /// Connection lost or events dropped: stop trusting the cache until the
    /// next snapshot.
    pub fn mark_stale(&mut self) {
        if !self.stale {
            log::debug!("view {}/{} is stale", self.room_id, self.echelon);
        }
        self.stale = true;
        self.discard_in_flight();
    }

    fn discard_in_flight(&mut self) {
        self.tweens.clear();
        self.entrances.clear();
        self.pending.clear();
        self.deferred_edits.clear();
        self.drag = None;
        self.throttle = WriteThrottle::new(self.throttle.interval());
    }

    pub fn is_stale(&self) -> bool {
        self.stale
    }

    pub fn last_seq(&self) -> u64 {
        self.last_seq
    }

    pub fn room_id(&self) -> Uuid {
        self.room_id
    }

    pub fn echelon(&self) -> EchelonIndex {
        self.echelon
    }

    pub fn room(&self) -> Option<&Room> {
        self.room.as_ref()
    }

    pub fn unit(&self, id: Uuid) -> Option<&Unit> {
        self.units.get(&id)
    }

    pub fn drawing(&self, id: Uuid) -> Option<&Drawing> {
        self.drawings.get(&id)
    }

    /// Cached units in paint order.
    pub fn units(&self) -> Vec<&Unit> {
        let mut units: Vec<&Unit> = self.units.values().collect();
        units.sort_by_key(|u| (u.z_order, u.updated_at, u.id));
        units
    }

    pub fn drawings(&self) -> Vec<&Drawing> {
        let mut drawings: Vec<&Drawing> = self.drawings.values().collect();
        drawings.sort_by_key(|d| (d.updated_at, d.id));
        drawings
    }

    // ─── Remote events ────────────────────────────────────────────────

    /// Apply one change event from the room feed.
    pub fn apply_event(&mut self, event: &ChangeEvent, now: Instant) -> EventOutcome {
        if event.room_id != self.room_id || self.stale || event.seq <= self.last_seq {
            return EventOutcome::Ignored;
        }
        if event.seq > self.last_seq + 1 {
            log::warn!(
                "view {}/{}: expected seq {}, got {}",
                self.room_id,
                self.echelon,
                self.last_seq + 1,
                event.seq
            );
            self.mark_stale();
            return EventOutcome::ResyncRequired;
        }
        self.last_seq = event.seq;

        match (&event.kind, &event.payload) {
            (ChangeKind::Delete, ChangePayload::Room(_)) => {
                self.room = None;
                self.units.clear();
                self.drawings.clear();
                self.selection.clear();
                self.discard_in_flight();
                EventOutcome::Applied
            }
            (_, ChangePayload::Room(room)) => {
                self.room = Some(room.clone());
                EventOutcome::Applied
            }
            (_, ChangePayload::Member(_)) => EventOutcome::Ignored,
            (_, payload) if payload.echelon() != Some(self.echelon) => EventOutcome::Ignored,
            (ChangeKind::Delete, ChangePayload::Unit(unit)) => {
                self.supersede(unit.id);
                self.forget(unit.id);
                self.units.remove(&unit.id);
                EventOutcome::Applied
            }
            (ChangeKind::Delete, ChangePayload::Drawing(drawing)) => {
                self.supersede(drawing.id);
                self.forget(drawing.id);
                self.drawings.remove(&drawing.id);
                EventOutcome::Applied
            }
            (_, ChangePayload::Unit(unit)) => {
                self.supersede(unit.id);
                self.apply_remote_unit(unit.clone(), now);
                EventOutcome::Applied
            }
            (_, ChangePayload::Drawing(drawing)) => {
                self.supersede(drawing.id);
                if self.drawings.insert(drawing.id, drawing.clone()).is_none() {
                    self.entrances.insert(drawing.id, now);
                }
                EventOutcome::Applied
            }
        }
    }

    /// Insert or update is authoritative for the cache; the rendered
    /// position glides from where it was drawn to the new value.
    fn apply_remote_unit(&mut self, unit: Unit, now: Instant) {
        let id = unit.id;
        let rendered = self.unit_position(id, now);
        let target = Vec2::from(&unit);
        if self.units.insert(id, unit).is_none() {
            self.entrances.insert(id, now);
            return;
        }
        let dragging = self.drag.is_some_and(|d| d.unit_id == id);
        match rendered {
            Some(from) if from != target && !dragging => {
                self.tweens.insert(
                    id,
                    Tween {
                        from,
                        to: target,
                        started: now,
                    },
                );
            }
            _ => {
                self.tweens.remove(&id);
            }
        }
    }

    /// The server has spoken about `id`: pending undo steps for it would
    /// roll back to older data, so they are dropped.
    fn supersede(&mut self, id: Uuid) {
        for steps in self.pending.values_mut() {
            steps.retain(|step| match step {
                Undo::Restore(entity) => entity.id() != id,
                Undo::Remove(_, removed) => *removed != id,
            });
        }
    }

    /// Drop view state that references an entity about to disappear.
    fn forget(&mut self, id: Uuid) {
        self.selection.remove(&id);
        self.tweens.remove(&id);
        self.entrances.remove(&id);
        if self.drag.is_some_and(|d| d.unit_id == id) {
            self.drag = None;
        }
    }

    // ─── Local edits ──────────────────────────────────────────────────

    /// Advisory gate check against the cached room. The server decides.
    pub fn can_edit(&self, target_owner: Option<UserId>) -> Result<(), SyncError> {
        let room = self
            .room
            .as_ref()
            .ok_or_else(|| SyncError::validation("view has no snapshot yet"))?;
        authorize(self.user_id, room, target_owner).into_result()
    }

    fn record(&mut self, undo: Vec<Undo>) -> EditId {
        let id = EditId(self.next_edit);
        self.next_edit += 1;
        self.pending.insert(id, undo);
        id
    }

    pub fn place_unit(&mut self, mut unit: Unit) -> Result<(EditId, Mutation), SyncError> {
        unit.room_id = self.room_id;
        unit.echelon = self.echelon;
        unit.validate()?;
        self.can_edit(unit.owner_user_id)?;
        self.units.insert(unit.id, unit.clone());
        let edit = self.record(vec![Undo::Remove(EntityKind::Unit, unit.id)]);
        Ok((edit, Mutation::CreateUnit(unit)))
    }

    pub fn draw(&mut self, mut drawing: Drawing) -> Result<(EditId, Mutation), SyncError> {
        drawing.room_id = self.room_id;
        drawing.echelon = self.echelon;
        drawing.validate()?;
        self.can_edit(None)?;
        self.drawings.insert(drawing.id, drawing.clone());
        let edit = self.record(vec![Undo::Remove(EntityKind::Drawing, drawing.id)]);
        Ok((edit, Mutation::CreateDrawing(drawing)))
    }

    pub fn update_unit(&mut self, id: Uuid, patch: UnitPatch) -> Result<(EditId, Mutation), SyncError> {
        let current = self
            .units
            .get(&id)
            .cloned()
            .ok_or_else(|| SyncError::not_found(EntityClass::Unit, id))?;
        patch.validate()?;
        self.can_edit(current.owner_user_id)?;

        let mut updated = current.clone();
        patch.apply(&mut updated);
        self.units.insert(id, updated);
        self.tweens.remove(&id);
        let edit = self.record(vec![Undo::Restore(Entity::Unit(current))]);
        Ok((edit, Mutation::UpdateUnit { id, patch }))
    }

    pub fn delete_unit(&mut self, id: Uuid) -> Result<(EditId, Mutation), SyncError> {
        let owner = self.units.get(&id).and_then(|u| u.owner_user_id);
        self.can_edit(owner)?;
        self.forget(id);
        let undo = self
            .units
            .remove(&id)
            .map(|u| vec![Undo::Restore(Entity::Unit(u))])
            .unwrap_or_default();
        Ok((self.record(undo), Mutation::DeleteUnit { id }))
    }

    pub fn delete_drawing(&mut self, id: Uuid) -> Result<(EditId, Mutation), SyncError> {
        self.can_edit(None)?;
        self.forget(id);
        let undo = self
            .drawings
            .remove(&id)
            .map(|d| vec![Undo::Restore(Entity::Drawing(d))])
            .unwrap_or_default();
        Ok((self.record(undo), Mutation::DeleteDrawing { id }))
    }

    /// "Clear front" (`units: false`) or "clear map" on this echelon.
    pub fn clear(&mut self, units: bool, drawings: bool) -> Result<(EditId, Mutation), SyncError> {
        let mutation = Mutation::Clear {
            echelon: self.echelon,
            units,
            drawings,
        };
        mutation.validate()?;
        let room = self
            .room
            .as_ref()
            .ok_or_else(|| SyncError::validation("view has no snapshot yet"))?;
        let owners: Vec<Option<UserId>> = if units {
            self.units.values().map(|u| u.owner_user_id).collect()
        } else {
            Vec::new()
        };
        authorize_all(self.user_id, room, owners).into_result()?;

        let mut undo = Vec::new();
        if units {
            for (_, unit) in self.units.drain() {
                undo.push(Undo::Restore(Entity::Unit(unit)));
            }
        }
        if drawings {
            for (_, drawing) in self.drawings.drain() {
                undo.push(Undo::Restore(Entity::Drawing(drawing)));
            }
        }
        let (units_left, drawings_left) = (&self.units, &self.drawings);
        self.selection
            .retain(|id| units_left.contains_key(id) || drawings_left.contains_key(id));
        self.tweens.clear();
        self.entrances.clear();
        self.drag = None;
        Ok((self.record(undo), mutation))
    }

    /// The server accepted the edit; its change event is authoritative.
    pub fn confirm(&mut self, edit: EditId) -> bool {
        self.pending.remove(&edit).is_some()
    }

    /// The server rejected the edit: put back what it changed, except for
    /// entities a remote event has touched since.
    pub fn reject(&mut self, edit: EditId) -> bool {
        let Some(undo) = self.pending.remove(&edit) else {
            return false;
        };
        for step in undo.into_iter().rev() {
            match step {
                Undo::Restore(Entity::Unit(unit)) => {
                    self.tweens.remove(&unit.id);
                    self.units.insert(unit.id, unit);
                }
                Undo::Restore(Entity::Drawing(drawing)) => {
                    self.drawings.insert(drawing.id, drawing);
                }
                Undo::Remove(EntityKind::Unit, id) => {
                    self.forget(id);
                    self.units.remove(&id);
                }
                Undo::Remove(EntityKind::Drawing, id) => {
                    self.forget(id);
                    self.drawings.remove(&id);
                }
            }
        }
        log::debug!("view {}/{}: rolled back edit {:?}", self.room_id, self.echelon, edit);
        true
    }

    pub fn pending_edits(&self) -> usize {
        self.pending.len()
    }

    // ─── Drag ─────────────────────────────────────────────────────────

    pub fn begin_drag(&mut self, unit_id: Uuid) -> Result<(), SyncError> {
        let unit = self
            .units
            .get(&unit_id)
            .ok_or_else(|| SyncError::not_found(EntityClass::Unit, unit_id))?;
        self.can_edit(unit.owner_user_id)?;
        let origin = Vec2::from(unit);
        self.tweens.remove(&unit_id);
        self.drag = Some(DragState {
            unit_id,
            origin,
            position: origin,
        });
        Ok(())
    }

    /// Per-frame pointer update. Local only; nothing is sent.
    pub fn drag_to(&mut self, x: f32, y: f32) {
        if let Some(drag) = self.drag.as_mut() {
            drag.position = Vec2::new(x, y);
        }
    }

    pub fn cancel_drag(&mut self) {
        self.drag = None;
    }

    pub fn is_dragging(&self) -> bool {
        self.drag.is_some()
    }

    /// Release: the final position is applied locally and offered to the
    /// write throttle. Returns the mutation to send now, or `None` when it
    /// was coalesced (see [`MapView::take_due_writes`]) or nothing moved.
    pub fn end_drag(&mut self, now: Instant) -> Option<(EditId, Mutation)> {
        let drag = self.drag.take()?;
        if drag.position == drag.origin {
            return None;
        }
        let id = drag.unit_id;
        let previous = self.units.get(&id).cloned()?;

        let patch = UnitPatch::position(drag.position.x, drag.position.y);
        let mut moved = previous.clone();
        patch.apply(&mut moved);
        self.units.insert(id, moved);
        self.tweens.remove(&id);

        // Consecutive releases inside one interval share one edit and undo.
        let edit = match self.deferred_edits.get(&id) {
            Some(edit) => *edit,
            None => self.record(vec![Undo::Restore(Entity::Unit(previous))]),
        };

        match self.throttle.offer(id, patch, now) {
            Admission::Now(patch) => {
                self.deferred_edits.remove(&id);
                Some((edit, Mutation::UpdateUnit { id, patch }))
            }
            Admission::Deferred { .. } => {
                self.deferred_edits.insert(id, edit);
                None
            }
        }
    }

    /// Coalesced drag releases whose interval has elapsed. Also prunes
    /// throttle slots of units that have gone quiet.
    pub fn take_due_writes(&mut self, now: Instant) -> Vec<(EditId, Mutation)> {
        let due = self.throttle.take_due(now);
        self.throttle.forget_idle(now);
        let mut writes = Vec::with_capacity(due.len());
        for (id, patch) in due {
            if let Some(edit) = self.deferred_edits.remove(&id) {
                writes.push((edit, Mutation::UpdateUnit { id, patch }));
            }
        }
        writes
    }

    pub fn next_write_due(&self) -> Option<Instant> {
        self.throttle.next_due()
    }

    // ─── Rendering ────────────────────────────────────────────────────

    /// Where the unit is drawn now: drag position, tween sample, or cache.
    pub fn unit_position(&self, id: Uuid, now: Instant) -> Option<Vec2> {
        if let Some(drag) = self.drag.filter(|d| d.unit_id == id) {
            return Some(drag.position);
        }
        if let Some(tween) = self.tweens.get(&id) {
            return Some(tween.sample(now));
        }
        self.units.get(&id).map(Vec2::from)
    }

    /// 0 → 1 while an inserted entity fades in.
    pub fn opacity(&self, id: Uuid, now: Instant) -> f32 {
        self.entrances
            .get(&id)
            .map_or(1.0, |started| ease_out_cubic(progress(*started, ENTRANCE_DURATION, now)))
    }

    pub fn render_units(&self, now: Instant) -> Vec<RenderedUnit> {
        self.units()
            .into_iter()
            .map(|u| RenderedUnit {
                id: u.id,
                position: self.unit_position(u.id, now).unwrap_or_else(|| Vec2::from(u)),
                opacity: self.opacity(u.id, now),
                z_order: u.z_order,
                selected: self.selection.contains(&u.id),
            })
            .collect()
    }

    /// Drop finished animations.
    pub fn tick(&mut self, now: Instant) {
        self.tweens.retain(|_, t| !t.is_done(now));
        self.entrances
            .retain(|_, started| now.saturating_duration_since(*started) < ENTRANCE_DURATION);
    }

    pub fn is_animating(&self) -> bool {
        !self.tweens.is_empty() || !self.entrances.is_empty()
    }

    // ─── Selection ────────────────────────────────────────────────────

    pub fn select(&mut self, id: Uuid) -> bool {
        if self.units.contains_key(&id) || self.drawings.contains_key(&id) {
            self.selection.insert(id)
        } else {
            false
        }
    }

    pub fn deselect(&mut self, id: Uuid) -> bool {
        self.selection.remove(&id)
    }

    pub fn clear_selection(&mut self) {
        self.selection.clear();
    }

    pub fn selected(&self) -> Vec<Uuid> {
        let mut ids: Vec<Uuid> = self.selection.iter().copied().collect();
        ids.sort();
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use battlemap_core::{now_millis, DenyReason, Point, ShapeType};

    const MS: Duration = Duration::from_millis(1);

    struct Harness {
        view: MapView,
        room: Room,
        seq: u64,
    }

    impl Harness {
        fn new() -> Self {
            let owner = Uuid::new_v4();
            let room = Room::new("r", owner, "map");
            let mut view = MapView::new(room.id, EchelonIndex::FIRST, owner);
            view.load_snapshot(snapshot(&room, 0, vec![], vec![])).unwrap();
            Self { view, room, seq: 0 }
        }

        fn event(&mut self, kind: ChangeKind, payload: ChangePayload) -> ChangeEvent {
            self.seq += 1;
            ChangeEvent {
                seq: self.seq,
                room_id: self.room.id,
                kind,
                payload,
                committed_at: now_millis(),
            }
        }

        fn unit(&self, x: f32, y: f32) -> Unit {
            Unit::new(self.room.id, EchelonIndex::FIRST, "inf", "inf", x, y)
        }
    }

    fn snapshot(room: &Room, seq: u64, units: Vec<Unit>, drawings: Vec<Drawing>) -> RoomSnapshot {
        RoomSnapshot {
            room: room.clone(),
            echelon: EchelonIndex::FIRST,
            seq,
            units,
            drawings,
        }
    }

    #[test]
    fn test_remote_insert_is_idempotent_and_fades_in() {
        let mut h = Harness::new();
        let unit = h.unit(1.0, 1.0);
        let now = Instant::now();
        let ev = h.event(ChangeKind::Insert, ChangePayload::Unit(unit.clone()));

        assert_eq!(h.view.apply_event(&ev, now), EventOutcome::Applied);
        assert_eq!(h.view.apply_event(&ev, now), EventOutcome::Ignored);
        assert_eq!(h.view.units().len(), 1);
        assert_eq!(h.view.opacity(unit.id, now), 0.0);
        assert_eq!(h.view.opacity(unit.id, now + ENTRANCE_DURATION), 1.0);
    }

    #[test]
    fn test_remote_update_glides() {
        let mut h = Harness::new();
        let mut unit = h.unit(0.0, 0.0);
        let start = Instant::now();
        let ev = h.event(ChangeKind::Insert, ChangePayload::Unit(unit.clone()));
        h.view.apply_event(&ev, start);

        unit.x = 100.0;
        let ev = h.event(ChangeKind::Update, ChangePayload::Unit(unit.clone()));
        h.view.apply_event(&ev, start);

        // cache is authoritative immediately, rendering catches up
        assert_eq!(h.view.unit(unit.id).unwrap().x, 100.0);
        assert_eq!(h.view.unit_position(unit.id, start), Some(Vec2::new(0.0, 0.0)));
        let mid = h.view.unit_position(unit.id, start + 125 * MS).unwrap();
        assert!(mid.x > 50.0 && mid.x < 100.0);
        assert_eq!(
            h.view.unit_position(unit.id, start + UPDATE_TWEEN),
            Some(Vec2::new(100.0, 0.0))
        );

        h.view.tick(start + UPDATE_TWEEN);
        assert!(!h.view.is_animating());
    }

    #[test]
    fn test_remote_delete_clears_selection() {
        let mut h = Harness::new();
        let unit = h.unit(0.0, 0.0);
        let now = Instant::now();
        let ev = h.event(ChangeKind::Insert, ChangePayload::Unit(unit.clone()));
        h.view.apply_event(&ev, now);
        assert!(h.view.select(unit.id));
        h.view.begin_drag(unit.id).unwrap();

        let ev = h.event(ChangeKind::Delete, ChangePayload::Unit(unit.clone()));
        h.view.apply_event(&ev, now);
        assert!(h.view.selected().is_empty());
        assert!(!h.view.is_dragging());
        assert!(h.view.unit(unit.id).is_none());
    }

    #[test]
    fn test_sequence_gap_marks_stale() {
        let mut h = Harness::new();
        let now = Instant::now();
        h.seq += 3;
        let unit = h.unit(0.0, 0.0);
        let ev = h.event(ChangeKind::Insert, ChangePayload::Unit(unit.clone()));
        assert_eq!(h.view.apply_event(&ev, now), EventOutcome::ResyncRequired);
        assert!(h.view.is_stale());

        h.view
            .load_snapshot(snapshot(&h.room, ev.seq, vec![unit.clone()], vec![]))
            .unwrap();
        assert!(!h.view.is_stale());
        assert_eq!(h.view.last_seq(), 4);
        assert!(h.view.unit(unit.id).is_some());
    }

    #[test]
    fn test_other_echelon_advances_seq_only() {
        let mut h = Harness::new();
        let other = Unit::new(h.room.id, EchelonIndex::new(2).unwrap(), "inf", "inf", 0.0, 0.0);
        let ev = h.event(ChangeKind::Insert, ChangePayload::Unit(other));
        assert_eq!(h.view.apply_event(&ev, Instant::now()), EventOutcome::Ignored);
        assert_eq!(h.view.last_seq(), 1);
        assert!(h.view.units().is_empty());
    }

    #[test]
    fn test_rejected_edit_rolls_back() {
        let mut h = Harness::new();
        let unit = h.unit(3.0, 4.0);
        let (placed, _) = h.view.place_unit(unit.clone()).unwrap();
        assert!(h.view.confirm(placed));

        let (moved, mutation) = h.view.update_unit(unit.id, UnitPatch::position(9.0, 9.0)).unwrap();
        assert!(matches!(mutation, Mutation::UpdateUnit { .. }));
        assert_eq!(h.view.unit(unit.id).unwrap().x, 9.0);

        assert!(h.view.reject(moved));
        assert_eq!(h.view.unit(unit.id).unwrap().x, 3.0);
        assert!(!h.view.reject(moved));

        let line = Drawing::new(
            h.room.id,
            EchelonIndex::FIRST,
            ShapeType::Arrow,
            vec![Point::new(0.0, 0.0), Point::new(5.0, 5.0)],
        );
        let (drawn, _) = h.view.draw(line.clone()).unwrap();
        h.view.reject(drawn);
        assert!(h.view.drawing(line.id).is_none());
    }

    #[test]
    fn test_advisory_gate_blocks_without_turn() {
        let mut h = Harness::new();
        let mut room = h.room.clone();
        room.current_turn_user_id = Some(Uuid::new_v4());
        let ev = h.event(ChangeKind::Update, ChangePayload::Room(room));
        h.view.apply_event(&ev, Instant::now());

        // the owner is still admin
        let unit = h.unit(0.0, 0.0);
        assert!(h.view.place_unit(unit).is_ok());

        let mut player = MapView::new(h.room.id, EchelonIndex::FIRST, Uuid::new_v4());
        player.load_snapshot(snapshot(&h.room, h.seq, vec![], vec![])).unwrap();
        let mut locked_out = h.room.clone();
        locked_out.current_turn_user_id = None;
        h.seq += 1;
        let ev = ChangeEvent {
            seq: h.seq,
            room_id: h.room.id,
            kind: ChangeKind::Update,
            payload: ChangePayload::Room(locked_out),
            committed_at: 0,
        };
        player.apply_event(&ev, Instant::now());
        assert_eq!(
            player.place_unit(h.unit(0.0, 0.0)).map(|_| ()),
            Err(SyncError::Authorization(DenyReason::NotYourTurn))
        );
        assert!(player.units().is_empty());
    }

    #[test]
    fn test_long_drag_commits_once() {
        let mut h = Harness::new();
        let unit = h.unit(0.0, 0.0);
        let start = Instant::now();
        let ev = h.event(ChangeKind::Insert, ChangePayload::Unit(unit.clone()));
        h.view.apply_event(&ev, start);

        h.view.begin_drag(unit.id).unwrap();
        // 2 s at 60 fps
        for frame in 1..=120 {
            h.view.drag_to(frame as f32, frame as f32 / 2.0);
            assert!(h.view.take_due_writes(start + frame * 16 * MS).is_empty());
        }
        let release = start + 2000 * MS;
        let (edit, mutation) = h.view.end_drag(release).unwrap();
        let patch = match &mutation {
            Mutation::UpdateUnit { patch, .. } => patch.clone(),
            other => panic!("unexpected {other:?}"),
        };
        assert_eq!(patch, UnitPatch::position(120.0, 60.0));
        assert!(h.view.take_due_writes(release + 1000 * MS).is_empty());

        // own echo arrives with the same value: no visual jump
        let mut committed = unit.clone();
        patch.apply(&mut committed);
        let ev = h.event(ChangeKind::Update, ChangePayload::Unit(committed));
        h.view.apply_event(&ev, release + 40 * MS);
        assert!(h.view.confirm(edit));
        assert_eq!(
            h.view.unit_position(unit.id, release + 40 * MS),
            Some(Vec2::new(120.0, 60.0))
        );
    }

    #[test]
    fn test_quick_drags_coalesce() {
        let mut h = Harness::new();
        let unit = h.unit(0.0, 0.0);
        let start = Instant::now();
        let ev = h.event(ChangeKind::Insert, ChangePayload::Unit(unit.clone()));
        h.view.apply_event(&ev, start);

        h.view.begin_drag(unit.id).unwrap();
        h.view.drag_to(1.0, 1.0);
        assert!(h.view.end_drag(start).is_some());

        for (i, x) in [2.0, 3.0].into_iter().enumerate() {
            h.view.begin_drag(unit.id).unwrap();
            h.view.drag_to(x, x);
            assert!(h.view.end_drag(start + (100 * (i as u32 + 1)) * MS).is_none());
        }
        assert_eq!(h.view.pending_edits(), 2);

        let due = h.view.take_due_writes(start + 500 * MS);
        assert_eq!(due.len(), 1);
        assert!(matches!(
            &due[0].1,
            Mutation::UpdateUnit { patch, .. } if *patch == UnitPatch::position(3.0, 3.0)
        ));
    }

    #[test]
    fn test_snapshot_for_wrong_view_is_rejected() {
        let mut h = Harness::new();
        let other = Room::new("other", Uuid::new_v4(), "m");
        assert!(h.view.load_snapshot(snapshot(&other, 0, vec![], vec![])).is_err());
    }

    #[test]
    fn test_clear_front_keeps_units() {
        let mut h = Harness::new();
        let now = Instant::now();
        let unit = h.unit(0.0, 0.0);
        let line = Drawing::new(
            h.room.id,
            EchelonIndex::FIRST,
            ShapeType::Line,
            vec![Point::new(0.0, 0.0), Point::new(1.0, 0.0)],
        );
        let ev = h.event(ChangeKind::Insert, ChangePayload::Unit(unit.clone()));
        h.view.apply_event(&ev, now);
        let ev = h.event(ChangeKind::Insert, ChangePayload::Drawing(line));
        h.view.apply_event(&ev, now);

        let (edit, mutation) = h.view.clear(false, true).unwrap();
        assert!(matches!(mutation, Mutation::Clear { units: false, drawings: true, .. }));
        assert_eq!(h.view.units().len(), 1);
        assert!(h.view.drawings().is_empty());

        h.view.reject(edit);
        assert_eq!(h.view.drawings().len(), 1);
    }

    #[test]
    fn test_reject_after_remote_update_keeps_server_value() {
        let mut h = Harness::new();
        let player_id = Uuid::new_v4();
        let mut room = h.room.clone();
        room.current_turn_user_id = Some(player_id);
        let mut unit = h.unit(0.0, 0.0).owned_by(player_id, Some(1));
        let mut player = MapView::new(room.id, EchelonIndex::FIRST, player_id);
        player
            .load_snapshot(snapshot(&room, h.seq, vec![unit.clone()], vec![]))
            .unwrap();
        let now = Instant::now();

        let (edit, _) = player.update_unit(unit.id, UnitPatch::position(10.0, 0.0)).unwrap();
        assert_eq!(player.unit(unit.id).unwrap().x, 10.0);

        room.current_turn_user_id = None;
        let ev = h.event(ChangeKind::Update, ChangePayload::Room(room));
        assert_eq!(player.apply_event(&ev, now), EventOutcome::Applied);
        unit.x = 50.0;
        let ev = h.event(ChangeKind::Update, ChangePayload::Unit(unit.clone()));
        assert_eq!(player.apply_event(&ev, now), EventOutcome::Applied);

        assert!(player.reject(edit));
        assert_eq!(player.unit(unit.id).unwrap().x, 50.0);
        assert_eq!(player.pending_edits(), 0);
    }

    #[test]
    fn test_remote_delete_beats_rejected_edit() {
        let mut h = Harness::new();
        let unit = h.unit(1.0, 1.0);
        let now = Instant::now();
        let ev = h.event(ChangeKind::Insert, ChangePayload::Unit(unit.clone()));
        h.view.apply_event(&ev, now);

        let (edit, _) = h.view.update_unit(unit.id, UnitPatch::position(2.0, 2.0)).unwrap();
        let ev = h.event(ChangeKind::Delete, ChangePayload::Unit(unit.clone()));
        h.view.apply_event(&ev, now);

        h.view.reject(edit);
        assert!(h.view.unit(unit.id).is_none());
    }

    #[test]
    fn test_due_writes_prune_quiet_units() {
        let mut h = Harness::new();
        let start = Instant::now();
        let a = h.unit(0.0, 0.0);
        let b = h.unit(5.0, 5.0);
        for unit in [&a, &b] {
            let ev = h.event(ChangeKind::Insert, ChangePayload::Unit(unit.clone()));
            h.view.apply_event(&ev, start);
            h.view.begin_drag(unit.id).unwrap();
            h.view.drag_to(9.0, 9.0);
            assert!(h.view.end_drag(start).is_some());
        }
        assert_eq!(h.view.throttle.tracked_len(), 2);

        assert!(h.view.take_due_writes(start + 100 * MS).is_empty());
        assert_eq!(h.view.throttle.tracked_len(), 2);
        assert!(h.view.take_due_writes(start + DEFAULT_WRITE_INTERVAL + MS).is_empty());
        assert_eq!(h.view.throttle.tracked_len(), 0);
    }
}
