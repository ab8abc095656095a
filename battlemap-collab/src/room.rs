//! Room hubs: the commit pipeline of one room, and the registry that
//! maps room ids to live hubs.
//!
//! ```text
//!  Mutate ──► validate ──► lock commit section ──► gate (room row as of now)
//!                                │                        │
//!                                │                  throttle (updates)
//!                                │                   │          │
//!                                │                 Now      Deferred ──► flusher task
//!                                ▼                   ▼                       │
//!                             MapStore ◄──────── apply ◄─────────────────────┘
//!                                                    │
//!                                             ChangeFeed::publish
//! ```
//!
//! Everything that changes room state or entities goes through the hub's
//! commit section, so the gate always sees the turn holder the commit will
//! actually run under, and events leave in commit order.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

use battlemap_core::{
    authorize, authorize_admin, authorize_all, now_millis, Admission, ChangeKind, ChangePayload,
    DenyReason, Drawing, EchelonIndex, Entity, EntityClass, EntityPatch, Mutation, Room,
    RoomMember, SessionContext, SyncError, Unit, UserId, WriteThrottle, DEFAULT_WRITE_INTERVAL,
};

use crate::feed::{ChangeFeed, FeedStats, FeedSubscription, SubscriptionHandle};
use crate::presence::{PresenceManager, DEFAULT_PRESENCE_TIMEOUT};
use crate::storage::MapStore;

/// Per-hub limits, derived from the server configuration.
#[derive(Debug, Clone)]
pub struct HubConfig {
    pub broadcast_capacity: usize,
    pub max_members: usize,
    pub presence_timeout: Duration,
    pub write_interval: Duration,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            broadcast_capacity: 256,
            max_members: 64,
            presence_timeout: DEFAULT_PRESENCE_TIMEOUT,
            write_interval: DEFAULT_WRITE_INTERVAL,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitOutcome {
    Committed,
    /// Folded into a pending throttled write, committed at `flush_at`.
    Coalesced { flush_at: Instant },
}

/// What a joining session needs to start.
pub struct JoinOutcome {
    pub room: Room,
    pub members: Vec<RoomMember>,
    pub seq: u64,
    pub subscription: FeedSubscription,
}

/// One echelon of the room, consistent with feed sequence `seq`.
#[derive(Debug, Clone)]
pub struct RoomSnapshot {
    pub room: Room,
    pub echelon: EchelonIndex,
    pub seq: u64,
    pub units: Vec<Unit>,
    pub drawings: Vec<Drawing>,
}

/// Throttle key: one slot per (user, entity).
type WriteKey = (UserId, Uuid);

struct HubState {
    room: Room,
    throttle: WriteThrottle<WriteKey, Mutation>,
    presence: PresenceManager,
    flush_scheduled: bool,
    /// Set once the room is deleted or the hub is retired from the registry.
    closed: bool,
}

pub struct RoomHub {
    room_id: Uuid,
    store: Arc<dyn MapStore>,
    feed: ChangeFeed,
    config: HubConfig,
    state: Mutex<HubState>,
}

impl RoomHub {
    pub fn new(room: Room, members: Vec<RoomMember>, store: Arc<dyn MapStore>, config: HubConfig) -> Self {
        let mut presence = PresenceManager::new(config.presence_timeout);
        presence.restore(members, Instant::now());
        Self {
            room_id: room.id,
            store,
            feed: ChangeFeed::new(room.id, config.broadcast_capacity),
            state: Mutex::new(HubState {
                room,
                throttle: WriteThrottle::new(config.write_interval),
                presence,
                flush_scheduled: false,
                closed: false,
            }),
            config,
        }
    }

    pub fn room_id(&self) -> Uuid {
        self.room_id
    }

    pub fn feed(&self) -> &ChangeFeed {
        &self.feed
    }

    pub fn feed_stats(&self) -> FeedStats {
        self.feed.stats()
    }

    pub async fn room(&self) -> Room {
        self.state.lock().await.room.clone()
    }

    fn closed_error(&self) -> SyncError {
        SyncError::not_found(EntityClass::Room, self.room_id)
    }

    // ─── Sessions ─────────────────────────────────────────────────────

    /// Admit `user_id`, subscribe it to the feed and publish its member row.
    /// The subscription is taken before the member event is published, so
    /// the joiner sees its own arrival.
    pub async fn join(&self, user_id: UserId, display_name: &str) -> Result<JoinOutcome, SyncError> {
        let mut state = self.state.lock().await;
        if state.closed {
            return Err(self.closed_error());
        }

        let returning = state.presence.is_member(user_id);
        if state.room.is_locked && !returning && !state.room.is_admin(user_id) {
            log::warn!("room {}: join by {} refused, room is locked", self.room_id, user_id);
            return Err(SyncError::Authorization(DenyReason::RoomLocked));
        }
        // Inactive rows stay for returning users but do not hold a seat.
        if !returning && state.presence.connected_count() >= self.config.max_members {
            return Err(SyncError::validation(format!(
                "room is full ({} members)",
                self.config.max_members
            )));
        }

        let subscription = self.feed.subscribe();
        let (member, created) = state
            .presence
            .join(self.room_id, user_id, display_name, Instant::now());

        if let Err(e) = self.store.upsert_member(&member) {
            log::error!("room {}: failed to persist member {}: {}", self.room_id, user_id, e);
            if created {
                state.presence.leave(user_id);
            } else {
                state.presence.disconnect(user_id);
            }
            self.feed.unsubscribe(subscription.handle);
            return Err(e.into());
        }

        let kind = if created { ChangeKind::Insert } else { ChangeKind::Update };
        self.feed.publish(kind, ChangePayload::Member(member));
        log::info!(
            "room {}: {} ({}) joined{}",
            self.room_id,
            display_name,
            user_id,
            if created { "" } else { " again" }
        );

        Ok(JoinOutcome {
            room: state.room.clone(),
            members: state.presence.list_all(),
            seq: self.feed.current_seq(),
            subscription,
        })
    }

    /// Explicit leave from one connection. The member row is removed with
    /// the last connection; until then the leave counts as a disconnect.
    pub async fn leave(&self, user_id: UserId) -> Result<(), SyncError> {
        let mut state = self.state.lock().await;
        let connections = state.presence.connections(user_id);
        if connections > 1 {
            state.presence.disconnect(user_id);
            log::debug!(
                "room {}: {} left from one of {} connections",
                self.room_id,
                user_id,
                connections
            );
            return Ok(());
        }
        if let Some(member) = state.presence.leave(user_id) {
            self.store.remove_member(self.room_id, user_id)?;
            self.feed.publish(ChangeKind::Delete, ChangePayload::Member(member));
            log::info!("room {}: {} left", self.room_id, user_id);
        }
        Ok(())
    }

    /// A connection closed without leaving. The member stays, inactive once
    /// its last connection is gone.
    pub async fn disconnect(&self, user_id: UserId, handle: SubscriptionHandle) {
        self.feed.unsubscribe(handle);
        let mut state = self.state.lock().await;
        if let Some(member) = state.presence.disconnect(user_id) {
            self.persist_member(member);
        }
    }

    pub async fn heartbeat(&self, user_id: UserId) {
        let mut state = self.state.lock().await;
        log::trace!("room {}: heartbeat from {}", self.room_id, user_id);
        if let Some(member) = state.presence.heartbeat(user_id, Instant::now()) {
            self.persist_member(member);
        }
    }

    pub async fn list_active(&self) -> Vec<RoomMember> {
        self.state.lock().await.presence.list_active(Instant::now())
    }

    /// Flip members with stale heartbeats to inactive. Returns how many.
    pub async fn reap_stale(&self, now: Instant) -> usize {
        let mut state = self.state.lock().await;
        let reaped = state.presence.reap_stale(now);
        let count = reaped.len();
        for member in reaped {
            log::debug!("room {}: {} went stale", self.room_id, member.user_id);
            self.persist_member(member);
        }
        count
    }

    fn persist_member(&self, member: RoomMember) {
        if let Err(e) = self.store.upsert_member(&member) {
            log::error!(
                "room {}: failed to persist member {}: {}",
                self.room_id,
                member.user_id,
                e
            );
        }
        self.feed.publish(ChangeKind::Update, ChangePayload::Member(member));
    }

    /// No subscribers, no connected members and nothing left to flush.
    pub async fn is_idle(&self) -> bool {
        let state = self.state.lock().await;
        self.feed.subscriber_count() == 0
            && state.presence.connected_count() == 0
            && !state.flush_scheduled
    }

    // ─── Reads ────────────────────────────────────────────────────────

    pub async fn snapshot(&self, echelon: EchelonIndex) -> Result<RoomSnapshot, SyncError> {
        let state = self.state.lock().await;
        if state.closed {
            return Err(self.closed_error());
        }
        let (units, drawings) = self.store.list_by_echelon(self.room_id, echelon)?;
        Ok(RoomSnapshot {
            room: state.room.clone(),
            echelon,
            seq: self.feed.current_seq(),
            units,
            drawings,
        })
    }

    // ─── Writes ───────────────────────────────────────────────────────

    /// Commit a mutation on behalf of `ctx`. Updates of one entity by one
    /// user are rate-limited; a write inside the interval is coalesced and
    /// committed by a background flush.
    pub async fn commit(self: &Arc<Self>, ctx: &SessionContext, mutation: Mutation) -> Result<CommitOutcome, SyncError> {
        mutation.validate()?;
        let mut state = self.state.lock().await;
        if state.closed {
            return Err(self.closed_error());
        }
        if !state.presence.is_member(ctx.user_id) {
            return Err(SyncError::validation("join the room before writing"));
        }

        let Some(entity_id) = mutation.throttle_key() else {
            self.apply_locked(&mut state, ctx.user_id, mutation)?;
            return Ok(CommitOutcome::Committed);
        };

        // Reject now rather than after the interval when the gate already says no.
        self.check_update(&state, ctx.user_id, &mutation)?;

        match state
            .throttle
            .offer((ctx.user_id, entity_id), mutation, Instant::now())
        {
            Admission::Now(m) => {
                self.apply_locked(&mut state, ctx.user_id, m)?;
                Ok(CommitOutcome::Committed)
            }
            Admission::Deferred { flush_at } => {
                log::debug!(
                    "room {}: coalesced write to {} by {}",
                    self.room_id,
                    entity_id,
                    ctx.user_id
                );
                self.schedule_flush(&mut state, flush_at);
                Ok(CommitOutcome::Coalesced { flush_at })
            }
        }
    }

    fn check_update(&self, state: &HubState, actor: UserId, mutation: &Mutation) -> Result<(), SyncError> {
        match mutation {
            Mutation::UpdateUnit { id, .. } => {
                let unit = self
                    .store
                    .get_unit(self.room_id, *id)?
                    .ok_or_else(|| SyncError::not_found(EntityClass::Unit, *id))?;
                authorize(actor, &state.room, unit.owner_user_id).into_result()
            }
            Mutation::UpdateDrawing { id, .. } => {
                if self.store.get_drawing(self.room_id, *id)?.is_none() {
                    return Err(SyncError::not_found(EntityClass::Drawing, *id));
                }
                authorize(actor, &state.room, None).into_result()
            }
            _ => Ok(()),
        }
    }

    fn schedule_flush(self: &Arc<Self>, state: &mut HubState, flush_at: Instant) {
        if state.flush_scheduled {
            return;
        }
        state.flush_scheduled = true;
        let hub = Arc::clone(self);
        tokio::spawn(async move { hub.run_flusher(flush_at).await });
    }

    async fn run_flusher(self: Arc<Self>, mut at: Instant) {
        loop {
            tokio::time::sleep_until(tokio::time::Instant::from_std(at)).await;

            let mut state = self.state.lock().await;
            let now = Instant::now();
            for ((actor, entity_id), mutation) in state.throttle.take_due(now) {
                if state.closed {
                    break;
                }
                let label = mutation.label();
                if let Err(e) = self.apply_locked(&mut state, actor, mutation) {
                    log::warn!(
                        "room {}: deferred {} of {} by {} rejected: {}",
                        self.room_id,
                        label,
                        entity_id,
                        actor,
                        e
                    );
                    self.publish_correction(entity_id);
                }
            }

            match state.throttle.next_due() {
                Some(next) if !state.closed => at = next,
                _ => {
                    state.flush_scheduled = false;
                    state.throttle.forget_idle(now);
                    return;
                }
            }
        }
    }

    /// Re-publish the stored row of an entity whose deferred write failed,
    /// so clients that applied it optimistically snap back.
    fn publish_correction(&self, entity_id: Uuid) {
        let payload = match self.store.get_unit(self.room_id, entity_id) {
            Ok(Some(unit)) => Some(ChangePayload::Unit(unit)),
            Ok(None) => match self.store.get_drawing(self.room_id, entity_id) {
                Ok(found) => found.map(ChangePayload::Drawing),
                Err(e) => {
                    log::error!("room {}: correction read failed: {}", self.room_id, e);
                    None
                }
            },
            Err(e) => {
                log::error!("room {}: correction read failed: {}", self.room_id, e);
                None
            }
        };
        if let Some(payload) = payload {
            self.feed.publish(ChangeKind::Update, payload);
        }
    }

    /// Gate and apply one mutation. Caller holds the commit section.
    fn apply_locked(&self, state: &mut HubState, actor: UserId, mutation: Mutation) -> Result<(), SyncError> {
        let room_id = self.room_id;
        let store = self.store.as_ref();

        match mutation {
            Mutation::CreateUnit(mut unit) => {
                authorize(actor, &state.room, unit.owner_user_id).into_result()?;
                unit.room_id = room_id;
                unit.updated_at = now_millis();
                if let Entity::Unit(unit) = store.create(Entity::Unit(unit))? {
                    self.feed.publish(ChangeKind::Insert, ChangePayload::Unit(unit));
                }
            }
            Mutation::CreateDrawing(mut drawing) => {
                authorize(actor, &state.room, None).into_result()?;
                drawing.room_id = room_id;
                drawing.updated_at = now_millis();
                if let Entity::Drawing(drawing) = store.create(Entity::Drawing(drawing))? {
                    self.feed.publish(ChangeKind::Insert, ChangePayload::Drawing(drawing));
                }
            }
            Mutation::UpdateUnit { id, patch } => {
                let current = store
                    .get_unit(room_id, id)?
                    .ok_or_else(|| SyncError::not_found(EntityClass::Unit, id))?;
                authorize(actor, &state.room, current.owner_user_id).into_result()?;
                if let Entity::Unit(unit) = store.update(room_id, id, &EntityPatch::Unit(patch))? {
                    self.feed.publish(ChangeKind::Update, ChangePayload::Unit(unit));
                }
            }
            Mutation::UpdateDrawing { id, patch } => {
                if store.get_drawing(room_id, id)?.is_none() {
                    return Err(SyncError::not_found(EntityClass::Drawing, id));
                }
                authorize(actor, &state.room, None).into_result()?;
                if let Entity::Drawing(drawing) =
                    store.update(room_id, id, &EntityPatch::Drawing(patch))?
                {
                    self.feed.publish(ChangeKind::Update, ChangePayload::Drawing(drawing));
                }
            }
            Mutation::DeleteUnit { id } => {
                let current = store.get_unit(room_id, id)?;
                let owner = current.as_ref().and_then(|u| u.owner_user_id);
                authorize(actor, &state.room, owner).into_result()?;
                if let Some(unit) = store.remove_unit(room_id, id)? {
                    self.feed.publish(ChangeKind::Delete, ChangePayload::Unit(unit));
                }
            }
            Mutation::DeleteDrawing { id } => {
                authorize(actor, &state.room, None).into_result()?;
                if let Some(drawing) = store.remove_drawing(room_id, id)? {
                    self.feed.publish(ChangeKind::Delete, ChangePayload::Drawing(drawing));
                }
            }
            Mutation::Clear {
                echelon,
                units,
                drawings,
            } => {
                let owners = if units {
                    store
                        .list_units(room_id, echelon)?
                        .into_iter()
                        .map(|u| u.owner_user_id)
                        .collect()
                } else {
                    Vec::new()
                };
                authorize_all(actor, &state.room, owners).into_result()?;
                let report = store.clear(room_id, echelon, units, drawings)?;
                self.publish_cleared(report.units, report.drawings);
            }
            Mutation::CopyEchelon { from, to } => {
                authorize(actor, &state.room, None).into_result()?;
                let report = store.copy_echelon(room_id, from, to);
                for unit in report.units.created.iter().cloned() {
                    self.feed.publish(ChangeKind::Insert, ChangePayload::Unit(unit));
                }
                for drawing in report.drawings.created.iter().cloned() {
                    self.feed.publish(ChangeKind::Insert, ChangePayload::Drawing(drawing));
                }
                if let Some(err) = report.first_error() {
                    log::error!(
                        "room {}: copy {} -> {} incomplete ({} units, {} drawings copied): {}",
                        room_id,
                        from,
                        to,
                        report.units.created.len(),
                        report.drawings.created.len(),
                        err
                    );
                    return Err(err.clone());
                }
            }
            Mutation::ImportPlan(plan) => {
                let existing = store.list_units(room_id, plan.echelon)?;
                let owners = existing
                    .iter()
                    .map(|u| u.owner_user_id)
                    .chain(plan.units.iter().map(|u| u.owner_user_id))
                    .collect::<Vec<_>>();
                authorize_all(actor, &state.room, owners).into_result()?;

                let report = store.clear(room_id, plan.echelon, true, true)?;
                self.publish_cleared(report.units, report.drawings);

                let (units, drawings) = plan.rebind(room_id, plan.echelon);
                for unit in units {
                    if let Entity::Unit(unit) = store.create(Entity::Unit(unit))? {
                        self.feed.publish(ChangeKind::Insert, ChangePayload::Unit(unit));
                    }
                }
                for drawing in drawings {
                    if let Entity::Drawing(drawing) = store.create(Entity::Drawing(drawing))? {
                        self.feed.publish(ChangeKind::Insert, ChangePayload::Drawing(drawing));
                    }
                }
                log::info!(
                    "room {}: imported plan into echelon {} ({} units, {} drawings)",
                    room_id,
                    plan.echelon,
                    plan.units.len(),
                    plan.drawings.len()
                );
            }
            Mutation::GrantTurn { user_id } => {
                if !state.presence.is_member(user_id) {
                    return Err(SyncError::validation(format!(
                        "user {user_id} is not a member of this room"
                    )));
                }
                self.update_room(state, |room| room.grant_turn(actor, user_id))?;
            }
            Mutation::RevokeTurn => {
                self.update_room(state, |room| room.revoke_turn(actor))?;
            }
            Mutation::ToggleLock => {
                self.update_room(state, |room| room.toggle_lock(actor).map(|_| ()))?;
            }
            Mutation::ChangeMap { map_id } => {
                self.update_room(state, |room| room.change_map(actor, map_id))?;
            }
            Mutation::KickMember { user_id } => {
                authorize_admin(actor, &state.room).into_result()?;
                if state.room.is_admin(user_id) {
                    return Err(SyncError::validation("the room owner cannot be kicked"));
                }
                if state.room.holds_turn(user_id) {
                    self.update_room(state, |room| room.revoke_turn(actor))?;
                }
                let removed = store.remove_member(room_id, user_id)?;
                let member = state.presence.leave(user_id).or(removed);
                if let Some(member) = member {
                    self.feed.publish(ChangeKind::Delete, ChangePayload::Member(member));
                    log::info!("room {}: {} kicked by {}", room_id, user_id, actor);
                }
            }
            Mutation::DeleteRoom => {
                authorize_admin(actor, &state.room).into_result()?;
                store.delete_room(room_id)?;
                state.closed = true;
                self.feed
                    .publish(ChangeKind::Delete, ChangePayload::Room(state.room.clone()));
                log::info!("room {}: deleted by {}", room_id, actor);
            }
        }
        Ok(())
    }

    /// Apply a turn-state transition to a copy of the room row, persist
    /// it, then swap it in and publish.
    fn update_room<F>(&self, state: &mut HubState, transition: F) -> Result<(), SyncError>
    where
        F: FnOnce(&mut Room) -> Result<(), SyncError>,
    {
        let mut room = state.room.clone();
        transition(&mut room)?;
        self.store.put_room(&room)?;
        state.room = room.clone();
        self.feed.publish(ChangeKind::Update, ChangePayload::Room(room));
        Ok(())
    }

    fn publish_cleared(&self, units: Vec<Unit>, drawings: Vec<Drawing>) {
        for unit in units {
            self.feed.publish(ChangeKind::Delete, ChangePayload::Unit(unit));
        }
        for drawing in drawings {
            self.feed.publish(ChangeKind::Delete, ChangePayload::Drawing(drawing));
        }
    }

    /// Mark the hub unusable. Later calls fail with `NotFound(room)`.
    async fn retire(&self) {
        self.state.lock().await.closed = true;
    }
}

// ───────────────────────────────────────────────────────────────────
// Registry
// ───────────────────────────────────────────────────────────────────

/// Maps room ids to live hubs. Hubs are loaded from the store on first
/// use and dropped once idle; the data stays in the store.
pub struct RoomRegistry {
    store: Arc<dyn MapStore>,
    hubs: RwLock<HashMap<Uuid, Arc<RoomHub>>>,
    config: HubConfig,
}

impl RoomRegistry {
    pub fn new(store: Arc<dyn MapStore>, config: HubConfig) -> Self {
        Self {
            store,
            hubs: RwLock::new(HashMap::new()),
            config,
        }
    }

    pub fn store(&self) -> &Arc<dyn MapStore> {
        &self.store
    }

    /// Create a room owned by `owner` and open its hub.
    pub async fn create_room(
        &self,
        owner: UserId,
        name: &str,
        map_id: &str,
    ) -> Result<(Room, Arc<RoomHub>), SyncError> {
        if name.trim().is_empty() {
            return Err(SyncError::validation("room name must not be empty"));
        }
        let room = Room::new(name, owner, map_id);
        self.store.insert_room(&room)?;
        let hub = Arc::new(RoomHub::new(
            room.clone(),
            Vec::new(),
            self.store.clone(),
            self.config.clone(),
        ));
        self.hubs.write().await.insert(room.id, hub.clone());
        log::info!("Room {} ({}) created by {}", room.name, room.id, owner);
        Ok((room, hub))
    }

    /// Get the live hub for a room, loading it from the store if needed.
    pub async fn get_or_load(&self, room_id: Uuid) -> Result<Arc<RoomHub>, SyncError> {
        {
            let hubs = self.hubs.read().await;
            if let Some(hub) = hubs.get(&room_id) {
                return Ok(hub.clone());
            }
        }

        let mut hubs = self.hubs.write().await;
        if let Some(hub) = hubs.get(&room_id) {
            return Ok(hub.clone());
        }

        let room = self
            .store
            .get_room(room_id)?
            .ok_or_else(|| SyncError::not_found(EntityClass::Room, room_id))?;
        let members = self.store.list_members(room_id)?;
        log::info!("Loaded room {} with {} members", room_id, members.len());
        let hub = Arc::new(RoomHub::new(room, members, self.store.clone(), self.config.clone()));
        hubs.insert(room_id, hub.clone());
        Ok(hub)
    }

    /// Join through the registry. The registry read lock is held across
    /// the join so an idle sweep cannot retire the hub in between.
    pub async fn join(
        &self,
        room_id: Uuid,
        user_id: UserId,
        display_name: &str,
    ) -> Result<(Arc<RoomHub>, JoinOutcome), SyncError> {
        loop {
            let hub = self.get_or_load(room_id).await?;
            let hubs = self.hubs.read().await;
            match hubs.get(&room_id) {
                Some(live) if Arc::ptr_eq(live, &hub) => {
                    let outcome = hub.join(user_id, display_name).await?;
                    return Ok((hub, outcome));
                }
                // retired between load and lock; load again
                _ => continue,
            }
        }
    }

    pub async fn get(&self, room_id: Uuid) -> Option<Arc<RoomHub>> {
        self.hubs.read().await.get(&room_id).cloned()
    }

    /// Drop the hub if nobody is connected. Returns `true` if removed.
    pub async fn remove_if_idle(&self, room_id: Uuid) -> bool {
        let mut hubs = self.hubs.write().await;
        let idle = match hubs.get(&room_id) {
            Some(hub) => hub.is_idle().await,
            None => return false,
        };
        if idle {
            if let Some(hub) = hubs.remove(&room_id) {
                hub.retire().await;
            }
            log::info!("Room {room_id} unloaded (idle)");
        }
        idle
    }

    /// Forget a hub whose room was deleted.
    pub async fn forget(&self, room_id: Uuid) {
        if let Some(hub) = self.hubs.write().await.remove(&room_id) {
            hub.retire().await;
        }
    }

    /// Reap stale members in every live hub, then unload idle hubs.
    pub async fn reap_all(&self, now: Instant) -> usize {
        let hubs: Vec<Arc<RoomHub>> = self.hubs.read().await.values().cloned().collect();
        let mut reaped = 0;
        for hub in &hubs {
            reaped += hub.reap_stale(now).await;
        }
        for hub in hubs {
            self.remove_if_idle(hub.room_id()).await;
        }
        reaped
    }

    pub async fn room_count(&self) -> usize {
        self.hubs.read().await.len()
    }

    pub async fn active_rooms(&self) -> Vec<Uuid> {
        self.hubs.read().await.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;
    use battlemap_core::{Point, ShapeType, UnitPatch};
    use tokio::sync::broadcast::error::TryRecvError;

    fn registry() -> RoomRegistry {
        RoomRegistry::new(Arc::new(MemoryStore::new()), HubConfig::default())
    }

    fn e(i: u8) -> EchelonIndex {
        EchelonIndex::new(i).unwrap()
    }

    fn drain(sub: &mut FeedSubscription) -> Vec<Arc<battlemap_core::ChangeEvent>> {
        let mut events = Vec::new();
        loop {
            match sub.rx.try_recv() {
                Ok(ev) => events.push(ev),
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => return events,
                Err(TryRecvError::Lagged(_)) => continue,
            }
        }
    }

    struct Fixture {
        hub: Arc<RoomHub>,
        admin: SessionContext,
        player: SessionContext,
        admin_sub: FeedSubscription,
    }

    async fn fixture() -> Fixture {
        let reg = registry();
        let admin_id = Uuid::new_v4();
        let player_id = Uuid::new_v4();
        let (room, hub) = reg.create_room(admin_id, "ops", "map-1").await.unwrap();
        let admin_sub = hub.join(admin_id, "admin").await.unwrap().subscription;
        hub.join(player_id, "player").await.unwrap();
        Fixture {
            hub,
            admin: SessionContext::new(admin_id, "admin", room.id),
            player: SessionContext::new(player_id, "player", room.id),
            admin_sub,
        }
    }

    #[tokio::test]
    async fn test_turn_scenario() {
        let mut f = fixture().await;
        let hub = &f.hub;

        hub.commit(&f.admin, Mutation::GrantTurn { user_id: f.player.user_id })
            .await
            .unwrap();

        let unit = Unit::new(hub.room_id(), e(0), "infantry", "inf-bn", 1.0, 1.0)
            .owned_by(f.player.user_id, Some(1));
        let unit_id = unit.id;
        hub.commit(&f.player, Mutation::CreateUnit(unit)).await.unwrap();

        hub.commit(&f.admin, Mutation::RevokeTurn).await.unwrap();

        let denied = hub
            .commit(
                &f.player,
                Mutation::UpdateUnit {
                    id: unit_id,
                    patch: UnitPatch::position(5.0, 5.0),
                },
            )
            .await;
        assert_eq!(denied, Err(SyncError::Authorization(DenyReason::NotYourTurn)));

        let ok = hub
            .commit(
                &f.admin,
                Mutation::UpdateUnit {
                    id: unit_id,
                    patch: UnitPatch::position(6.0, 6.0),
                },
            )
            .await
            .unwrap();
        assert_eq!(ok, CommitOutcome::Committed);

        let snap = hub.snapshot(e(0)).await.unwrap();
        assert_eq!((snap.units[0].x, snap.units[0].y), (6.0, 6.0));

        let kinds: Vec<(ChangeKind, EntityClass)> = drain(&mut f.admin_sub)
            .iter()
            .map(|ev| (ev.kind, ev.payload.class()))
            .collect();
        assert!(kinds.contains(&(ChangeKind::Insert, EntityClass::Unit)));
        assert!(kinds.contains(&(ChangeKind::Update, EntityClass::Room)));
    }

    #[tokio::test]
    async fn test_holder_cannot_move_foreign_unit() {
        let f = fixture().await;
        let unit = Unit::new(f.hub.room_id(), e(0), "hq", "hq", 0.0, 0.0)
            .owned_by(f.admin.user_id, Some(0));
        let id = unit.id;
        f.hub.commit(&f.admin, Mutation::CreateUnit(unit)).await.unwrap();
        f.hub
            .commit(&f.admin, Mutation::GrantTurn { user_id: f.player.user_id })
            .await
            .unwrap();

        let err = f
            .hub
            .commit(&f.player, Mutation::DeleteUnit { id })
            .await
            .unwrap_err();
        assert_eq!(err, SyncError::Authorization(DenyReason::NotOwner));
    }

    #[tokio::test]
    async fn test_updates_are_coalesced_then_flushed() {
        let reg = RoomRegistry::new(
            Arc::new(MemoryStore::new()),
            HubConfig {
                write_interval: Duration::from_millis(80),
                ..HubConfig::default()
            },
        );
        let admin = Uuid::new_v4();
        let (room, hub) = reg.create_room(admin, "t", "m").await.unwrap();
        let ctx = SessionContext::new(admin, "admin", room.id);
        let mut sub = hub.join(admin, "admin").await.unwrap().subscription;

        let unit = Unit::new(room.id, e(1), "armor", "tank", 0.0, 0.0);
        let id = unit.id;
        hub.commit(&ctx, Mutation::CreateUnit(unit)).await.unwrap();

        let first = hub
            .commit(&ctx, Mutation::UpdateUnit { id, patch: UnitPatch::position(1.0, 1.0) })
            .await
            .unwrap();
        assert_eq!(first, CommitOutcome::Committed);
        for i in 2..6 {
            let out = hub
                .commit(
                    &ctx,
                    Mutation::UpdateUnit {
                        id,
                        patch: UnitPatch::position(i as f32, i as f32),
                    },
                )
                .await
                .unwrap();
            assert!(matches!(out, CommitOutcome::Coalesced { .. }));
        }

        tokio::time::sleep(Duration::from_millis(250)).await;

        let updates: Vec<_> = drain(&mut sub)
            .into_iter()
            .filter(|ev| ev.kind == ChangeKind::Update && ev.payload.class() == EntityClass::Unit)
            .collect();
        assert_eq!(updates.len(), 2);
        match &updates[1].payload {
            ChangePayload::Unit(u) => assert_eq!((u.x, u.y), (5.0, 5.0)),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_clear_requires_owning_every_unit() {
        let f = fixture().await;
        let admin_unit = Unit::new(f.hub.room_id(), e(0), "hq", "hq", 0.0, 0.0)
            .owned_by(f.admin.user_id, None);
        f.hub.commit(&f.admin, Mutation::CreateUnit(admin_unit)).await.unwrap();
        f.hub
            .commit(&f.admin, Mutation::GrantTurn { user_id: f.player.user_id })
            .await
            .unwrap();

        let clear_map = Mutation::Clear { echelon: e(0), units: true, drawings: true };
        assert_eq!(
            f.hub.commit(&f.player, clear_map.clone()).await,
            Err(SyncError::Authorization(DenyReason::NotOwner))
        );

        // clearing the front only touches unowned drawings
        let line = Drawing::new(
            f.hub.room_id(),
            e(0),
            ShapeType::Line,
            vec![Point::new(0.0, 0.0), Point::new(1.0, 1.0)],
        );
        f.hub.commit(&f.player, Mutation::CreateDrawing(line)).await.unwrap();
        f.hub
            .commit(&f.player, Mutation::Clear { echelon: e(0), units: false, drawings: true })
            .await
            .unwrap();
        let snap = f.hub.snapshot(e(0)).await.unwrap();
        assert_eq!(snap.units.len(), 1);
        assert!(snap.drawings.is_empty());

        f.hub.commit(&f.admin, clear_map).await.unwrap();
        assert!(f.hub.snapshot(e(0)).await.unwrap().units.is_empty());
    }

    #[tokio::test]
    async fn test_locked_room_admits_only_members() {
        let f = fixture().await;
        f.hub.commit(&f.admin, Mutation::ToggleLock).await.unwrap();

        let stranger = Uuid::new_v4();
        assert_eq!(
            f.hub.join(stranger, "stranger").await.err(),
            Some(SyncError::Authorization(DenyReason::RoomLocked))
        );
        // the existing player reconnects fine
        assert!(f.hub.join(f.player.user_id, "player").await.is_ok());
    }

    #[tokio::test]
    async fn test_kick_revokes_turn() {
        let mut f = fixture().await;
        f.hub
            .commit(&f.admin, Mutation::GrantTurn { user_id: f.player.user_id })
            .await
            .unwrap();
        f.hub
            .commit(&f.admin, Mutation::KickMember { user_id: f.player.user_id })
            .await
            .unwrap();
        assert_eq!(f.hub.room().await.current_turn_user_id, None);

        let events = drain(&mut f.admin_sub);
        assert!(events.iter().any(|ev| ev.kind == ChangeKind::Delete
            && ev.payload.class() == EntityClass::Member
            && ev.payload.entity_id() == f.player.user_id));

        let err = f
            .hub
            .commit(&f.player, Mutation::CreateDrawing(Drawing::new(
                f.hub.room_id(),
                e(0),
                ShapeType::Line,
                vec![Point::default(), Point::new(1.0, 0.0)],
            )))
            .await;
        assert!(err.is_err());
    }

    #[tokio::test]
    async fn test_delete_room_closes_hub() {
        let reg = registry();
        let admin = Uuid::new_v4();
        let (room, hub) = reg.create_room(admin, "gone", "m").await.unwrap();
        let ctx = SessionContext::new(admin, "admin", room.id);
        let mut sub = hub.join(admin, "admin").await.unwrap().subscription;

        hub.commit(&ctx, Mutation::DeleteRoom).await.unwrap();
        let last = drain(&mut sub).pop().unwrap();
        assert_eq!(last.kind, ChangeKind::Delete);
        assert_eq!(last.payload.class(), EntityClass::Room);

        assert!(hub.snapshot(e(0)).await.is_err());
        reg.forget(room.id).await;
        assert!(matches!(
            reg.get_or_load(room.id).await.err(),
            Some(SyncError::NotFound { class: EntityClass::Room, .. })
        ));
    }

    #[tokio::test]
    async fn test_registry_unloads_idle_rooms() {
        let reg = registry();
        let admin = Uuid::new_v4();
        let (room, hub) = reg.create_room(admin, "idle", "m").await.unwrap();
        let (_, outcome) = reg.join(room.id, admin, "admin").await.unwrap();
        assert!(!reg.remove_if_idle(room.id).await);

        hub.disconnect(admin, outcome.subscription.handle).await;
        drop(outcome.subscription);
        assert!(reg.remove_if_idle(room.id).await);
        assert_eq!(reg.room_count().await, 0);

        // reload from the store; the member is remembered but inactive
        let reloaded = reg.get_or_load(room.id).await.unwrap();
        assert!(!Arc::ptr_eq(&hub, &reloaded));
        assert!(reloaded.list_active().await.is_empty());
    }

    #[tokio::test]
    async fn test_copy_echelon_publishes_inserts() {
        let mut f = fixture().await;
        for i in 0..3 {
            let u = Unit::new(f.hub.room_id(), e(0), "inf", "inf", i as f32, 0.0);
            f.hub.commit(&f.admin, Mutation::CreateUnit(u)).await.unwrap();
        }
        drain(&mut f.admin_sub);

        f.hub
            .commit(&f.admin, Mutation::CopyEchelon { from: e(0), to: e(2) })
            .await
            .unwrap();
        let inserts = drain(&mut f.admin_sub)
            .into_iter()
            .filter(|ev| ev.kind == ChangeKind::Insert && ev.is_for_echelon(e(2)))
            .count();
        assert_eq!(inserts, 3);
        assert_eq!(f.hub.snapshot(e(0)).await.unwrap().units.len(), 3);
    }

    #[tokio::test]
    async fn test_create_cannot_reuse_foreign_unit_id() {
        let mut f = fixture().await;
        let admin_unit = Unit::new(f.hub.room_id(), e(0), "hq", "hq", 1.0, 1.0)
            .owned_by(f.admin.user_id, Some(0));
        f.hub
            .commit(&f.admin, Mutation::CreateUnit(admin_unit.clone()))
            .await
            .unwrap();
        f.hub
            .commit(&f.admin, Mutation::GrantTurn { user_id: f.player.user_id })
            .await
            .unwrap();
        drain(&mut f.admin_sub);

        let takeover = Unit {
            echelon: e(2),
            x: 99.0,
            ..admin_unit.clone()
        }
        .owned_by(f.player.user_id, Some(1));
        let err = f
            .hub
            .commit(&f.player, Mutation::CreateUnit(takeover))
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Validation(_)));

        let snap = f.hub.snapshot(e(0)).await.unwrap();
        assert_eq!(snap.units.len(), 1);
        assert_eq!(snap.units[0].owner_user_id, Some(f.admin.user_id));
        assert_eq!(snap.units[0].x, 1.0);
        assert!(f.hub.snapshot(e(2)).await.unwrap().units.is_empty());
        assert!(drain(&mut f.admin_sub).is_empty());
    }

    #[tokio::test]
    async fn test_member_cap_counts_connected_members() {
        let reg = RoomRegistry::new(
            Arc::new(MemoryStore::new()),
            HubConfig {
                max_members: 2,
                ..HubConfig::default()
            },
        );
        let owner = Uuid::new_v4();
        let guest = Uuid::new_v4();
        let late = Uuid::new_v4();
        let (_, hub) = reg.create_room(owner, "cap", "m").await.unwrap();
        let owner_join = hub.join(owner, "owner").await.unwrap();
        let guest_join = hub.join(guest, "guest").await.unwrap();

        assert!(matches!(
            hub.join(late, "late").await,
            Err(SyncError::Validation(_))
        ));

        hub.disconnect(guest, guest_join.subscription.handle).await;
        let joined = hub.join(late, "late").await.unwrap();
        assert_eq!(joined.members.len(), 3);

        // A returning member always gets back in.
        hub.join(guest, "guest").await.unwrap();
        hub.disconnect(owner, owner_join.subscription.handle).await;
        assert_eq!(hub.list_active().await.len(), 2);
    }

    #[tokio::test]
    async fn test_deferred_write_rejected_at_flush_publishes_correction() {
        let reg = RoomRegistry::new(
            Arc::new(MemoryStore::new()),
            HubConfig {
                write_interval: Duration::from_millis(100),
                ..HubConfig::default()
            },
        );
        let admin_id = Uuid::new_v4();
        let player_id = Uuid::new_v4();
        let (room, hub) = reg.create_room(admin_id, "t", "m").await.unwrap();
        let admin = SessionContext::new(admin_id, "admin", room.id);
        let player = SessionContext::new(player_id, "player", room.id);
        let mut sub = hub.join(admin_id, "admin").await.unwrap().subscription;
        hub.join(player_id, "player").await.unwrap();
        hub.commit(&admin, Mutation::GrantTurn { user_id: player_id })
            .await
            .unwrap();

        let unit = Unit::new(room.id, e(0), "infantry", "inf", 0.0, 0.0).owned_by(player_id, Some(1));
        let id = unit.id;
        hub.commit(&player, Mutation::CreateUnit(unit)).await.unwrap();
        let first = hub
            .commit(&player, Mutation::UpdateUnit { id, patch: UnitPatch::position(1.0, 1.0) })
            .await
            .unwrap();
        assert_eq!(first, CommitOutcome::Committed);
        let second = hub
            .commit(&player, Mutation::UpdateUnit { id, patch: UnitPatch::position(7.0, 7.0) })
            .await
            .unwrap();
        assert!(matches!(second, CommitOutcome::Coalesced { .. }));

        hub.commit(&admin, Mutation::RevokeTurn).await.unwrap();
        drain(&mut sub);
        tokio::time::sleep(Duration::from_millis(300)).await;

        let corrections: Vec<_> = drain(&mut sub)
            .into_iter()
            .filter(|ev| ev.kind == ChangeKind::Update && ev.payload.entity_id() == id)
            .collect();
        assert_eq!(corrections.len(), 1);
        match &corrections[0].payload {
            ChangePayload::Unit(u) => assert_eq!((u.x, u.y), (1.0, 1.0)),
            other => panic!("unexpected {other:?}"),
        }
        let snap = hub.snapshot(e(0)).await.unwrap();
        assert_eq!((snap.units[0].x, snap.units[0].y), (1.0, 1.0));
    }

    #[tokio::test]
    async fn test_leave_from_one_connection_keeps_member() {
        let mut f = fixture().await;
        let second = f.hub.join(f.player.user_id, "player").await.unwrap();
        drain(&mut f.admin_sub);

        f.hub.leave(f.player.user_id).await.unwrap();
        f.hub.feed().unsubscribe(second.subscription.handle);
        assert!(drain(&mut f.admin_sub)
            .iter()
            .all(|ev| ev.kind != ChangeKind::Delete));
        assert!(f
            .hub
            .list_active()
            .await
            .iter()
            .any(|m| m.user_id == f.player.user_id));

        f.hub.leave(f.player.user_id).await.unwrap();
        let deleted = drain(&mut f.admin_sub)
            .into_iter()
            .filter(|ev| ev.kind == ChangeKind::Delete)
            .count();
        assert_eq!(deleted, 1);
        assert!(f
            .hub
            .list_active()
            .await
            .iter()
            .all(|m| m.user_id != f.player.user_id));
    }
}
