//! Session/presence tracking for one room.
//!
//! Presence is advisory: it tells the UI who is around, it never gates a
//! write. A member is active while it keeps at least one connection and
//! heartbeats within the staleness window.
//!
//! ```text
//!   join ──► active ──(no heartbeat for timeout)──► inactive
//!              ▲  │                                    │
//!   heartbeat ─┘  └──(last connection closes)──────────┤
//!                                                      │
//!   heartbeat / join again ◄───────────────────────────┘
//!   leave / kick ──► row removed
//! ```

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use uuid::Uuid;

use battlemap_core::{now_millis, RoomMember, UserId};

pub const DEFAULT_PRESENCE_TIMEOUT: Duration = Duration::from_secs(45);

// ───────────────────────────────────────────────────────────────────
// Member colors
// ───────────────────────────────────────────────────────────────────

/// RGBA color for a member's markers and list entry.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MemberColor {
    pub r: f32,
    pub g: f32,
    pub b: f32,
    pub a: f32,
}

impl MemberColor {
    /// Stable, vivid color from a user id (HSL with fixed saturation and
    /// lightness, hue from the id).
    pub fn from_uuid(id: Uuid) -> Self {
        let hash = id.as_u128();
        let hue = ((hash % 360) as f32) / 360.0;
        let (r, g, b) = hsl_to_rgb(hue, 0.7, 0.6);
        Self { r, g, b, a: 1.0 }
    }

    pub fn to_array(&self) -> [f32; 4] {
        [self.r, self.g, self.b, self.a]
    }

    /// `#rrggbb`, usable as a unit tint.
    pub fn to_hex(&self) -> String {
        let channel = |v: f32| (v.clamp(0.0, 1.0) * 255.0).round() as u8;
        format!(
            "#{:02x}{:02x}{:02x}",
            channel(self.r),
            channel(self.g),
            channel(self.b)
        )
    }
}

fn hsl_to_rgb(h: f32, s: f32, l: f32) -> (f32, f32, f32) {
    if s == 0.0 {
        return (l, l, l);
    }

    let q = if l < 0.5 { l * (1.0 + s) } else { l + s - l * s };
    let p = 2.0 * l - q;

    (
        hue_to_rgb(p, q, h + 1.0 / 3.0),
        hue_to_rgb(p, q, h),
        hue_to_rgb(p, q, h - 1.0 / 3.0),
    )
}

fn hue_to_rgb(p: f32, q: f32, mut t: f32) -> f32 {
    if t < 0.0 {
        t += 1.0;
    }
    if t > 1.0 {
        t -= 1.0;
    }
    if t < 1.0 / 6.0 {
        return p + (q - p) * 6.0 * t;
    }
    if t < 1.0 / 2.0 {
        return q;
    }
    if t < 2.0 / 3.0 {
        return p + (q - p) * (2.0 / 3.0 - t) * 6.0;
    }
    p
}

// ───────────────────────────────────────────────────────────────────
// Presence manager
// ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
struct PresenceEntry {
    member: RoomMember,
    last_heartbeat: Instant,
    connections: usize,
}

impl PresenceEntry {
    fn touch(&mut self, now: Instant) {
        self.last_heartbeat = now;
        self.member.last_seen_at = now_millis();
    }
}

/// Member liveness for one room. Each method returns the member row when
/// it changed, so the caller can persist it and publish a Member event.
#[derive(Debug)]
pub struct PresenceManager {
    timeout: Duration,
    entries: HashMap<UserId, PresenceEntry>,
}

impl PresenceManager {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            entries: HashMap::new(),
        }
    }

    /// Seed from persisted rows after a restart. Nobody is connected yet,
    /// so every restored member starts inactive.
    pub fn restore(&mut self, members: Vec<RoomMember>, now: Instant) {
        for mut member in members {
            member.is_active = false;
            self.entries.insert(
                member.user_id,
                PresenceEntry {
                    member,
                    last_heartbeat: now,
                    connections: 0,
                },
            );
        }
    }

    /// Register a connection for `user_id`. Creates the member on first
    /// join; returns the (possibly new) row and whether it was created.
    pub fn join(&mut self, room_id: Uuid, user_id: UserId, display_name: &str, now: Instant) -> (RoomMember, bool) {
        match self.entries.get_mut(&user_id) {
            Some(entry) => {
                entry.connections += 1;
                entry.member.is_active = true;
                entry.member.display_name = display_name.to_string();
                entry.touch(now);
                (entry.member.clone(), false)
            }
            None => {
                let member = RoomMember::new(room_id, user_id, display_name);
                self.entries.insert(
                    user_id,
                    PresenceEntry {
                        member: member.clone(),
                        last_heartbeat: now,
                        connections: 1,
                    },
                );
                (member, true)
            }
        }
    }

    /// Explicit leave or kick: forget the member entirely.
    pub fn leave(&mut self, user_id: UserId) -> Option<RoomMember> {
        self.entries.remove(&user_id).map(|e| e.member)
    }

    /// A connection closed without leaving. Returns the row when the last
    /// connection went away and the member flipped inactive.
    pub fn disconnect(&mut self, user_id: UserId) -> Option<RoomMember> {
        let entry = self.entries.get_mut(&user_id)?;
        entry.connections = entry.connections.saturating_sub(1);
        if entry.connections == 0 && entry.member.is_active {
            entry.member.is_active = false;
            return Some(entry.member.clone());
        }
        None
    }

    /// Refresh liveness. Returns the row only if it flipped back to active.
    pub fn heartbeat(&mut self, user_id: UserId, now: Instant) -> Option<RoomMember> {
        let entry = self.entries.get_mut(&user_id)?;
        entry.touch(now);
        if !entry.member.is_active && entry.connections > 0 {
            entry.member.is_active = true;
            return Some(entry.member.clone());
        }
        None
    }

    pub fn is_active(&self, user_id: UserId, now: Instant) -> bool {
        self.entries
            .get(&user_id)
            .is_some_and(|e| e.member.is_active && now.duration_since(e.last_heartbeat) <= self.timeout)
    }

    pub fn is_member(&self, user_id: UserId) -> bool {
        self.entries.contains_key(&user_id)
    }

    pub fn member(&self, user_id: UserId) -> Option<&RoomMember> {
        self.entries.get(&user_id).map(|e| &e.member)
    }

    /// Members that heartbeated within the window, ordered by join time.
    pub fn list_active(&self, now: Instant) -> Vec<RoomMember> {
        let mut active: Vec<RoomMember> = self
            .entries
            .values()
            .filter(|e| e.member.is_active && now.duration_since(e.last_heartbeat) <= self.timeout)
            .map(|e| e.member.clone())
            .collect();
        active.sort_by_key(|m| (m.joined_at, m.user_id));
        active
    }

    pub fn list_all(&self) -> Vec<RoomMember> {
        let mut all: Vec<RoomMember> = self.entries.values().map(|e| e.member.clone()).collect();
        all.sort_by_key(|m| (m.joined_at, m.user_id));
        all
    }

    /// Flip members whose heartbeat is older than the window to inactive.
    /// Returns the rows that changed.
    pub fn reap_stale(&mut self, now: Instant) -> Vec<RoomMember> {
        let timeout = self.timeout;
        let mut reaped = Vec::new();
        for entry in self.entries.values_mut() {
            if entry.member.is_active && now.duration_since(entry.last_heartbeat) > timeout {
                entry.member.is_active = false;
                reaped.push(entry.member.clone());
            }
        }
        reaped
    }

    pub fn member_count(&self) -> usize {
        self.entries.len()
    }

    /// Open connections of one member.
    pub fn connections(&self, user_id: UserId) -> usize {
        self.entries.get(&user_id).map_or(0, |e| e.connections)
    }

    /// Members with at least one open connection.
    pub fn connected_count(&self) -> usize {
        self.entries.values().filter(|e| e.connections > 0).count()
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

impl Default for PresenceManager {
    fn default() -> Self {
        Self::new(DEFAULT_PRESENCE_TIMEOUT)
    }
}
