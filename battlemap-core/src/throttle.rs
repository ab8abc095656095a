//! Per-key minimum write interval with last-value coalescing.
//!
//! The first write for a key passes immediately. Writes arriving within
//! `interval` of the last emitted one are folded into a single pending
//! value, which becomes due once the interval has elapsed. Nothing is
//! ever queued: at most one pending value exists per key.
//!
//! Time is passed in explicitly so the same type serves the server commit
//! path (tokio clock) and the client drag path (frame clock), and so the
//! behavior is testable without sleeping.

use std::collections::HashMap;
use std::hash::Hash;
use std::time::{Duration, Instant};

pub const DEFAULT_WRITE_INTERVAL: Duration = Duration::from_millis(500);

/// Fold a newer write into an older pending one.
pub trait Coalesce {
    fn coalesce(&mut self, newer: Self);
}

#[derive(Debug, PartialEq)]
pub enum Admission<V> {
    /// Emit this value now.
    Now(V),
    /// Value was absorbed; it becomes due at `flush_at`.
    Deferred { flush_at: Instant },
}

#[derive(Debug)]
struct Slot<V> {
    last_emit: Instant,
    pending: Option<V>,
}

#[derive(Debug)]
pub struct WriteThrottle<K, V> {
    interval: Duration,
    slots: HashMap<K, Slot<V>>,
}

impl<K, V> WriteThrottle<K, V>
where
    K: Eq + Hash + Clone,
    V: Coalesce,
{
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            slots: HashMap::new(),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn offer(&mut self, key: K, value: V, now: Instant) -> Admission<V> {
        let interval = self.interval;
        let slot = match self.slots.get_mut(&key) {
            Some(slot) => slot,
            None => {
                self.slots.insert(
                    key,
                    Slot {
                        last_emit: now,
                        pending: None,
                    },
                );
                return Admission::Now(value);
            }
        };

        let due_at = slot.last_emit + interval;
        let merged = match slot.pending.take() {
            Some(mut older) => {
                older.coalesce(value);
                older
            }
            None => value,
        };

        if now >= due_at {
            slot.last_emit = now;
            Admission::Now(merged)
        } else {
            slot.pending = Some(merged);
            Admission::Deferred { flush_at: due_at }
        }
    }

    /// Take every pending value whose interval has elapsed.
    pub fn take_due(&mut self, now: Instant) -> Vec<(K, V)> {
        let interval = self.interval;
        let mut due = Vec::new();
        for (key, slot) in self.slots.iter_mut() {
            if slot.pending.is_some() && now >= slot.last_emit + interval {
                if let Some(value) = slot.pending.take() {
                    slot.last_emit = now;
                    due.push((key.clone(), value));
                }
            }
        }
        due
    }

    pub fn take_due_for(&mut self, key: &K, now: Instant) -> Option<V> {
        let interval = self.interval;
        let slot = self.slots.get_mut(key)?;
        if now < slot.last_emit + interval {
            return None;
        }
        let value = slot.pending.take()?;
        slot.last_emit = now;
        Some(value)
    }

    /// Take a pending value regardless of the interval.
    pub fn flush(&mut self, key: &K) -> Option<V> {
        self.slots.get_mut(key)?.pending.take()
    }

    /// Earliest instant at which a pending value becomes due.
    pub fn next_due(&self) -> Option<Instant> {
        self.slots
            .values()
            .filter(|s| s.pending.is_some())
            .map(|s| s.last_emit + self.interval)
            .min()
    }

    /// Drop bookkeeping for keys with nothing pending and an elapsed interval.
    pub fn forget_idle(&mut self, now: Instant) {
        let interval = self.interval;
        self.slots
            .retain(|_, slot| slot.pending.is_some() || now < slot.last_emit + interval);
    }

    pub fn pending_len(&self) -> usize {
        self.slots.values().filter(|s| s.pending.is_some()).count()
    }

    pub fn is_pending(&self, key: &K) -> bool {
        self.slots.get(key).is_some_and(|s| s.pending.is_some())
    }

    /// Keys with bookkeeping, pending or not.
    pub fn tracked_len(&self) -> usize {
        self.slots.len()
    }
}

impl<K, V> Default for WriteThrottle<K, V>
where
    K: Eq + Hash + Clone,
    V: Coalesce,
{
    fn default() -> Self {
        Self::new(DEFAULT_WRITE_INTERVAL)
    }
}
