//! Room membership, used to scope producer notifications.

use common::types::{RoomId, SessionId};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};

#[derive(Debug, Default)]
struct Rooms {
    members: HashMap<RoomId, HashSet<SessionId>>,
    /// Reverse index: the single room a session belongs to.
    membership: HashMap<SessionId, RoomId>,
}

/// Tracks which sessions are in which room.
///
/// A session is in at most one room. Rooms are created on first join and
/// stay around (empty) after their last member leaves.
#[derive(Debug, Default)]
pub struct RoomRegistry {
    inner: Mutex<Rooms>,
}

impl RoomRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `session_id` to `room_id`, leaving its previous room if any.
    ///
    /// Returns the room the session moved out of.
    pub fn join(&self, session_id: SessionId, room_id: RoomId) -> Option<RoomId> {
        let mut rooms = self.inner.lock();

        if rooms.membership.get(&session_id) == Some(&room_id) {
            return None;
        }

        let previous = rooms.membership.insert(session_id, room_id.clone());
        if let Some(previous) = &previous {
            if let Some(members) = rooms.members.get_mut(previous) {
                members.remove(&session_id);
            }
        }
        rooms.members.entry(room_id).or_default().insert(session_id);
        previous
    }

    /// Other members of `room_id`.
    #[must_use]
    pub fn members_excluding(&self, room_id: &RoomId, session_id: SessionId) -> Vec<SessionId> {
        self.inner
            .lock()
            .members
            .get(room_id)
            .map(|members| {
                members
                    .iter()
                    .copied()
                    .filter(|id| *id != session_id)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// The room `session_id` belongs to, if any.
    #[must_use]
    pub fn room_of(&self, session_id: SessionId) -> Option<RoomId> {
        self.inner.lock().membership.get(&session_id).cloned()
    }

    /// Remove `session_id` from every room. No-op for non-members.
    pub fn leave(&self, session_id: SessionId) {
        let mut rooms = self.inner.lock();
        if let Some(room_id) = rooms.membership.remove(&session_id) {
            if let Some(members) = rooms.members.get_mut(&room_id) {
                members.remove(&session_id);
            }
        }
    }

    /// Number of members of `room_id` (0 for unknown rooms).
    #[must_use]
    pub fn member_count(&self, room_id: &RoomId) -> usize {
        self.inner
            .lock()
            .members
            .get(room_id)
            .map_or(0, HashSet::len)
    }

    /// Whether `room_id` has ever been joined.
    #[must_use]
    pub fn contains_room(&self, room_id: &RoomId) -> bool {
        self.inner.lock().members.contains_key(room_id)
    }
}
