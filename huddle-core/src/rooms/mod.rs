mod connection;
mod room;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use dashmap::DashMap;
use log::info;
use parking_lot::Mutex;
use thiserror::Error;

pub use connection::*;
pub use room::*;

use crate::{PresenceRegistry, SessionId};

#[derive(Debug, Error)]
pub enum RoomError {
    #[error("Room {0} doesn't exist")]
    NotFound(RoomId),
    #[error("Session is not a member of the room")]
    NotMember,
    #[error("Session is not connected")]
    SessionNotConnected,
}

/// The generic join/leave/broadcast primitive every subsystem builds on.
///
/// Each room is its own lock domain, so unrelated rooms broadcast in
/// parallel. The coordinator also keeps a reverse index from session to
/// joined rooms, which makes disconnect cleanup proportional to the rooms a
/// session actually joined.
pub struct RoomCoordinator<E> {
    presence: Arc<PresenceRegistry<E>>,
    rooms: DashMap<RoomId, Arc<Room>>,
    memberships: Mutex<HashMap<SessionId, HashSet<RoomId>>>,
}

impl<E> RoomCoordinator<E> {
    pub fn new(presence: &Arc<PresenceRegistry<E>>) -> Self {
        Self {
            presence: presence.clone(),
            rooms: Default::default(),
            memberships: Default::default(),
        }
    }

    /// Adds a session to a room, creating the room if it doesn't exist yet.
    /// Fails if the session has already been destroyed, which keeps dead
    /// sessions out of membership sets.
    pub fn join(&self, room_id: RoomId, session_id: SessionId) -> Result<(), RoomError> {
        if self.presence.session(session_id).is_none() {
            return Err(RoomError::SessionNotConnected);
        }

        let room = self
            .rooms
            .entry(room_id.clone())
            .or_insert_with(|| Arc::new(Room::new(room_id.clone())))
            .clone();

        room.join(session_id);

        self.memberships
            .lock()
            .entry(session_id)
            .or_default()
            .insert(room_id.clone());

        // An eviction may have completed between the liveness check above
        // and these inserts, finding nothing to sweep yet. Re-check and undo
        // so a destroyed session can never linger in a member set.
        if self.presence.session(session_id).is_none() {
            self.leave(&room_id, session_id);
            return Err(RoomError::SessionNotConnected);
        }

        Ok(())
    }

    /// Removes a session from a room. Returns true when this destroyed an
    /// ephemeral room. A no-op for unknown rooms or non-members.
    pub fn leave(&self, room_id: &RoomId, session_id: SessionId) -> bool {
        let Some(room) = self.rooms.get(room_id).map(|r| r.clone()) else {
            return false;
        };

        let (removed, now_empty) = room.leave(session_id);

        if removed {
            let mut memberships = self.memberships.lock();

            if let Some(rooms_of_session) = memberships.get_mut(&session_id) {
                rooms_of_session.remove(room_id);

                if rooms_of_session.is_empty() {
                    memberships.remove(&session_id);
                }
            }
        }

        if now_empty && room_id.kind.is_ephemeral() {
            self.rooms.remove(room_id);
            info!("Room {} destroyed", room_id);

            return true;
        }

        false
    }

    /// Returns the current members of a room, empty for unknown rooms
    pub fn members_of(&self, room_id: &RoomId) -> HashSet<SessionId> {
        self.rooms
            .get(room_id)
            .map(|r| r.members())
            .unwrap_or_default()
    }

    /// The rooms a session currently belongs to
    pub fn rooms_of(&self, session_id: SessionId) -> HashSet<RoomId> {
        self.memberships
            .lock()
            .get(&session_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn is_member(&self, room_id: &RoomId, session_id: SessionId) -> bool {
        self.rooms
            .get(room_id)
            .map(|r| r.is_member(session_id))
            .unwrap_or(false)
    }

    /// Disconnects the session from the registry and removes it from every
    /// room it joined, in that order: once the registry entry is gone, no
    /// broadcast started afterwards can target the session. Returns the
    /// ephemeral rooms destroyed by the removal so their owning subsystem can
    /// drop state. Idempotent.
    pub fn evict(&self, session_id: SessionId) -> Vec<RoomId> {
        self.presence.disconnect(session_id);

        let joined_rooms = self
            .memberships
            .lock()
            .remove(&session_id)
            .unwrap_or_default();

        joined_rooms
            .into_iter()
            .filter(|room_id| {
                let Some(room) = self.rooms.get(room_id).map(|r| r.clone()) else {
                    return false;
                };

                let (_, now_empty) = room.leave(session_id);

                if now_empty && room_id.kind.is_ephemeral() {
                    self.rooms.remove(room_id);
                    info!("Room {} destroyed", room_id);

                    true
                } else {
                    false
                }
            })
            .collect()
    }
}

impl<E> RoomCoordinator<E>
where
    E: Clone,
{
    /// Broadcasts an event to every member of a room, assigning the room's
    /// next sequence number atomically with respect to other broadcasts in
    /// the same room.
    pub fn broadcast(
        &self,
        room_id: &RoomId,
        event: E,
        exclude: Option<SessionId>,
    ) -> Result<u64, RoomError> {
        let room = self
            .rooms
            .get(room_id)
            .map(|r| r.clone())
            .ok_or_else(|| RoomError::NotFound(room_id.clone()))?;

        Ok(room.broadcast(&self.presence, event, exclude))
    }

    /// Broadcasts if the room exists and has members. Used for best-effort
    /// live mirrors of durable state, where nobody listening is fine.
    pub fn try_broadcast(
        &self,
        room_id: &RoomId,
        event: E,
        exclude: Option<SessionId>,
    ) -> Option<u64> {
        let room = self.rooms.get(room_id).map(|r| r.clone())?;

        if room.is_empty() {
            return None;
        }

        Some(room.broadcast(&self.presence, event, exclude))
    }

    /// Delivers an event to a single member of a room, still consuming a
    /// room sequence number. Fails if the target is not a member.
    pub fn direct(&self, room_id: &RoomId, to: SessionId, event: E) -> Result<u64, RoomError> {
        let room = self
            .rooms
            .get(room_id)
            .map(|r| r.clone())
            .ok_or_else(|| RoomError::NotFound(room_id.clone()))?;

        room.direct(&self.presence, to, event)
            .ok_or(RoomError::NotMember)
    }
}
