use std::collections::HashSet;
use std::fmt::Display;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::{PresenceRegistry, Sequenced, SessionId};

/// The collaboration kind a room serves
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoomKind {
    Chat,
    Music,
    Screen,
}

impl RoomKind {
    /// Ephemeral rooms are destroyed when their last member leaves. Chat
    /// delivery rooms survive empty, since the conversation outlives live
    /// membership.
    pub fn is_ephemeral(&self) -> bool {
        matches!(self, Self::Music | Self::Screen)
    }
}

/// A named broadcast domain, scoped to one collaboration kind
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RoomId {
    pub kind: RoomKind,
    pub key: String,
}

impl RoomId {
    pub fn chat(conversation_id: impl Into<String>) -> Self {
        Self {
            kind: RoomKind::Chat,
            key: conversation_id.into(),
        }
    }

    pub fn music(name: impl Into<String>) -> Self {
        Self {
            kind: RoomKind::Music,
            key: name.into(),
        }
    }

    pub fn screen(session_id: impl Into<String>) -> Self {
        Self {
            kind: RoomKind::Screen,
            key: session_id.into(),
        }
    }
}

impl Display for RoomId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match self.kind {
            RoomKind::Chat => "chat",
            RoomKind::Music => "music",
            RoomKind::Screen => "screen",
        };

        write!(f, "{}:{}", kind, self.key)
    }
}

/// A live room: a membership set and a sequence counter, serialized behind
/// one lock so broadcasts in the same room get a total order.
pub struct Room {
    pub id: RoomId,
    state: Mutex<RoomState>,
}

#[derive(Default)]
struct RoomState {
    members: HashSet<SessionId>,
    sequence: u64,
}

impl Room {
    pub fn new(id: RoomId) -> Self {
        Self {
            id,
            state: Default::default(),
        }
    }

    /// Adds a member. Returns false if it was already present.
    pub fn join(&self, session_id: SessionId) -> bool {
        self.state.lock().members.insert(session_id)
    }

    /// Removes a member, returning whether it was present and whether the
    /// room is now empty.
    pub fn leave(&self, session_id: SessionId) -> (bool, bool) {
        let mut state = self.state.lock();
        let removed = state.members.remove(&session_id);

        (removed, state.members.is_empty())
    }

    pub fn members(&self) -> HashSet<SessionId> {
        self.state.lock().members.clone()
    }

    pub fn is_member(&self, session_id: SessionId) -> bool {
        self.state.lock().members.contains(&session_id)
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().members.is_empty()
    }

    /// Assigns the next sequence number and delivers the event to every
    /// member, all under the room lock. Membership is re-read at send time,
    /// and sessions that died since are dropped by the registry.
    pub fn broadcast<E>(
        &self,
        registry: &PresenceRegistry<E>,
        event: E,
        exclude: Option<SessionId>,
    ) -> u64
    where
        E: Clone,
    {
        let mut state = self.state.lock();
        state.sequence += 1;
        let seq = state.sequence;

        for member in &state.members {
            if Some(*member) == exclude {
                continue;
            }

            registry.send_to(
                *member,
                Sequenced {
                    room_id: self.id.clone(),
                    seq,
                    event: event.clone(),
                },
            );
        }

        seq
    }

    /// Like [Room::broadcast], but delivers to a single member. The event
    /// still consumes a sequence number so the per-room order stays total.
    /// Returns None if the target is not a member.
    pub fn direct<E>(
        &self,
        registry: &PresenceRegistry<E>,
        to: SessionId,
        event: E,
    ) -> Option<u64> {
        let mut state = self.state.lock();

        if !state.members.contains(&to) {
            return None;
        }

        state.sequence += 1;
        let seq = state.sequence;

        registry.send_to(
            to,
            Sequenced {
                room_id: self.id.clone(),
                seq,
                event,
            },
        );

        Some(seq)
    }
}
