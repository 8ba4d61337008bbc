mod shuffle;

pub use shuffle::*;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use crossbeam::atomic::AtomicCell;
use dashmap::DashMap;
use huddle_core::{
    QueueSnapshotData, RepeatMode, RoomError, RoomId, Session, SessionId, TrackData,
};
use log::warn;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{HubContext, HubEvent};

#[derive(Debug, Error)]
pub enum PlaybackError {
    #[error("Music room {0} doesn't exist")]
    RoomNotFound(String),
    #[error("Session is not a member of the room")]
    NotMember,
    #[error("Track {0} is not in the queue")]
    UnknownTrack(String),
    #[error(transparent)]
    Room(RoomError),
}

/// A transport control affecting a music room's authoritative state
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TransportCommand {
    Play,
    Pause,
    Seek { position_ms: u64 },
    Next,
    Previous,
    AddTrack { track: TrackData },
    RemoveTrack { track_id: String },
    SetShuffle { enabled: bool },
    SetRepeat { mode: RepeatMode },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Transport {
    Playing,
    Paused,
}

/// The derived state of a music room at one point in time, as sent to a
/// joining member or broadcast after an accepted command
#[derive(Debug, Clone, Serialize)]
pub struct PlaybackSnapshot {
    pub room: String,
    pub queue: Vec<TrackData>,
    pub current_index: Option<usize>,
    pub transport: Transport,
    /// Live elapsed position, computed from the authoritative clock
    pub position_ms: u64,
    pub shuffle: bool,
    pub repeat: RepeatMode,
}

/// The authoritative playback state machine of every music room.
///
/// Exactly one state exists per room, mutated only by accepted transport
/// commands from members, serialized behind the room's own lock. Late
/// joiners receive the current derived state instead of a replay: the
/// position is reconciled against the server clock, which is what keeps
/// listeners in sync regardless of when they join.
pub struct PlaybackSynchronizer {
    context: HubContext,
    rooms: DashMap<String, Arc<MusicRoom>>,
}

pub struct MusicRoom {
    name: String,
    /// Whether the room has (or ever had) live members. Restored rooms stay
    /// false until somebody joins them.
    live: AtomicCell<bool>,
    state: Mutex<PlaybackState>,
}

struct PlaybackState {
    queue: Vec<TrackData>,
    current: Option<usize>,
    transport: Transport,
    /// Position at the moment of the last accepted command
    position_ms: u64,
    last_event_at: DateTime<Utc>,
    repeat: RepeatMode,
    shuffle: Option<ShuffleOrder>,
}

impl MusicRoom {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            live: AtomicCell::new(true),
            state: Mutex::new(PlaybackState {
                queue: Vec::new(),
                current: None,
                transport: Transport::Paused,
                position_ms: 0,
                last_event_at: Utc::now(),
                repeat: RepeatMode::Off,
                shuffle: None,
            }),
        }
    }

    fn from_snapshot(snapshot: QueueSnapshotData) -> Self {
        let shuffle = snapshot
            .shuffle
            .then(|| ShuffleOrder::new(snapshot.queue.len()));

        let current = snapshot
            .current_index
            .filter(|&i| i < snapshot.queue.len());

        Self {
            name: snapshot.room,
            live: AtomicCell::new(false),
            state: Mutex::new(PlaybackState {
                queue: snapshot.queue,
                current,
                // Recovered rooms come back paused at the start of the track
                transport: Transport::Paused,
                position_ms: 0,
                last_event_at: Utc::now(),
                repeat: snapshot.repeat,
                shuffle,
            }),
        }
    }
}

impl PlaybackSynchronizer {
    pub fn new(context: &HubContext) -> Self {
        Self {
            context: context.clone(),
            rooms: Default::default(),
        }
    }

    /// Recreates music rooms from their durable queue snapshots
    pub async fn restore(&self) -> Result<(), huddle_core::StorageError> {
        for snapshot in self.context.storage.queue_snapshots().await? {
            let room = MusicRoom::from_snapshot(snapshot);
            self.rooms.insert(room.name.clone(), Arc::new(room));
        }

        Ok(())
    }

    /// Adds the session to the room (creating it on first join) and returns
    /// the current derived state
    pub fn join(&self, room: &str, session: &Session) -> Result<PlaybackSnapshot, PlaybackError> {
        let room_id = RoomId::music(room);

        self.context
            .rooms
            .join(room_id.clone(), session.id)
            .map_err(PlaybackError::Room)?;

        let music = self
            .rooms
            .entry(room.to_string())
            .or_insert_with(|| Arc::new(MusicRoom::new(room)))
            .clone();

        music.live.store(true);

        self.context.rooms.try_broadcast(
            &room_id,
            HubEvent::MemberJoined {
                session: session.clone(),
            },
            Some(session.id),
        );

        let snapshot = music.state.lock().snapshot(room, Utc::now());
        Ok(snapshot)
    }

    /// Applies a transport command from a member and broadcasts the result
    /// with the room's next sequence number. The broadcast goes out
    /// immediately; the queue snapshot is persisted best-effort afterwards.
    pub async fn apply(
        &self,
        room: &str,
        session_id: SessionId,
        command: TransportCommand,
    ) -> Result<PlaybackSnapshot, PlaybackError> {
        self.apply_at(room, session_id, command, Utc::now()).await
    }

    async fn apply_at(
        &self,
        room: &str,
        session_id: SessionId,
        command: TransportCommand,
        now: DateTime<Utc>,
    ) -> Result<PlaybackSnapshot, PlaybackError> {
        let room_id = RoomId::music(room);

        if !self.context.rooms.is_member(&room_id, session_id) {
            return Err(PlaybackError::NotMember);
        }

        let music = self
            .rooms
            .get(room)
            .map(|r| r.clone())
            .ok_or_else(|| PlaybackError::RoomNotFound(room.to_string()))?;

        let (snapshot, queue_changed) = {
            let mut state = music.state.lock();

            state.settle(now);
            let queue_changed = state.apply(command)?;

            (state.snapshot(room, now), queue_changed)
        };

        if queue_changed {
            self.context.rooms.try_broadcast(
                &room_id,
                HubEvent::QueueChanged {
                    queue: snapshot.queue.clone(),
                    current_index: snapshot.current_index,
                },
                None,
            );
        }

        self.context.rooms.try_broadcast(
            &room_id,
            HubEvent::PlaybackChanged {
                snapshot: snapshot.clone(),
            },
            None,
        );

        if queue_changed {
            self.persist_snapshot(&snapshot).await;
        }

        Ok(snapshot)
    }

    /// The current derived state of a room without mutating anything
    pub fn snapshot(&self, room: &str) -> Result<PlaybackSnapshot, PlaybackError> {
        self.snapshot_at(room, Utc::now())
    }

    fn snapshot_at(&self, room: &str, now: DateTime<Utc>) -> Result<PlaybackSnapshot, PlaybackError> {
        let music = self
            .rooms
            .get(room)
            .map(|r| r.clone())
            .ok_or_else(|| PlaybackError::RoomNotFound(room.to_string()))?;

        let snapshot = music.state.lock().snapshot(room, now);
        Ok(snapshot)
    }

    /// Drops the in-memory state of music rooms whose live room no longer
    /// exists, persisting a final snapshot for each. Restored rooms nobody
    /// has joined yet are left alone, since they never had a live room.
    pub async fn prune(&self) {
        let dead: Vec<String> = self
            .rooms
            .iter()
            .filter(|r| {
                r.live.load()
                    && self
                        .context
                        .rooms
                        .members_of(&RoomId::music(r.key().as_str()))
                        .is_empty()
            })
            .map(|r| r.key().clone())
            .collect();

        for name in dead {
            self.drop_room(&name).await;
        }
    }

    /// Called when the live room was destroyed. Persists a final snapshot so
    /// the queue survives a later restore, then drops the in-memory state.
    pub async fn drop_room(&self, room: &str) {
        let Some((_, music)) = self.rooms.remove(room) else {
            return;
        };

        let snapshot = music.state.lock().snapshot(room, Utc::now());
        self.persist_snapshot(&snapshot).await;
    }

    async fn persist_snapshot(&self, snapshot: &PlaybackSnapshot) {
        let data = QueueSnapshotData {
            room: snapshot.room.clone(),
            queue: snapshot.queue.clone(),
            current_index: snapshot.current_index,
            repeat: snapshot.repeat,
            shuffle: snapshot.shuffle,
        };

        // Best-effort: the live state is authoritative, the snapshot only
        // matters for crash recovery
        if let Err(e) = self.context.storage.save_queue_snapshot(data).await {
            warn!("Saving queue snapshot for {} failed: {}", snapshot.room, e);
        }
    }
}

impl PlaybackState {
    /// Materializes the live elapsed position into `position_ms` and moves
    /// the event clock forward. Called before every accepted command.
    fn settle(&mut self, now: DateTime<Utc>) {
        self.position_ms = self.derived_position(now);
        self.last_event_at = now;
    }

    /// Live elapsed position: the stored position plus wall time elapsed
    /// since the last event while playing
    fn derived_position(&self, now: DateTime<Utc>) -> u64 {
        let position = match self.transport {
            Transport::Paused => self.position_ms,
            Transport::Playing => {
                let elapsed = (now - self.last_event_at).num_milliseconds().max(0) as u64;
                self.position_ms + elapsed
            }
        };

        // Never report past the end of the current track
        match self.current.and_then(|i| self.queue.get(i)) {
            Some(track) => position.min(track.duration_ms),
            None => 0,
        }
    }

    /// Applies a command to the settled state. Returns whether the queue
    /// contents changed.
    fn apply(&mut self, command: TransportCommand) -> Result<bool, PlaybackError> {
        match command {
            TransportCommand::Play => {
                if self.current.is_some() {
                    self.transport = Transport::Playing;
                }
            }
            TransportCommand::Pause => {
                self.transport = Transport::Paused;
            }
            TransportCommand::Seek { position_ms } => {
                self.position_ms = position_ms;
            }
            TransportCommand::Next => {
                self.step(true);
            }
            TransportCommand::Previous => {
                self.step(false);
            }
            TransportCommand::AddTrack { track } => {
                self.queue.push(track);

                let added = self.queue.len() - 1;
                if let Some(order) = &mut self.shuffle {
                    order.push(added);
                }

                // The first track becomes current, but playback stays paused
                // until a member presses play
                if self.current.is_none() {
                    self.current = Some(added);
                    self.position_ms = 0;
                }

                return Ok(true);
            }
            TransportCommand::RemoveTrack { track_id } => {
                self.remove_track(&track_id)?;
                return Ok(true);
            }
            TransportCommand::SetShuffle { enabled } => {
                self.shuffle = enabled.then(|| ShuffleOrder::new(self.queue.len()));
            }
            TransportCommand::SetRepeat { mode } => {
                self.repeat = mode;
            }
        }

        Ok(false)
    }

    /// Advances to the next or previous track, honoring repeat and shuffle.
    /// The position always resets; `repeat = one` replays the same index.
    fn step(&mut self, forward: bool) {
        self.position_ms = 0;

        if self.queue.is_empty() {
            self.current = None;
            self.transport = Transport::Paused;
            return;
        }

        let Some(current) = self.current else {
            self.current = Some(0);
            return;
        };

        if self.repeat == RepeatMode::One {
            return;
        }

        let next = match &self.shuffle {
            Some(order) => {
                let position = order.position_of(current).unwrap_or(0);
                self.neighbor(position, forward, order.len())
                    .and_then(|p| order.index_at(p))
            }
            None => self.neighbor(current, forward, self.queue.len()),
        };

        match next {
            Some(index) => self.current = Some(index),
            // End of the queue without repeat: stay put, stop playing
            None => self.transport = Transport::Paused,
        }
    }

    /// The adjacent slot in a sequence of `len`, wrapping when repeat is set
    /// to all and running off the edge otherwise
    fn neighbor(&self, at: usize, forward: bool, len: usize) -> Option<usize> {
        if forward {
            if at + 1 < len {
                Some(at + 1)
            } else if self.repeat == RepeatMode::All {
                Some(0)
            } else {
                None
            }
        } else if at > 0 {
            Some(at - 1)
        } else if self.repeat == RepeatMode::All {
            Some(len - 1)
        } else {
            None
        }
    }

    fn remove_track(&mut self, track_id: &str) -> Result<(), PlaybackError> {
        let index = self
            .queue
            .iter()
            .position(|t| t.id == track_id)
            .ok_or_else(|| PlaybackError::UnknownTrack(track_id.to_string()))?;

        let removing_current = self.current == Some(index);

        if removing_current {
            // Advance under the same repeat/shuffle rule before removing
            self.step(true);
        }

        self.queue.remove(index);
        if let Some(order) = &mut self.shuffle {
            order.remove(index);
        }

        if self.queue.is_empty() {
            self.current = None;
            self.transport = Transport::Paused;
            self.position_ms = 0;

            return Ok(());
        }

        self.current = self.current.map(|current| {
            if current == index {
                // The step stayed on the removed slot (repeat one, or end of
                // queue): the slot now holds the following track, clamped to
                // the new end
                current.min(self.queue.len() - 1)
            } else if current > index {
                current - 1
            } else {
                current
            }
        });

        if removing_current {
            self.position_ms = 0;
        }

        Ok(())
    }

    fn snapshot(&self, room: &str, now: DateTime<Utc>) -> PlaybackSnapshot {
        PlaybackSnapshot {
            room: room.to_string(),
            queue: self.queue.clone(),
            current_index: self.current,
            transport: self.transport,
            position_ms: self.derived_position(now),
            shuffle: self.shuffle.is_some(),
            repeat: self.repeat,
        }
    }
}
