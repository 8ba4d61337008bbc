use huddle_core::{
    MessageData, MessageState, OfferState, Session, SessionId, TrackData, UserId,
};
use serde::Serialize;

use crate::PlaybackSnapshot;

/// Every event the hub pushes to room members, tagged by kind.
///
/// Each variant belongs to one subsystem; the room id on the delivery
/// envelope tells the client which room it applies to.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HubEvent {
    /// A session joined the room
    MemberJoined { session: Session },
    /// A session left the room
    MemberLeft { session_id: SessionId, user_id: UserId },

    /// A new message was persisted and mirrored to live members
    MessageSent { message: MessageData },
    /// A message moved forward in its delivery progression
    MessageStateChanged {
        message_id: String,
        new_state: MessageState,
    },
    /// The sender recalled a message, peers must drop its content
    MessageRecalled { message_id: String },
    /// A file transfer was offered
    FileOffered {
        offer_id: String,
        sender_id: UserId,
        recipient_id: UserId,
        file_name: String,
    },
    /// A file transfer offer reached a terminal state
    OfferResolved {
        offer_id: String,
        new_state: OfferState,
    },

    /// The authoritative playback state of a music room changed
    PlaybackChanged { snapshot: PlaybackSnapshot },
    /// The queue contents of a music room changed
    QueueChanged {
        queue: Vec<TrackData>,
        current_index: Option<usize>,
    },

    /// A guest joined a screen session; sent to the host, which is expected
    /// to establish a peer connection per guest
    GuestJoined {
        session_id: SessionId,
        user_id: UserId,
    },
    /// A guest left a screen session
    GuestLeft { session_id: SessionId },
    /// An opaque signaling payload relayed verbatim between two peers
    Signal {
        from: SessionId,
        payload: serde_json::Value,
    },
    /// The screen session ended, all participants are evicted
    ScreenSessionEnded,
}
