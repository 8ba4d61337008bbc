use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The type used to identify users. Identities are owned by an external
/// collaborator, the hub only ever looks them up.
pub type UserId = String;

/// A user identity, as known to the external identity collaborator
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserData {
    pub id: UserId,
    pub display_name: String,
}

/// A durable two-party message thread, independent of live connectivity
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationData {
    pub id: String,
    pub participants: [UserId; 2],
    pub created_at: DateTime<Utc>,
}

/// The delivery state of a message.
///
/// Transitions are forward-only, except [MessageState::Recalled] which is a
/// terminal override reachable from any prior state by the sender.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageState {
    Sent,
    Delivered,
    Read,
    Recalled,
}

impl MessageState {
    /// The position of the state in the forward-only delivery progression
    pub fn rank(&self) -> u8 {
        match self {
            Self::Sent => 0,
            Self::Delivered => 1,
            Self::Read => 2,
            Self::Recalled => 3,
        }
    }

    pub fn is_recalled(&self) -> bool {
        matches!(self, Self::Recalled)
    }
}

/// The content of a message: either plain text, or a reference to a file in
/// the blob store
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageBody {
    Text(String),
    File { blob_ref: String, name: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageData {
    pub id: String,
    pub conversation_id: String,
    pub sender_id: UserId,
    pub body: MessageBody,
    pub state: MessageState,
    pub created_at: DateTime<Utc>,
}

/// The state of a file transfer offer. Once terminal it never changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OfferState {
    Offered,
    Accepted,
    Rejected,
    Expired,
}

impl OfferState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Offered)
    }
}

/// A file transfer handshake between two users of a conversation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileOfferData {
    pub id: String,
    pub conversation_id: String,
    pub sender_id: UserId,
    pub recipient_id: UserId,
    pub blob_ref: String,
    pub file_name: String,
    pub state: OfferState,
    pub created_at: DateTime<Utc>,
}

/// A track in a music room queue
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackData {
    pub id: String,
    /// Opaque reference to the track's media, resolved by the caller
    pub source_ref: String,
    pub duration_ms: u64,
    pub added_by: UserId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RepeatMode {
    Off,
    One,
    All,
}

/// A durable snapshot of a music room's queue, used for crash recovery
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueSnapshotData {
    pub room: String,
    pub queue: Vec<TrackData>,
    pub current_index: Option<usize>,
    pub repeat: RepeatMode,
    pub shuffle: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScreenState {
    Active,
    Ended,
}

/// The durable record of a screen share session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScreenSessionData {
    pub id: String,
    pub host_user_id: UserId,
    pub access_code: String,
    pub state: ScreenState,
    pub created_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    NewMessage,
    FileOffer,
}

/// A fire-and-forget record for offline or asynchronous consumption
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationData {
    pub id: String,
    pub user_id: UserId,
    pub kind: NotificationKind,
    pub payload: serde_json::Value,
    pub read: bool,
    pub created_at: DateTime<Utc>,
}
