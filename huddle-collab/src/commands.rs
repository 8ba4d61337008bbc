use huddle_core::{
    FileOfferData, MessageData, NotificationData, PresenceError, RoomError, RoomId, SessionId,
    StorageError, UserId,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{ChatError, PlaybackError, PlaybackSnapshot, SignalError, TransportCommand};

/// A request from a connected session, as decoded by the transport layer
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HubCommand {
    JoinRoom {
        room: RoomId,
    },
    LeaveRoom {
        room: RoomId,
    },
    SendMessage {
        recipient_id: UserId,
        body: String,
    },
    ListMessages {
        conversation_id: String,
    },
    MarkDelivered {
        message_id: String,
    },
    MarkRead {
        message_ids: Vec<String>,
    },
    RecallMessage {
        message_id: String,
    },
    OfferFile {
        recipient_id: UserId,
        blob_ref: String,
        file_name: String,
    },
    AcceptOffer {
        offer_id: String,
    },
    RejectOffer {
        offer_id: String,
    },
    Transport {
        room: String,
        command: TransportCommand,
    },
    CreateScreenSession {
        password: Option<String>,
    },
    JoinScreenSession {
        code: String,
        password: Option<String>,
    },
    LeaveScreenSession {
        screen_id: String,
    },
    EndScreenSession {
        screen_id: String,
    },
    Signal {
        screen_id: String,
        to: SessionId,
        payload: serde_json::Value,
    },
    ListNotifications,
    MarkNotificationsRead {
        notification_ids: Vec<String>,
    },
}

/// The direct answer to a [HubCommand]. Everything other sessions learn about
/// arrives as a sequenced room event instead.
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HubReply {
    Ack,
    Message { message: MessageData },
    Messages { messages: Vec<MessageData> },
    Offer { offer: FileOfferData },
    Playback { snapshot: PlaybackSnapshot },
    ScreenSession { screen_id: String, code: String },
    Notifications { notifications: Vec<NotificationData> },
}

#[derive(Debug, Error)]
pub enum HubError {
    #[error("User {0} doesn't exist")]
    UnknownUser(UserId),
    #[error("Not allowed")]
    Forbidden,
    #[error(transparent)]
    Presence(#[from] PresenceError),
    #[error(transparent)]
    Room(#[from] RoomError),
    #[error(transparent)]
    Chat(#[from] ChatError),
    #[error(transparent)]
    Playback(#[from] PlaybackError),
    #[error(transparent)]
    Signal(#[from] SignalError),
    #[error(transparent)]
    Storage(#[from] StorageError),
}
