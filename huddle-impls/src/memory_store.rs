use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use huddle_core::{
    random_string, ConversationData, FileOfferData, MessageData, NotificationData,
    QueueSnapshotData, ScreenSessionData, Storage, StorageError, StorageResult, UserData, UserId,
};
use parking_lot::Mutex;

/// A purely in-memory store, used by tests and single-process setups where
/// durability across restarts doesn't matter
#[derive(Default)]
pub struct MemoryStore {
    users: Mutex<HashMap<UserId, UserData>>,
    conversations: Mutex<HashMap<String, ConversationData>>,
    messages: Mutex<HashMap<String, MessageData>>,
    offers: Mutex<HashMap<String, FileOfferData>>,
    snapshots: Mutex<HashMap<String, QueueSnapshotData>>,
    screen_sessions: Mutex<HashMap<String, ScreenSessionData>>,
    notifications: Mutex<Vec<NotificationData>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Default::default()
    }

    /// Seeds a user identity, since the hub itself never creates them
    pub fn add_user(&self, id: &str, display_name: &str) {
        self.users.lock().insert(
            id.to_string(),
            UserData {
                id: id.to_string(),
                display_name: display_name.to_string(),
            },
        );
    }

    /// The canonical key for the conversation between two users, independent
    /// of who initiated it
    fn pair_key(a: &UserId, b: &UserId) -> (UserId, UserId) {
        if a <= b {
            (a.clone(), b.clone())
        } else {
            (b.clone(), a.clone())
        }
    }
}

#[async_trait]
impl Storage for MemoryStore {
    async fn user_by_id(&self, user_id: &UserId) -> StorageResult<UserData> {
        self.users
            .lock()
            .get(user_id)
            .cloned()
            .ok_or_else(|| StorageError::not_found("user", user_id))
    }

    async fn conversation_between(
        &self,
        a: &UserId,
        b: &UserId,
    ) -> StorageResult<ConversationData> {
        let (first, second) = Self::pair_key(a, b);

        let mut conversations = self.conversations.lock();

        let existing = conversations
            .values()
            .find(|c| c.participants == [first.clone(), second.clone()])
            .cloned();

        if let Some(conversation) = existing {
            return Ok(conversation);
        }

        let conversation = ConversationData {
            id: random_string(16),
            participants: [first, second],
            created_at: Utc::now(),
        };

        conversations.insert(conversation.id.clone(), conversation.clone());
        Ok(conversation)
    }

    async fn conversation_by_id(&self, conversation_id: &str) -> StorageResult<ConversationData> {
        self.conversations
            .lock()
            .get(conversation_id)
            .cloned()
            .ok_or_else(|| StorageError::not_found("conversation", conversation_id))
    }

    async fn upsert_message(&self, message: MessageData) -> StorageResult<()> {
        self.messages.lock().insert(message.id.clone(), message);
        Ok(())
    }

    async fn message_by_id(&self, message_id: &str) -> StorageResult<MessageData> {
        self.messages
            .lock()
            .get(message_id)
            .cloned()
            .ok_or_else(|| StorageError::not_found("message", message_id))
    }

    async fn messages_in_conversation(
        &self,
        conversation_id: &str,
    ) -> StorageResult<Vec<MessageData>> {
        let mut messages: Vec<_> = self
            .messages
            .lock()
            .values()
            .filter(|m| m.conversation_id == conversation_id)
            .cloned()
            .collect();

        messages.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(messages)
    }

    async fn upsert_offer(&self, offer: FileOfferData) -> StorageResult<()> {
        self.offers.lock().insert(offer.id.clone(), offer);
        Ok(())
    }

    async fn offer_by_id(&self, offer_id: &str) -> StorageResult<FileOfferData> {
        self.offers
            .lock()
            .get(offer_id)
            .cloned()
            .ok_or_else(|| StorageError::not_found("offer", offer_id))
    }

    async fn pending_offers(&self) -> StorageResult<Vec<FileOfferData>> {
        let pending = self
            .offers
            .lock()
            .values()
            .filter(|o| !o.state.is_terminal())
            .cloned()
            .collect();

        Ok(pending)
    }

    async fn save_queue_snapshot(&self, snapshot: QueueSnapshotData) -> StorageResult<()> {
        self.snapshots.lock().insert(snapshot.room.clone(), snapshot);
        Ok(())
    }

    async fn queue_snapshots(&self) -> StorageResult<Vec<QueueSnapshotData>> {
        Ok(self.snapshots.lock().values().cloned().collect())
    }

    async fn upsert_screen_session(&self, session: ScreenSessionData) -> StorageResult<()> {
        self.screen_sessions
            .lock()
            .insert(session.id.clone(), session);

        Ok(())
    }

    async fn append_notification(&self, notification: NotificationData) -> StorageResult<()> {
        self.notifications.lock().push(notification);
        Ok(())
    }

    async fn notifications_for_user(
        &self,
        user_id: &UserId,
    ) -> StorageResult<Vec<NotificationData>> {
        let notifications = self
            .notifications
            .lock()
            .iter()
            .filter(|n| n.user_id == *user_id)
            .cloned()
            .collect();

        Ok(notifications)
    }

    async fn mark_notifications_read(
        &self,
        user_id: &UserId,
        ids: &[String],
    ) -> StorageResult<()> {
        for notification in self.notifications.lock().iter_mut() {
            if notification.user_id == *user_id && ids.contains(&notification.id) {
                notification.read = true;
            }
        }

        Ok(())
    }
}
