use std::collections::HashMap;

use chrono::{DateTime, Utc};
use huddle_core::{
    random_string, ConversationData, FileOfferData, MessageBody, MessageData, MessageState,
    NotificationData, NotificationKind, OfferState, RoomId, StorageError, UserId,
};
use log::warn;
use parking_lot::Mutex;
use thiserror::Error;

use crate::{HubContext, HubEvent};

#[derive(Debug, Error)]
pub enum ChatError {
    /// Recall attempted by someone other than the sender
    #[error("Only the sender can recall a message")]
    Forbidden,
    /// The recall window has elapsed
    #[error("The recall window has expired")]
    WindowExpired,
    /// The offer already reached a terminal state
    #[error("The offer has already been resolved")]
    AlreadyResolved,
    /// The store failed after exhausting the retry budget, or the entity
    /// doesn't exist
    #[error(transparent)]
    Store(StorageError),
}

/// The direct-message and file-transfer engine.
///
/// Durable state lives in the store; the live room broadcast is a best-effort
/// low-latency mirror of it, sent only after the durable write resolved. The
/// in-memory pending table is the live authority for offer resolution, so an
/// accept, a reject, and the expiry sweep can never resolve the same offer
/// twice.
pub struct ChatEngine {
    context: HubContext,
    pending_offers: Mutex<HashMap<String, FileOfferData>>,
}

impl ChatEngine {
    pub fn new(context: &HubContext) -> Self {
        Self {
            context: context.clone(),
            pending_offers: Default::default(),
        }
    }

    /// Reloads unresolved offers from the store after a restart
    pub async fn restore(&self) -> Result<(), StorageError> {
        let pending = self.context.storage.pending_offers().await?;

        let mut table = self.pending_offers.lock();
        for offer in pending {
            table.insert(offer.id.clone(), offer);
        }

        Ok(())
    }

    /// Creates a message in the conversation between sender and recipient,
    /// persists it, then mirrors it to the conversation's live room and
    /// notifies the recipient if they are offline.
    pub async fn send_message(
        &self,
        sender_id: &UserId,
        recipient_id: &UserId,
        body: String,
    ) -> Result<MessageData, ChatError> {
        let conversation = self.conversation_with(sender_id, recipient_id).await?;

        let message = MessageData {
            id: random_string(16),
            conversation_id: conversation.id.clone(),
            sender_id: sender_id.clone(),
            body: MessageBody::Text(body),
            state: MessageState::Sent,
            created_at: Utc::now(),
        };

        self.persist_message(&message).await?;

        self.context.rooms.try_broadcast(
            &RoomId::chat(&conversation.id),
            HubEvent::MessageSent {
                message: message.clone(),
            },
            None,
        );

        self.notify_offline(
            recipient_id,
            NotificationKind::NewMessage,
            serde_json::json!({
                "conversation_id": conversation.id,
                "message_id": message.id,
                "sender_id": sender_id,
            }),
        )
        .await;

        Ok(message)
    }

    /// Marks a message as delivered. Forward-only: a no-op on messages that
    /// are already delivered, read, or recalled.
    pub async fn mark_delivered(&self, message_id: &str) -> Result<(), ChatError> {
        self.advance_message(message_id, MessageState::Delivered)
            .await
    }

    /// Marks messages as read. Read implies delivered.
    pub async fn mark_read(&self, message_ids: &[String]) -> Result<(), ChatError> {
        for message_id in message_ids {
            self.advance_message(message_id, MessageState::Read).await?;
        }

        Ok(())
    }

    /// Recalls a message, so peers remove its content. Only the sender may
    /// recall, and only within the configured window after sending.
    pub async fn recall(&self, message_id: &str, by_user_id: &UserId) -> Result<(), ChatError> {
        self.recall_at(message_id, by_user_id, Utc::now()).await
    }

    async fn recall_at(
        &self,
        message_id: &str,
        by_user_id: &UserId,
        now: DateTime<Utc>,
    ) -> Result<(), ChatError> {
        let mut message = self
            .context
            .storage
            .message_by_id(message_id)
            .await
            .map_err(ChatError::Store)?;

        if message.sender_id != *by_user_id {
            return Err(ChatError::Forbidden);
        }

        if message.state.is_recalled() {
            return Ok(());
        }

        if now - message.created_at > self.context.config.recall_window() {
            return Err(ChatError::WindowExpired);
        }

        message.state = MessageState::Recalled;
        self.persist_message(&message).await?;

        self.context.rooms.try_broadcast(
            &RoomId::chat(&message.conversation_id),
            HubEvent::MessageRecalled {
                message_id: message.id.clone(),
            },
            None,
        );

        Ok(())
    }

    /// Offers a file (already uploaded to the blob store by the transport
    /// layer) to the recipient. The offer expires on its own if it is not
    /// resolved within the configured timeout.
    pub async fn offer_file(
        &self,
        sender_id: &UserId,
        recipient_id: &UserId,
        blob_ref: String,
        file_name: String,
    ) -> Result<FileOfferData, ChatError> {
        let conversation = self.conversation_with(sender_id, recipient_id).await?;

        let offer = FileOfferData {
            id: random_string(16),
            conversation_id: conversation.id.clone(),
            sender_id: sender_id.clone(),
            recipient_id: recipient_id.clone(),
            blob_ref,
            file_name,
            state: OfferState::Offered,
            created_at: Utc::now(),
        };

        self.persist_offer(&offer).await?;

        self.pending_offers
            .lock()
            .insert(offer.id.clone(), offer.clone());

        self.context.rooms.try_broadcast(
            &RoomId::chat(&conversation.id),
            HubEvent::FileOffered {
                offer_id: offer.id.clone(),
                sender_id: sender_id.clone(),
                recipient_id: recipient_id.clone(),
                file_name: offer.file_name.clone(),
            },
            None,
        );

        self.notify_offline(
            recipient_id,
            NotificationKind::FileOffer,
            serde_json::json!({
                "conversation_id": conversation.id,
                "offer_id": offer.id,
                "sender_id": sender_id,
                "file_name": offer.file_name,
            }),
        )
        .await;

        Ok(offer)
    }

    pub async fn accept_offer(&self, offer_id: &str) -> Result<FileOfferData, ChatError> {
        self.resolve_offer(offer_id, OfferState::Accepted).await
    }

    pub async fn reject_offer(&self, offer_id: &str) -> Result<FileOfferData, ChatError> {
        self.resolve_offer(offer_id, OfferState::Rejected).await
    }

    /// Expires offers whose timeout has elapsed. Driven by the recurring
    /// sweeper, not by request traffic.
    pub async fn sweep_expired_offers(&self, now: DateTime<Utc>) -> Vec<String> {
        let timeout = self.context.config.offer_timeout();

        let lapsed: Vec<_> = {
            let mut table = self.pending_offers.lock();
            let ids: Vec<_> = table
                .values()
                .filter(|o| now - o.created_at > timeout)
                .map(|o| o.id.clone())
                .collect();

            ids.into_iter()
                .filter_map(|id| table.remove(&id))
                .collect()
        };

        let mut expired = Vec::new();

        for mut offer in lapsed {
            offer.state = OfferState::Expired;

            if let Err(e) = self.persist_offer(&offer).await {
                warn!("Expiring offer {} failed, will retry: {}", offer.id, e);

                offer.state = OfferState::Offered;
                self.pending_offers
                    .lock()
                    .insert(offer.id.clone(), offer);

                continue;
            }

            self.finish_offer(&offer).await;
            expired.push(offer.id);
        }

        expired
    }

    /// Takes the offer out of the pending table and moves it to a terminal
    /// state. The removal is what guarantees exactly-once resolution.
    async fn resolve_offer(
        &self,
        offer_id: &str,
        new_state: OfferState,
    ) -> Result<FileOfferData, ChatError> {
        let pending = self.pending_offers.lock().remove(offer_id);

        let mut offer = match pending {
            Some(offer) => offer,
            None => {
                // Unknown to the live table: either it never existed, or it
                // was already resolved (possibly by the expiry sweep)
                return match self.context.storage.offer_by_id(offer_id).await {
                    Ok(_) => Err(ChatError::AlreadyResolved),
                    Err(e) => Err(ChatError::Store(e)),
                };
            }
        };

        offer.state = new_state;

        if let Err(e) = self.persist_offer(&offer).await {
            // The durable write did not resolve, so the broadcast must not
            // happen either. Put the offer back so it stays resolvable.
            offer.state = OfferState::Offered;
            self.pending_offers
                .lock()
                .insert(offer.id.clone(), offer);

            return Err(e);
        }

        self.finish_offer(&offer).await;

        Ok(offer)
    }

    /// Broadcasts the terminal state and discards the blob for offers that
    /// will never be downloaded
    async fn finish_offer(&self, offer: &FileOfferData) {
        self.context.rooms.try_broadcast(
            &RoomId::chat(&offer.conversation_id),
            HubEvent::OfferResolved {
                offer_id: offer.id.clone(),
                new_state: offer.state,
            },
            None,
        );

        if matches!(offer.state, OfferState::Rejected | OfferState::Expired) {
            if let Err(e) = self.context.blobs.delete(&offer.blob_ref).await {
                warn!("Discarding blob {} failed: {}", offer.blob_ref, e);
            }
        }
    }

    /// Moves a message forward in the delivery progression. Backwards and
    /// repeated transitions are no-ops; recalled messages never change again.
    async fn advance_message(
        &self,
        message_id: &str,
        new_state: MessageState,
    ) -> Result<(), ChatError> {
        let mut message = self
            .context
            .storage
            .message_by_id(message_id)
            .await
            .map_err(ChatError::Store)?;

        if message.state.is_recalled() || message.state.rank() >= new_state.rank() {
            return Ok(());
        }

        message.state = new_state;
        self.persist_message(&message).await?;

        self.context.rooms.try_broadcast(
            &RoomId::chat(&message.conversation_id),
            HubEvent::MessageStateChanged {
                message_id: message.id.clone(),
                new_state,
            },
            None,
        );

        Ok(())
    }

    /// Looks up the recipient (identities are never created here) and the
    /// conversation between the two users
    async fn conversation_with(
        &self,
        sender_id: &UserId,
        recipient_id: &UserId,
    ) -> Result<ConversationData, ChatError> {
        self.context
            .storage
            .user_by_id(recipient_id)
            .await
            .map_err(ChatError::Store)?;

        self.context
            .storage
            .conversation_between(sender_id, recipient_id)
            .await
            .map_err(ChatError::Store)
    }

    async fn persist_message(&self, message: &MessageData) -> Result<(), ChatError> {
        let attempts = self.context.config.store_retry_attempts.max(1);
        let mut last_error = None;

        for attempt in 1..=attempts {
            match self.context.storage.upsert_message(message.clone()).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    warn!(
                        "Storing message {} failed (attempt {}/{}): {}",
                        message.id, attempt, attempts, e
                    );
                    last_error = Some(e);
                }
            }
        }

        Err(ChatError::Store(last_error.expect("at least one attempt")))
    }

    async fn persist_offer(&self, offer: &FileOfferData) -> Result<(), ChatError> {
        let attempts = self.context.config.store_retry_attempts.max(1);
        let mut last_error = None;

        for attempt in 1..=attempts {
            match self.context.storage.upsert_offer(offer.clone()).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    warn!(
                        "Storing offer {} failed (attempt {}/{}): {}",
                        offer.id, attempt, attempts, e
                    );
                    last_error = Some(e);
                }
            }
        }

        Err(ChatError::Store(last_error.expect("at least one attempt")))
    }

    /// Appends a notification record for users with no live session
    async fn notify_offline(
        &self,
        user_id: &UserId,
        kind: NotificationKind,
        payload: serde_json::Value,
    ) {
        if self.context.presence.is_online(user_id) {
            return;
        }

        let notification = NotificationData {
            id: random_string(16),
            user_id: user_id.clone(),
            kind,
            payload,
            read: false,
            created_at: Utc::now(),
        };

        // Fire-and-forget: a lost notification is not worth failing the send
        if let Err(e) = self.context.storage.append_notification(notification).await {
            warn!("Appending notification for {} failed: {}", user_id, e);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::testing::TestHub;
    use chrono::Duration;
    use huddle_core::Storage;

    #[tokio::test]
    async fn message_states_move_forward_only() {
        let hub = TestHub::new().await;
        let message = hub
            .hub
            .chat
            .send_message(&"mira".to_string(), &"sam".to_string(), "hi".into())
            .await
            .unwrap();

        assert_eq!(message.state, MessageState::Sent);

        hub.hub.chat.mark_read(&[message.id.clone()]).await.unwrap();
        let stored = hub.storage.message_by_id(&message.id).await.unwrap();
        assert_eq!(stored.state, MessageState::Read);

        // Delivered after read must not move the state backwards
        hub.hub.chat.mark_delivered(&message.id).await.unwrap();
        let stored = hub.storage.message_by_id(&message.id).await.unwrap();
        assert_eq!(stored.state, MessageState::Read);
    }

    #[tokio::test]
    async fn recall_is_sender_only() {
        let hub = TestHub::new().await;
        let message = hub
            .hub
            .chat
            .send_message(&"mira".to_string(), &"sam".to_string(), "oops".into())
            .await
            .unwrap();

        let result = hub.hub.chat.recall(&message.id, &"sam".to_string()).await;
        assert!(matches!(result, Err(ChatError::Forbidden)));

        hub.hub
            .chat
            .recall(&message.id, &"mira".to_string())
            .await
            .unwrap();

        let stored = hub.storage.message_by_id(&message.id).await.unwrap();
        assert_eq!(stored.state, MessageState::Recalled);
    }

    #[tokio::test]
    async fn recall_fails_outside_the_window() {
        let hub = TestHub::new().await;
        let message = hub
            .hub
            .chat
            .send_message(&"mira".to_string(), &"sam".to_string(), "late".into())
            .await
            .unwrap();

        let too_late = message.created_at
            + hub.hub.context().config.recall_window()
            + Duration::seconds(1);

        let result = hub
            .hub
            .chat
            .recall_at(&message.id, &"mira".to_string(), too_late)
            .await;

        assert!(matches!(result, Err(ChatError::WindowExpired)));
    }

    #[tokio::test]
    async fn offers_resolve_exactly_once() {
        let hub = TestHub::new().await;
        let offer = hub
            .hub
            .chat
            .offer_file(
                &"mira".to_string(),
                &"sam".to_string(),
                "blob-1".into(),
                "notes.pdf".into(),
            )
            .await
            .unwrap();

        let accepted = hub.hub.chat.accept_offer(&offer.id).await.unwrap();
        assert_eq!(accepted.state, OfferState::Accepted);

        let again = hub.hub.chat.reject_offer(&offer.id).await;
        assert!(matches!(again, Err(ChatError::AlreadyResolved)));
    }

    #[tokio::test]
    async fn unknown_offer_is_not_found() {
        let hub = TestHub::new().await;

        let result = hub.hub.chat.accept_offer("nope").await;
        assert!(matches!(
            result,
            Err(ChatError::Store(StorageError::NotFound { .. }))
        ));
    }

    #[tokio::test]
    async fn lapsed_offers_expire_in_the_sweep() {
        let hub = TestHub::new().await;
        let offer = hub
            .hub
            .chat
            .offer_file(
                &"mira".to_string(),
                &"sam".to_string(),
                "blob-1".into(),
                "notes.pdf".into(),
            )
            .await
            .unwrap();

        // A sweep before the timeout leaves the offer open
        let expired = hub.hub.chat.sweep_expired_offers(Utc::now()).await;
        assert!(expired.is_empty());

        let later = offer.created_at
            + hub.hub.context().config.offer_timeout()
            + Duration::seconds(1);

        let expired = hub.hub.chat.sweep_expired_offers(later).await;
        assert_eq!(expired, vec![offer.id.clone()]);

        let stored = hub.storage.offer_by_id(&offer.id).await.unwrap();
        assert_eq!(stored.state, OfferState::Expired);

        // Expiry is irreversible
        let result = hub.hub.chat.accept_offer(&offer.id).await;
        assert!(matches!(result, Err(ChatError::AlreadyResolved)));
    }

    #[tokio::test]
    async fn offline_recipients_get_a_notification() {
        let hub = TestHub::new().await;

        hub.hub
            .chat
            .send_message(&"mira".to_string(), &"sam".to_string(), "ping".into())
            .await
            .unwrap();

        let notifications = hub
            .storage
            .notifications_for_user(&"sam".to_string())
            .await
            .unwrap();

        assert_eq!(notifications.len(), 1);
        assert_eq!(notifications[0].kind, NotificationKind::NewMessage);
    }

    #[tokio::test]
    async fn online_recipients_get_the_live_event_instead() {
        let hub = TestHub::new().await;

        let mut sam = hub.hub.connect("sam".to_string()).await.unwrap();

        // Sam must have joined the conversation room to receive the mirror
        let conversation = hub
            .storage
            .conversation_between(&"mira".to_string(), &"sam".to_string())
            .await
            .unwrap();
        hub.hub
            .context()
            .rooms
            .join(RoomId::chat(&conversation.id), sam.id())
            .unwrap();

        hub.hub
            .chat
            .send_message(&"mira".to_string(), &"sam".to_string(), "ping".into())
            .await
            .unwrap();

        let delivered = sam.try_recv().unwrap();
        assert!(matches!(delivered.event, HubEvent::MessageSent { .. }));

        let notifications = hub
            .storage
            .notifications_for_user(&"sam".to_string())
            .await
            .unwrap();
        assert!(notifications.is_empty());
    }
}
