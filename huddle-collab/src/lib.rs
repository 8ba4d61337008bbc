mod chat;
mod commands;
mod events;
mod playback;
mod signaling;

pub use chat::*;
pub use commands::*;
pub use events::*;
pub use playback::*;
pub use signaling::*;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use huddle_core::{
    BlobStore, HubConfig, PresenceRegistry, RoomCoordinator, RoomKind, Session, SessionHandle,
    SessionId, Storage, StorageError, UserId,
};
use log::info;

/// The shared collaborators every engine is constructed with
#[derive(Clone)]
pub struct HubContext {
    pub config: HubConfig,
    pub storage: Arc<dyn Storage>,
    pub blobs: Arc<dyn BlobStore>,
    pub presence: Arc<PresenceRegistry<HubEvent>>,
    pub rooms: Arc<RoomCoordinator<HubEvent>>,
}

/// The collaboration hub: presence, rooms, and the three engines built on
/// them, behind one command surface for the transport layer.
pub struct Hub {
    context: HubContext,
    pub chat: ChatEngine,
    pub playback: PlaybackSynchronizer,
    pub signaling: SignalingRelay,
}

impl Hub {
    pub fn new(config: HubConfig, storage: Arc<dyn Storage>, blobs: Arc<dyn BlobStore>) -> Self {
        let presence = Arc::new(PresenceRegistry::new(&config));
        let rooms = Arc::new(RoomCoordinator::new(&presence));

        let context = HubContext {
            config,
            storage,
            blobs,
            presence,
            rooms,
        };

        Self {
            chat: ChatEngine::new(&context),
            playback: PlaybackSynchronizer::new(&context),
            signaling: SignalingRelay::new(&context),
            context,
        }
    }

    pub fn context(&self) -> &HubContext {
        &self.context
    }

    /// Reloads durable state after a restart: unresolved file offers and
    /// music queues come back, live membership does not
    pub async fn restore(&self) -> Result<(), StorageError> {
        self.chat.restore().await?;
        self.playback.restore().await?;

        info!("Restored durable hub state");
        Ok(())
    }

    /// Opens a session for an existing user and returns its live handle.
    /// Identities are managed elsewhere, so unknown users are refused.
    pub async fn connect(&self, user_id: UserId) -> Result<SessionHandle<HubEvent>, HubError> {
        self.context.storage.user_by_id(&user_id).await.map_err(|e| {
            if e.is_not_found() {
                HubError::UnknownUser(user_id.clone())
            } else {
                HubError::Storage(e)
            }
        })?;

        let (session, receiver) = self.context.presence.connect(user_id)?;
        info!("Session {} connected for {}", session.id, session.user_id);

        Ok(SessionHandle::new(&self.context.rooms, session, receiver))
    }

    /// Tears down a session: screen sessions it hosted end, every room it
    /// joined learns it left, and destroyed music rooms persist their queue.
    /// Idempotent.
    pub async fn disconnect(&self, session_id: SessionId) {
        let session = self.context.presence.session(session_id);

        // Hosted screen sessions tear down before the generic eviction so
        // their guests get the explicit ended event. The host index survives
        // eviction, so this also catches sessions whose handle was already
        // dropped.
        self.signaling.handle_disconnect(session_id).await;

        let joined = self.context.rooms.rooms_of(session_id);
        self.context.rooms.evict(session_id);

        if let Some(session) = &session {
            for room_id in &joined {
                self.context.rooms.try_broadcast(
                    room_id,
                    HubEvent::MemberLeft {
                        session_id,
                        user_id: session.user_id.clone(),
                    },
                    None,
                );
            }

            info!("Session {} disconnected", session_id);
        }

        // Reconciles music rooms destroyed by this eviction or by an earlier
        // drop-driven one
        self.playback.prune().await;
    }

    /// Routes one command from a connected session to its engine
    pub async fn dispatch(
        &self,
        session_id: SessionId,
        command: HubCommand,
    ) -> Result<HubReply, HubError> {
        let session = self
            .context
            .presence
            .session(session_id)
            .ok_or(huddle_core::RoomError::SessionNotConnected)
            .map_err(HubError::Room)?;

        match command {
            HubCommand::JoinRoom { room } => self.join_room(&session, room).await,
            HubCommand::LeaveRoom { room } => self.leave_room(&session, room).await,
            HubCommand::SendMessage { recipient_id, body } => {
                let message = self
                    .chat
                    .send_message(&session.user_id, &recipient_id, body)
                    .await?;

                Ok(HubReply::Message { message })
            }
            HubCommand::ListMessages { conversation_id } => {
                self.require_participant(&session, &conversation_id).await?;

                let messages = self
                    .context
                    .storage
                    .messages_in_conversation(&conversation_id)
                    .await?;

                Ok(HubReply::Messages { messages })
            }
            HubCommand::MarkDelivered { message_id } => {
                self.require_message_participant(&session, &message_id).await?;

                self.chat.mark_delivered(&message_id).await?;
                Ok(HubReply::Ack)
            }
            HubCommand::MarkRead { message_ids } => {
                for message_id in &message_ids {
                    self.require_message_participant(&session, message_id).await?;
                }

                self.chat.mark_read(&message_ids).await?;
                Ok(HubReply::Ack)
            }
            HubCommand::RecallMessage { message_id } => {
                self.chat.recall(&message_id, &session.user_id).await?;
                Ok(HubReply::Ack)
            }
            HubCommand::OfferFile {
                recipient_id,
                blob_ref,
                file_name,
            } => {
                let offer = self
                    .chat
                    .offer_file(&session.user_id, &recipient_id, blob_ref, file_name)
                    .await?;

                Ok(HubReply::Offer { offer })
            }
            HubCommand::AcceptOffer { offer_id } => {
                self.require_offer_recipient(&session, &offer_id).await?;

                let offer = self.chat.accept_offer(&offer_id).await?;
                Ok(HubReply::Offer { offer })
            }
            HubCommand::RejectOffer { offer_id } => {
                self.require_offer_recipient(&session, &offer_id).await?;

                let offer = self.chat.reject_offer(&offer_id).await?;
                Ok(HubReply::Offer { offer })
            }
            HubCommand::Transport { room, command } => {
                let snapshot = self.playback.apply(&room, session_id, command).await?;
                Ok(HubReply::Playback { snapshot })
            }
            HubCommand::CreateScreenSession { password } => {
                let screen = self.signaling.create_session(&session, password)?;

                Ok(HubReply::ScreenSession {
                    screen_id: screen.id.clone(),
                    code: screen.code.clone(),
                })
            }
            HubCommand::JoinScreenSession { code, password } => {
                let screen = self
                    .signaling
                    .join_by_code(&session, &code, password.as_deref())?;

                Ok(HubReply::ScreenSession {
                    screen_id: screen.id.clone(),
                    code: screen.code.clone(),
                })
            }
            HubCommand::LeaveScreenSession { screen_id } => {
                self.signaling.leave(&screen_id, session_id)?;
                Ok(HubReply::Ack)
            }
            HubCommand::EndScreenSession { screen_id } => {
                self.signaling.end_session(&screen_id, session_id).await?;
                Ok(HubReply::Ack)
            }
            HubCommand::Signal {
                screen_id,
                to,
                payload,
            } => {
                self.signaling.relay(&screen_id, session_id, to, payload)?;
                Ok(HubReply::Ack)
            }
            HubCommand::ListNotifications => {
                let notifications = self
                    .context
                    .storage
                    .notifications_for_user(&session.user_id)
                    .await?;

                Ok(HubReply::Notifications { notifications })
            }
            HubCommand::MarkNotificationsRead { notification_ids } => {
                self.context
                    .storage
                    .mark_notifications_read(&session.user_id, &notification_ids)
                    .await?;

                Ok(HubReply::Ack)
            }
        }
    }

    /// Spawns the recurring maintenance task that expires lapsed file offers
    /// and ends idle screen sessions
    pub fn start_sweeper(self: &Arc<Self>) {
        let hub = self.clone();
        let period = Duration::from_secs(hub.context.config.sweep_interval_in_seconds);

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);

            loop {
                interval.tick().await;
                let now = Utc::now();

                let expired = hub.chat.sweep_expired_offers(now).await;
                if !expired.is_empty() {
                    info!("Expired {} lapsed file offers", expired.len());
                }

                let ended = hub.signaling.sweep_idle(now).await;
                if !ended.is_empty() {
                    info!("Ended {} idle screen sessions", ended.len());
                }
            }
        });
    }

    async fn join_room(
        &self,
        session: &Session,
        room: huddle_core::RoomId,
    ) -> Result<HubReply, HubError> {
        match room.kind {
            RoomKind::Chat => {
                self.require_participant(session, &room.key).await?;

                self.context.rooms.join(room.clone(), session.id)?;
                self.context.rooms.try_broadcast(
                    &room,
                    HubEvent::MemberJoined {
                        session: session.clone(),
                    },
                    Some(session.id),
                );

                Ok(HubReply::Ack)
            }
            RoomKind::Music => {
                let snapshot = self.playback.join(&room.key, session)?;
                Ok(HubReply::Playback { snapshot })
            }
            // Screen rooms are joined by access code, never directly
            RoomKind::Screen => Err(HubError::Forbidden),
        }
    }

    async fn leave_room(
        &self,
        session: &Session,
        room: huddle_core::RoomId,
    ) -> Result<HubReply, HubError> {
        if room.kind == RoomKind::Screen {
            return Err(HubError::Forbidden);
        }

        if !self.context.rooms.is_member(&room, session.id) {
            return Err(huddle_core::RoomError::NotMember.into());
        }

        let destroyed = self.context.rooms.leave(&room, session.id);

        self.context.rooms.try_broadcast(
            &room,
            HubEvent::MemberLeft {
                session_id: session.id,
                user_id: session.user_id.clone(),
            },
            None,
        );

        if destroyed && room.kind == RoomKind::Music {
            self.playback.drop_room(&room.key).await;
        }

        Ok(HubReply::Ack)
    }

    /// Chat rooms and message history are only visible to the two users the
    /// conversation belongs to
    async fn require_participant(
        &self,
        session: &Session,
        conversation_id: &str,
    ) -> Result<(), HubError> {
        let conversation = self
            .context
            .storage
            .conversation_by_id(conversation_id)
            .await?;

        if !conversation.participants.contains(&session.user_id) {
            return Err(HubError::Forbidden);
        }

        Ok(())
    }

    /// Delivery-state changes are only accepted from someone in the
    /// message's conversation
    async fn require_message_participant(
        &self,
        session: &Session,
        message_id: &str,
    ) -> Result<(), HubError> {
        let message = self.context.storage.message_by_id(message_id).await?;

        self.require_participant(session, &message.conversation_id)
            .await
    }

    /// Only the recipient may accept or reject a file offer
    async fn require_offer_recipient(
        &self,
        session: &Session,
        offer_id: &str,
    ) -> Result<(), HubError> {
        let offer = self.context.storage.offer_by_id(offer_id).await?;

        if offer.recipient_id != session.user_id {
            return Err(HubError::Forbidden);
        }

        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use huddle_impls::{MemoryBlobStore, MemoryStore};

    pub struct TestHub {
        pub hub: Hub,
        pub storage: Arc<MemoryStore>,
    }

    impl TestHub {
        pub async fn new() -> Self {
            let storage = Arc::new(MemoryStore::new());
            storage.add_user("mira", "Mira");
            storage.add_user("sam", "Sam");

            let hub = Hub::new(
                HubConfig::default(),
                storage.clone(),
                Arc::new(MemoryBlobStore::new()),
            );

            Self { hub, storage }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use testing::TestHub;

    #[tokio::test]
    async fn unknown_users_cannot_connect() {
        let hub = TestHub::new().await;

        let result = hub.hub.connect("ghost".to_string()).await;
        assert!(matches!(result, Err(HubError::UnknownUser(_))));
    }

    #[tokio::test]
    async fn chat_rooms_are_participant_only() {
        let hub = TestHub::new().await;
        hub.storage.add_user("noa", "Noa");

        let conversation = hub
            .storage
            .conversation_between(&"mira".to_string(), &"sam".to_string())
            .await
            .unwrap();

        let outsider = hub.hub.connect("noa".to_string()).await.unwrap();

        let result = hub
            .hub
            .dispatch(
                outsider.id(),
                HubCommand::JoinRoom {
                    room: huddle_core::RoomId::chat(&conversation.id),
                },
            )
            .await;

        assert!(matches!(result, Err(HubError::Forbidden)));
    }

    #[tokio::test]
    async fn disconnect_broadcasts_member_left() {
        let hub = TestHub::new().await;

        let mira = hub.hub.connect("mira".to_string()).await.unwrap();
        let mut sam = hub.hub.connect("sam".to_string()).await.unwrap();

        hub.hub.playback.join("lobby", mira.session()).unwrap();
        hub.hub.playback.join("lobby", sam.session()).unwrap();

        while sam.try_recv().is_some() {}

        hub.hub.disconnect(mira.id()).await;

        let event = sam.try_recv().expect("sam should learn mira left");
        assert!(matches!(event.event, HubEvent::MemberLeft { .. }));

        // A second disconnect is a no-op
        hub.hub.disconnect(mira.id()).await;
    }

    #[tokio::test]
    async fn only_the_recipient_resolves_an_offer() {
        let hub = TestHub::new().await;

        let mira = hub.hub.connect("mira".to_string()).await.unwrap();

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

        // The sender cannot accept their own offer
        let result = hub
            .hub
            .dispatch(
                mira.id(),
                HubCommand::AcceptOffer {
                    offer_id: offer.id.clone(),
                },
            )
            .await;

        assert!(matches!(result, Err(HubError::Forbidden)));
    }

    #[tokio::test]
    async fn outsiders_cannot_advance_message_state() {
        let hub = TestHub::new().await;
        hub.storage.add_user("noa", "Noa");

        let message = hub
            .hub
            .chat
            .send_message(&"mira".to_string(), &"sam".to_string(), "hi".into())
            .await
            .unwrap();

        let outsider = hub.hub.connect("noa".to_string()).await.unwrap();

        let result = hub
            .hub
            .dispatch(
                outsider.id(),
                HubCommand::MarkDelivered {
                    message_id: message.id.clone(),
                },
            )
            .await;

        assert!(matches!(result, Err(HubError::Forbidden)));

        let stored = hub.storage.message_by_id(&message.id).await.unwrap();
        assert_eq!(stored.state, huddle_core::MessageState::Sent);
    }

    #[tokio::test]
    async fn restore_brings_back_offers_and_queues() {
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

        let handle = hub.hub.connect("mira".to_string()).await.unwrap();
        hub.hub.playback.join("lobby", handle.session()).unwrap();
        hub.hub
            .playback
            .apply(
                "lobby",
                handle.id(),
                TransportCommand::AddTrack {
                    track: huddle_core::TrackData {
                        id: "a".to_string(),
                        source_ref: "media/a".to_string(),
                        duration_ms: 180_000,
                        added_by: "mira".to_string(),
                    },
                },
            )
            .await
            .unwrap();

        // The socket closed before the hub learned about the disconnect
        let id = handle.id();
        drop(handle);
        hub.hub.disconnect(id).await;

        // A fresh hub over the same store picks the state back up
        let revived = Hub::new(
            HubConfig::default(),
            hub.storage.clone(),
            Arc::new(huddle_impls::MemoryBlobStore::new()),
        );
        revived.restore().await.unwrap();

        let accepted = revived.chat.accept_offer(&offer.id).await.unwrap();
        assert_eq!(accepted.state, huddle_core::OfferState::Accepted);

        let session = revived.connect("sam".to_string()).await.unwrap();
        let snapshot = revived.playback.join("lobby", session.session()).unwrap();

        assert_eq!(snapshot.queue.len(), 1);
        assert_eq!(snapshot.queue[0].id, "a");
        assert_eq!(snapshot.transport, Transport::Paused);
        assert_eq!(snapshot.position_ms, 0);
    }

    #[tokio::test]
    async fn commands_from_dead_sessions_are_refused() {
        let hub = TestHub::new().await;

        let mira = hub.hub.connect("mira".to_string()).await.unwrap();
        let id = mira.id();
        drop(mira);

        let result = hub.hub.dispatch(id, HubCommand::ListNotifications).await;
        assert!(matches!(
            result,
            Err(HubError::Room(huddle_core::RoomError::SessionNotConnected))
        ));
    }
}
