use std::collections::HashSet;
use std::sync::Arc;

use argon2::{
    password_hash::{Encoding, SaltString},
    Argon2, PasswordHash, PasswordHasher, PasswordVerifier,
};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use huddle_core::{
    random_code, random_string, RoomError, RoomId, ScreenSessionData, ScreenState, Session,
    SessionId, UserId,
};
use log::warn;
use parking_lot::Mutex;
use rand::rngs::OsRng;
use thiserror::Error;

use crate::{HubContext, HubEvent};

#[derive(Debug, Error)]
pub enum SignalError {
    #[error("No screen session matches that code")]
    NotFound,
    #[error("Wrong password for this screen session")]
    Unauthorized,
    #[error("Session is not a participant of this screen session")]
    NotParticipant,
    #[error("Only the host may do that")]
    Forbidden,
    #[error("Password hashing failed: {0}")]
    Hash(String),
    #[error(transparent)]
    Room(RoomError),
}

/// A live screen-share session: one host, any number of guests, an opaque
/// signaling channel between them
pub struct ScreenSession {
    pub id: String,
    pub code: String,
    pub host: SessionId,
    pub host_user: UserId,
    pub created_at: DateTime<Utc>,
    password_hash: Option<String>,
    state: Mutex<ScreenSessionState>,
}

struct ScreenSessionState {
    guests: HashSet<SessionId>,
    last_activity: DateTime<Utc>,
}

impl ScreenSession {
    fn is_participant(&self, session_id: SessionId) -> bool {
        self.host == session_id || self.state.lock().guests.contains(&session_id)
    }

    fn touch(&self, now: DateTime<Utc>) {
        self.state.lock().last_activity = now;
    }
}

/// Brokers screen-share sessions and relays signaling payloads between their
/// participants without inspecting them.
///
/// The relay never decodes a payload: negotiation data is whatever JSON the
/// peers exchange, delivered verbatim through the room's ordered channel.
pub struct SignalingRelay {
    context: HubContext,
    sessions: DashMap<String, Arc<ScreenSession>>,
    by_code: DashMap<String, String>,
    by_host: DashMap<SessionId, String>,
    argon: Argon2<'static>,
}

impl SignalingRelay {
    pub fn new(context: &HubContext) -> Self {
        Self {
            context: context.clone(),
            sessions: Default::default(),
            by_code: Default::default(),
            by_host: Default::default(),
            argon: Argon2::default(),
        }
    }

    /// Creates a screen session hosted by the given connected session and
    /// returns its join code
    pub fn create_session(
        &self,
        host: &Session,
        password: Option<String>,
    ) -> Result<Arc<ScreenSession>, SignalError> {
        let password_hash = password
            .map(|p| {
                let salt = SaltString::generate(&mut OsRng);

                self.argon
                    .hash_password(p.as_bytes(), &salt)
                    .map(|h| h.to_string())
                    .map_err(|e| SignalError::Hash(e.to_string()))
            })
            .transpose()?;

        let id = random_string(16);

        // Codes are short, so regenerate on the off chance of a collision
        let code = loop {
            let candidate = random_code(self.context.config.access_code_length);

            if !self.by_code.contains_key(&candidate) {
                break candidate;
            }
        };

        let session = Arc::new(ScreenSession {
            id: id.clone(),
            code: code.clone(),
            host: host.id,
            host_user: host.user_id.clone(),
            created_at: Utc::now(),
            password_hash,
            state: Mutex::new(ScreenSessionState {
                guests: HashSet::new(),
                last_activity: Utc::now(),
            }),
        });

        self.context
            .rooms
            .join(RoomId::screen(&id), host.id)
            .map_err(SignalError::Room)?;

        self.sessions.insert(id.clone(), session.clone());
        self.by_code.insert(code, id.clone());
        self.by_host.insert(host.id, id);

        Ok(session)
    }

    /// Admits a guest by access code, checking the password before anything
    /// else changes
    pub fn join_by_code(
        &self,
        guest: &Session,
        code: &str,
        password: Option<&str>,
    ) -> Result<Arc<ScreenSession>, SignalError> {
        let id = self
            .by_code
            .get(code)
            .map(|i| i.clone())
            .ok_or(SignalError::NotFound)?;

        let screen = self
            .sessions
            .get(&id)
            .map(|s| s.clone())
            .ok_or(SignalError::NotFound)?;

        if let Some(hash) = &screen.password_hash {
            let parsed = PasswordHash::parse(hash, Encoding::default())
                .map_err(|e| SignalError::Hash(e.to_string()))?;
            let supplied = password.ok_or(SignalError::Unauthorized)?;

            self.argon
                .verify_password(supplied.as_bytes(), &parsed)
                .map_err(|_| SignalError::Unauthorized)?;
        }

        self.context
            .rooms
            .join(RoomId::screen(&id), guest.id)
            .map_err(SignalError::Room)?;

        {
            let mut state = screen.state.lock();
            state.guests.insert(guest.id);
            state.last_activity = Utc::now();
        }

        let _ = self.context.rooms.direct(
            &RoomId::screen(&id),
            screen.host,
            HubEvent::GuestJoined {
                session_id: guest.id,
                user_id: guest.user_id.clone(),
            },
        );

        Ok(screen)
    }

    /// Forwards an opaque negotiation payload to one participant, verbatim
    pub fn relay(
        &self,
        screen_id: &str,
        from: SessionId,
        to: SessionId,
        payload: serde_json::Value,
    ) -> Result<(), SignalError> {
        let screen = self
            .sessions
            .get(screen_id)
            .map(|s| s.clone())
            .ok_or(SignalError::NotFound)?;

        if !screen.is_participant(from) || !screen.is_participant(to) {
            return Err(SignalError::NotParticipant);
        }

        screen.touch(Utc::now());

        self.context
            .rooms
            .direct(
                &RoomId::screen(screen_id),
                to,
                HubEvent::Signal { from, payload },
            )
            .map_err(|_| SignalError::NotParticipant)?;

        Ok(())
    }

    /// A guest leaves voluntarily. Host departure goes through
    /// [`end_session`] instead.
    pub fn leave(&self, screen_id: &str, session_id: SessionId) -> Result<(), SignalError> {
        let screen = self
            .sessions
            .get(screen_id)
            .map(|s| s.clone())
            .ok_or(SignalError::NotFound)?;

        if screen.host == session_id {
            return Err(SignalError::Forbidden);
        }

        self.remove_guest(&screen, session_id);
        Ok(())
    }

    /// Tears down the session: every participant leaves the room, the record
    /// is persisted as ended, and the code stops resolving
    pub async fn end_session(
        &self,
        screen_id: &str,
        requested_by: SessionId,
    ) -> Result<(), SignalError> {
        let screen = self
            .sessions
            .get(screen_id)
            .map(|s| s.clone())
            .ok_or(SignalError::NotFound)?;

        if screen.host != requested_by {
            return Err(SignalError::Forbidden);
        }

        self.tear_down(&screen).await;
        Ok(())
    }

    /// Reacts to a disconnect: a vanished host ends their session, a
    /// vanished guest just drops out
    pub async fn handle_disconnect(&self, session_id: SessionId) {
        if let Some(id) = self.by_host.get(&session_id).map(|i| i.clone()) {
            if let Some(screen) = self.sessions.get(&id).map(|s| s.clone()) {
                self.tear_down(&screen).await;
            }

            return;
        }

        let screens: Vec<_> = self
            .sessions
            .iter()
            .filter(|s| s.state.lock().guests.contains(&session_id))
            .map(|s| s.clone())
            .collect();

        for screen in screens {
            self.remove_guest(&screen, session_id);
        }
    }

    /// Ends sessions with no signaling traffic for longer than the idle
    /// timeout. Returns the ids that were torn down.
    pub async fn sweep_idle(&self, now: DateTime<Utc>) -> Vec<String> {
        let timeout = self.context.config.idle_screen_timeout();

        let idle: Vec<_> = self
            .sessions
            .iter()
            .filter(|s| now - s.state.lock().last_activity > timeout)
            .map(|s| s.clone())
            .collect();

        let mut ended = vec![];

        for screen in idle {
            self.tear_down(&screen).await;
            ended.push(screen.id.clone());
        }

        ended
    }

    fn remove_guest(&self, screen: &Arc<ScreenSession>, session_id: SessionId) {
        let removed = screen.state.lock().guests.remove(&session_id);

        if !removed {
            return;
        }

        let room_id = RoomId::screen(&screen.id);
        self.context.rooms.leave(&room_id, session_id);

        let _ = self.context.rooms.direct(
            &room_id,
            screen.host,
            HubEvent::GuestLeft { session_id },
        );
    }

    async fn tear_down(&self, screen: &Arc<ScreenSession>) {
        let room_id = RoomId::screen(&screen.id);

        self.context
            .rooms
            .try_broadcast(&room_id, HubEvent::ScreenSessionEnded, None);

        let members: Vec<_> = {
            let state = screen.state.lock();
            state.guests.iter().copied().collect()
        };

        for member in members {
            self.context.rooms.leave(&room_id, member);
        }
        self.context.rooms.leave(&room_id, screen.host);

        self.by_code.remove(&screen.code);
        self.by_host.remove(&screen.host);
        self.sessions.remove(&screen.id);

        let record = ScreenSessionData {
            id: screen.id.clone(),
            host_user_id: screen.host_user.clone(),
            access_code: screen.code.clone(),
            state: ScreenState::Ended,
            created_at: screen.created_at,
            ended_at: Some(Utc::now()),
        };

        if let Err(e) = self.context.storage.upsert_screen_session(record).await {
            warn!("Persisting ended screen session {} failed: {}", screen.id, e);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::testing::TestHub;
    use serde_json::json;

    #[tokio::test]
    async fn wrong_password_is_rejected_before_joining() {
        let hub = TestHub::new().await;

        let host = hub.hub.connect("mira".to_string()).await.unwrap();
        let guest = hub.hub.connect("sam".to_string()).await.unwrap();

        let screen = hub
            .hub
            .signaling
            .create_session(host.session(), Some("hunter2".to_string()))
            .unwrap();

        let result = hub
            .hub
            .signaling
            .join_by_code(guest.session(), &screen.code, Some("wrong"));

        assert!(matches!(result, Err(SignalError::Unauthorized)));
        assert!(!screen.is_participant(guest.id()));
        assert!(!hub
            .hub
            .context()
            .rooms
            .is_member(&RoomId::screen(&screen.id), guest.id()));
    }

    #[tokio::test]
    async fn payload_is_delivered_verbatim_to_the_target_only() {
        let hub = TestHub::new().await;

        let host = hub.hub.connect("mira".to_string()).await.unwrap();
        let mut guest = hub.hub.connect("sam".to_string()).await.unwrap();
        let mut bystander = hub.hub.connect("sam".to_string()).await.unwrap();

        let screen = hub.hub.signaling.create_session(host.session(), None).unwrap();

        hub.hub
            .signaling
            .join_by_code(guest.session(), &screen.code, None)
            .unwrap();
        hub.hub
            .signaling
            .join_by_code(bystander.session(), &screen.code, None)
            .unwrap();

        // Drain the join notifications the guests may have received
        while guest.try_recv().is_some() {}
        while bystander.try_recv().is_some() {}

        let payload = json!({ "sdp": "v=0...", "kind": "offer" });

        hub.hub
            .signaling
            .relay(&screen.id, host.id(), guest.id(), payload.clone())
            .unwrap();

        let delivered = guest.try_recv().expect("target should receive the signal");
        match delivered.event {
            HubEvent::Signal { from, payload: got } => {
                assert_eq!(from, host.id());
                assert_eq!(got, payload);
            }
            other => panic!("unexpected event: {:?}", other),
        }

        assert!(bystander.try_recv().is_none());
    }

    #[tokio::test]
    async fn relaying_to_a_departed_guest_fails() {
        let hub = TestHub::new().await;

        let host = hub.hub.connect("mira".to_string()).await.unwrap();
        let guest = hub.hub.connect("sam".to_string()).await.unwrap();

        let screen = hub.hub.signaling.create_session(host.session(), None).unwrap();

        hub.hub
            .signaling
            .join_by_code(guest.session(), &screen.code, None)
            .unwrap();
        hub.hub.signaling.leave(&screen.id, guest.id()).unwrap();

        let result = hub
            .hub
            .signaling
            .relay(&screen.id, host.id(), guest.id(), json!({}));

        assert!(matches!(result, Err(SignalError::NotParticipant)));
    }

    #[tokio::test]
    async fn only_the_host_can_end_the_session() {
        let hub = TestHub::new().await;

        let host = hub.hub.connect("mira".to_string()).await.unwrap();
        let guest = hub.hub.connect("sam".to_string()).await.unwrap();

        let screen = hub.hub.signaling.create_session(host.session(), None).unwrap();
        hub.hub
            .signaling
            .join_by_code(guest.session(), &screen.code, None)
            .unwrap();

        let denied = hub.hub.signaling.end_session(&screen.id, guest.id()).await;
        assert!(matches!(denied, Err(SignalError::Forbidden)));

        hub.hub
            .signaling
            .end_session(&screen.id, host.id())
            .await
            .unwrap();

        // The code no longer resolves
        let rejoin = hub
            .hub
            .signaling
            .join_by_code(guest.session(), &screen.code, None);
        assert!(matches!(rejoin, Err(SignalError::NotFound)));
    }

    #[tokio::test]
    async fn host_disconnect_ends_the_session() {
        let hub = TestHub::new().await;

        let host = hub.hub.connect("mira".to_string()).await.unwrap();
        let mut guest = hub.hub.connect("sam".to_string()).await.unwrap();

        let screen = hub.hub.signaling.create_session(host.session(), None).unwrap();
        hub.hub
            .signaling
            .join_by_code(guest.session(), &screen.code, None)
            .unwrap();

        while guest.try_recv().is_some() {}

        let host_id = host.id();
        hub.hub.disconnect(host_id).await;

        let ended = (0..8)
            .filter_map(|_| guest.try_recv())
            .any(|e| matches!(e.event, HubEvent::ScreenSessionEnded));
        assert!(ended);

        assert!(hub.hub.signaling.sessions.get(&screen.id).is_none());
    }

    #[tokio::test]
    async fn dropped_host_handle_still_ends_the_session() {
        let hub = TestHub::new().await;

        let host = hub.hub.connect("mira".to_string()).await.unwrap();
        let mut guest = hub.hub.connect("sam".to_string()).await.unwrap();

        let screen = hub.hub.signaling.create_session(host.session(), None).unwrap();
        hub.hub
            .signaling
            .join_by_code(guest.session(), &screen.code, None)
            .unwrap();

        while guest.try_recv().is_some() {}

        // The transport dropped the handle (socket closed) before telling
        // the hub about the disconnect
        let host_id = host.id();
        drop(host);
        hub.hub.disconnect(host_id).await;

        let ended = (0..8)
            .filter_map(|_| guest.try_recv())
            .any(|e| matches!(e.event, HubEvent::ScreenSessionEnded));
        assert!(ended);

        assert!(hub.hub.signaling.sessions.get(&screen.id).is_none());

        let rejoin = hub
            .hub
            .signaling
            .join_by_code(guest.session(), &screen.code, None);
        assert!(matches!(rejoin, Err(SignalError::NotFound)));
    }

    #[tokio::test]
    async fn idle_sessions_end_in_the_sweep() {
        let hub = TestHub::new().await;

        let host = hub.hub.connect("mira".to_string()).await.unwrap();
        let mut guest = hub.hub.connect("sam".to_string()).await.unwrap();

        let screen = hub.hub.signaling.create_session(host.session(), None).unwrap();
        hub.hub
            .signaling
            .join_by_code(guest.session(), &screen.code, None)
            .unwrap();

        while guest.try_recv().is_some() {}

        // A sweep before the timeout leaves the session alone
        let ended = hub.hub.signaling.sweep_idle(Utc::now()).await;
        assert!(ended.is_empty());

        let later = Utc::now()
            + hub.hub.context().config.idle_screen_timeout()
            + chrono::Duration::seconds(1);

        let ended = hub.hub.signaling.sweep_idle(later).await;
        assert_eq!(ended, vec![screen.id.clone()]);

        let got_ended = (0..8)
            .filter_map(|_| guest.try_recv())
            .any(|e| matches!(e.event, HubEvent::ScreenSessionEnded));
        assert!(got_ended);

        assert!(hub.hub.signaling.sessions.get(&screen.id).is_none());
    }
}
