use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use log::info;
use parking_lot::Mutex;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};

use crate::{HubConfig, Id, Sequenced, UserId};

pub type SessionId = Id<Session>;

/// One live client connection, distinct from the identity that opened it
#[derive(Debug, Clone, Serialize)]
pub struct Session {
    pub id: SessionId,
    pub user_id: UserId,
    pub connected_at: DateTime<Utc>,
}

/// A session together with its outbound push channel
struct ConnectedSession<E> {
    session: Session,
    sender: UnboundedSender<Sequenced<E>>,
}

#[derive(Debug, Error)]
pub enum PresenceError {
    /// The user already holds the maximum number of live sessions
    #[error("Connection limit of {limit} reached")]
    CapacityExceeded { limit: usize },
}

/// Tracks every live session in the hub.
///
/// A user may hold multiple simultaneous sessions (two open tabs are two
/// sessions) and is considered online while at least one exists. The session
/// table is its own synchronization domain, independent of any room.
pub struct PresenceRegistry<E> {
    config: HubConfig,
    sessions: DashMap<SessionId, ConnectedSession<E>>,
    by_user: Mutex<HashMap<UserId, HashSet<SessionId>>>,
}

impl<E> PresenceRegistry<E> {
    pub fn new(config: &HubConfig) -> Self {
        Self {
            config: config.clone(),
            sessions: Default::default(),
            by_user: Default::default(),
        }
    }

    /// Registers a new live session for a user, returning the session and the
    /// receiving end of its push channel.
    pub fn connect(
        &self,
        user_id: UserId,
    ) -> Result<(Session, UnboundedReceiver<Sequenced<E>>), PresenceError> {
        let mut by_user = self.by_user.lock();
        let sessions_of_user = by_user.entry(user_id.clone()).or_default();

        if sessions_of_user.len() >= self.config.max_sessions_per_user {
            return Err(PresenceError::CapacityExceeded {
                limit: self.config.max_sessions_per_user,
            });
        }

        let (sender, receiver) = unbounded_channel();

        let session = Session {
            id: SessionId::new(),
            user_id,
            connected_at: Utc::now(),
        };

        sessions_of_user.insert(session.id);
        self.sessions.insert(
            session.id,
            ConnectedSession {
                session: session.clone(),
                sender,
            },
        );

        info!("User {} connected as session {}", session.user_id, session.id);

        Ok((session, receiver))
    }

    /// Removes a session. Idempotent, a no-op if the session is already gone.
    ///
    /// Dropping the sender closes the push channel, which cancels any
    /// in-flight consumption of it. Callers that also track room membership
    /// must sweep rooms after this returns, see `RoomCoordinator::evict`.
    pub fn disconnect(&self, session_id: SessionId) -> Option<Session> {
        let removed = self.sessions.remove(&session_id)?.1;

        let mut by_user = self.by_user.lock();
        if let Some(sessions_of_user) = by_user.get_mut(&removed.session.user_id) {
            sessions_of_user.remove(&session_id);

            if sessions_of_user.is_empty() {
                by_user.remove(&removed.session.user_id);
            }
        }

        info!(
            "User {} disconnected session {}",
            removed.session.user_id, session_id
        );

        Some(removed.session)
    }

    /// Returns the session if it is still live
    pub fn session(&self, session_id: SessionId) -> Option<Session> {
        self.sessions.get(&session_id).map(|s| s.session.clone())
    }

    /// Returns every live session id of a user
    pub fn sessions_of(&self, user_id: &UserId) -> HashSet<SessionId> {
        self.by_user
            .lock()
            .get(user_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Returns the subset of the given users that have at least one session
    pub fn list_online(&self, user_ids: &[UserId]) -> HashSet<UserId> {
        let by_user = self.by_user.lock();

        user_ids
            .iter()
            .filter(|u| by_user.contains_key(*u))
            .cloned()
            .collect()
    }

    pub fn is_online(&self, user_id: &UserId) -> bool {
        self.by_user.lock().contains_key(user_id)
    }

    /// Pushes an event to a single session. Delivery to a session that has
    /// disconnected in the meantime is silently dropped.
    pub fn send_to(&self, session_id: SessionId, event: Sequenced<E>) {
        if let Some(connected) = self.sessions.get(&session_id) {
            // The receiver may be gone mid-send, which is fine
            let _ = connected.sender.send(event);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn registry() -> PresenceRegistry<&'static str> {
        PresenceRegistry::new(&HubConfig {
            max_sessions_per_user: 2,
            ..Default::default()
        })
    }

    #[test]
    fn connection_cap_is_enforced() {
        let registry = registry();

        registry.connect("mira".to_string()).unwrap();
        registry.connect("mira".to_string()).unwrap();

        let result = registry.connect("mira".to_string());
        assert!(matches!(
            result,
            Err(PresenceError::CapacityExceeded { limit: 2 })
        ));

        // Other users are unaffected
        registry.connect("sam".to_string()).unwrap();
    }

    #[test]
    fn online_while_any_session_exists() {
        let registry = registry();

        let (first, _rx1) = registry.connect("mira".to_string()).unwrap();
        let (second, _rx2) = registry.connect("mira".to_string()).unwrap();

        assert!(registry.is_online(&"mira".to_string()));
        assert_eq!(registry.sessions_of(&"mira".to_string()).len(), 2);

        registry.disconnect(first.id);
        assert!(registry.is_online(&"mira".to_string()));

        registry.disconnect(second.id);
        assert!(!registry.is_online(&"mira".to_string()));
    }

    #[test]
    fn disconnect_is_idempotent() {
        let registry = registry();

        let (session, _rx) = registry.connect("mira".to_string()).unwrap();

        assert!(registry.disconnect(session.id).is_some());
        assert!(registry.disconnect(session.id).is_none());
    }

    #[test]
    fn list_online_filters_to_present_users() {
        let registry = registry();

        let (_session, _rx) = registry.connect("mira".to_string()).unwrap();

        let online = registry.list_online(&["mira".to_string(), "sam".to_string()]);

        assert!(online.contains("mira"));
        assert!(!online.contains("sam"));
    }

    #[test]
    fn send_to_dead_session_is_dropped() {
        let registry = registry();

        let (session, rx) = registry.connect("mira".to_string()).unwrap();
        drop(rx);

        // Must not panic or error
        registry.send_to(
            session.id,
            Sequenced {
                room_id: crate::RoomId::music("lobby"),
                seq: 1,
                event: "hello",
            },
        );
    }
}
