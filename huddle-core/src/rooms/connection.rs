use std::{
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
};

use futures_util::Stream;
use tokio::sync::mpsc::UnboundedReceiver;

use crate::{RoomCoordinator, Sequenced, Session, SessionId, UserId};

/// A live connection handle held by the transport layer.
///
/// The handle is the receiving half of the session's push channel. Dropping
/// it disconnects the session and evicts it from every room it joined.
pub struct SessionHandle<E> {
    session: Session,
    receiver: UnboundedReceiver<Sequenced<E>>,
    coordinator: Arc<RoomCoordinator<E>>,
}

impl<E> SessionHandle<E>
where
    E: Clone,
{
    pub fn new(
        coordinator: &Arc<RoomCoordinator<E>>,
        session: Session,
        receiver: UnboundedReceiver<Sequenced<E>>,
    ) -> Self {
        Self {
            session,
            receiver,
            coordinator: coordinator.clone(),
        }
    }

    pub fn id(&self) -> SessionId {
        self.session.id
    }

    pub fn user_id(&self) -> &UserId {
        &self.session.user_id
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Waits for the next pushed event. Returns None once the session has
    /// been disconnected.
    pub async fn recv(&mut self) -> Option<Sequenced<E>> {
        self.receiver.recv().await
    }

    /// Returns the next pushed event if one is already queued
    pub fn try_recv(&mut self) -> Option<Sequenced<E>> {
        self.receiver.try_recv().ok()
    }
}

impl<E> Drop for SessionHandle<E> {
    fn drop(&mut self) {
        self.coordinator.evict(self.session.id);
    }
}

impl<E> Stream for SessionHandle<E> {
    type Item = Sequenced<E>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().receiver.poll_recv(cx)
    }
}
