use async_trait::async_trait;
use thiserror::Error;

mod data;
pub use data::*;

pub type StorageResult<T> = std::result::Result<T, StorageError>;

#[derive(Debug, Error)]
pub enum StorageError {
    /// An unknown or internal error happened in the store
    #[error(transparent)]
    Internal(Box<dyn std::error::Error + Send + Sync>),
    /// A resource already exists
    #[error("{resource} with id {id} already exists")]
    Conflict { resource: &'static str, id: String },
    /// A resource doesn't exist in the store
    #[error("{resource}:{id} doesn't exist")]
    NotFound { resource: &'static str, id: String },
}

impl StorageError {
    pub fn not_found(resource: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            resource,
            id: id.into(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

/// The document-store-shaped persistence collaborator.
///
/// The hub treats this as the durability source of truth for messages,
/// offers, queue snapshots, screen session records, and notifications. All
/// upserts are keyed by entity id and must be idempotent, since the hub
/// retries them with a bounded budget.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Looks up a user identity. This is the single authoritative existence
    /// check for users; the hub never creates identities itself.
    async fn user_by_id(&self, user_id: &UserId) -> StorageResult<UserData>;

    /// Returns the conversation between the two users, creating it if it
    /// doesn't exist yet. The pair is unordered.
    async fn conversation_between(&self, a: &UserId, b: &UserId) -> StorageResult<ConversationData>;
    async fn conversation_by_id(&self, conversation_id: &str) -> StorageResult<ConversationData>;

    async fn upsert_message(&self, message: MessageData) -> StorageResult<()>;
    async fn message_by_id(&self, message_id: &str) -> StorageResult<MessageData>;
    async fn messages_in_conversation(&self, conversation_id: &str) -> StorageResult<Vec<MessageData>>;

    async fn upsert_offer(&self, offer: FileOfferData) -> StorageResult<()>;
    async fn offer_by_id(&self, offer_id: &str) -> StorageResult<FileOfferData>;
    /// All offers that are not yet in a terminal state, for crash recovery
    async fn pending_offers(&self) -> StorageResult<Vec<FileOfferData>>;

    async fn save_queue_snapshot(&self, snapshot: QueueSnapshotData) -> StorageResult<()>;
    async fn queue_snapshots(&self) -> StorageResult<Vec<QueueSnapshotData>>;

    async fn upsert_screen_session(&self, session: ScreenSessionData) -> StorageResult<()>;

    async fn append_notification(&self, notification: NotificationData) -> StorageResult<()>;
    async fn notifications_for_user(&self, user_id: &UserId) -> StorageResult<Vec<NotificationData>>;
    async fn mark_notifications_read(&self, user_id: &UserId, ids: &[String]) -> StorageResult<()>;
}

#[derive(Debug, Error)]
pub enum BlobError {
    #[error(transparent)]
    Internal(Box<dyn std::error::Error + Send + Sync>),
    #[error("blob {reference} doesn't exist")]
    NotFound { reference: String },
}

/// The opaque blob storage collaborator.
///
/// The hub only ever stores and forwards reference strings. Raw bytes never
/// enter hub state.
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn put(&self, reference: &str, bytes: Vec<u8>) -> std::result::Result<(), BlobError>;
    async fn get(&self, reference: &str) -> std::result::Result<Vec<u8>, BlobError>;
    async fn delete(&self, reference: &str) -> std::result::Result<(), BlobError>;
}
