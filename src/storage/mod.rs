// src/storage/mod.rs
// Storage interface contract (§4.B) plus the two shipped implementations.

pub mod memory;
pub mod sqlite;

use async_trait::async_trait;
use thiserror::Error;

use crate::model::{Message, Participant};

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("conversation {0} not found")]
    NotFound(String),
    #[error("conversation {0} is at its queue ceiling")]
    QueueFull(String),
    #[error("storage backend temporarily unavailable: {0}")]
    Unavailable(String),
    #[error("conflicting concurrent update to conversation {0}")]
    Conflict(String),
    #[error("unknown storage backend {0:?}")]
    UnknownBackend(String),
    #[error(transparent)]
    Sqlite(#[from] sqlx::Error),
}

pub type StorageResult<T> = Result<T, StorageError>;

/// Persisted, backend-agnostic conversation metadata row. Distinct from
/// `model::Conversation`, which also carries in-memory-only queue/job
/// state that Storage never sees.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ConversationRecord {
    pub conversation_id: String,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub updated_at: chrono::DateTime<chrono::Utc>,
    pub title: Option<String>,
    pub active: bool,
}

impl ConversationRecord {
    pub fn new(conversation_id: impl Into<String>) -> Self {
        let now = chrono::Utc::now();
        Self {
            conversation_id: conversation_id.into(),
            created_at: now,
            updated_at: now,
            title: None,
            active: true,
        }
    }
}

/// The durable side of §3/§4.B. Every method must be safe under concurrent
/// callers; `next_sequence_id` in particular must never hand out the same
/// id twice nor leave gaps (Invariant M1).
#[async_trait]
pub trait StorageBackend: Send + Sync {
    async fn store_message(&self, message: &Message) -> StorageResult<()>;

    async fn get_conversation_messages(
        &self,
        conversation_id: &str,
        limit: Option<usize>,
        after_seq: Option<u64>,
    ) -> StorageResult<Vec<Message>>;

    async fn next_sequence_id(&self, conversation_id: &str) -> StorageResult<u64>;

    /// Idempotency guard (Invariant M3): true if `message_id` has already
    /// been stored for this conversation. Callers must consult this
    /// *before* allocating a sequence id (§4.F.2 step 2 / §9).
    async fn has_message(&self, conversation_id: &str, message_id: &str) -> StorageResult<bool>;

    /// Fetches a single previously-stored message by id, used to answer a
    /// duplicate submission with the same ack it received the first time
    /// (§9 — idempotency decision).
    async fn get_message(&self, conversation_id: &str, message_id: &str) -> StorageResult<Option<Message>>;

    async fn create_conversation(&self, record: ConversationRecord) -> StorageResult<()>;
    async fn get_conversation(&self, conversation_id: &str) -> StorageResult<Option<ConversationRecord>>;
    async fn update_conversation(&self, record: ConversationRecord) -> StorageResult<()>;

    async fn is_participant(&self, conversation_id: &str, participant_id: &str) -> StorageResult<bool>;
    async fn get_participant_count(&self, conversation_id: &str) -> StorageResult<usize>;
    async fn update_participants(&self, conversation_id: &str, participants: &[Participant]) -> StorageResult<()>;

    async fn get_user_conversations(
        &self,
        participant_id: &str,
        limit: usize,
        offset: usize,
    ) -> StorageResult<Vec<ConversationRecord>>;
}

/// Resolves `chat.storage.backend` (§6.3) into a concrete implementation.
/// Unknown names fail fast at startup rather than silently falling back.
pub async fn build_backend(
    backend: &str,
    sqlite_path: &str,
) -> anyhow::Result<std::sync::Arc<dyn StorageBackend>> {
    match backend {
        "memory" => Ok(std::sync::Arc::new(memory::InMemoryStorage::new())),
        "sqlite" => {
            let store = sqlite::SqliteStorage::connect(sqlite_path).await?;
            Ok(std::sync::Arc::new(store))
        }
        other => Err(StorageError::UnknownBackend(other.to_string()).into()),
    }
}
