// src/lifecycle/mod.rs
// Conversation lifecycle surface (§4.H): thin orchestration over Storage,
// the Conversation Manager, and the Connection Manager. No new state of
// its own — every operation here composes calls the other three
// components already expose.

use std::sync::Arc;

use tracing::info;

use crate::connection::ConnectionManager;
use crate::conversation::ConversationManager;
use crate::error::{ChatError, ChatResult};
use crate::model::Participant;
use crate::participant::ChatParticipant;
use crate::storage::{ConversationRecord, StorageBackend};

pub struct LifecycleService {
    storage: Arc<dyn StorageBackend>,
    conversations: Arc<ConversationManager>,
    connections: Arc<ConnectionManager>,
}

impl LifecycleService {
    pub fn new(storage: Arc<dyn StorageBackend>, conversations: Arc<ConversationManager>, connections: Arc<ConnectionManager>) -> Self {
        Self { storage, conversations, connections }
    }

    /// Creates a durable conversation row. The conversation only gains
    /// in-memory state (queue, mode, participants) once the first
    /// participant joins (§4.F lazily materializes it).
    pub async fn create_conversation(&self, conversation_id: &str) -> ChatResult<()> {
        self.storage.create_conversation(ConversationRecord::new(conversation_id)).await?;
        info!(conversation_id, "conversation created");
        Ok(())
    }

    /// §4.H join — rejects a participant already present (Invariant C-ish,
    /// mirrored from §6.2's `already_member` error). `max_participants` is
    /// enforced by the Conversation Manager itself.
    pub async fn join(&self, conversation_id: &str, behavior: Arc<dyn ChatParticipant>) -> ChatResult<bool> {
        if self.storage.get_conversation(conversation_id).await?.is_none() {
            return Err(ChatError::UnknownConversation(conversation_id.to_string()));
        }
        self.conversations.add_participant(conversation_id, behavior).await
    }

    /// §4.H leave — rejects a participant that was never a member, then
    /// removes it from both the Conversation Manager and any live
    /// connection the Connection Manager is holding for it.
    pub async fn leave(&self, conversation_id: &str, participant_id: &str) -> ChatResult<()> {
        let was_member = self.conversations.participant_snapshot(conversation_id).await.iter().any(|p| p.participant_id == participant_id);
        if !was_member {
            return Err(ChatError::NotMember(participant_id.to_string(), conversation_id.to_string()));
        }
        self.conversations.remove_participant(conversation_id, participant_id).await;
        self.connections.remove_connection(conversation_id, participant_id);
        Ok(())
    }

    pub async fn list_participants(&self, conversation_id: &str) -> Vec<Participant> {
        self.conversations.participant_snapshot(conversation_id).await
    }

    /// §4.H list-for-user — conversations a participant currently belongs
    /// to, most-recently-active first (delegates ordering to Storage).
    pub async fn conversations_for_participant(&self, participant_id: &str, limit: usize, offset: usize) -> ChatResult<Vec<ConversationRecord>> {
        Ok(self.storage.get_user_conversations(participant_id, limit, offset).await?)
    }

    pub async fn get_conversation(&self, conversation_id: &str) -> ChatResult<Option<ConversationRecord>> {
        Ok(self.storage.get_conversation(conversation_id).await?)
    }

    pub async fn history(&self, conversation_id: &str, limit: Option<usize>, after_seq: Option<u64>) -> ChatResult<Vec<crate::model::Message>> {
        Ok(self.storage.get_conversation_messages(conversation_id, limit, after_seq).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ai::context::ContextBuilder;
    use crate::cache::ConversationCache;
    use crate::config::{AiConfig, ConnectionConfig, ConversationConfig};
    use crate::participant::human::HumanParticipant;
    use crate::storage::memory::InMemoryStorage;

    fn service() -> LifecycleService {
        let storage: Arc<dyn StorageBackend> = Arc::new(InMemoryStorage::new());
        let cache = Arc::new(ConversationCache::new(10, 100));
        let connections = Arc::new(ConnectionManager::new(ConnectionConfig { channel_send_timeout_ms: 1000, channel_send_buffer: 16 }));
        let ai_config = AiConfig { timeout_seconds: 5, human_messages_context: 5, nlweb_messages_context: 1 };
        let conversations = Arc::new(ConversationManager::new(
            ConversationConfig { single_mode_timeout_ms: 100, multi_mode_timeout_ms: 2000, queue_size_limit: 100, max_participants: 10 },
            storage.clone(),
            cache,
            connections.clone(),
            ContextBuilder::new(&ai_config),
        ));
        LifecycleService::new(storage, conversations, connections)
    }

    #[tokio::test]
    async fn join_fails_on_an_unknown_conversation() {
        let service = service();
        let err = service.join("ghost", Arc::new(HumanParticipant::new(Participant::human("alice", "Alice")))).await.unwrap_err();
        assert!(matches!(err, ChatError::UnknownConversation(_)));
    }

    #[tokio::test]
    async fn leave_fails_for_a_non_member() {
        let service = service();
        service.create_conversation("c1").await.unwrap();
        let err = service.leave("c1", "alice").await.unwrap_err();
        assert!(matches!(err, ChatError::NotMember(_, _)));
    }

    #[tokio::test]
    async fn join_then_leave_round_trips_membership() {
        let service = service();
        service.create_conversation("c1").await.unwrap();
        service.join("c1", Arc::new(HumanParticipant::new(Participant::human("alice", "Alice")))).await.unwrap();
        assert_eq!(service.list_participants("c1").await.len(), 1);
        service.leave("c1", "alice").await.unwrap();
        assert_eq!(service.list_participants("c1").await.len(), 0);
    }
}
