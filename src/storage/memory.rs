// src/storage/memory.rs
// The authoritative in-memory reference implementation (§4.B, §8 P1/P8/P9/P10).

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::{ConversationRecord, StorageBackend, StorageError, StorageResult};
use crate::model::{Message, Participant};

struct ConversationData {
    record: ConversationRecord,
    next_sequence_id: u64,
    messages: BTreeMap<u64, Message>,
    seen_message_ids: HashSet<String>,
    participants: Vec<Participant>,
}

impl ConversationData {
    fn new(record: ConversationRecord) -> Self {
        Self {
            record,
            next_sequence_id: 1,
            messages: BTreeMap::new(),
            seen_message_ids: HashSet::new(),
            participants: Vec::new(),
        }
    }
}

/// All conversations share one outer lock guarding the map of ids to
/// per-conversation state; each conversation's own mutex then guards its
/// sequence counter, message log, and membership so unrelated
/// conversations never contend with each other.
pub struct InMemoryStorage {
    conversations: Mutex<HashMap<String, Arc<Mutex<ConversationData>>>>,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self {
            conversations: Mutex::new(HashMap::new()),
        }
    }

    fn conversation(&self, conversation_id: &str) -> Option<Arc<Mutex<ConversationData>>> {
        self.conversations.lock().get(conversation_id).cloned()
    }

    fn conversation_or_insert(&self, conversation_id: &str) -> Arc<Mutex<ConversationData>> {
        self.conversations
            .lock()
            .entry(conversation_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(ConversationData::new(ConversationRecord::new(conversation_id)))))
            .clone()
    }
}

impl Default for InMemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StorageBackend for InMemoryStorage {
    async fn store_message(&self, message: &Message) -> StorageResult<()> {
        let conv = self.conversation_or_insert(&message.conversation_id);
        let mut data = conv.lock();
        if data.seen_message_ids.contains(&message.message_id) {
            // Idempotent: the Conversation Manager already guarantees this
            // path is only hit before a duplicate consumes a new sequence
            // id, but a defensive no-op keeps Storage safe on its own too.
            return Ok(());
        }
        data.seen_message_ids.insert(message.message_id.clone());
        data.messages.insert(message.sequence_id, message.clone());
        data.record.updated_at = message.timestamp;
        Ok(())
    }

    async fn get_conversation_messages(
        &self,
        conversation_id: &str,
        limit: Option<usize>,
        after_seq: Option<u64>,
    ) -> StorageResult<Vec<Message>> {
        let Some(conv) = self.conversation(conversation_id) else {
            return Ok(Vec::new());
        };
        let data = conv.lock();
        let iter = match after_seq {
            Some(seq) => data.messages.range((seq + 1)..),
            None => data.messages.range(..),
        };
        let mut items: Vec<Message> = iter.map(|(_, m)| m.clone()).collect();
        if let Some(limit) = limit {
            if after_seq.is_some() {
                items.truncate(limit);
            } else if items.len() > limit {
                let start = items.len() - limit;
                items = items.split_off(start);
            }
        }
        Ok(items)
    }

    async fn next_sequence_id(&self, conversation_id: &str) -> StorageResult<u64> {
        let conv = self.conversation_or_insert(conversation_id);
        let mut data = conv.lock();
        let id = data.next_sequence_id;
        data.next_sequence_id += 1;
        Ok(id)
    }

    async fn has_message(&self, conversation_id: &str, message_id: &str) -> StorageResult<bool> {
        let Some(conv) = self.conversation(conversation_id) else {
            return Ok(false);
        };
        Ok(conv.lock().seen_message_ids.contains(message_id))
    }

    async fn get_message(&self, conversation_id: &str, message_id: &str) -> StorageResult<Option<Message>> {
        let Some(conv) = self.conversation(conversation_id) else {
            return Ok(None);
        };
        Ok(conv.lock().messages.values().find(|m| m.message_id == message_id).cloned())
    }

    async fn create_conversation(&self, record: ConversationRecord) -> StorageResult<()> {
        let mut conversations = self.conversations.lock();
        conversations
            .entry(record.conversation_id.clone())
            .or_insert_with(|| Arc::new(Mutex::new(ConversationData::new(record))));
        Ok(())
    }

    async fn get_conversation(&self, conversation_id: &str) -> StorageResult<Option<ConversationRecord>> {
        Ok(self.conversation(conversation_id).map(|c| c.lock().record.clone()))
    }

    async fn update_conversation(&self, record: ConversationRecord) -> StorageResult<()> {
        let conv = self.conversation_or_insert(&record.conversation_id);
        conv.lock().record = record;
        Ok(())
    }

    async fn is_participant(&self, conversation_id: &str, participant_id: &str) -> StorageResult<bool> {
        let Some(conv) = self.conversation(conversation_id) else {
            return Ok(false);
        };
        Ok(conv
            .lock()
            .participants
            .iter()
            .any(|p| p.participant_id == participant_id))
    }

    async fn get_participant_count(&self, conversation_id: &str) -> StorageResult<usize> {
        let Some(conv) = self.conversation(conversation_id) else {
            return Ok(0);
        };
        Ok(conv.lock().participants.len())
    }

    async fn update_participants(&self, conversation_id: &str, participants: &[Participant]) -> StorageResult<()> {
        let conv = self.conversation_or_insert(conversation_id);
        conv.lock().participants = participants.to_vec();
        Ok(())
    }

    async fn get_user_conversations(
        &self,
        participant_id: &str,
        limit: usize,
        offset: usize,
    ) -> StorageResult<Vec<ConversationRecord>> {
        let conversations = self.conversations.lock();
        let mut snapshot: Vec<ConversationRecord> = conversations
            .values()
            .filter(|c| {
                let data = c.lock();
                data.participants.iter().any(|p| p.participant_id == participant_id)
            })
            .map(|c| c.lock().record.clone())
            .collect();
        snapshot.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(snapshot.into_iter().skip(offset).take(limit).collect())
    }
}
