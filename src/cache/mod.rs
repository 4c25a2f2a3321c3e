// src/cache/mod.rs
// Conversation Cache (§4.C): a bounded LRU of recent messages and
// participant snapshots. Never authoritative — Storage always wins on
// divergence (§3 Ownership); a miss here is never fatal to a caller.

use std::collections::VecDeque;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};

use lru::LruCache;
use parking_lot::Mutex;

use crate::model::{Message, Participant};

struct CachedConversation {
    messages: VecDeque<Message>,
    participants: Vec<Participant>,
}

impl CachedConversation {
    fn new() -> Self {
        Self {
            messages: VecDeque::new(),
            participants: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
    pub cached_conversations: usize,
    pub total_cached_messages: usize,
}

pub struct ConversationCache {
    max_messages_per_conversation: usize,
    inner: Mutex<LruCache<String, CachedConversation>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl ConversationCache {
    pub fn new(max_conversations: usize, max_messages_per_conversation: usize) -> Self {
        let capacity = NonZeroUsize::new(max_conversations.max(1)).expect("capacity must be non-zero");
        Self {
            max_messages_per_conversation: max_messages_per_conversation.max(1),
            inner: Mutex::new(LruCache::new(capacity)),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Returns the cached suffix of a conversation's message log, newest
    /// last, or `None` on a miss (caller falls back to Storage).
    pub fn get_messages(&self, conversation_id: &str) -> Option<Vec<Message>> {
        let mut inner = self.inner.lock();
        match inner.get(conversation_id) {
            Some(conv) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                crate::metrics::record_cache_result(true);
                Some(conv.messages.iter().cloned().collect())
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                crate::metrics::record_cache_result(false);
                None
            }
        }
    }

    pub fn get_participants(&self, conversation_id: &str) -> Option<Vec<Participant>> {
        self.inner.lock().get(conversation_id).map(|c| c.participants.clone())
    }

    /// Appends a freshly-sequenced message; the cached window stays a
    /// contiguous suffix of the stored log by always evicting from the
    /// front once it exceeds the per-conversation cap.
    pub fn record_message(&self, conversation_id: &str, message: Message) {
        let mut inner = self.inner.lock();
        let conv = inner.get_or_insert_mut(conversation_id.to_string(), CachedConversation::new);
        conv.messages.push_back(message);
        while conv.messages.len() > self.max_messages_per_conversation {
            conv.messages.pop_front();
        }
    }

    pub fn record_participants(&self, conversation_id: &str, participants: Vec<Participant>) {
        let mut inner = self.inner.lock();
        let conv = inner.get_or_insert_mut(conversation_id.to_string(), CachedConversation::new);
        conv.participants = participants;
    }

    /// Evicts a conversation wholesale (messages and participant snapshot
    /// together, per Invariant (iii) in §4.C).
    pub fn evict(&self, conversation_id: &str) {
        self.inner.lock().pop(conversation_id);
    }

    pub fn stats(&self) -> CacheStats {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        let inner = self.inner.lock();
        CacheStats {
            hits,
            misses,
            hit_rate: if total == 0 { 0.0 } else { hits as f64 / total as f64 },
            cached_conversations: inner.len(),
            total_cached_messages: inner.iter().map(|(_, c)| c.messages.len()).sum(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{MessageKind, ParticipantKind, Sender};

    fn msg(cid: &str, seq: u64) -> Message {
        let mut m = Message::draft(
            format!("m{seq}"),
            cid,
            Sender { id: "alice".into(), display_name: "Alice".into(), kind: ParticipantKind::Human },
            "hi".into(),
            MessageKind::Text,
        )
        .unwrap();
        m.sequence_id = seq;
        m
    }

    #[test]
    fn evicts_oldest_message_past_the_per_conversation_cap() {
        let cache = ConversationCache::new(10, 3);
        for seq in 1..=5 {
            cache.record_message("c1", msg("c1", seq));
        }
        let cached = cache.get_messages("c1").unwrap();
        assert_eq!(cached.iter().map(|m| m.sequence_id).collect::<Vec<_>>(), vec![3, 4, 5]);
    }

    #[test]
    fn evicts_whole_conversation_past_the_conversation_cap() {
        let cache = ConversationCache::new(1, 10);
        cache.record_message("c1", msg("c1", 1));
        cache.record_message("c2", msg("c2", 1));
        assert!(cache.get_messages("c1").is_none());
        assert!(cache.get_messages("c2").is_some());
    }

    #[test]
    fn miss_is_reflected_in_stats_but_never_fatal() {
        let cache = ConversationCache::new(10, 10);
        assert!(cache.get_messages("missing").is_none());
        let stats = cache.stats();
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.hits, 0);
    }
}
