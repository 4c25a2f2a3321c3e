// src/conversation/mod.rs
// Conversation Manager (§4.F) — the heart of the ingress pipeline. Owns
// per-conversation state behind `tokio::sync::Mutex` (not `parking_lot`)
// because the critical section legally spans the `next_sequence_id` await
// (§5's concurrency model). Participant *behavior* objects are tracked in
// a side registry, separate from `model::Conversation.participants`, which
// stays pure data so it can be cloned into a membership snapshot cheaply.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex as SyncMutex;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::ai::context::ContextBuilder;
use crate::ai::FailureRecorder;
use crate::cache::ConversationCache;
use crate::config::ConversationConfig;
use crate::connection::ConnectionManager;
use crate::error::{ChatError, ChatResult, FailureKind};
use crate::model::{AiJobKey, Conversation, Message, MessageStatus, Participant, ParticipantKind};
use crate::participant::{ChatParticipant, ChunkSink};
use crate::storage::StorageBackend;
use crate::wire::ServerFrame;

/// Forwards an in-flight AI job's chunks to every current connection in a
/// conversation, tagged with the producing participant (§4.E.3/§4.G).
struct BroadcastChunkSink {
    connections: Arc<ConnectionManager>,
    conversation_id: String,
    participant_id: String,
}

#[async_trait]
impl ChunkSink for BroadcastChunkSink {
    async fn send_chunk(&self, chunk: &str) {
        let frame = ServerFrame::StreamChunk {
            conversation_id: self.conversation_id.clone(),
            participant_id: self.participant_id.clone(),
            chunk: chunk.to_string(),
        }
        .to_json();
        self.connections.broadcast_to_conversation(&self.conversation_id, frame).await;
    }
}

/// How many recent messages to hand the context builder. Generous relative
/// to any single `AiConfig` window so trimming is the builder's job, not
/// the history fetch's.
const HISTORY_FETCH_LIMIT: usize = 200;

pub struct ConversationManager {
    config: ConversationConfig,
    storage: Arc<dyn StorageBackend>,
    cache: Arc<ConversationCache>,
    connections: Arc<ConnectionManager>,
    context_builder: ContextBuilder,
    conversations: SyncMutex<HashMap<String, Arc<AsyncMutex<Conversation>>>>,
    participants: SyncMutex<HashMap<String, HashMap<String, Arc<dyn ChatParticipant>>>>,
    background_tasks: SyncMutex<Vec<JoinHandle<()>>>,
}

impl ConversationManager {
    pub fn new(
        config: ConversationConfig,
        storage: Arc<dyn StorageBackend>,
        cache: Arc<ConversationCache>,
        connections: Arc<ConnectionManager>,
        context_builder: ContextBuilder,
    ) -> Self {
        Self {
            config,
            storage,
            cache,
            connections,
            context_builder,
            conversations: SyncMutex::new(HashMap::new()),
            participants: SyncMutex::new(HashMap::new()),
            background_tasks: SyncMutex::new(Vec::new()),
        }
    }

    fn conversation_or_insert(&self, conversation_id: &str) -> Arc<AsyncMutex<Conversation>> {
        self.conversations
            .lock()
            .entry(conversation_id.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(Conversation::new(conversation_id))))
            .clone()
    }

    fn get_conversation(&self, conversation_id: &str) -> Option<Arc<AsyncMutex<Conversation>>> {
        self.conversations.lock().get(conversation_id).cloned()
    }

    fn track_task(&self, handle: JoinHandle<()>) {
        let mut tasks = self.background_tasks.lock();
        tasks.retain(|h| !h.is_finished());
        tasks.push(handle);
    }

    /// Drains outstanding background tasks (persistence, fan-out, AI
    /// dispatch) with a bounded wait, for graceful shutdown.
    pub async fn shutdown(&self) {
        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.background_tasks.lock());
        let drain = futures::future::join_all(handles);
        if tokio::time::timeout(std::time::Duration::from_secs(5), drain).await.is_err() {
            warn!("conversation manager shutdown timed out waiting for background tasks");
        }
    }

    pub async fn mode(&self, conversation_id: &str) -> Option<crate::model::ConversationMode> {
        let conv = self.get_conversation(conversation_id)?;
        Some(conv.lock().await.mode)
    }

    pub async fn input_timeout_ms(&self, conversation_id: &str) -> Option<u64> {
        let conv = self.get_conversation(conversation_id)?;
        let guard = conv.lock().await;
        Some(guard.mode.input_timeout_ms(self.config.single_mode_timeout_ms, self.config.multi_mode_timeout_ms))
    }

    pub async fn failures(&self, conversation_id: &str) -> Vec<crate::error::RecordedFailure> {
        let Some(conv) = self.get_conversation(conversation_id) else {
            return Vec::new();
        };
        conv.lock().await.failures.iter().cloned().collect()
    }

    pub async fn active_ai_job_count(&self, conversation_id: &str) -> usize {
        let Some(conv) = self.get_conversation(conversation_id) else {
            return 0;
        };
        conv.lock().await.active_ai_jobs.len()
    }

    /// Queue depth for every conversation currently materialized in
    /// memory, used by the health endpoint (§6.2) — conversations never
    /// joined since process start are not reflected here, matching
    /// "lazily materializes on first join" (§4.H).
    pub async fn queue_depths(&self) -> std::collections::HashMap<String, usize> {
        let handles: Vec<(String, Arc<AsyncMutex<Conversation>>)> =
            self.conversations.lock().iter().map(|(id, c)| (id.clone(), c.clone())).collect();
        let mut out = std::collections::HashMap::with_capacity(handles.len());
        for (id, conv) in handles {
            out.insert(id, conv.lock().await.queue_depth);
        }
        out
    }

    pub async fn participant_snapshot(&self, conversation_id: &str) -> Vec<Participant> {
        let Some(conv) = self.get_conversation(conversation_id) else {
            return Vec::new();
        };
        conv.lock().await.participants.iter().cloned().collect()
    }

    /// §4.F.1 — registers both the data record and the behavioral object,
    /// recomputes mode, and broadcasts a `mode_change` frame if it moved.
    /// Fails with `LimitExceeded` at `max_participants` (§6.2/§8).
    pub async fn add_participant(&self, conversation_id: &str, behavior: Arc<dyn ChatParticipant>) -> ChatResult<bool> {
        let info = behavior.info();
        let conv_arc = self.conversation_or_insert(conversation_id);
        let mode_changed = {
            let mut conv = conv_arc.lock().await;
            if conv.participants.len() >= self.config.max_participants {
                return Err(ChatError::LimitExceeded(conversation_id.to_string(), conv.participants.len(), self.config.max_participants));
            }
            if conv.participants.contains(&info) {
                return Err(ChatError::AlreadyMember(info.participant_id.clone(), conversation_id.to_string()));
            }
            conv.participants.insert(info.clone());
            conv.updated_at = Utc::now();
            conv.recompute_mode()
        };

        self.participants
            .lock()
            .entry(conversation_id.to_string())
            .or_default()
            .insert(info.participant_id.clone(), behavior);

        let snapshot = self.participant_snapshot(conversation_id).await;
        self.cache.record_participants(conversation_id, snapshot.clone());

        let storage = self.storage.clone();
        let cid = conversation_id.to_string();
        self.track_task(tokio::spawn(async move {
            if let Err(err) = storage.update_participants(&cid, &snapshot).await {
                warn!(conversation_id = %cid, error = %err, "failed to persist participant membership");
            }
        }));

        if mode_changed {
            self.broadcast_mode_change(conversation_id, conv_arc).await;
        }

        Ok(mode_changed)
    }

    /// §4.F.1 — idempotent: removing an unknown participant is a no-op
    /// rather than an error, since Leave is driven by the caller's own
    /// membership check at the lifecycle layer.
    pub async fn remove_participant(&self, conversation_id: &str, participant_id: &str) -> bool {
        let Some(conv_arc) = self.get_conversation(conversation_id) else {
            return false;
        };
        let mode_changed = {
            let mut conv = conv_arc.lock().await;
            let removed = conv.participants.iter().any(|p| p.participant_id == participant_id);
            if !removed {
                return false;
            }
            conv.participants.retain(|p| p.participant_id != participant_id);
            conv.updated_at = Utc::now();
            conv.recompute_mode()
        };

        if let Some(registry) = self.participants.lock().get_mut(conversation_id) {
            registry.remove(participant_id);
        }
        self.connections.remove_connection(conversation_id, participant_id);

        let snapshot = self.participant_snapshot(conversation_id).await;
        self.cache.record_participants(conversation_id, snapshot.clone());
        let storage = self.storage.clone();
        let cid = conversation_id.to_string();
        self.track_task(tokio::spawn(async move {
            if let Err(err) = storage.update_participants(&cid, &snapshot).await {
                warn!(conversation_id = %cid, error = %err, "failed to persist participant membership");
            }
        }));

        if mode_changed {
            self.broadcast_mode_change(conversation_id, conv_arc).await;
        }
        true
    }

    async fn broadcast_mode_change(&self, conversation_id: &str, conv_arc: Arc<AsyncMutex<Conversation>>) {
        let mode = conv_arc.lock().await.mode;
        let input_timeout = mode.input_timeout_ms(self.config.single_mode_timeout_ms, self.config.multi_mode_timeout_ms);
        let frame = ServerFrame::ModeChange {
            conversation_id: conversation_id.to_string(),
            mode,
            input_timeout,
            timestamp: Utc::now().timestamp_millis(),
        }
        .to_json();
        self.connections.broadcast_to_conversation(conversation_id, frame).await;
    }

    /// Fetches recent history for context-building, preferring the cache
    /// (§4.C) and falling back to Storage on a miss.
    async fn recent_history(&self, conversation_id: &str) -> ChatResult<Vec<Message>> {
        if let Some(cached) = self.cache.get_messages(conversation_id) {
            return Ok(cached);
        }
        Ok(self.storage.get_conversation_messages(conversation_id, Some(HISTORY_FETCH_LIMIT), None).await?)
    }

    /// §4.F.2 — the full ingress pipeline. Requires `Arc<Self>` because a
    /// produced AI reply is submitted as a new, separately-spawned call
    /// back into this same pipeline (§9 — re-entrant-as-a-task decision).
    pub async fn process_message(self: &Arc<Self>, mut message: Message) -> ChatResult<Message> {
        let conv_arc = self.conversation_or_insert(&message.conversation_id);
        let mut guard = conv_arc.lock().await;

        if message.sender.kind != ParticipantKind::System && !guard.is_participant(&message.sender.id) {
            return Err(ChatError::UnknownSender(message.sender.id.clone()));
        }

        // Idempotency guard consulted before any sequence id is allocated
        // (§9 decision) — a duplicate submission gets back the exact
        // record (and sequence_id) it produced the first time, and never
        // touches queue_depth.
        if let Some(existing) = self.storage.get_message(&message.conversation_id, &message.message_id).await? {
            return Ok(existing);
        }

        if guard.queue_depth >= self.config.queue_size_limit {
            match guard.active_ai_jobs.pop_front() {
                Some(shed) => {
                    guard.queue_depth = guard.queue_depth.saturating_sub(1);
                    crate::metrics::record_ai_job_shed();
                    info!(conversation_id = %message.conversation_id, message_id = %shed.message_id, participant_id = %shed.participant_id, "shedding oldest AI job to admit new message");
                }
                None => {
                    return Err(ChatError::QueueFull {
                        conversation_id: message.conversation_id.clone(),
                        depth: guard.queue_depth,
                        limit: self.config.queue_size_limit,
                    });
                }
            }
        }
        guard.queue_depth += 1;
        crate::metrics::set_queue_depth(&message.conversation_id, guard.queue_depth);

        let sequence_id = self.storage.next_sequence_id(&message.conversation_id).await?;
        message.sequence_id = sequence_id;
        message.status = MessageStatus::Delivered;
        guard.updated_at = message.timestamp;

        // Membership snapshot taken before releasing the lock (§9 decision
        // — fan-out, including AI dispatch, uses membership as of this
        // instant; a participant added or removed afterward doesn't retroactively
        // change who this particular message reaches).
        let participants_snapshot: Vec<Participant> = guard.participants.iter().cloned().collect();
        drop(guard);

        self.cache.record_message(&message.conversation_id, message.clone());
        self.spawn_persist(message.clone());
        self.spawn_broadcast(&message, conv_arc.clone());

        for p in participants_snapshot
            .iter()
            .filter(|p| p.kind == ParticipantKind::Ai && p.participant_id != message.sender.id)
        {
            self.dispatch_ai_job(conv_arc.clone(), message.clone(), p.participant_id.clone());
        }

        Ok(message)
    }

    fn spawn_persist(self: &Arc<Self>, message: Message) {
        let storage = self.storage.clone();
        let conv_arc = self.conversation_or_insert(&message.conversation_id);
        let handle = tokio::spawn(async move {
            if let Err(err) = storage.store_message(&message).await {
                warn!(conversation_id = %message.conversation_id, message_id = %message.message_id, error = %err, "failed to persist message");
                crate::metrics::record_delivery_failure(FailureKind::Storage.as_str());
                let mut conv = conv_arc.lock().await;
                conv.record_failure(FailureKind::Storage, "storage", err.to_string(), Some(message.message_id));
            }
        });
        self.track_task(handle);
    }

    fn spawn_broadcast(self: &Arc<Self>, message: &Message, conv_arc: Arc<AsyncMutex<Conversation>>) {
        let connections = self.connections.clone();
        let frame = ServerFrame::Message { message: message.clone() }.to_json();
        let conversation_id = message.conversation_id.clone();
        let sender_id = message.sender.id.clone();
        let handle = tokio::spawn(async move {
            let failures = connections.broadcast_message(&conversation_id, frame, Some(&sender_id)).await;
            if !failures.is_empty() {
                let mut conv = conv_arc.lock().await;
                for (participant_id, reason) in failures {
                    crate::metrics::record_delivery_failure(FailureKind::Delivery.as_str());
                    conv.record_failure(FailureKind::Delivery, participant_id, format!("{reason:?}"), None);
                }
            }
        });
        self.track_task(handle);
    }

    /// §4.E/§4.F.2 step 4 — runs one AI participant's `process` against the
    /// triggering message, tracking it in `active_ai_jobs` for the
    /// lifetime of the call so shedding can find it, and submitting any
    /// produced reply back through the pipeline as a new task.
    fn dispatch_ai_job(self: &Arc<Self>, conv_arc: Arc<AsyncMutex<Conversation>>, message: Message, participant_id: String) {
        let manager = self.clone();
        let job_key = AiJobKey { message_id: message.message_id.clone(), participant_id: participant_id.clone() };
        let handle = tokio::spawn(async move {
            {
                let mut conv = conv_arc.lock().await;
                conv.active_ai_jobs.push_back(job_key.clone());
            }

            let behavior = manager
                .participants
                .lock()
                .get(&message.conversation_id)
                .and_then(|registry| registry.get(&participant_id))
                .cloned();

            let dispatch_started = std::time::Instant::now();
            let reply = if let Some(behavior) = behavior {
                let history = match manager.recent_history(&message.conversation_id).await {
                    Ok(history) => history,
                    Err(err) => {
                        warn!(conversation_id = %message.conversation_id, error = %err, "failed to load context history for AI dispatch");
                        Vec::new()
                    }
                };
                let context = manager.context_builder.build(&history, &message);
                let sink = BroadcastChunkSink {
                    connections: manager.connections.clone(),
                    conversation_id: message.conversation_id.clone(),
                    participant_id: participant_id.clone(),
                };
                let reply = behavior.process(&message, &context, &sink).await;
                let outcome = if reply.is_some() { "ok" } else { "no_reply" };
                crate::metrics::record_ai_job(outcome, dispatch_started.elapsed().as_secs_f64());
                reply
            } else {
                debug!(conversation_id = %message.conversation_id, participant_id = %participant_id, "AI participant vanished before dispatch ran");
                None
            };

            {
                let mut conv = conv_arc.lock().await;
                conv.active_ai_jobs.retain(|k| k != &job_key);
            }

            if let Some(reply) = reply {
                // Submitted as a brand-new pipeline run, not an inline
                // recursive call (§9) — its own admission/sequencing/
                // fan-out happens independently of the triggering message.
                if let Err(err) = manager.process_message(reply).await {
                    warn!(conversation_id = %message.conversation_id, participant_id = %participant_id, error = %err, "failed to submit AI reply");
                }
            }
        });
        self.track_task(handle);
    }
}

/// Lets the AI adapter record failures against the conversation that owns
/// the job, without needing to know about `ConversationManager` internals
/// beyond this narrow port (§4.E / §9).
#[async_trait]
impl FailureRecorder for ConversationManager {
    async fn record(&self, conversation_id: &str, kind: FailureKind, participant_id: &str, message_id: &str, error: &str) {
        crate::metrics::record_delivery_failure(kind.as_str());
        let conv_arc = self.conversation_or_insert(conversation_id);
        let mut conv = conv_arc.lock().await;
        conv.record_failure(kind, participant_id, error, Some(message_id.to_string()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::ConversationCache;
    use crate::config::AiConfig;
    use crate::config::ConnectionConfig;
    use crate::model::{MessageKind, Sender};
    use crate::participant::human::HumanParticipant;
    use crate::storage::memory::InMemoryStorage;

    fn manager() -> Arc<ConversationManager> {
        let storage: Arc<dyn StorageBackend> = Arc::new(InMemoryStorage::new());
        let cache = Arc::new(ConversationCache::new(10, 100));
        let connections = Arc::new(ConnectionManager::new(ConnectionConfig { channel_send_timeout_ms: 1000, channel_send_buffer: 16 }));
        let ai_config = AiConfig { timeout_seconds: 5, human_messages_context: 5, nlweb_messages_context: 1 };
        Arc::new(ConversationManager::new(
            ConversationConfig { single_mode_timeout_ms: 100, multi_mode_timeout_ms: 2000, queue_size_limit: 3, max_participants: 10 },
            storage,
            cache,
            connections,
            ContextBuilder::new(&ai_config),
        ))
    }

    fn human(id: &str) -> Arc<dyn ChatParticipant> {
        Arc::new(HumanParticipant::new(Participant::human(id, id)))
    }

    #[tokio::test]
    async fn adding_a_second_human_flips_mode_to_multi() {
        let manager = self::manager();
        manager.add_participant("c1", human("alice")).await.unwrap();
        assert_eq!(manager.mode("c1").await, Some(crate::model::ConversationMode::Single));
        let mode_changed = manager.add_participant("c1", human("bob")).await.unwrap();
        assert!(mode_changed);
        assert_eq!(manager.mode("c1").await, Some(crate::model::ConversationMode::Multi));
    }

    #[tokio::test]
    async fn unknown_sender_is_rejected() {
        let manager = self::manager();
        manager.add_participant("c1", human("alice")).await.unwrap();
        let msg = Message::draft("m1", "c1", Sender { id: "mallory".into(), display_name: "Mallory".into(), kind: ParticipantKind::Human }, "hi".into(), MessageKind::Text).unwrap();
        let err = manager.process_message(msg).await.unwrap_err();
        assert!(matches!(err, ChatError::UnknownSender(_)));
    }

    #[tokio::test]
    async fn duplicate_submission_returns_the_original_sequence_id() {
        let manager = self::manager();
        manager.add_participant("c1", human("alice")).await.unwrap();
        let sender = Sender { id: "alice".into(), display_name: "Alice".into(), kind: ParticipantKind::Human };
        let msg = Message::draft("m1", "c1", sender, "hi".into(), MessageKind::Text).unwrap();
        let first = manager.process_message(msg.clone()).await.unwrap();
        let second = manager.process_message(msg).await.unwrap();
        assert_eq!(first.sequence_id, second.sequence_id);
    }

    #[tokio::test]
    async fn queue_full_without_ai_jobs_to_shed_is_rejected() {
        let manager = self::manager();
        manager.add_participant("c1", human("alice")).await.unwrap();
        let sender = Sender { id: "alice".into(), display_name: "Alice".into(), kind: ParticipantKind::Human };
        for i in 0..3 {
            let msg = Message::draft(format!("m{i}"), "c1", sender.clone(), "hi".into(), MessageKind::Text).unwrap();
            manager.process_message(msg).await.unwrap();
        }
        let overflow = Message::draft("m-overflow", "c1", sender, "hi".into(), MessageKind::Text).unwrap();
        let err = manager.process_message(overflow).await.unwrap_err();
        assert!(matches!(err, ChatError::QueueFull { .. }));
    }
}
