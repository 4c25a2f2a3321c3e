// src/ai/mod.rs
// AI adapter (§4.E): bridges an external query engine into the
// Participant abstraction. The engine itself is a pluggable black box
// (§6.4, out of scope); this module only defines the narrow contract and
// the translation/timeout/best-effort-store logic around it.

pub mod context;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::config::AiConfig;
use crate::error::FailureKind;
use crate::model::{Message, MessageKind, Participant as ParticipantInfo, ParticipantKind, Sender};
use crate::participant::{ChatParticipant, ChunkSink};
use context::ContextEntry;

/// A single item in the engine's completion payload, used only by the
/// best-effort conversation-exchange store hook (§4.E.7).
#[derive(Debug, Clone)]
pub struct EngineContentItem {
    pub name: String,
    pub description: String,
}

#[derive(Debug, Clone, Default)]
pub struct EngineOutcome {
    /// Raw records the engine reported as "produced messages" — kept
    /// opaque (serde_json::Value) since the engine defines their shape.
    pub messages: Vec<Value>,
    pub content: Vec<EngineContentItem>,
}

/// Loose, stringly-typed request map matching §6.4 exactly: string keys
/// to arrays of values, so any engine-specific extra key passes through
/// verbatim without the core needing to know about it.
#[derive(Debug, Clone, Default)]
pub struct EngineQuery {
    pub params: BTreeMap<String, Vec<Value>>,
}

/// The external AI query engine contract (§6.4). Implementations are
/// supplied by the embedding application; this crate ships none.
#[async_trait]
pub trait AiEngine: Send + Sync {
    async fn run(&self, query: EngineQuery, sink: &dyn ChunkSink) -> anyhow::Result<EngineOutcome>;
}

/// Outbound port for recording a non-fatal AI failure against the owning
/// conversation (§9 — "cross-cutting callback" re-architected as a port).
/// The Conversation Manager implements this and wires it into every
/// `AiAdapter` it constructs.
#[async_trait]
pub trait FailureRecorder: Send + Sync {
    async fn record(&self, conversation_id: &str, kind: FailureKind, participant_id: &str, message_id: &str, error: &str);
}

/// Best-effort post-hoc persistence of a completed exchange (summary +
/// embedding in the source system this was distilled from). Failures here
/// must never affect the reply path (§4.E.7).
#[async_trait]
pub trait ExchangeStore: Send + Sync {
    async fn store_exchange(&self, conversation_id: &str, user_id: &str, query: &str, content: &[EngineContentItem]) -> anyhow::Result<()>;
}

/// Buffers every chunk (for reply synthesis) while forwarding it
/// immediately through the real sink — no buffering beyond what the sink
/// itself requires (§4.E.3).
struct RecordingSink<'a> {
    buffer: tokio::sync::Mutex<String>,
    forward: &'a dyn ChunkSink,
}

#[async_trait]
impl<'a> ChunkSink for RecordingSink<'a> {
    async fn send_chunk(&self, chunk: &str) {
        self.buffer.lock().await.push_str(chunk);
        self.forward.send_chunk(chunk).await;
    }
}

/// Wraps an `AiEngine` as a `ChatParticipant` (§4.D/§4.E).
pub struct AiAdapter {
    info: ParticipantInfo,
    engine: Arc<dyn AiEngine>,
    config: AiConfig,
    failure_recorder: Arc<dyn FailureRecorder>,
    exchange_store: Option<Arc<dyn ExchangeStore>>,
}

impl AiAdapter {
    pub fn new(
        info: ParticipantInfo,
        engine: Arc<dyn AiEngine>,
        config: AiConfig,
        failure_recorder: Arc<dyn FailureRecorder>,
        exchange_store: Option<Arc<dyn ExchangeStore>>,
    ) -> Self {
        Self { info, engine, config, failure_recorder, exchange_store }
    }

    /// Step 2 of §4.E — translate the bounded context plus the inbound
    /// message into the engine's loose query-params map. Previous queries
    /// are already a list (passed through as `prev`); every other scalar
    /// is wrapped in a singleton array, mirroring the source's
    /// list-wrap-everything-except-lists convention, generalized per §9.
    fn build_query(&self, message: &Message, context: &[ContextEntry]) -> EngineQuery {
        let mut params = BTreeMap::new();
        params.insert("query".to_string(), vec![Value::String(message.content.clone())]);
        params.insert("user_id".to_string(), vec![Value::String(message.sender.id.clone())]);
        params.insert("conversation_id".to_string(), vec![Value::String(message.conversation_id.clone())]);
        params.insert("streaming".to_string(), vec![Value::String("true".to_string())]);

        let prev: Vec<Value> = context
            .iter()
            .map(|e| {
                serde_json::json!({
                    "query": e.query_text,
                    "user_id": e.participant_id,
                    "timestamp": e.timestamp_iso,
                })
            })
            .collect();
        params.insert("prev".to_string(), prev);

        for (key, value) in &message.metadata {
            if matches!(key.as_str(), "query" | "user_id" | "conversation_id" | "streaming" | "prev") {
                continue;
            }
            let wrapped = match value {
                Value::Array(items) => items.clone(),
                other => vec![other.clone()],
            };
            params.insert(key.clone(), wrapped);
        }

        EngineQuery { params }
    }
}

#[async_trait]
impl ChatParticipant for AiAdapter {
    fn info(&self) -> ParticipantInfo {
        self.info.clone()
    }

    async fn process(&self, message: &Message, context: &[ContextEntry], stream_sink: &dyn ChunkSink) -> Option<Message> {
        let query = self.build_query(message, context);
        let recording = RecordingSink { buffer: tokio::sync::Mutex::new(String::new()), forward: stream_sink };

        let timeout = Duration::from_secs(self.config.timeout_seconds);
        let run = self.engine.run(query, &recording);

        let outcome = match tokio::time::timeout(timeout, run).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(err)) => {
                warn!(participant_id = %self.info.participant_id, message_id = %message.message_id, error = %err, "AI engine returned an error");
                self.failure_recorder.record(&message.conversation_id, FailureKind::AiError, &self.info.participant_id, &message.message_id, &err.to_string()).await;
                return None;
            }
            Err(_) => {
                warn!(participant_id = %self.info.participant_id, message_id = %message.message_id, timeout_seconds = self.config.timeout_seconds, "AI job timed out");
                self.failure_recorder.record(&message.conversation_id, FailureKind::AiTimeout, &self.info.participant_id, &message.message_id, "wall-clock timeout exceeded").await;
                return None;
            }
        };

        let produced: String = recording.buffer.lock().await.clone();

        if let Some(store) = &self.exchange_store {
            if !outcome.content.is_empty() {
                let store = store.clone();
                let conversation_id = message.conversation_id.clone();
                let user_id = message.sender.id.clone();
                let query_text = message.content.clone();
                let content = outcome.content.clone();
                tokio::spawn(async move {
                    if let Err(err) = store.store_exchange(&conversation_id, &user_id, &query_text, &content).await {
                        debug!(error = %err, "best-effort conversation-exchange store failed");
                    }
                });
            }
        }

        if produced.is_empty() {
            info!(participant_id = %self.info.participant_id, message_id = %message.message_id, "AI chose not to respond");
            return None;
        }

        Message::draft(
            uuid::Uuid::new_v4().to_string(),
            message.conversation_id.clone(),
            Sender { id: self.info.participant_id.clone(), display_name: self.info.display_name.clone(), kind: ParticipantKind::Ai },
            produced,
            MessageKind::AiResponse,
        )
        .ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{MessageKind, ParticipantKind, Sender};

    struct EchoEngine;
    #[async_trait]
    impl AiEngine for EchoEngine {
        async fn run(&self, query: EngineQuery, sink: &dyn ChunkSink) -> anyhow::Result<EngineOutcome> {
            let q = query.params.get("query").and_then(|v| v.first()).and_then(|v| v.as_str()).unwrap_or_default();
            sink.send_chunk(&format!("echo: {q}")).await;
            Ok(EngineOutcome { messages: vec![], content: vec![EngineContentItem { name: "r".into(), description: q.to_string() }] })
        }
    }

    struct SleepyEngine;
    #[async_trait]
    impl AiEngine for SleepyEngine {
        async fn run(&self, _query: EngineQuery, _sink: &dyn ChunkSink) -> anyhow::Result<EngineOutcome> {
            tokio::time::sleep(Duration::from_secs(25)).await;
            Ok(EngineOutcome::default())
        }
    }

    struct NoopSink;
    #[async_trait]
    impl ChunkSink for NoopSink {
        async fn send_chunk(&self, _chunk: &str) {}
    }

    struct RecordingFailures(std::sync::Mutex<Vec<FailureKind>>);
    #[async_trait]
    impl FailureRecorder for RecordingFailures {
        async fn record(&self, _conversation_id: &str, kind: FailureKind, _participant_id: &str, _message_id: &str, _error: &str) {
            self.0.lock().unwrap().push(kind);
        }
    }

    fn draft_message() -> Message {
        Message::draft(
            "m1",
            "c1",
            Sender { id: "alice".into(), display_name: "Alice".into(), kind: ParticipantKind::Human },
            "hello".into(),
            MessageKind::Text,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn produces_a_reply_and_forwards_chunks() {
        let failures = Arc::new(RecordingFailures(std::sync::Mutex::new(Vec::new())));
        let adapter = AiAdapter::new(
            ParticipantInfo::ai("ai", "Assistant"),
            Arc::new(EchoEngine),
            AiConfig { timeout_seconds: 5, human_messages_context: 5, nlweb_messages_context: 1 },
            failures.clone(),
            None,
        );
        let msg = draft_message();
        let reply = adapter.process(&msg, &[], &NoopSink).await;
        assert!(reply.is_some());
        assert_eq!(reply.unwrap().content, "echo: hello");
        assert!(failures.0.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn timeout_produces_no_reply_and_records_a_failure() {
        let failures = Arc::new(RecordingFailures(std::sync::Mutex::new(Vec::new())));
        let adapter = AiAdapter::new(
            ParticipantInfo::ai("ai", "Assistant"),
            Arc::new(SleepyEngine),
            AiConfig { timeout_seconds: 1, human_messages_context: 5, nlweb_messages_context: 1 },
            failures.clone(),
            None,
        );
        let msg = draft_message();
        let reply = adapter.process(&msg, &[], &NoopSink).await;
        assert!(reply.is_none());
        assert_eq!(failures.0.lock().unwrap().as_slice(), [FailureKind::AiTimeout]);
    }
}
