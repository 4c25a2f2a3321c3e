// src/connection/mod.rs
// Connection Manager (§4.G): maps conversations to active bidirectional
// channels and delivers broadcasts, excluding senders, enforcing a
// one-channel-per-participant cap. The transport itself (WebSocket framing)
// is out of scope (§1); this module only depends on the narrow
// `OutboundChannel` port, which `api::ws` implements.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::warn;

use crate::config::ConnectionConfig;

/// A single addressable send-side channel to one participant. Closing is
/// fire-and-forget; a failed send never closes the channel itself (§5).
#[async_trait]
pub trait OutboundChannel: Send + Sync {
    async fn send(&self, payload: String) -> anyhow::Result<()>;
    fn close(&self);
}

#[derive(Debug, Clone, Copy)]
pub struct BroadcastFailure<'a> {
    pub participant_id: &'a str,
    pub reason: BroadcastFailureReason,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BroadcastFailureReason {
    SendTimeout,
    SendError,
}

struct ConversationConnections {
    channels: HashMap<String, Arc<dyn OutboundChannel>>,
}

impl ConversationConnections {
    fn new() -> Self {
        Self { channels: HashMap::new() }
    }
}

pub struct ConnectionManager {
    config: ConnectionConfig,
    conversations: Mutex<HashMap<String, ConversationConnections>>,
}

impl ConnectionManager {
    pub fn new(config: ConnectionConfig) -> Self {
        Self { config, conversations: Mutex::new(HashMap::new()) }
    }

    /// Registers a channel for `participant_id` in `conversation_id`. A cap
    /// of one channel per human participant is enforced by evicting (and
    /// closing) any prior channel for the same participant.
    pub fn add_connection(&self, conversation_id: &str, participant_id: &str, channel: Arc<dyn OutboundChannel>) {
        let mut conversations = self.conversations.lock();
        let entry = conversations.entry(conversation_id.to_string()).or_insert_with(ConversationConnections::new);
        if let Some(previous) = entry.channels.insert(participant_id.to_string(), channel) {
            previous.close();
        }
    }

    pub fn remove_connection(&self, conversation_id: &str, participant_id: &str) {
        let mut conversations = self.conversations.lock();
        if let Some(entry) = conversations.get_mut(conversation_id) {
            if let Some(channel) = entry.channels.remove(participant_id) {
                channel.close();
            }
            if entry.channels.is_empty() {
                conversations.remove(conversation_id);
            }
        }
    }

    pub fn connection_count(&self, conversation_id: &str) -> usize {
        self.conversations.lock().get(conversation_id).map(|c| c.channels.len()).unwrap_or(0)
    }

    fn snapshot(&self, conversation_id: &str) -> Vec<(String, Arc<dyn OutboundChannel>)> {
        self.conversations
            .lock()
            .get(conversation_id)
            .map(|c| c.channels.iter().map(|(id, ch)| (id.clone(), ch.clone())).collect())
            .unwrap_or_default()
    }

    /// §4.G broadcast_message — serializes once (the caller passes an
    /// already-serialized payload), delivers to every channel except
    /// `exclude_sender`, and returns per-channel failures for the caller
    /// to record in the conversation's `failures` ring (never fatal here).
    pub async fn broadcast_message(&self, conversation_id: &str, payload: String, exclude_sender: Option<&str>) -> Vec<(String, BroadcastFailureReason)> {
        let targets = self.snapshot(conversation_id);
        let mut failures = Vec::new();
        let deadline = Duration::from_millis(self.config.channel_send_timeout_ms);
        for (participant_id, channel) in targets {
            if exclude_sender == Some(participant_id.as_str()) {
                continue;
            }
            match tokio::time::timeout(deadline, channel.send(payload.clone())).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    warn!(conversation_id, participant_id = %participant_id, error = %err, "channel send failed");
                    failures.push((participant_id, BroadcastFailureReason::SendError));
                }
                Err(_) => {
                    warn!(conversation_id, participant_id = %participant_id, "channel send deadline exceeded");
                    failures.push((participant_id, BroadcastFailureReason::SendTimeout));
                }
            }
        }
        failures
    }

    pub async fn broadcast_to_conversation(&self, conversation_id: &str, payload: String) -> Vec<(String, BroadcastFailureReason)> {
        self.broadcast_message(conversation_id, payload, None).await
    }

    pub async fn send_to(&self, conversation_id: &str, participant_id: &str, payload: String) -> Result<(), BroadcastFailureReason> {
        let channel = {
            let conversations = self.conversations.lock();
            conversations.get(conversation_id).and_then(|c| c.channels.get(participant_id)).cloned()
        };
        let Some(channel) = channel else {
            return Err(BroadcastFailureReason::SendError);
        };
        let deadline = Duration::from_millis(self.config.channel_send_timeout_ms);
        match tokio::time::timeout(deadline, channel.send(payload)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(BroadcastFailureReason::SendError),
            Err(_) => Err(BroadcastFailureReason::SendTimeout),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct RecordingChannel {
        received: Arc<Mutex<Vec<String>>>,
        fail: bool,
    }

    #[async_trait]
    impl OutboundChannel for RecordingChannel {
        async fn send(&self, payload: String) -> anyhow::Result<()> {
            if self.fail {
                anyhow::bail!("boom");
            }
            self.received.lock().push(payload);
            Ok(())
        }
        fn close(&self) {}
    }

    fn config() -> ConnectionConfig {
        ConnectionConfig { channel_send_timeout_ms: 1000, channel_send_buffer: 16 }
    }

    #[tokio::test]
    async fn excludes_the_sender_from_broadcast() {
        let manager = ConnectionManager::new(config());
        let alice_received = Arc::new(Mutex::new(Vec::new()));
        let bob_received = Arc::new(Mutex::new(Vec::new()));
        manager.add_connection("c1", "alice", Arc::new(RecordingChannel { received: alice_received.clone(), fail: false }));
        manager.add_connection("c1", "bob", Arc::new(RecordingChannel { received: bob_received.clone(), fail: false }));

        let failures = manager.broadcast_message("c1", "hello".to_string(), Some("alice")).await;
        assert!(failures.is_empty());
        assert!(alice_received.lock().is_empty());
        assert_eq!(bob_received.lock().as_slice(), ["hello".to_string()]);
    }

    #[tokio::test]
    async fn a_second_connection_for_the_same_participant_evicts_the_first() {
        let manager = ConnectionManager::new(config());
        let closed = Arc::new(AtomicUsize::new(0));

        struct ClosableChannel(Arc<AtomicUsize>);
        #[async_trait]
        impl OutboundChannel for ClosableChannel {
            async fn send(&self, _payload: String) -> anyhow::Result<()> { Ok(()) }
            fn close(&self) { self.0.fetch_add(1, Ordering::SeqCst); }
        }

        manager.add_connection("c1", "alice", Arc::new(ClosableChannel(closed.clone())));
        manager.add_connection("c1", "alice", Arc::new(ClosableChannel(closed.clone())));
        assert_eq!(closed.load(Ordering::SeqCst), 1);
        assert_eq!(manager.connection_count("c1"), 1);
    }

    #[tokio::test]
    async fn a_failed_send_is_recorded_but_does_not_abort_the_broadcast() {
        let manager = ConnectionManager::new(config());
        let bob_received = Arc::new(Mutex::new(Vec::new()));
        manager.add_connection("c1", "alice", Arc::new(RecordingChannel { received: Arc::new(Mutex::new(Vec::new())), fail: true }));
        manager.add_connection("c1", "bob", Arc::new(RecordingChannel { received: bob_received.clone(), fail: false }));

        let failures = manager.broadcast_to_conversation("c1", "hi".to_string()).await;
        assert_eq!(failures.len(), 1);
        assert_eq!(bob_received.lock().as_slice(), ["hi".to_string()]);
    }
}
