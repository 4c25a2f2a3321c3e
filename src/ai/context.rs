// src/ai/context.rs
// Context builder (§4.E.1, P7 context purity). Grounded on the
// "last N human queries, identity preserved" window the AI participant
// was originally handed, generalized to also retain recent AI responses.

use crate::config::AiConfig;
use crate::model::{Message, MessageKind, ParticipantKind};

#[derive(Debug, Clone, serde::Serialize)]
pub struct ContextEntry {
    pub query_text: String,
    pub participant_id: String,
    pub timestamp_iso: String,
}

/// Builds the bounded multi-human context handed to an AI participant.
/// Context always includes messages from *every* human participant (never
/// filtered by sender identity) and never contains the triggering message
/// itself (P7).
pub struct ContextBuilder {
    human_messages_context: usize,
    ai_messages_context: usize,
}

impl ContextBuilder {
    pub fn new(config: &AiConfig) -> Self {
        Self {
            human_messages_context: config.human_messages_context,
            ai_messages_context: config.nlweb_messages_context,
        }
    }

    pub fn build(&self, history: &[Message], current_message: &Message) -> Vec<ContextEntry> {
        let humans: Vec<ContextEntry> = history
            .iter()
            .filter(|m| m.sender.kind == ParticipantKind::Human && m.message_id != current_message.message_id)
            .rev()
            .take(self.human_messages_context)
            .map(to_entry)
            .collect();

        let ai_responses: Vec<ContextEntry> = history
            .iter()
            .filter(|m| m.kind == MessageKind::AiResponse && m.message_id != current_message.message_id)
            .rev()
            .take(self.ai_messages_context)
            .map(to_entry)
            .collect();

        let mut entries: Vec<ContextEntry> = humans.into_iter().rev().collect();
        entries.extend(ai_responses.into_iter().rev());
        entries
    }
}

fn to_entry(m: &Message) -> ContextEntry {
    ContextEntry {
        query_text: m.content.clone(),
        participant_id: m.sender.id.clone(),
        timestamp_iso: m.timestamp.to_rfc3339(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{MessageStatus, Sender};

    fn human_msg(id: &str, sender_id: &str, content: &str) -> Message {
        Message {
            message_id: id.to_string(),
            conversation_id: "c1".to_string(),
            sequence_id: 1,
            sender: Sender { id: sender_id.to_string(), display_name: sender_id.to_string(), kind: ParticipantKind::Human },
            content: content.to_string(),
            kind: MessageKind::Text,
            timestamp: chrono::Utc::now(),
            status: MessageStatus::Delivered,
            metadata: Default::default(),
        }
    }

    #[test]
    fn excludes_the_triggering_message_and_preserves_identity() {
        let config = AiConfig { timeout_seconds: 20, human_messages_context: 5, nlweb_messages_context: 1 };
        let builder = ContextBuilder::new(&config);
        let m1 = human_msg("m1", "alice", "hello from alice");
        let m2 = human_msg("m2", "bob", "hello from bob");
        let current = human_msg("m3", "alice", "trigger");
        let history = vec![m1.clone(), m2.clone(), current.clone()];

        let entries = builder.build(&history, &current);
        assert!(entries.iter().all(|e| e.query_text != current.content));
        assert!(entries.iter().any(|e| e.participant_id == "alice"));
        assert!(entries.iter().any(|e| e.participant_id == "bob"));
    }
}
