// src/wire.rs
// Wire protocol (§6.1). Each frame is a JSON object tagged by `type`; the
// outbound "message" frame reuses the full `Message` record verbatim
// rather than a parallel DTO, since `Message` already derives `Serialize`.

use serde::{Deserialize, Serialize};

use crate::model::{ConversationMode, Message, Participant};

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    Message {
        content: String,
        #[serde(default)]
        sites: Option<Vec<String>>,
        #[serde(default)]
        mode: Option<String>,
        #[serde(default)]
        metadata: Option<serde_json::Value>,
    },
    Ping,
}

#[derive(Debug, Clone, Serialize)]
pub struct ParticipantSnapshot {
    #[serde(flatten)]
    pub participant: Participant,
    pub is_online: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    Connected {
        conversation_id: String,
        participant_id: String,
        mode: ConversationMode,
        input_timeout: u64,
    },
    Message {
        #[serde(flatten)]
        message: Message,
    },
    MessageAck {
        message_id: String,
        sequence_id: u64,
    },
    ModeChange {
        conversation_id: String,
        mode: ConversationMode,
        input_timeout: u64,
        timestamp: i64,
    },
    ParticipantJoined {
        conversation_id: String,
        participant: Participant,
        participant_count: usize,
        timestamp: i64,
    },
    ParticipantLeft {
        conversation_id: String,
        participant: Participant,
        participant_count: usize,
        timestamp: i64,
    },
    ParticipantList {
        participants: Vec<ParticipantSnapshot>,
    },
    /// Live partial output from an in-flight AI job (§4.E.3). Not part of
    /// the persisted message log — only the final `Message` frame is.
    StreamChunk {
        conversation_id: String,
        participant_id: String,
        chunk: String,
    },
    Pong,
    Error {
        error: String,
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        code: Option<i32>,
    },
}

impl ServerFrame {
    /// Error codes enumerated in §6.1.
    pub fn error(code_name: &str, message: impl Into<String>, http_like_code: Option<i32>) -> Self {
        ServerFrame::Error { error: code_name.to_string(), message: message.into(), code: http_like_code }
    }

    pub fn queue_full(message: impl Into<String>) -> Self {
        Self::error("queue_full", message, Some(429))
    }

    pub fn invalid_json(message: impl Into<String>) -> Self {
        Self::error("invalid_json", message, None)
    }

    pub fn processing_error(message: impl Into<String>) -> Self {
        Self::error("processing_error", message, None)
    }

    pub fn unknown_conversation(message: impl Into<String>) -> Self {
        Self::error("unknown_conversation", message, None)
    }

    pub fn not_member(message: impl Into<String>) -> Self {
        Self::error("not_member", message, None)
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{\"type\":\"error\",\"error\":\"processing_error\",\"message\":\"serialization failure\"}".to_string())
    }
}
