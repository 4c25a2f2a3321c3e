// src/error.rs
// Core error taxonomy for the chat orchestration core.

use thiserror::Error;

/// Errors that can cross the public boundary of the Conversation Manager /
/// Lifecycle surface. Everything else (delivery failures, storage hiccups,
/// AI timeouts) is recovered locally and recorded in a conversation's
/// `failures` ring instead of bubbling up here.
#[derive(Debug, Error)]
pub enum ChatError {
    #[error("conversation {0} does not exist")]
    UnknownConversation(String),

    #[error("participant {0} is not known to the conversation")]
    UnknownSender(String),

    #[error("participant {0} is not a member of conversation {1}")]
    NotMember(String, String),

    #[error("participant {0} is already a member of conversation {1}")]
    AlreadyMember(String, String),

    #[error("conversation {0} is at capacity ({1}/{2})")]
    LimitExceeded(String, usize, usize),

    #[error("conversation {conversation_id} queue is full ({depth}/{limit})")]
    QueueFull {
        conversation_id: String,
        depth: usize,
        limit: usize,
    },

    #[error("message content exceeds the {0} codepoint limit")]
    ContentTooLong(usize),

    #[error("storage backend error: {0}")]
    Storage(#[from] crate::storage::StorageError),

    #[error("background task join error: {0}")]
    Join(#[from] tokio::task::JoinError),
}

pub type ChatResult<T> = Result<T, ChatError>;

/// Non-fatal failures accumulated in a conversation's bounded `failures`
/// ring. Never surfaced to a caller directly; observable only through the
/// conversation snapshot or metrics.
#[derive(Debug, Clone, serde::Serialize)]
pub struct RecordedFailure {
    pub participant_id: String,
    pub timestamp_ms: i64,
    pub error: String,
    pub message_id: Option<String>,
}

/// The narrow set of reasons a recorded (non-fatal) failure can occur,
/// kept distinct from `ChatError` so logging/metrics can categorize them
/// without string matching.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    Delivery,
    Storage,
    AiTimeout,
    AiError,
}

impl FailureKind {
    pub fn as_str(self) -> &'static str {
        match self {
            FailureKind::Delivery => "delivery_failure",
            FailureKind::Storage => "storage_error",
            FailureKind::AiTimeout => "ai_timeout",
            FailureKind::AiError => "ai_error",
        }
    }
}
