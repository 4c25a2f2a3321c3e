// src/model.rs
// Message / Participant / Conversation records. These double as the wire
// representation (see api::wire) rather than living behind a separate DTO
// layer, since they are immutable once sequenced.

use std::collections::{BTreeMap, HashSet, VecDeque};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::RecordedFailure;

pub const MAX_CONTENT_CODEPOINTS: usize = 10_000;
pub const FAILURES_RING_CAPACITY: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ParticipantKind {
    Human,
    Ai,
    System,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageKind {
    Text,
    System,
    AiResponse,
    Join,
    Leave,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum MessageStatus {
    Pending,
    Delivered,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationMode {
    Single,
    Multi,
}

impl ConversationMode {
    /// §4.F.1 — advisory-only, never used to gate server-side processing.
    pub fn input_timeout_ms(self, single_ms: u64, multi_ms: u64) -> u64 {
        match self {
            ConversationMode::Single => single_ms,
            ConversationMode::Multi => multi_ms,
        }
    }
}

/// `{ id, display_name, kind }` attached to every message and participant
/// record. Equality and set membership for participants are by `id` alone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sender {
    pub id: String,
    pub display_name: String,
    pub kind: ParticipantKind,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Participant {
    pub participant_id: String,
    pub display_name: String,
    pub kind: ParticipantKind,
    pub joined_at: DateTime<Utc>,
}

impl PartialEq for Participant {
    fn eq(&self, other: &Self) -> bool {
        self.participant_id == other.participant_id
    }
}
impl Eq for Participant {}

impl std::hash::Hash for Participant {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.participant_id.hash(state);
    }
}

impl Participant {
    pub fn human(id: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            participant_id: id.into(),
            display_name: display_name.into(),
            kind: ParticipantKind::Human,
            joined_at: Utc::now(),
        }
    }

    pub fn ai(id: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            participant_id: id.into(),
            display_name: display_name.into(),
            kind: ParticipantKind::Ai,
            joined_at: Utc::now(),
        }
    }

    pub fn sender(&self) -> Sender {
        Sender {
            id: self.participant_id.clone(),
            display_name: self.display_name.clone(),
            kind: self.kind,
        }
    }
}

/// Immutable once `sequence_id` is assigned (Invariant M1/M2).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub message_id: String,
    pub conversation_id: String,
    pub sequence_id: u64,
    pub sender: Sender,
    pub content: String,
    pub kind: MessageKind,
    pub timestamp: DateTime<Utc>,
    pub status: MessageStatus,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, serde_json::Value>,
}

impl Message {
    /// Builds an unsequenced draft (`sequence_id = 0` is a sentinel, never
    /// observable once `process_message` has run). Validates the content
    /// length per §3/§6.1.
    pub fn draft(
        message_id: impl Into<String>,
        conversation_id: impl Into<String>,
        sender: Sender,
        content: String,
        kind: MessageKind,
    ) -> Result<Self, crate::error::ChatError> {
        let len = content.chars().count();
        if len > MAX_CONTENT_CODEPOINTS {
            return Err(crate::error::ChatError::ContentTooLong(MAX_CONTENT_CODEPOINTS));
        }
        Ok(Self {
            message_id: message_id.into(),
            conversation_id: conversation_id.into(),
            sequence_id: 0,
            sender,
            content,
            kind,
            timestamp: Utc::now(),
            status: MessageStatus::Pending,
            metadata: BTreeMap::new(),
        })
    }
}

/// `(message_id, participant_id)` key for an in-flight AI job, ordered by
/// insertion so shedding (§4.F.3) can drop the oldest one.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AiJobKey {
    pub message_id: String,
    pub participant_id: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConversationMetadata {
    pub title: Option<String>,
    pub sites: Vec<String>,
    pub generation_mode: Option<String>,
    pub active: bool,
}

impl Default for ConversationMetadata {
    fn default() -> Self {
        Self {
            title: None,
            sites: Vec::new(),
            generation_mode: None,
            active: true,
        }
    }
}

/// The in-memory conversation record owned exclusively by the Conversation
/// Manager (§3 Ownership). `active_ai_jobs` preserves insertion order via
/// the accompanying `VecDeque` so shedding picks the oldest job.
pub struct Conversation {
    pub conversation_id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub participants: HashSet<Participant>,
    pub mode: ConversationMode,
    pub queue_depth: usize,
    pub active_ai_jobs: VecDeque<AiJobKey>,
    pub failures: VecDeque<RecordedFailure>,
    pub metadata: ConversationMetadata,
}

impl Conversation {
    pub fn new(conversation_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            conversation_id: conversation_id.into(),
            created_at: now,
            updated_at: now,
            participants: HashSet::new(),
            mode: ConversationMode::Single,
            queue_depth: 0,
            active_ai_jobs: VecDeque::new(),
            failures: VecDeque::new(),
            metadata: ConversationMetadata::default(),
        }
    }

    /// Invariant C1 — recomputed after every membership mutation.
    pub fn recompute_mode(&mut self) -> bool {
        let humans = self
            .participants
            .iter()
            .filter(|p| p.kind == ParticipantKind::Human)
            .count();
        let total = self.participants.len();
        let new_mode = if humans >= 2 || total >= 3 {
            ConversationMode::Multi
        } else {
            ConversationMode::Single
        };
        let changed = new_mode != self.mode;
        self.mode = new_mode;
        changed
    }

    pub fn record_failure(&mut self, kind: crate::error::FailureKind, participant_id: impl Into<String>, error: impl Into<String>, message_id: Option<String>) {
        if self.failures.len() >= FAILURES_RING_CAPACITY {
            self.failures.pop_front();
        }
        self.failures.push_back(RecordedFailure {
            participant_id: participant_id.into(),
            timestamp_ms: Utc::now().timestamp_millis(),
            error: format!("[{}] {}", kind.as_str(), error.into()),
            message_id,
        });
    }

    pub fn is_participant(&self, participant_id: &str) -> bool {
        self.participants.iter().any(|p| p.participant_id == participant_id)
    }
}
