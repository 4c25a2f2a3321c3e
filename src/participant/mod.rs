// src/participant/mod.rs
// Participant abstraction (§4.D): identity plus the capability to receive
// context and optionally produce a reply. Kinds are a tagged variant
// (model::ParticipantKind) rather than a class hierarchy, so membership
// math (§4.F.1, P5) is by value, not by downcast.

pub mod human;

use async_trait::async_trait;

use crate::ai::context::ContextEntry;
use crate::model::{Message, Participant as ParticipantInfo};

/// A sink a participant implementation streams response chunks through as
/// they are produced, so the caller never buffers more than it needs to.
#[async_trait]
pub trait ChunkSink: Send + Sync {
    async fn send_chunk(&self, chunk: &str);
}

#[async_trait]
pub trait ChatParticipant: Send + Sync {
    fn info(&self) -> ParticipantInfo;

    /// Processes an inbound message with the given bounded context (§4.E.1)
    /// and an optional reply. Humans always return `None` — they produce
    /// messages only as ingress (§4.D).
    async fn process(
        &self,
        message: &Message,
        context: &[ContextEntry],
        stream_sink: &dyn ChunkSink,
    ) -> Option<Message>;
}

pub use human::HumanParticipant;
