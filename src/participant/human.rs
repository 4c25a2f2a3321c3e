// src/participant/human.rs

use async_trait::async_trait;

use super::{ChatParticipant, ChunkSink};
use crate::ai::context::ContextEntry;
use crate::model::{Message, Participant as ParticipantInfo};

/// Identity and addressability only — a human has no server-side compute;
/// `process` never produces a reply.
pub struct HumanParticipant {
    info: ParticipantInfo,
}

impl HumanParticipant {
    pub fn new(info: ParticipantInfo) -> Self {
        Self { info }
    }
}

#[async_trait]
impl ChatParticipant for HumanParticipant {
    fn info(&self) -> ParticipantInfo {
        self.info.clone()
    }

    async fn process(&self, _message: &Message, _context: &[ContextEntry], _stream_sink: &dyn ChunkSink) -> Option<Message> {
        None
    }
}
