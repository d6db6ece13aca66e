use std::time::Instant;

use serde::{Deserialize, Serialize};

/// Speaker of a conversation turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

/// One entry in the conversation history.
///
/// Fields are private so a turn cannot change after it has been appended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationTurn {
    role: Role,
    content: String,
}

impl ConversationTurn {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn content(&self) -> &str {
        &self.content
    }
}

/// A finalized transcript as delivered by the transcription stream.
#[derive(Debug, Clone)]
pub struct TranscriptEvent {
    pub text: String,
    /// When the transcript reached us. Used as the start of the
    /// end-of-speech to first-audio latency measurement.
    pub received_at: Instant,
}

impl TranscriptEvent {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            received_at: Instant::now(),
        }
    }

    /// True when the transcript carries no speech (empty or whitespace only).
    pub fn is_blank(&self) -> bool {
        self.text.trim().is_empty()
    }
}
