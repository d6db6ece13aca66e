//! Conversation runtime: drives the listen, reply, speak loop.
//!
//! The orchestrator consumes finalized transcripts, asks a
//! [`ReplyGenerator`](talkback_providers::ReplyGenerator) for a reply, plays
//! it through a [`SpeechSynthesizer`](talkback_media::SpeechSynthesizer) and
//! keeps capture muted for the whole span so the assistant never hears
//! itself.

use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

pub mod conversation;
pub mod session;

pub use conversation::{ConversationOptions, ConversationOrchestrator, TranscriptKind, classify};
pub use session::ConversationSession;

/// Orchestrator state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnState {
    Listening,
    ProcessingReply,
    Speaking,
    Ended,
}

/// A failure inside one turn. Always recovered by the loop.
#[derive(Debug, Error)]
pub enum TurnError {
    #[error("Reply generation failed: {0}")]
    Reply(anyhow::Error),

    #[error("Reply generation timed out after {0:?}")]
    ReplyTimeout(Duration),

    #[error("Speech synthesis failed: {0}")]
    Synthesis(anyhow::Error),

    #[error("Speech synthesis timed out after {0:?}")]
    SynthesisTimeout(Duration),

    #[error("Audio playback failed: {0}")]
    Playback(anyhow::Error),
}

impl TurnError {
    /// Short label for log fields.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Reply(_) => "reply",
            Self::ReplyTimeout(_) => "reply_timeout",
            Self::Synthesis(_) => "synthesis",
            Self::SynthesisTimeout(_) => "synthesis_timeout",
            Self::Playback(_) => "playback",
        }
    }
}

/// How a single accepted utterance ended.
#[derive(Debug)]
pub enum TurnOutcome {
    /// Reply appended and fully played. `chunks` is 0 for a blank reply.
    Completed { chunks: usize },
    /// No reply; the user turn was dropped from history.
    ReplyFailed(TurnError),
    /// Reply appended but playback stopped after `chunks` buffers.
    SpeechFailed { chunks: usize, error: TurnError },
}

impl TurnOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Completed { .. })
    }
}

/// Why [`ConversationOrchestrator::run`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionEnd {
    /// A transcript contained the exit keyword.
    ExitKeyword,
    /// The transcription stream finished on its own.
    StreamEnded,
    /// The transcription stream reported an error.
    StreamFailed,
}
