//! Reply generation.
//!
//! Each provider implements [`ReplyGenerator`]: given the ordered
//! conversation so far, return one assistant reply.

use async_trait::async_trait;

use talkback_core::types::ConversationTurn;

pub mod openai;
pub mod sse;

pub use openai::OpenAiChat;

/// A conversational text agent.
#[async_trait]
pub trait ReplyGenerator: Send + Sync {
    /// Provider identifier (e.g., "openai").
    fn id(&self) -> &str;

    /// Produce the next assistant reply for `turns`.
    ///
    /// One request per call; failures are returned, never retried here.
    async fn reply(&self, turns: &[ConversationTurn]) -> anyhow::Result<String>;
}
