//! Per-invocation conversation state.

use tracing::debug;

use talkback_core::types::{ConversationTurn, Role};
use talkback_media::CaptureGate;

use crate::TurnState;

/// Ordered history, the capture gate, and the current loop state.
///
/// Turns alternate user then assistant. A user turn whose reply fails is
/// removed again, so the history never holds two user turns in a row.
#[derive(Debug)]
pub struct ConversationSession {
    turns: Vec<ConversationTurn>,
    gate: CaptureGate,
    state: TurnState,
}

impl ConversationSession {
    pub fn new(gate: CaptureGate) -> Self {
        Self {
            turns: Vec::new(),
            gate,
            state: TurnState::Listening,
        }
    }

    pub fn turns(&self) -> &[ConversationTurn] {
        &self.turns
    }

    pub fn gate(&self) -> &CaptureGate {
        &self.gate
    }

    pub fn state(&self) -> TurnState {
        self.state
    }

    /// Number of user turns that received a reply.
    pub fn completed_turns(&self) -> usize {
        self.turns
            .iter()
            .filter(|t| t.role() == Role::Assistant)
            .count()
    }

    pub(crate) fn set_state(&mut self, next: TurnState) {
        if self.state != next {
            debug!(from = ?self.state, to = ?next, "Turn state");
            self.state = next;
        }
    }

    pub(crate) fn push_user(&mut self, text: impl Into<String>) {
        debug_assert!(
            self.turns.last().is_none_or(|t| t.role() == Role::Assistant),
            "user turn must follow an assistant turn"
        );
        self.turns.push(ConversationTurn::user(text));
    }

    pub(crate) fn push_assistant(&mut self, text: impl Into<String>) {
        debug_assert!(
            self.turns.last().is_some_and(|t| t.role() == Role::User),
            "assistant turn must answer a user turn"
        );
        self.turns.push(ConversationTurn::assistant(text));
    }

    /// Drop the trailing user turn left behind by a failed reply.
    pub(crate) fn discard_pending_user(&mut self) -> Option<ConversationTurn> {
        match self.turns.last() {
            Some(turn) if turn.role() == Role::User => self.turns.pop(),
            _ => None,
        }
    }
}
