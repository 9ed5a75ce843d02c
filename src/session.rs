//! Per-user conversation state.
//!
//! A [`Session`] owns the turn history and the (at most one) extraction
//! awaiting human confirmation. It is a plain value passed to the
//! [`Orchestrator`](crate::pipeline::Orchestrator) by `&mut`, so exclusive
//! access, and with it strictly sequential processing, is enforced by the
//! borrow checker rather than by convention.
//!
//! ```text
//!            begin_image / begin_audio
//!   Idle ─────────────────────────────▶ AwaitingHitlConfirmation
//!    │  ▲                                  │        │
//!    │  │ turn finished                    │confirm │cancel
//!    │  │                                  ▼        ▼
//!    └──┴─ submit_text ──────────────▶ Processing   Idle
//! ```

use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

use crate::extract::ExtractError;
use crate::models::{ConversationTurn, PendingHitlEntry};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    AwaitingHitlConfirmation,
    Processing,
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("no extracted text is waiting for confirmation")]
    NoPendingExtraction,

    #[error("confirm or cancel the pending extraction first")]
    AwaitingConfirmation,

    #[error("input is empty")]
    EmptyInput,

    #[error("no turn at index {0}")]
    UnknownTurn(usize),

    #[error("turn {0} cannot be marked accurate")]
    FeedbackNotEligible(usize),

    #[error("failed to save to memory: {0}")]
    Memory(String),

    #[error(transparent)]
    Extract(#[from] ExtractError),
}

#[derive(Debug, Serialize)]
pub struct Session {
    id: Uuid,
    state: SessionState,
    pending: Option<PendingHitlEntry>,
    turns: Vec<ConversationTurn>,
}

impl Session {
    pub fn new() -> Self {
        Self {
            id: Uuid::new_v4(),
            state: SessionState::Idle,
            pending: None,
            turns: Vec::new(),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn pending(&self) -> Option<&PendingHitlEntry> {
        self.pending.as_ref()
    }

    pub fn turns(&self) -> &[ConversationTurn] {
        &self.turns
    }

    pub fn turn(&self, index: usize) -> Result<&ConversationTurn, SessionError> {
        self.turns.get(index).ok_or(SessionError::UnknownTurn(index))
    }

    pub(crate) fn turn_mut(&mut self, index: usize) -> Result<&mut ConversationTurn, SessionError> {
        self.turns.get_mut(index).ok_or(SessionError::UnknownTurn(index))
    }

    /// Append a turn and return its index.
    pub(crate) fn push(&mut self, turn: ConversationTurn) -> usize {
        self.turns.push(turn);
        self.turns.len() - 1
    }

    /// Drop any pending extraction ahead of a new one.
    pub(crate) fn discard_pending(&mut self) {
        if self.pending.take().is_some() {
            tracing::debug!(session = %self.id, "discarding previous pending extraction");
        }
        self.state = SessionState::Idle;
    }

    pub(crate) fn set_pending(&mut self, entry: PendingHitlEntry) {
        self.pending = Some(entry);
        self.state = SessionState::AwaitingHitlConfirmation;
    }

    /// Replace the extracted text with a human correction.
    pub fn edit_pending(&mut self, text: &str) -> Result<(), SessionError> {
        let pending = self.pending.as_mut().ok_or(SessionError::NoPendingExtraction)?;
        if pending.extracted_text != text {
            pending.extracted_text = text.to_string();
            pending.edited = true;
        }
        Ok(())
    }

    pub fn cancel_pending(&mut self) -> Result<PendingHitlEntry, SessionError> {
        let entry = self.pending.take().ok_or(SessionError::NoPendingExtraction)?;
        self.state = SessionState::Idle;
        Ok(entry)
    }

    /// Remove the confirmed entry and enter `Processing`. Blank text is
    /// rejected with the entry and state left untouched.
    pub(crate) fn take_pending(&mut self) -> Result<PendingHitlEntry, SessionError> {
        let pending = self.pending.as_ref().ok_or(SessionError::NoPendingExtraction)?;
        if pending.extracted_text.trim().is_empty() {
            return Err(SessionError::EmptyInput);
        }
        let entry = self.pending.take().ok_or(SessionError::NoPendingExtraction)?;
        self.state = SessionState::Processing;
        Ok(entry)
    }

    /// Enter `Processing` for a typed query.
    pub(crate) fn begin_text(&mut self) -> Result<(), SessionError> {
        if self.pending.is_some() {
            return Err(SessionError::AwaitingConfirmation);
        }
        self.state = SessionState::Processing;
        Ok(())
    }

    pub(crate) fn finish(&mut self) {
        self.state = SessionState::Idle;
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::MediaKind;

    fn entry(text: &str) -> PendingHitlEntry {
        PendingHitlEntry {
            kind: MediaKind::Image,
            raw_media: vec![1, 2, 3],
            extracted_text: text.to_string(),
            edited: false,
        }
    }

    #[test]
    fn test_new_session_is_idle() {
        let s = Session::new();
        assert_eq!(s.state(), SessionState::Idle);
        assert!(s.pending().is_none());
        assert!(s.turns().is_empty());
    }

    #[test]
    fn test_pending_blocks_text() {
        let mut s = Session::new();
        s.set_pending(entry("x + 1 = 2"));
        assert_eq!(s.state(), SessionState::AwaitingHitlConfirmation);
        assert!(matches!(s.begin_text(), Err(SessionError::AwaitingConfirmation)));
    }

    #[test]
    fn test_edit_marks_entry_edited() {
        let mut s = Session::new();
        s.set_pending(entry("x + l = 2"));
        s.edit_pending("x + 1 = 2").unwrap();
        let p = s.pending().unwrap();
        assert_eq!(p.extracted_text, "x + 1 = 2");
        assert!(p.edited);

        s.edit_pending("x + 1 = 2").unwrap();
        assert!(s.pending().unwrap().edited);
    }

    #[test]
    fn test_new_extraction_replaces_pending() {
        let mut s = Session::new();
        s.set_pending(entry("first"));
        s.discard_pending();
        s.set_pending(entry("second"));
        assert_eq!(s.pending().unwrap().extracted_text, "second");
    }

    #[test]
    fn test_take_and_cancel() {
        let mut s = Session::new();
        assert!(matches!(s.take_pending(), Err(SessionError::NoPendingExtraction)));
        assert!(matches!(s.edit_pending("x"), Err(SessionError::NoPendingExtraction)));

        s.set_pending(entry("a"));
        assert_eq!(s.take_pending().unwrap().extracted_text, "a");
        assert_eq!(s.state(), SessionState::Processing);
        s.finish();

        s.set_pending(entry("b"));
        s.cancel_pending().unwrap();
        assert_eq!(s.state(), SessionState::Idle);
        assert!(s.pending().is_none());
    }

    #[test]
    fn test_blank_confirmation_keeps_pending() {
        let mut s = Session::new();
        s.set_pending(entry("2x = 6"));
        s.edit_pending("   ").unwrap();
        assert!(matches!(s.take_pending(), Err(SessionError::EmptyInput)));
        assert_eq!(s.state(), SessionState::AwaitingHitlConfirmation);
        assert_eq!(s.pending().unwrap().raw_media, vec![1, 2, 3]);

        s.edit_pending("2x = 6").unwrap();
        assert_eq!(s.take_pending().unwrap().extracted_text, "2x = 6");
    }

    #[test]
    fn test_unknown_turn() {
        let mut s = Session::new();
        let i = s.push(ConversationTurn::user("hi"));
        assert_eq!(i, 0);
        assert!(s.turn(0).is_ok());
        assert!(matches!(s.turn(3), Err(SessionError::UnknownTurn(3))));
    }
}
