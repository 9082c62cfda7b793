//! Per-session tracing span.

use std::time::Instant;

use tracing::{Level, Span, field, span};
use uuid::Uuid;

use crate::session::{SessionOutcome, SessionState};

/// Span covering one upstream session from dispatch to its terminal state.
pub struct SessionSpan {
    span: Span,
    start: Instant,
}

impl SessionSpan {
    pub fn new(session_id: Uuid, user_id: &str, model: &str, provider: &str) -> Self {
        let span = span!(
            Level::INFO,
            "proxy.session",
            session_id = %session_id,
            user_id = user_id,
            model = model,
            provider = provider,
            state = field::Empty,
            outcome = field::Empty,
            raw_tokens = field::Empty,
            duration_ms = field::Empty,
        );
        Self {
            span,
            start: Instant::now(),
        }
    }

    pub fn span(&self) -> &Span {
        &self.span
    }

    pub fn elapsed_ms(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }

    pub fn transition(&self, state: SessionState) {
        self.span.record("state", state.as_str());
        tracing::debug!(parent: &self.span, state = state.as_str(), elapsed_ms = self.elapsed_ms(), "Session state changed");
    }

    pub fn finish(&self, outcome: SessionOutcome, raw_tokens: u64) -> u64 {
        let duration_ms = self.elapsed_ms();
        self.span.record("outcome", outcome.as_str());
        self.span.record("raw_tokens", raw_tokens);
        self.span.record("duration_ms", duration_ms);
        duration_ms
    }
}
