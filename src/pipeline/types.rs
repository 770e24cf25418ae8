//! Shared types for the processing pipeline.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ── Run state ───────────────────────────────────────────────────────

/// Where a run is in its lifecycle. The final value is stored in the report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Idle,
    Fetching,
    Classifying,
    Organizing,
    /// Every candidate was attempted.
    Completed,
    /// Stopped early at the budget; not an error.
    TimedOut,
    /// Fetching failed; the run returned early with the error recorded.
    FatalError,
}

impl RunState {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Fetching => "fetching",
            Self::Classifying => "classifying",
            Self::Organizing => "organizing",
            Self::Completed => "completed",
            Self::TimedOut => "timed_out",
            Self::FatalError => "fatal_error",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::TimedOut | Self::FatalError)
    }
}

// ── Report ──────────────────────────────────────────────────────────

/// Summary of one pipeline run.
///
/// `processed_emails <= total_emails` always holds, and
/// `remaining_emails == total_emails - processed_emails` once the run ends.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessingReport {
    pub run_id: Uuid,
    pub total_emails: usize,
    pub processed_emails: usize,
    pub needs_reply_count: usize,
    pub business_count: usize,
    pub errors: Vec<String>,
    pub timeout_reached: bool,
    pub remaining_emails: usize,
    pub state: RunState,
    pub duration_ms: u64,
}

impl ProcessingReport {
    pub fn new() -> Self {
        Self {
            run_id: Uuid::new_v4(),
            total_emails: 0,
            processed_emails: 0,
            needs_reply_count: 0,
            business_count: 0,
            errors: Vec::new(),
            timeout_reached: false,
            remaining_emails: 0,
            state: RunState::Idle,
            duration_ms: 0,
        }
    }

    /// Whether the run hit a fatal error.
    pub fn is_fatal(&self) -> bool {
        self.state == RunState::FatalError
    }

    /// Settle the derived counters and the terminal state.
    pub(crate) fn finish(&mut self, state: RunState, duration_ms: u64) {
        debug_assert!(state.is_terminal());
        self.state = state;
        self.remaining_emails = self.total_emails.saturating_sub(self.processed_emails);
        self.duration_ms = duration_ms;
    }
}

impl Default for ProcessingReport {
    fn default() -> Self {
        Self::new()
    }
}
