//! Record state machine.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Lifecycle state of a record.
///
/// State transitions:
/// - Queued -> Processing (dequeue)
/// - Processing -> Completed (mark complete)
/// - Processing -> Failed (mark failed)
/// - Processing -> Queued (reset, reset budget left)
/// - Processing -> Errored (reset, reset budget exhausted)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordState {
    /// Waiting to be claimed.
    Queued,

    /// Leased to exactly one worker.
    Processing,

    /// Handler finished successfully.
    Completed,

    /// Reset too many times; needs an operator.
    Errored,

    /// Handler reported a failure.
    Failed,
}

impl RecordState {
    /// Is this a terminal state (no further store-driven transitions)?
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RecordState::Completed | RecordState::Errored | RecordState::Failed
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RecordState::Queued => "queued",
            RecordState::Processing => "processing",
            RecordState::Completed => "completed",
            RecordState::Errored => "errored",
            RecordState::Failed => "failed",
        }
    }
}

impl fmt::Display for RecordState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
