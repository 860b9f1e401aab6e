//! Import-job state, shared between the tracker and its callers.

use serde::{Deserialize, Serialize};

/// Lifecycle of the single background import slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImportState {
    Running,
    Done,
    Error,
    Cancelled,
}

/// Outcome of a finished import.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ImportResult {
    pub created: u64,
    pub skipped: u64,
}

/// Snapshot of the import slot. Every field is owned, so a clone is a deep
/// copy and callers can never reach back into tracker state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImportTask {
    pub state: ImportState,
    pub total: u64,
    pub current: u64,
    /// Feed currently being imported; cleared when the job leaves Running.
    pub feed_name: Option<String>,
    pub result: Option<ImportResult>,
    pub error: Option<String>,
}

impl ImportTask {
    #[must_use]
    pub fn running(total: u64) -> Self {
        Self {
            state: ImportState::Running,
            total,
            current: 0,
            feed_name: None,
            result: None,
            error: None,
        }
    }
}
