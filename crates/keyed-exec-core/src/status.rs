use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle of a key's worker.
///
/// `Ready` only exists before the first drain cycle. `Completed` and
/// `Aborted` end a cycle; a later submission moves the key back to `Started`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    /// Key registered, worker never started
    Ready,
    /// Worker spawned, not yet draining
    Started,
    /// Worker is draining the queue
    Executing,
    /// Queue drained normally
    Completed,
    /// Drain cycle cancelled by `terminate`
    Aborted,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Ready => "ready",
            ExecutionStatus::Started => "started",
            ExecutionStatus::Executing => "executing",
            ExecutionStatus::Completed => "completed",
            ExecutionStatus::Aborted => "aborted",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "ready" => Some(ExecutionStatus::Ready),
            "started" => Some(ExecutionStatus::Started),
            "executing" => Some(ExecutionStatus::Executing),
            "completed" => Some(ExecutionStatus::Completed),
            "aborted" => Some(ExecutionStatus::Aborted),
            _ => None,
        }
    }

    /// True for the two states that end a drain cycle.
    pub fn is_finished(&self) -> bool {
        matches!(self, ExecutionStatus::Completed | ExecutionStatus::Aborted)
    }

    /// True while a worker owns the key.
    pub fn is_running(&self) -> bool {
        matches!(self, ExecutionStatus::Started | ExecutionStatus::Executing)
    }
}

impl Default for ExecutionStatus {
    fn default() -> Self {
        ExecutionStatus::Ready
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
