use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Complete,
    Failed,
    Stuck,
    WaitingHuman,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Pending => "pending",
            RunStatus::Running => "running",
            RunStatus::Complete => "complete",
            RunStatus::Failed => "failed",
            RunStatus::Stuck => "stuck",
            RunStatus::WaitingHuman => "waiting_human",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "pending" => Some(RunStatus::Pending),
            "running" => Some(RunStatus::Running),
            "complete" => Some(RunStatus::Complete),
            "failed" => Some(RunStatus::Failed),
            "stuck" => Some(RunStatus::Stuck),
            "waiting_human" => Some(RunStatus::WaitingHuman),
            _ => None,
        }
    }

    /// Terminal states carry a completion timestamp and accept no further
    /// executions. `failed` is terminal too but may be retried via an
    /// explicit resume.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RunStatus::Complete | RunStatus::Failed | RunStatus::Stuck
        )
    }

    pub fn is_active(self) -> bool {
        matches!(
            self,
            RunStatus::Pending | RunStatus::Running | RunStatus::WaitingHuman
        )
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One end-to-end execution of a workflow script against an initial
/// prompt. Owned and mutated exclusively by the engine; deletion is an
/// external operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Run {
    pub id: i64,
    pub created_at: i64,
    pub completed_at: Option<i64>,
    pub initial_prompt: String,
    pub spec_name: String,
    pub spec_path: String,
    pub workspace_path: String,
    pub status: RunStatus,
    pub current_agent: String,
    pub error: String,
    pub waiting_reason: String,
    pub waiting_session_id: String,
}
