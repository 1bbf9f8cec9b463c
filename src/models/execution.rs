use crate::models::Signal;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecStatus {
    Pending,
    Running,
    Complete,
    Failed,
    WaitingHuman,
}

impl ExecStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ExecStatus::Pending => "pending",
            ExecStatus::Running => "running",
            ExecStatus::Complete => "complete",
            ExecStatus::Failed => "failed",
            ExecStatus::WaitingHuman => "waiting_human",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "pending" => Some(ExecStatus::Pending),
            "running" => Some(ExecStatus::Running),
            "complete" => Some(ExecStatus::Complete),
            "failed" => Some(ExecStatus::Failed),
            "waiting_human" => Some(ExecStatus::WaitingHuman),
            _ => None,
        }
    }
}

impl std::fmt::Display for ExecStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One attempt to satisfy one `run()` call. `(run_id, call_index)` is the
/// memoization key; `sequence_num` is the per-run creation ordinal and
/// differs from the call index when divergence forces re-execution.
#[derive(Debug, Clone, PartialEq)]
pub struct Execution {
    pub id: i64,
    pub run_id: i64,
    pub agent_name: String,
    pub session_id: String,
    pub status: ExecStatus,
    pub exit_code: Option<i64>,
    pub started_at: Option<i64>,
    pub completed_at: Option<i64>,
    pub output_signal: Option<Signal>,
    pub sequence_num: i64,
    pub call_index: i64,
    pub prompt: String,
    pub pid: Option<i64>,
}

impl Execution {
    /// The stored signal's `status` field, when present.
    pub fn signal_status(&self) -> Option<&str> {
        self.output_signal
            .as_ref()
            .and_then(|signal| signal.get("status"))
            .and_then(|value| value.as_str())
    }
}
