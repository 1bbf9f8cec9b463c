pub mod execution;
pub mod run;

pub use execution::{ExecStatus, Execution};
pub use run::{Run, RunStatus};

/// An agent's structured output: the parsed contents of its signal file.
/// Always carries at least a string `status` once an execution completes.
pub type Signal = serde_json::Map<String, serde_json::Value>;
