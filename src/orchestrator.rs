use crate::agent::{kill_process_group, AgentRunner};
use crate::config::{Config, ConfigError};
use crate::engine::{Engine, EngineError, RunOutcome};
use crate::models::{ExecStatus, Execution, Run, RunStatus};
use crate::shared::{append_engine_log_line, now_secs};
use crate::storage::{Storage, StorageError};
use crate::workspace::{Workspace, WorkspaceError};
use std::path::{Path, PathBuf};

#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("config: {0}")]
    Config(#[from] ConfigError),
    #[error("storage: {0}")]
    Storage(#[from] StorageError),
    #[error("workspace: {0}")]
    Workspace(#[from] WorkspaceError),
    #[error("engine: {0}")]
    Engine(#[from] EngineError),
    #[error("run {run_id} is not waiting for a human (status: {status})")]
    NotWaiting { run_id: i64, status: RunStatus },
    #[error("run {run_id} has no resumable session recorded")]
    NoWaitingSession { run_id: i64 },
}

/// The boundary the CLI drives: owns the store, provisions workspaces,
/// and hands runs to the engine.
pub struct Orchestrator {
    config: Config,
    storage: Storage,
    runner: AgentRunner,
}

impl Orchestrator {
    pub fn new(config: Config) -> Result<Self, OrchestratorError> {
        let storage = Storage::open(&config.db_path)?;
        Ok(Self {
            config,
            storage,
            runner: AgentRunner::default(),
        })
    }

    pub fn with_runner(mut self, runner: AgentRunner) -> Self {
        self.runner = runner;
        self
    }

    pub fn runner(&self) -> &AgentRunner {
        &self.runner
    }

    /// Create the run row and its workspace. Execution is a separate
    /// step so callers can provision without running (`--no-exec`).
    pub fn start_run(
        &self,
        spec_path: &Path,
        spec_name: &str,
        prompt: &str,
        source_repo: Option<&Path>,
    ) -> Result<Run, OrchestratorError> {
        let mut run = Run {
            id: 0,
            created_at: now_secs(),
            completed_at: None,
            initial_prompt: prompt.to_string(),
            spec_name: spec_name.to_string(),
            spec_path: spec_path.display().to_string(),
            workspace_path: String::new(),
            status: RunStatus::Pending,
            current_agent: String::new(),
            error: String::new(),
            waiting_reason: String::new(),
            waiting_session_id: String::new(),
        };
        run.id = self.storage.create_run(&run)?;

        let workspace = Workspace::create(&self.config.workspaces_dir(), run.id, source_repo)?;
        run.workspace_path = workspace.path.display().to_string();
        self.storage.update_run(&run)?;

        workspace.init_context(spec_name, prompt)?;

        Ok(run)
    }

    /// Execute the run's script from the top. Already-satisfied calls
    /// replay from the log, so this is also the resume entry point once
    /// the run row is back in `running`.
    pub fn execute(&self, run_id: i64) -> Result<Run, OrchestratorError> {
        let mut run = self.storage.get_run(run_id)?;
        run.status = RunStatus::Running;
        self.storage.update_run(&run)?;
        self.drive(run)
    }

    /// Resume an interrupted or suspended run. The script re-executes
    /// from the top with every satisfied call replayed from the log, so
    /// resuming an unchanged completed run settles back into `complete`
    /// without appending records or invoking agents.
    pub fn resume(&self, run_id: i64) -> Result<Run, OrchestratorError> {
        let mut run = self.storage.get_run(run_id)?;
        run.status = RunStatus::Running;
        run.completed_at = None;
        run.error = String::new();
        run.waiting_reason = String::new();
        run.waiting_session_id = String::new();
        self.storage.update_run(&run)?;
        self.drive(run)
    }

    fn drive(&self, run: Run) -> Result<Run, OrchestratorError> {
        let run_id = run.id;
        let workspace = Workspace::open(&self.config.workspaces_dir(), run_id)?;
        let engine = Engine::new(self.storage.clone(), workspace, run)
            .with_runner(self.runner.clone());

        let outcome = engine.execute();
        self.flush_logs(run_id, &engine.logs());
        let _: RunOutcome = outcome?;

        Ok(self.storage.get_run(run_id)?)
    }

    fn flush_logs(&self, run_id: i64, logs: &[String]) {
        let now = now_secs();
        for line in logs {
            let _ = append_engine_log_line(
                &self.config.data_dir,
                &format!("ts={now} run_id={run_id} {line}"),
            );
        }
    }

    pub fn get_run(&self, run_id: i64) -> Result<Run, OrchestratorError> {
        Ok(self.storage.get_run(run_id)?)
    }

    pub fn list_runs(&self, limit: i64) -> Result<Vec<Run>, OrchestratorError> {
        Ok(self.storage.list_runs(limit)?)
    }

    pub fn executions_for_run(&self, run_id: i64) -> Result<Vec<Execution>, OrchestratorError> {
        Ok(self.storage.executions_for_run(run_id)?)
    }

    /// Kill the live agent's whole process group, then fail both records.
    /// The engine host process may itself already be dead; everything
    /// here works from persisted state alone.
    pub fn kill_run(&self, run_id: i64) -> Result<(), OrchestratorError> {
        let mut run = self.storage.get_run(run_id)?;

        let running = self
            .storage
            .executions_for_run(run_id)?
            .into_iter()
            .find(|exec| exec.status == ExecStatus::Running);
        if let Some(mut exec) = running {
            if let Some(pid) = exec.pid {
                kill_process_group(pid);
            }
            self.storage.mark_execution_failed(&mut exec, now_secs())?;
        }

        run.status = RunStatus::Failed;
        run.completed_at = Some(now_secs());
        self.storage.update_run(&run)?;
        Ok(())
    }

    /// Give up on a waiting run: the waiting execution fails and the run
    /// goes to `stuck` with the operator's reason.
    pub fn stop_run(&self, run_id: i64, reason: &str) -> Result<(), OrchestratorError> {
        let mut run = self.storage.get_run(run_id)?;
        if run.status != RunStatus::WaitingHuman {
            return Err(OrchestratorError::NotWaiting {
                run_id,
                status: run.status,
            });
        }

        if let Some(mut exec) = self.storage.running_execution_for_run(run_id)? {
            self.storage.mark_execution_failed(&mut exec, now_secs())?;
        }

        run.status = RunStatus::Stuck;
        run.completed_at = Some(now_secs());
        run.error = if reason.is_empty() {
            "stopped while waiting for human".to_string()
        } else {
            reason.to_string()
        };
        self.storage.update_run(&run)?;
        Ok(())
    }

    /// Resolve the interactive session a human should rejoin for a
    /// waiting run. The caller owns actually spawning it.
    pub fn continue_run(&self, run_id: i64) -> Result<(String, PathBuf), OrchestratorError> {
        let run = self.storage.get_run(run_id)?;
        if run.status != RunStatus::WaitingHuman {
            return Err(OrchestratorError::NotWaiting {
                run_id,
                status: run.status,
            });
        }
        if run.waiting_session_id.is_empty() {
            return Err(OrchestratorError::NoWaitingSession { run_id });
        }

        let workspace = Workspace::open(&self.config.workspaces_dir(), run_id)?;
        Ok((run.waiting_session_id, workspace.repo_path))
    }

    /// Tear a run down completely: worktree registration, workspace
    /// subtree, then the database rows.
    pub fn delete_run(&self, run_id: i64) -> Result<(), OrchestratorError> {
        let run = self.storage.get_run(run_id)?;

        if !run.workspace_path.is_empty() {
            let path = PathBuf::from(&run.workspace_path);
            let workspace = Workspace {
                repo_path: path.join("repo"),
                path,
            };
            workspace.destroy()?;
        }

        self.storage.delete_run(run_id)?;
        Ok(())
    }
}
