pub mod prompts;
pub mod sandbox;
pub mod value;

use crate::agent::{is_process_alive, kill_process_group, AgentRunner};
use crate::models::{ExecStatus, Execution, Run, RunStatus, Signal};
use crate::shared::now_secs;
use crate::storage::{Storage, StorageError};
use crate::workspace::{RunMetadata, Workspace, WorkspaceError};
use serde_json::Value;
use std::cell::RefCell;
use std::fs;
use std::rc::Rc;

/// Reserved agent name used by `pause()` checkpoints. Scripts cannot
/// collide with it: it is not a valid agent definition name.
pub const CHECKPOINT_AGENT: &str = "_checkpoint";

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("failed to read script {path}: {source}")]
    ReadScript {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to initialize script sandbox: {0}")]
    Sandbox(String),
    #[error("script must define a `workflow` function")]
    MissingWorkflowFunction,
    #[error("{0}")]
    Script(String),
    #[error("checkpoint agent failed: {0}")]
    Checkpoint(String),
    #[error("storage: {0}")]
    Storage(#[from] StorageError),
    #[error("workspace: {0}")]
    Workspace(#[from] WorkspaceError),
}

/// How one execution of the workflow script ended. Script failures are
/// reported through `EngineError::Script` instead, after the run has been
/// marked failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    Complete,
    Stuck { reason: String },
    WaitingHuman { reason: String, session_id: String },
}

#[derive(Debug, Clone)]
struct WaitingState {
    agent: String,
    reason: String,
    session_id: String,
}

struct EngineState {
    run: Run,
    call_index: i64,
    logs: Vec<String>,
    previous_agents: Vec<String>,
    stuck: Option<String>,
    waiting: Option<WaitingState>,
}

/// Failure channel for the injected API calls. `Waiting` is not a fault:
/// it unwinds the script so the suspension can be persisted.
enum CallError {
    Waiting { reason: String },
    Engine(EngineError),
}

impl CallError {
    fn engine(err: impl Into<EngineError>) -> Self {
        CallError::Engine(err.into())
    }

    fn raise(self) -> mlua::Error {
        match self {
            CallError::Waiting { reason } => {
                mlua::Error::RuntimeError(format!("waiting for human: {reason}"))
            }
            CallError::Engine(err) => mlua::Error::RuntimeError(err.to_string()),
        }
    }
}

impl From<StorageError> for CallError {
    fn from(err: StorageError) -> Self {
        CallError::Engine(EngineError::Storage(err))
    }
}

impl From<WorkspaceError> for CallError {
    fn from(err: WorkspaceError) -> Self {
        CallError::Engine(EngineError::Workspace(err))
    }
}

/// Executes one workflow script against one run, memoizing every
/// `run()`/`pause()` call through the execution log so that re-execution
/// replays history and only invokes agents for calls that have not yet
/// succeeded.
pub struct Engine {
    storage: Storage,
    workspace: Workspace,
    run: Run,
    runner: AgentRunner,
    collected_logs: RefCell<Vec<String>>,
}

struct EngineInner {
    storage: Storage,
    workspace: Workspace,
    runner: AgentRunner,
    state: RefCell<EngineState>,
}

impl Engine {
    /// The run must already be in `running` state; terminal bookkeeping
    /// happens here, resume bookkeeping at the orchestrator boundary.
    pub fn new(storage: Storage, workspace: Workspace, run: Run) -> Self {
        Self {
            storage,
            workspace,
            run,
            runner: AgentRunner::default(),
            collected_logs: RefCell::new(Vec::new()),
        }
    }

    pub fn with_runner(mut self, runner: AgentRunner) -> Self {
        self.runner = runner;
        self
    }

    /// Messages the script emitted via `log()`, plus engine warnings.
    /// Populated once `execute` returns.
    pub fn logs(&self) -> Vec<String> {
        self.collected_logs.borrow().clone()
    }

    /// Run the script's `workflow(prompt)` function to one of its four
    /// ends: normal return, `stuck()`, human suspension, or error. The
    /// run row reflects the outcome before this returns.
    pub fn execute(&self) -> Result<RunOutcome, EngineError> {
        let inner = Rc::new(EngineInner {
            storage: self.storage.clone(),
            workspace: self.workspace.clone(),
            runner: self.runner.clone(),
            state: RefCell::new(EngineState {
                run: self.run.clone(),
                call_index: 0,
                logs: Vec::new(),
                previous_agents: Vec::new(),
                stuck: None,
                waiting: None,
            }),
        });

        let result = execute_with(&inner);
        *self.collected_logs.borrow_mut() = inner.state.borrow().logs.clone();
        result
    }
}

fn execute_with(inner: &Rc<EngineInner>) -> Result<RunOutcome, EngineError> {
    let script_result = run_script(inner);

    let (stuck, waiting) = {
        let state = inner.state.borrow();
        (state.stuck.clone(), state.waiting.clone())
    };

    if let Some(reason) = stuck {
        inner.mark_run_stuck(&reason)?;
        return Ok(RunOutcome::Stuck { reason });
    }
    if let Some(waiting) = waiting {
        inner.mark_run_waiting(&waiting)?;
        return Ok(RunOutcome::WaitingHuman {
            reason: waiting.reason,
            session_id: waiting.session_id,
        });
    }

    match script_result {
        Ok(()) => {
            inner.mark_run_complete()?;
            Ok(RunOutcome::Complete)
        }
        Err(err) => {
            inner.mark_run_failed(&err.to_string())?;
            Err(err)
        }
    }
}

fn run_script(inner: &Rc<EngineInner>) -> Result<(), EngineError> {
    let (spec_path, initial_prompt) = {
        let state = inner.state.borrow();
        (
            state.run.spec_path.clone(),
            state.run.initial_prompt.clone(),
        )
    };

    let script = fs::read_to_string(&spec_path).map_err(|source| EngineError::ReadScript {
        path: spec_path.clone(),
        source,
    })?;

    let lua = sandbox::new_sandboxed_lua().map_err(|err| EngineError::Sandbox(err.to_string()))?;
    register_api(inner, &lua).map_err(|err| EngineError::Sandbox(err.to_string()))?;

    lua.load(script.as_str())
        .set_name(spec_path.as_str())
        .exec()
        .map_err(|err| EngineError::Script(format!("failed to load script: {err}")))?;

    let workflow: mlua::Value = lua
        .globals()
        .get("workflow")
        .map_err(|err| EngineError::Sandbox(err.to_string()))?;
    let mlua::Value::Function(workflow) = workflow else {
        return Err(EngineError::MissingWorkflowFunction);
    };

    workflow
        .call::<()>(initial_prompt)
        .map_err(|err| EngineError::Script(format!("workflow execution failed: {err}")))
}

fn register_api(inner: &Rc<EngineInner>, lua: &mlua::Lua) -> mlua::Result<()> {
    let globals = lua.globals();

    let handle = Rc::clone(inner);
    globals.set(
        "run",
        lua.create_function(move |lua, (agent, prompt): (String, Option<String>)| {
            let signal = handle
                .call_run(&agent, prompt.as_deref().unwrap_or(""))
                .map_err(CallError::raise)?;
            value::signal_to_table(lua, &signal)
        })?,
    )?;

    let handle = Rc::clone(inner);
    globals.set(
        "pause",
        lua.create_function(move |lua, message: String| {
            let signal = handle.call_pause(&message).map_err(CallError::raise)?;
            pause_result_table(lua, &signal)
        })?,
    )?;

    let handle = Rc::clone(inner);
    globals.set(
        "stuck",
        lua.create_function(move |_lua, reason: Option<String>| -> mlua::Result<()> {
            let reason = reason.unwrap_or_else(|| "workflow stuck".to_string());
            handle.state.borrow_mut().stuck = Some(reason.clone());
            Err(mlua::Error::RuntimeError(format!("stuck: {reason}")))
        })?,
    )?;

    let handle = Rc::clone(inner);
    globals.set(
        "context",
        lua.create_function(move |lua, ()| {
            let state = handle.state.borrow();
            let table = lua.create_table()?;
            table.set("run_id", state.run.id)?;
            table.set("repo", handle.workspace.repo_path.display().to_string())?;
            table.set("iteration", state.call_index)?;
            table.set("prompt", state.run.initial_prompt.as_str())?;
            Ok(table)
        })?,
    )?;

    let handle = Rc::clone(inner);
    globals.set(
        "log",
        lua.create_function(move |_lua, message: String| {
            handle.state.borrow_mut().logs.push(message);
            Ok(())
        })?,
    )?;

    Ok(())
}

impl EngineInner {
    fn advance_call_index(&self) -> i64 {
        let mut state = self.state.borrow_mut();
        state.call_index += 1;
        state.call_index
    }

    fn run_id(&self) -> i64 {
        self.state.borrow().run.id
    }

    fn remember_agent(&self, agent: &str) {
        if agent != CHECKPOINT_AGENT {
            self.state
                .borrow_mut()
                .previous_agents
                .push(agent.to_string());
        }
    }

    fn set_waiting(&self, agent: &str, reason: &str, session_id: &str) {
        let mut state = self.state.borrow_mut();
        state.run.current_agent = agent.to_string();
        state.waiting = Some(WaitingState {
            agent: agent.to_string(),
            reason: reason.to_string(),
            session_id: session_id.to_string(),
        });
    }

    /// The memoized `run(agent, prompt?)` call. Divergence is checked
    /// before any use of the cached record.
    fn call_run(&self, agent: &str, prompt: &str) -> Result<Signal, CallError> {
        let call_index = self.advance_call_index();
        let run_id = self.run_id();
        let existing = self.storage.execution_by_call_index(run_id, call_index)?;

        match existing {
            None => self.run_fresh(agent, prompt, call_index),
            Some(exec) if exec.agent_name != agent => {
                self.note_divergence(call_index, &exec.agent_name, agent);
                self.storage
                    .invalidate_executions_after(run_id, call_index - 1)?;
                self.run_fresh(agent, prompt, call_index)
            }
            Some(exec) => match exec.status {
                ExecStatus::Complete => {
                    let signal = exec
                        .output_signal
                        .clone()
                        .unwrap_or_else(|| error_signal("no signal in cache"));
                    self.remember_agent(&exec.agent_name);
                    Ok(signal)
                }
                ExecStatus::Failed | ExecStatus::Pending => {
                    self.run_agent(agent, prompt, exec, call_index)
                }
                ExecStatus::Running | ExecStatus::WaitingHuman => {
                    self.recover_execution(exec, call_index)
                }
            },
        }
    }

    /// Append a fresh pending record, then invoke the agent against it.
    fn run_fresh(&self, agent: &str, prompt: &str, call_index: i64) -> Result<Signal, CallError> {
        let run_id = self.run_id();
        let mut exec = Execution {
            id: 0,
            run_id,
            agent_name: agent.to_string(),
            session_id: String::new(),
            status: ExecStatus::Pending,
            exit_code: None,
            started_at: None,
            completed_at: None,
            output_signal: None,
            sequence_num: self.storage.next_sequence_num(run_id)?,
            call_index,
            prompt: prompt.to_string(),
            pid: None,
        };
        exec.id = self.storage.create_execution(&exec)?;
        self.run_agent(agent, prompt, exec, call_index)
    }

    /// Stage the workspace for an agent and transition its record to
    /// running.
    fn stage_agent(
        &self,
        agent: &str,
        call_index: i64,
        exec: &mut Execution,
    ) -> Result<(), CallError> {
        let run = {
            let mut state = self.state.borrow_mut();
            state.run.current_agent = agent.to_string();
            state.run.clone()
        };
        self.storage.update_run(&run)?;
        self.workspace.ensure_scratchpad(agent)?;

        let previous_agents = self.state.borrow().previous_agents.clone();
        self.workspace.write_run_metadata(&RunMetadata {
            run_id: run.id,
            spec_name: run.spec_name.clone(),
            initial_prompt: run.initial_prompt.clone(),
            current_agent: agent.to_string(),
            iteration: call_index,
            previous_agents,
        })?;

        exec.started_at = Some(now_secs());
        exec.status = ExecStatus::Running;
        self.storage.update_execution(exec)?;
        Ok(())
    }

    /// Invoke the agent for a staged record, then settle the record from
    /// the signal file. Launch failures and missing signals surface to
    /// the script as a synthetic `ERROR` signal; only `NEEDS_HUMAN`
    /// unwinds.
    fn run_agent(
        &self,
        agent: &str,
        prompt: &str,
        mut exec: Execution,
        call_index: i64,
    ) -> Result<Signal, CallError> {
        self.stage_agent(agent, call_index, &mut exec)?;

        let (spec_name, initial_prompt) = {
            let state = self.state.borrow();
            (
                state.run.spec_name.clone(),
                state.run.initial_prompt.clone(),
            )
        };
        let full_prompt =
            prompts::build_agent_prompt(agent, &spec_name, prompt, &initial_prompt, call_index);

        let exec_id = exec.id;
        let invocation =
            self.runner
                .invoke(&self.workspace.repo_path, agent, &full_prompt, &mut |pid| {
                    let _ = self.storage.update_execution_pid(exec_id, i64::from(pid));
                });
        let invocation = match invocation {
            Ok(invocation) => invocation,
            Err(err) => {
                self.storage.mark_execution_failed(&mut exec, now_secs())?;
                return Ok(error_signal(&format!("agent execution failed: {err}")));
            }
        };

        exec.session_id = invocation.session_id.clone();
        exec.exit_code = Some(invocation.exit_code);

        let signal = match self.workspace.read_signal(agent) {
            Ok(signal) => signal,
            Err(err) => {
                self.storage.mark_execution_failed(&mut exec, now_secs())?;
                return Ok(error_signal(&format!("no signal produced: {err}")));
            }
        };

        self.settle_signal(agent, signal, &invocation.session_id, exec)
    }

    /// Shared tail of the fresh-run and recovery paths: validate the
    /// signal, suspend on `NEEDS_HUMAN`, otherwise finalize and publish.
    fn settle_signal(
        &self,
        agent: &str,
        signal: Signal,
        session_id: &str,
        mut exec: Execution,
    ) -> Result<Signal, CallError> {
        let Some(status) = signal
            .get("status")
            .and_then(Value::as_str)
            .map(str::to_string)
        else {
            self.storage.mark_execution_failed(&mut exec, now_secs())?;
            return Ok(error_signal("signal missing status field"));
        };

        if status == "NEEDS_HUMAN" {
            let reason = signal
                .get("reason")
                .and_then(Value::as_str)
                .unwrap_or("Agent needs human input")
                .to_string();
            self.storage.mark_execution_waiting(&mut exec, session_id)?;
            self.set_waiting(agent, &reason, &exec.session_id);
            return Err(CallError::Waiting { reason });
        }

        let exit_code = exec.exit_code;
        self.storage
            .finalize_execution(&mut exec, signal.clone(), exit_code, session_id, now_secs())?;
        self.workspace.append_context(agent, &signal)?;
        self.remember_agent(agent);

        let mut signal = signal;
        if !exec.session_id.is_empty() {
            signal.insert(
                "_session_id".to_string(),
                Value::String(exec.session_id.clone()),
            );
        }
        Ok(signal)
    }

    /// A record was left `running` or `waiting_human` by an earlier engine
    /// process. The signal file is the source of truth: present and
    /// non-waiting means the agent finished while we were away; absent
    /// means it died and the call re-runs.
    fn recover_execution(&self, exec: Execution, call_index: i64) -> Result<Signal, CallError> {
        match self.workspace.read_signal(&exec.agent_name) {
            Ok(signal) => {
                let agent = exec.agent_name.clone();
                let session_id = exec.session_id.clone();
                self.settle_signal(&agent, signal, &session_id, exec)
            }
            Err(WorkspaceError::SignalNotFound { .. }) => {
                // The original process may still be alive and about to
                // write its signal; kill its group before re-invoking so
                // two agents never race on one record.
                if let Some(pid) = exec.pid {
                    if is_process_alive(pid) {
                        kill_process_group(pid);
                    }
                }
                let agent = exec.agent_name.clone();
                let prompt = exec.prompt.clone();
                self.run_agent(&agent, &prompt, exec, call_index)
            }
            Err(err) => Err(CallError::engine(err)),
        }
    }

    /// The memoized `pause(message)` call: a checkpoint pseudo-agent that
    /// shares the `run()` cache and recovery machinery.
    fn call_pause(&self, message: &str) -> Result<Signal, CallError> {
        let call_index = self.advance_call_index();
        let run_id = self.run_id();
        let existing = self.storage.execution_by_call_index(run_id, call_index)?;

        match existing {
            None => self.run_checkpoint(message, None, call_index),
            Some(exec) if exec.agent_name != CHECKPOINT_AGENT => {
                self.note_divergence(call_index, &exec.agent_name, CHECKPOINT_AGENT);
                self.storage
                    .invalidate_executions_after(run_id, call_index - 1)?;
                self.run_checkpoint(message, None, call_index)
            }
            Some(exec) => match exec.status {
                ExecStatus::Complete => Ok(exec
                    .output_signal
                    .clone()
                    .unwrap_or_else(|| error_signal("no signal in cache"))),
                ExecStatus::Failed | ExecStatus::Pending => {
                    self.run_checkpoint(message, Some(exec), call_index)
                }
                ExecStatus::Running | ExecStatus::WaitingHuman => {
                    self.recover_checkpoint(message, exec)
                }
            },
        }
    }

    fn recover_checkpoint(&self, message: &str, mut exec: Execution) -> Result<Signal, CallError> {
        if let Ok(signal) = self.workspace.read_signal(CHECKPOINT_AGENT) {
            let status = signal.get("status").and_then(Value::as_str).unwrap_or("");
            if !status.is_empty() && status != "NEEDS_HUMAN" {
                let session_id = exec.session_id.clone();
                let exit_code = exec.exit_code;
                self.storage.finalize_execution(
                    &mut exec,
                    signal.clone(),
                    exit_code,
                    &session_id,
                    now_secs(),
                )?;
                return Ok(signal);
            }
        }

        let session_id = exec.session_id.clone();
        self.storage.mark_execution_waiting(&mut exec, &session_id)?;
        self.set_waiting(CHECKPOINT_AGENT, message, &session_id);
        Err(CallError::Waiting {
            reason: message.to_string(),
        })
    }

    fn run_checkpoint(
        &self,
        message: &str,
        existing: Option<Execution>,
        call_index: i64,
    ) -> Result<Signal, CallError> {
        let run_id = self.run_id();
        let mut exec = match existing {
            Some(exec) => exec,
            None => {
                let mut exec = Execution {
                    id: 0,
                    run_id,
                    agent_name: CHECKPOINT_AGENT.to_string(),
                    session_id: String::new(),
                    status: ExecStatus::Pending,
                    exit_code: None,
                    started_at: None,
                    completed_at: None,
                    output_signal: None,
                    sequence_num: self.storage.next_sequence_num(run_id)?,
                    call_index,
                    prompt: message.to_string(),
                    pid: None,
                };
                exec.id = self.storage.create_execution(&exec)?;
                exec
            }
        };

        self.stage_agent(CHECKPOINT_AGENT, call_index, &mut exec)?;

        let checkpoint_prompt = prompts::build_checkpoint_prompt(message);
        let exec_id = exec.id;
        // The checkpoint runs without --agent: it is a plain interactive
        // session mediated by the human, not a named agent definition.
        let invocation = self.runner.invoke(
            &self.workspace.repo_path,
            "",
            &checkpoint_prompt,
            &mut |pid| {
                let _ = self.storage.update_execution_pid(exec_id, i64::from(pid));
            },
        );
        let invocation = match invocation {
            Ok(invocation) => invocation,
            Err(err) => {
                self.storage.mark_execution_failed(&mut exec, now_secs())?;
                return Err(CallError::engine(EngineError::Checkpoint(err.to_string())));
            }
        };

        exec.session_id = invocation.session_id.clone();
        exec.exit_code = Some(invocation.exit_code);

        let signal = match self.workspace.read_signal(CHECKPOINT_AGENT) {
            Ok(signal) => signal,
            Err(WorkspaceError::SignalNotFound { .. }) => {
                // No decision yet: seed the waiting signal ourselves so
                // resume can poll the same file.
                let seeded = needs_human_signal(message);
                self.workspace.write_signal(CHECKPOINT_AGENT, &seeded)?;
                seeded
            }
            Err(err) => return Err(CallError::engine(err)),
        };

        let status = signal.get("status").and_then(Value::as_str).unwrap_or("");
        if status == "NEEDS_HUMAN" {
            self.storage
                .mark_execution_waiting(&mut exec, &invocation.session_id)?;
            self.set_waiting(CHECKPOINT_AGENT, message, &invocation.session_id);
            return Err(CallError::Waiting {
                reason: message.to_string(),
            });
        }

        let exit_code = exec.exit_code;
        self.storage.finalize_execution(
            &mut exec,
            signal.clone(),
            exit_code,
            &invocation.session_id,
            now_secs(),
        )?;
        Ok(signal)
    }

    fn note_divergence(&self, call_index: i64, recorded: &str, requested: &str) {
        self.state.borrow_mut().logs.push(format!(
            "WARNING: determinism violation at call {call_index}: expected {recorded}, got {requested}"
        ));
    }

    // Run terminal transitions

    fn mark_run_complete(&self) -> Result<(), StorageError> {
        let run = {
            let mut state = self.state.borrow_mut();
            state.run.status = RunStatus::Complete;
            state.run.completed_at = Some(now_secs());
            state.run.clone()
        };
        self.storage.update_run(&run)
    }

    fn mark_run_stuck(&self, reason: &str) -> Result<(), StorageError> {
        let run = {
            let mut state = self.state.borrow_mut();
            state.run.status = RunStatus::Stuck;
            state.run.completed_at = Some(now_secs());
            state.run.error = reason.to_string();
            state.run.clone()
        };
        self.storage.update_run(&run)
    }

    fn mark_run_failed(&self, message: &str) -> Result<(), StorageError> {
        let run = {
            let mut state = self.state.borrow_mut();
            state.run.status = RunStatus::Failed;
            state.run.completed_at = Some(now_secs());
            state.run.error = message.to_string();
            state.run.clone()
        };
        self.storage.update_run(&run)
    }

    fn mark_run_waiting(&self, waiting: &WaitingState) -> Result<(), StorageError> {
        let run = {
            let mut state = self.state.borrow_mut();
            state.run.status = RunStatus::WaitingHuman;
            state.run.waiting_reason = waiting.reason.clone();
            state.run.waiting_session_id = waiting.session_id.clone();
            state.run.current_agent = waiting.agent.clone();
            state.run.clone()
        };
        self.storage.update_run(&run)
    }
}

fn error_signal(reason: &str) -> Signal {
    let mut signal = Signal::new();
    signal.insert("status".to_string(), Value::String("ERROR".to_string()));
    signal.insert("reason".to_string(), Value::String(reason.to_string()));
    signal
}

fn needs_human_signal(reason: &str) -> Signal {
    let mut signal = Signal::new();
    signal.insert(
        "status".to_string(),
        Value::String("NEEDS_HUMAN".to_string()),
    );
    signal.insert("reason".to_string(), Value::String(reason.to_string()));
    signal
}

/// Translate a checkpoint signal into the `{continue, reason?, message?}`
/// table `pause()` returns.
fn pause_result_table(lua: &mlua::Lua, signal: &Signal) -> mlua::Result<mlua::Table> {
    let table = lua.create_table()?;
    let status = signal.get("status").and_then(Value::as_str).unwrap_or("");
    table.set("continue", status == "CONTINUE")?;
    if let Some(reason) = signal.get("reason").and_then(Value::as_str) {
        table.set("reason", reason)?;
    }
    if let Some(message) = signal.get("message").and_then(Value::as_str) {
        table.set("message", message)?;
    }
    Ok(table)
}
