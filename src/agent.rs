use serde_json::Value;
use std::io::Read;
use std::path::Path;
use std::process::{Command, Stdio};
use std::thread;

#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("agent binary `{binary}` not found")]
    MissingBinary { binary: String },
    #[error("failed to spawn agent `{agent}`: {source}")]
    Spawn {
        agent: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to read agent output: {source}")]
    Output {
        #[source]
        source: std::io::Error,
    },
}

/// Outcome of one agent invocation. A non-zero exit code is not itself an
/// error; the engine decides by inspecting the signal file.
#[derive(Debug, Clone, Default)]
pub struct Invocation {
    pub session_id: String,
    pub exit_code: i64,
}

/// Spawns agent child processes in their own process group, pins their
/// PID down before blocking, and reaps them. The binary is overridable so
/// tests can substitute a mock.
#[derive(Debug, Clone)]
pub struct AgentRunner {
    binary: String,
}

impl Default for AgentRunner {
    fn default() -> Self {
        Self {
            binary: std::env::var("SHOP_AGENT_BIN").unwrap_or_else(|_| "claude".to_string()),
        }
    }
}

impl AgentRunner {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    pub fn binary(&self) -> &str {
        &self.binary
    }

    /// Launch the agent and block until it exits. `on_spawn` receives the
    /// child PID immediately after a successful spawn, before any output
    /// is read, so the PID reaches durable storage while the agent runs.
    pub fn invoke(
        &self,
        workdir: &Path,
        agent: &str,
        prompt: &str,
        on_spawn: &mut dyn FnMut(u32),
    ) -> Result<Invocation, AgentError> {
        let mut command = Command::new(&self.binary);
        if !agent.is_empty() {
            command.arg("--agent").arg(agent);
        }
        command
            .arg("-p")
            .arg(prompt)
            .arg("--output-format")
            .arg("json")
            .arg("--dangerously-skip-permissions")
            .arg("--max-turns")
            .arg("10")
            .current_dir(workdir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null());

        // Own process group, so killing the group severs child-of-child
        // agents too.
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            command.process_group(0);
        }

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(AgentError::MissingBinary {
                    binary: self.binary.clone(),
                })
            }
            Err(source) => {
                return Err(AgentError::Spawn {
                    agent: agent.to_string(),
                    source,
                })
            }
        };

        on_spawn(child.id());

        let stdout = child.stdout.take();
        let reader = thread::spawn(move || {
            let mut buf = String::new();
            if let Some(mut stdout) = stdout {
                let _ = stdout.read_to_string(&mut buf);
            }
            buf
        });

        let status = child.wait().map_err(|source| AgentError::Output { source })?;
        let output = reader.join().unwrap_or_default();

        Ok(Invocation {
            session_id: parse_session_id(&output).unwrap_or_default(),
            exit_code: status.code().map(i64::from).unwrap_or(-1),
        })
    }
}

/// The agent prints a single JSON result object on stdout; tolerate any
/// leading noise by scanning for the last well-formed object carrying a
/// `session_id`.
pub fn parse_session_id(stdout: &str) -> Option<String> {
    let mut found = None;
    for candidate in json_object_candidates(stdout) {
        if let Ok(Value::Object(map)) = serde_json::from_str::<Value>(candidate) {
            if let Some(session_id) = map.get("session_id").and_then(Value::as_str) {
                found = Some(session_id.to_string());
            }
        }
    }
    found
}

fn json_object_candidates(stdout: &str) -> impl Iterator<Item = &str> {
    stdout
        .lines()
        .map(str::trim)
        .filter(|line| line.starts_with('{') && line.ends_with('}'))
        .chain({
            let trimmed = stdout.trim();
            (trimmed.starts_with('{') && trimmed.ends_with('}')).then_some(trimmed)
        })
}

/// Unconditional SIGKILL to an entire process group. Used by the external
/// kill path and the recovery guard; never by a normally completing run.
pub fn kill_process_group(pid: i64) {
    #[cfg(unix)]
    {
        let _ = Command::new("kill")
            .arg("-KILL")
            .arg("--")
            .arg(format!("-{pid}"))
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status();
    }

    #[cfg(not(unix))]
    {
        let _ = pid;
    }
}

pub fn is_process_alive(pid: i64) -> bool {
    if pid <= 0 {
        return false;
    }

    #[cfg(unix)]
    {
        Command::new("kill")
            .arg("-0")
            .arg(pid.to_string())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map(|status| status.success())
            .unwrap_or(false)
    }

    #[cfg(not(unix))]
    {
        false
    }
}

/// Rejoin a waiting agent's interactive session in the foreground.
/// Inherits the terminal; returns once the human closes the session.
pub fn resume_session(binary: &str, workdir: &Path, session_id: &str) -> Result<(), AgentError> {
    Command::new(binary)
        .arg("--resume")
        .arg(session_id)
        .current_dir(workdir)
        .status()
        .map_err(|source| AgentError::Spawn {
            agent: "--resume".to_string(),
            source,
        })?;
    Ok(())
}
