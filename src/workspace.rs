use crate::models::Signal;
use crate::shared::atomic_write_file;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Command;

#[derive(Debug, thiserror::Error)]
pub enum WorkspaceError {
    #[error("workspace for run {run_id} does not exist at {path}")]
    NotFound { run_id: i64, path: String },
    #[error("signal file not found for agent `{agent}`")]
    SignalNotFound { agent: String },
    #[error("signal for agent `{agent}` is not a json object: {source}")]
    SignalParse {
        agent: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("{path} is not a git repository")]
    NotAGitRepository { path: String },
    #[error("git {operation} failed: {detail}")]
    Git { operation: String, detail: String },
    #[error("io error at {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("json error at {path}: {source}")]
    Json {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}

fn io_error(path: &Path, source: std::io::Error) -> WorkspaceError {
    WorkspaceError::Io {
        path: path.display().to_string(),
        source,
    }
}

/// Metadata the engine writes to `.shop/run.json` before each agent
/// invocation; agents read it to learn their role.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunMetadata {
    pub run_id: i64,
    pub spec_name: String,
    pub initial_prompt: String,
    pub current_agent: String,
    pub iteration: i64,
    #[serde(default)]
    pub previous_agents: Vec<String>,
}

/// A filesystem subtree owned by one run: the working repo plus the
/// `.agents/` exchange area the engine and agents communicate through.
#[derive(Debug, Clone)]
pub struct Workspace {
    pub path: PathBuf,
    pub repo_path: PathBuf,
}

impl Workspace {
    /// Provision the workspace: a detached git worktree of `source_repo`
    /// when one is given, a plain directory otherwise, plus the
    /// `.agents/` skeleton and protocol document.
    pub fn create(
        base_dir: &Path,
        run_id: i64,
        source_repo: Option<&Path>,
    ) -> Result<Self, WorkspaceError> {
        let path = base_dir.join(format!("run-{run_id}"));
        let workspace = Self {
            repo_path: path.join("repo"),
            path,
        };

        fs::create_dir_all(&workspace.path).map_err(|e| io_error(&workspace.path, e))?;

        match source_repo {
            Some(source_repo) => workspace.create_worktree(source_repo)?,
            None => {
                fs::create_dir_all(&workspace.repo_path)
                    .map_err(|e| io_error(&workspace.repo_path, e))?;
            }
        }

        for dir in [
            workspace.repo_path.join(".agents/messages"),
            workspace.repo_path.join(".agents/signals"),
            workspace.repo_path.join(".agents/scratchpad"),
            workspace.repo_path.join(".shop"),
        ] {
            fs::create_dir_all(&dir).map_err(|e| io_error(&dir, e))?;
        }

        let skill_path = workspace.repo_path.join(".agents/SKILL.md");
        fs::write(&skill_path, SKILL_CONTENT).map_err(|e| io_error(&skill_path, e))?;

        Ok(workspace)
    }

    pub fn open(base_dir: &Path, run_id: i64) -> Result<Self, WorkspaceError> {
        let path = base_dir.join(format!("run-{run_id}"));
        if !path.is_dir() {
            return Err(WorkspaceError::NotFound {
                run_id,
                path: path.display().to_string(),
            });
        }
        Ok(Self {
            repo_path: path.join("repo"),
            path,
        })
    }

    fn create_worktree(&self, source_repo: &Path) -> Result<(), WorkspaceError> {
        let source_repo = fs::canonicalize(source_repo).map_err(|e| io_error(source_repo, e))?;

        let probe = Command::new("git")
            .args(["rev-parse", "--git-dir"])
            .current_dir(&source_repo)
            .output()
            .map_err(|e| io_error(&source_repo, e))?;
        if !probe.status.success() {
            return Err(WorkspaceError::NotAGitRepository {
                path: source_repo.display().to_string(),
            });
        }

        let head = Command::new("git")
            .args(["rev-parse", "HEAD"])
            .current_dir(&source_repo)
            .output()
            .map_err(|e| io_error(&source_repo, e))?;
        if !head.status.success() {
            return Err(WorkspaceError::Git {
                operation: "rev-parse HEAD".to_string(),
                detail: String::from_utf8_lossy(&head.stderr).trim().to_string(),
            });
        }
        let sha = String::from_utf8_lossy(&head.stdout).trim().to_string();

        // Detached so the run never holds a branch in the source repo.
        let added = Command::new("git")
            .arg("worktree")
            .arg("add")
            .arg("--detach")
            .arg(&self.repo_path)
            .arg(&sha)
            .current_dir(&source_repo)
            .output()
            .map_err(|e| io_error(&source_repo, e))?;
        if !added.status.success() {
            return Err(WorkspaceError::Git {
                operation: "worktree add".to_string(),
                detail: String::from_utf8_lossy(&added.stderr).trim().to_string(),
            });
        }
        Ok(())
    }

    /// Remove the worktree registration in the source repo, if there is
    /// one, then delete the workspace subtree.
    pub fn destroy(&self) -> Result<(), WorkspaceError> {
        if let Some(source_repo) = self.find_source_repo() {
            let _ = Command::new("git")
                .arg("worktree")
                .arg("remove")
                .arg("--force")
                .arg(&self.repo_path)
                .current_dir(&source_repo)
                .output();
        }
        if self.path.exists() {
            fs::remove_dir_all(&self.path).map_err(|e| io_error(&self.path, e))?;
        }
        Ok(())
    }

    /// Extract the main repo path from the worktree's `.git` file, which
    /// reads `gitdir: /path/to/main/.git/worktrees/run-N`.
    pub fn find_source_repo(&self) -> Option<PathBuf> {
        let raw = fs::read_to_string(self.repo_path.join(".git")).ok()?;
        let git_dir = raw.strip_prefix("gitdir: ")?.trim();
        let idx = git_dir.rfind("/.git/")?;
        Some(PathBuf::from(&git_dir[..idx]))
    }

    pub fn write_run_metadata(&self, meta: &RunMetadata) -> Result<(), WorkspaceError> {
        let path = self.repo_path.join(".shop/run.json");
        let body = serde_json::to_vec_pretty(meta).map_err(|source| WorkspaceError::Json {
            path: path.display().to_string(),
            source,
        })?;
        atomic_write_file(&path, &body).map_err(|e| io_error(&path, e))
    }

    pub fn signal_path(&self, agent: &str) -> PathBuf {
        self.repo_path
            .join(".agents/signals")
            .join(format!("{agent}.json"))
    }

    pub fn read_signal(&self, agent: &str) -> Result<Signal, WorkspaceError> {
        let path = self.signal_path(agent);
        let raw = match fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(WorkspaceError::SignalNotFound {
                    agent: agent.to_string(),
                })
            }
            Err(err) => return Err(io_error(&path, err)),
        };
        serde_json::from_str(&raw).map_err(|source| WorkspaceError::SignalParse {
            agent: agent.to_string(),
            source,
        })
    }

    /// Used only by the checkpoint path, to seed a `NEEDS_HUMAN` signal
    /// when the checkpoint agent did not write one itself.
    pub fn write_signal(&self, agent: &str, signal: &Signal) -> Result<(), WorkspaceError> {
        let path = self.signal_path(agent);
        let body = serde_json::to_vec_pretty(signal).map_err(|source| WorkspaceError::Json {
            path: path.display().to_string(),
            source,
        })?;
        atomic_write_file(&path, &body).map_err(|e| io_error(&path, e))
    }

    pub fn ensure_scratchpad(&self, agent: &str) -> Result<(), WorkspaceError> {
        let path = self.repo_path.join(".agents/scratchpad").join(agent);
        fs::create_dir_all(&path).map_err(|e| io_error(&path, e))
    }

    pub fn context_path(&self) -> PathBuf {
        self.repo_path.join(".agents/context.md")
    }

    pub fn init_context(&self, spec_name: &str, prompt: &str) -> Result<(), WorkspaceError> {
        let path = self.context_path();
        let header = format!("# Workflow: {spec_name}\n\n**Task:** {prompt}\n");
        fs::write(&path, header).map_err(|e| io_error(&path, e))
    }

    /// Append one agent's signal to the shared narrative. Appended after
    /// an execution is finalized and before control returns to the
    /// script, so the next agent always sees its predecessor's outcome.
    pub fn append_context(&self, agent: &str, signal: &Signal) -> Result<(), WorkspaceError> {
        let status = signal
            .get("status")
            .and_then(|value| value.as_str())
            .unwrap_or("UNKNOWN");

        let mut entry = format!("\n## {agent}\n\n**Status:** {status}\n\n");
        match signal.get("summary").and_then(|value| value.as_str()) {
            Some(summary) => {
                entry.push_str(summary);
                entry.push('\n');
            }
            None => {
                let body = serde_json::to_string_pretty(signal).map_err(|source| {
                    WorkspaceError::Json {
                        path: self.context_path().display().to_string(),
                        source,
                    }
                })?;
                entry.push_str("```json\n");
                entry.push_str(&body);
                entry.push_str("\n```\n");
            }
        }

        let path = self.context_path();
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| io_error(&path, e))?;
        file.write_all(entry.as_bytes()).map_err(|e| io_error(&path, e))
    }
}

// Protocol document dropped into every workspace so agents know how to
// participate without any per-run prompting.
const SKILL_CONTENT: &str = r#"---
name: shop-protocol
description: Protocol for multi-agent orchestrated workflows. Use when .agents/ directory exists.
---

# Shop Workspace Protocol

You are one agent in a coordinated workflow. Other agents work on this
codebase before and after you.

## Reading Context

1. Check `.shop/run.json` for run metadata and your role
2. Read `.agents/context.md` for the outcome of previous agents
3. Read `.agents/messages/*.md` in order for notes from previous agents

## Leaving Context for Next Agent

Write to `.agents/messages/{NNN}-{your-role}.md`:
- Increment the number from the last message
- Be concise—what does the next agent need to know?
- Don't duplicate what's obvious from code or commits

## Signaling Completion

**IMPORTANT:** When your work is complete, write your decision to:
`.agents/signals/{your-role}.json`

The file must be a JSON object with at least a `status` field. Example:
```json
{"status": "APPROVED", "summary": "Code looks good, no issues found"}
```

If you are blocked and need a human, set `status` to `NEEDS_HUMAN` and
explain why in `reason`.

## Private Workspace

Use `.agents/scratchpad/{your-role}/` for drafts, notes, or intermediate
work. No guarantee anyone reads this.

## Git Commits

Make atomic commits with clear messages. The commit history is part of
the communication trail. Don't squash—preserve the narrative.
"#;
