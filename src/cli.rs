use crate::agent::resume_session;
use crate::config::{is_lua_spec, Config};
use crate::models::{Run, RunStatus};
use crate::orchestrator::Orchestrator;
use crate::shared::time::format_time_ago;
use crate::shared::now_secs;
use std::path::PathBuf;

pub fn run(args: Vec<String>) -> Result<String, String> {
    if args.is_empty() {
        return Ok(help_text());
    }

    match args[0].as_str() {
        "run" => cmd_run(&args[1..]),
        "resume" => cmd_resume(&args[1..]),
        "status" => cmd_status(&args[1..]),
        "list" => cmd_list(&args[1..]),
        "kill" => cmd_kill(&args[1..]),
        "delete" => cmd_delete(&args[1..]),
        "continue" => cmd_continue(&args[1..]),
        "stop" => cmd_stop(&args[1..]),
        "help" | "--help" | "-h" => Ok(help_text()),
        other => Err(format!("unknown command `{other}`")),
    }
}

pub fn help_text() -> String {
    [
        "Shop coordinates Claude Code agents through Lua workflow scripts.",
        "",
        "Commands:",
        "  run <spec> <prompt> [--repo <path>] [--no-exec]   Start a new workflow run",
        "  resume <run-id>                                   Resume an interrupted run",
        "  status <run-id>                                   Show run status and executions",
        "  list [--active]                                   List recent runs",
        "  kill <run-id>                                     Kill a running run's agent",
        "  delete <run-id>                                   Delete a run and its workspace",
        "  continue <run-id>                                 Open the Claude session of a waiting run",
        "  stop <run-id> [--reason <text>]                   Mark a waiting run as stuck",
    ]
    .join("\n")
}

fn open_orchestrator() -> Result<(Config, Orchestrator), String> {
    let config = Config::new().map_err(|err| err.to_string())?;
    config.ensure_data_dir().map_err(|err| err.to_string())?;
    let orchestrator = Orchestrator::new(config.clone()).map_err(|err| err.to_string())?;
    Ok((config, orchestrator))
}

fn parse_run_id(args: &[String]) -> Result<i64, String> {
    let raw = args.first().ok_or("missing <run-id> argument")?;
    raw.parse::<i64>()
        .map_err(|_| format!("invalid run ID `{raw}`"))
}

fn cmd_run(args: &[String]) -> Result<String, String> {
    let mut positional = Vec::new();
    let mut repo: Option<String> = Some(".".to_string());
    let mut no_exec = false;

    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--repo" | "-r" => {
                let value = iter.next().ok_or("--repo requires a path")?;
                repo = if value.is_empty() {
                    None
                } else {
                    Some(value.clone())
                };
            }
            "--no-exec" => no_exec = true,
            other => positional.push(other.to_string()),
        }
    }

    let [spec_name, prompt] = positional.as_slice() else {
        return Err("usage: run <spec> <prompt> [--repo <path>] [--no-exec]".to_string());
    };

    let (config, orchestrator) = open_orchestrator()?;

    let spec_path = config.find_spec(spec_name).ok_or_else(|| {
        format!(
            "spec `{spec_name}` not found (looked in {} and {})",
            config.project_spec_dir.display(),
            config.user_spec_dir.display()
        )
    })?;
    if !is_lua_spec(&spec_path) {
        return Err(format!("not a Lua spec: {}", spec_path.display()));
    }

    let repo_path = repo.map(PathBuf::from);
    let run = orchestrator
        .start_run(&spec_path, spec_name, prompt, repo_path.as_deref())
        .map_err(|err| err.to_string())?;

    let mut out = format!(
        "Created run #{}\nWorkspace: {}\nSpec: {}\n",
        run.id,
        run.workspace_path,
        spec_path.display()
    );

    if no_exec {
        out.push_str("Skipping execution (--no-exec)\n");
        return Ok(out);
    }

    out.push_str(&format!("Executing workflow `{spec_name}`...\n"));
    match orchestrator.execute(run.id) {
        Ok(run) => {
            out.push_str(&render_outcome(&run));
            Ok(out)
        }
        Err(err) => Err(render_failure(&orchestrator, run.id, &err.to_string())),
    }
}

fn cmd_resume(args: &[String]) -> Result<String, String> {
    let run_id = parse_run_id(args)?;
    let (_config, orchestrator) = open_orchestrator()?;

    let run = orchestrator.get_run(run_id).map_err(|err| err.to_string())?;
    let mut out = format!("Resuming run #{run_id}\nSpec: {}\n", run.spec_path);

    match orchestrator.resume(run_id) {
        Ok(run) => {
            out.push_str(&render_outcome(&run));
            Ok(out)
        }
        Err(err) => Err(render_failure(&orchestrator, run_id, &err.to_string())),
    }
}

fn render_outcome(run: &Run) -> String {
    let mut out = format!("Run completed with status: {}\n", run.status);
    if run.status == RunStatus::WaitingHuman {
        out.push_str(&format!(
            "Waiting for: {}\nUse `shop continue {}` to open the Claude session.\n",
            run.waiting_reason, run.id
        ));
    }
    if !run.error.is_empty() {
        out.push_str(&format!("Error: {}\n", run.error));
    }
    out
}

fn render_failure(orchestrator: &Orchestrator, run_id: i64, fallback: &str) -> String {
    match orchestrator.get_run(run_id) {
        Ok(run) => {
            let mut out = format!("Run completed with status: {}\n", run.status);
            if !run.error.is_empty() {
                out.push_str(&format!("Error: {}\n", run.error));
            }
            out
        }
        Err(_) => fallback.to_string(),
    }
}

fn cmd_status(args: &[String]) -> Result<String, String> {
    let run_id = parse_run_id(args)?;
    let (_config, orchestrator) = open_orchestrator()?;

    let run = orchestrator.get_run(run_id).map_err(|err| err.to_string())?;

    let mut out = format!("Run #{}: {}\n", run.id, run.spec_name);
    out.push_str(&format!("Status: {}\n", run.status));
    out.push_str(&format!("Prompt: {}\n", run.initial_prompt));
    out.push_str(&format!("Workspace: {}\n", run.workspace_path));
    if !run.spec_path.is_empty() {
        out.push_str(&format!("Spec: {}\n", run.spec_path));
    }
    if !run.current_agent.is_empty() {
        out.push_str(&format!("Agent: {}\n", run.current_agent));
    }

    if run.status == RunStatus::WaitingHuman {
        if !run.waiting_session_id.is_empty() {
            out.push_str(&format!("Session: {}\n", run.waiting_session_id));
        }
        if !run.waiting_reason.is_empty() {
            out.push_str(&format!("Reason: {}\n", run.waiting_reason));
        }
        out.push_str(&format!(
            "Waiting since: {}\n",
            format_time_ago(run.created_at, now_secs())
        ));
        out.push_str(&format!(
            "\nUse `shop continue {}` to open the Claude session.\n",
            run.id
        ));
    }

    if !run.error.is_empty() {
        out.push_str(&format!("Error: {}\n", run.error));
    }

    let execs = orchestrator
        .executions_for_run(run_id)
        .map_err(|err| err.to_string())?;
    if !execs.is_empty() {
        out.push_str("\nExecutions:\n");
        for exec in execs {
            let mut status = exec.status.to_string();
            if let Some(exit_code) = exec.exit_code {
                status.push_str(&format!(" (exit {exit_code})"));
            }
            out.push_str(&format!(
                "  [{}] {} [{}]\n",
                exec.call_index, exec.agent_name, status
            ));
        }
    }

    Ok(out)
}

fn cmd_list(args: &[String]) -> Result<String, String> {
    let active_only = args.iter().any(|arg| arg == "--active");
    let (_config, orchestrator) = open_orchestrator()?;

    let mut runs = orchestrator.list_runs(20).map_err(|err| err.to_string())?;
    if active_only {
        runs.retain(|run| run.status.is_active());
    }

    if runs.is_empty() {
        return Ok(if active_only {
            "No active runs found.".to_string()
        } else {
            "No runs found.".to_string()
        });
    }

    let mut out = format!(
        "{:<4} {:<15} {:<14} {:<12} {}\n",
        "ID", "SPEC", "STATUS", "AGENT", "WAITING FOR"
    );
    for run in runs {
        let agent = if run.current_agent.is_empty() {
            "-".to_string()
        } else {
            truncate(&run.current_agent, 12)
        };
        let waiting_for = if run.status == RunStatus::WaitingHuman && !run.waiting_reason.is_empty()
        {
            truncate(&run.waiting_reason, 40)
        } else {
            "-".to_string()
        };
        out.push_str(&format!(
            "{:<4} {:<15} {:<14} {:<12} {}\n",
            run.id,
            truncate(&run.spec_name, 15),
            run.status,
            agent,
            waiting_for
        ));
    }
    Ok(out)
}

fn cmd_kill(args: &[String]) -> Result<String, String> {
    let run_id = parse_run_id(args)?;
    let (_config, orchestrator) = open_orchestrator()?;
    orchestrator.kill_run(run_id).map_err(|err| err.to_string())?;
    Ok(format!("Killed run #{run_id}"))
}

fn cmd_delete(args: &[String]) -> Result<String, String> {
    let run_id = parse_run_id(args)?;
    let (_config, orchestrator) = open_orchestrator()?;
    orchestrator
        .delete_run(run_id)
        .map_err(|err| err.to_string())?;
    Ok(format!("Deleted run #{run_id}"))
}

fn cmd_continue(args: &[String]) -> Result<String, String> {
    let run_id = parse_run_id(args)?;
    let (_config, orchestrator) = open_orchestrator()?;

    let run = orchestrator.get_run(run_id).map_err(|err| err.to_string())?;
    let (session_id, workdir) = orchestrator
        .continue_run(run_id)
        .map_err(|err| err.to_string())?;

    println!("Opening Claude session for: {}", run.current_agent);
    println!("Reason: {}\n", run.waiting_reason);

    resume_session(orchestrator.runner().binary(), &workdir, &session_id)
        .map_err(|err| err.to_string())?;

    Ok(format!(
        "\nClaude session ended.\nRun `shop resume {run_id}` to continue the workflow."
    ))
}

fn cmd_stop(args: &[String]) -> Result<String, String> {
    let run_id = parse_run_id(args)?;

    let mut reason = String::new();
    let mut iter = args.iter().skip(1);
    while let Some(arg) = iter.next() {
        if arg == "--reason" {
            reason = iter.next().cloned().unwrap_or_default();
        }
    }

    let (_config, orchestrator) = open_orchestrator()?;
    orchestrator
        .stop_run(run_id, &reason)
        .map_err(|err| err.to_string())?;

    Ok(if reason.is_empty() {
        format!("Run {run_id} marked as stuck")
    } else {
        format!("Run {run_id} marked as stuck: {reason}")
    })
}

fn truncate(text: &str, max_len: usize) -> String {
    if text.chars().count() <= max_len {
        return text.to_string();
    }
    let head: String = text.chars().take(max_len.saturating_sub(3)).collect();
    format!("{head}...")
}
