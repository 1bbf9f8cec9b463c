use serde_json::json;
use shop::agent::AgentRunner;
use shop::config::Config;
use shop::models::{ExecStatus, Execution, Run, RunStatus};
use shop::orchestrator::Orchestrator;
use shop::storage::Storage;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use tempfile::{tempdir, TempDir};

// Writes a DONE signal and echoes a session id per agent.
const DONE_MOCK: &str = r#"#!/bin/sh
agent=""
if [ "$1" = "--agent" ]; then
  agent="$2"
fi
echo "$agent" >> .mock-invocations
printf '{"status":"DONE","summary":"%s finished"}' "$agent" > ".agents/signals/$agent.json"
printf '{"session_id":"sess-%s"}\n' "$agent"
"#;

// Reviewer rejects once, then approves; everyone else is DONE.
const REVIEW_MOCK: &str = r#"#!/bin/sh
agent=""
if [ "$1" = "--agent" ]; then
  agent="$2"
fi
echo "$agent" >> .mock-invocations
count_file=".mock-count-$agent"
count=0
[ -f "$count_file" ] && count=$(cat "$count_file")
count=$((count+1))
echo "$count" > "$count_file"
status="DONE"
if [ "$agent" = "reviewer" ]; then
  if [ "$count" -ge 2 ]; then status="APPROVED"; else status="CHANGES_REQUESTED"; fi
fi
printf '{"status":"%s"}' "$status" > ".agents/signals/$agent.json"
printf '{"session_id":"sess-%s-%s"}\n' "$agent" "$count"
"#;

// Always asks for a human.
const NEEDS_HUMAN_MOCK: &str = r#"#!/bin/sh
agent=""
if [ "$1" = "--agent" ]; then
  agent="$2"
fi
echo "$agent" >> .mock-invocations
printf '{"status":"NEEDS_HUMAN","reason":"clarify auth"}' > ".agents/signals/$agent.json"
printf '{"session_id":"sess-help"}\n'
"#;

// Checkpoint sessions write no signal; named agents complete normally.
const CHECKPOINT_MOCK: &str = r#"#!/bin/sh
if [ "$1" = "--agent" ]; then
  echo "agent:$2" >> .mock-invocations
  printf '{"status":"DONE"}' > ".agents/signals/$2.json"
else
  echo "checkpoint" >> .mock-invocations
fi
printf '{"session_id":"sess-checkpoint"}\n'
"#;

struct Harness {
    _dir: TempDir,
    config: Config,
    orchestrator: Orchestrator,
}

fn write_script(path: &Path, body: &str) {
    fs::write(path, body).expect("write script");
    let mut perms = fs::metadata(path).expect("metadata").permissions();
    perms.set_mode(0o755);
    fs::set_permissions(path, perms).expect("chmod");
}

fn harness(mock_body: &str) -> Harness {
    let dir = tempdir().expect("tempdir");
    let config = Config::with_data_dir(dir.path().join("data"));
    config.ensure_data_dir().expect("data dir");

    let bin = dir.path().join("claude-mock");
    write_script(&bin, mock_body);

    let orchestrator = Orchestrator::new(config.clone())
        .expect("orchestrator")
        .with_runner(AgentRunner::new(bin.display().to_string()));

    Harness {
        _dir: dir,
        config,
        orchestrator,
    }
}

fn write_spec(harness: &Harness, name: &str, body: &str) -> PathBuf {
    let path = harness.config.user_spec_dir.join(format!("{name}.lua"));
    fs::write(&path, body).expect("write spec");
    path
}

fn start(harness: &Harness, name: &str, script: &str, prompt: &str) -> Run {
    let spec_path = write_spec(harness, name, script);
    harness
        .orchestrator
        .start_run(&spec_path, name, prompt, None)
        .expect("start run")
}

fn repo_dir(run: &Run) -> PathBuf {
    PathBuf::from(&run.workspace_path).join("repo")
}

fn invocations(run: &Run) -> Vec<String> {
    fs::read_to_string(repo_dir(run).join(".mock-invocations"))
        .unwrap_or_default()
        .lines()
        .map(str::to_string)
        .collect()
}

fn executions(harness: &Harness, run_id: i64) -> Vec<Execution> {
    harness
        .orchestrator
        .executions_for_run(run_id)
        .expect("executions")
}

#[test]
fn linear_workflow_completes_with_ordered_executions() {
    let harness = harness(DONE_MOCK);
    let run = start(
        &harness,
        "linear",
        "function workflow(p)\n  run(\"a\", p)\n  run(\"b\")\nend\n",
        "build it",
    );

    let run = harness.orchestrator.execute(run.id).expect("execute");
    assert_eq!(run.status, RunStatus::Complete);
    assert!(run.completed_at.is_some());

    let execs = executions(&harness, run.id);
    assert_eq!(execs.len(), 2);
    assert_eq!(execs[0].call_index, 1);
    assert_eq!(execs[0].agent_name, "a");
    assert_eq!(execs[1].call_index, 2);
    assert_eq!(execs[1].agent_name, "b");
    for exec in &execs {
        assert_eq!(exec.status, ExecStatus::Complete);
        assert_eq!(exec.exit_code, Some(0));
        assert_eq!(
            exec.signal_status(),
            Some("DONE"),
            "stored signal should carry DONE"
        );
    }
    assert_eq!(execs[0].session_id, "sess-a");
    assert_eq!(execs[1].session_id, "sess-b");

    let context = fs::read_to_string(repo_dir(&run).join(".agents/context.md")).expect("context");
    let a_at = context.find("## a").expect("a section");
    let b_at = context.find("## b").expect("b section");
    assert!(a_at < b_at, "context entries must follow call order");

    assert_eq!(invocations(&run), ["a", "b"]);
}

#[test]
fn review_loop_runs_until_approval() {
    let harness = harness(REVIEW_MOCK);
    let script = r#"
function workflow(p)
  for i = 1, 10 do
    run("coder", p)
    local review = run("reviewer")
    if review.status == "APPROVED" then
      return
    end
  end
  stuck("review loop exhausted")
end
"#;
    let run = start(&harness, "review-loop", script, "fix the bug");

    let run = harness.orchestrator.execute(run.id).expect("execute");
    assert_eq!(run.status, RunStatus::Complete);

    let execs = executions(&harness, run.id);
    let summary: Vec<(i64, String, ExecStatus)> = execs
        .iter()
        .map(|exec| (exec.call_index, exec.agent_name.clone(), exec.status))
        .collect();
    assert_eq!(
        summary,
        [
            (1, "coder".to_string(), ExecStatus::Complete),
            (2, "reviewer".to_string(), ExecStatus::Complete),
            (3, "coder".to_string(), ExecStatus::Complete),
            (4, "reviewer".to_string(), ExecStatus::Complete),
        ]
    );
    assert_eq!(execs[1].signal_status(), Some("CHANGES_REQUESTED"));
    assert_eq!(execs[3].signal_status(), Some("APPROVED"));
}

#[test]
fn needs_human_suspends_and_resume_completes_without_reinvoking() {
    let harness = harness(NEEDS_HUMAN_MOCK);
    let run = start(
        &harness,
        "ask-human",
        "function workflow(p)\n  run(\"needs-help\", p)\nend\n",
        "set up auth",
    );

    let run = harness.orchestrator.execute(run.id).expect("execute");
    assert_eq!(run.status, RunStatus::WaitingHuman);
    assert_eq!(run.waiting_reason, "clarify auth");
    assert_eq!(run.waiting_session_id, "sess-help");
    assert_eq!(run.current_agent, "needs-help");
    assert!(run.completed_at.is_none(), "waiting runs are not terminal");

    let execs = executions(&harness, run.id);
    assert_eq!(execs.len(), 1, "no executions beyond the suspension point");
    assert_eq!(execs[0].status, ExecStatus::WaitingHuman);
    assert_eq!(execs[0].session_id, "sess-help");

    // The human finishes the agent's session; the signal file flips.
    fs::write(
        repo_dir(&run).join(".agents/signals/needs-help.json"),
        "{\"status\":\"DONE\",\"summary\":\"auth clarified\"}",
    )
    .expect("overwrite signal");

    let run = harness.orchestrator.resume(run.id).expect("resume");
    assert_eq!(run.status, RunStatus::Complete);

    let execs = executions(&harness, run.id);
    assert_eq!(execs.len(), 1);
    assert_eq!(execs[0].status, ExecStatus::Complete);
    assert_eq!(execs[0].signal_status(), Some("DONE"));

    assert_eq!(
        invocations(&run).len(),
        1,
        "the agent must not be re-invoked on resume"
    );
}

#[test]
fn crash_mid_agent_recovers_from_the_signal_file() {
    let harness = harness(DONE_MOCK);
    let run = start(
        &harness,
        "recover",
        "function workflow(p)\n  local s = run(\"a\", p)\n  if s.status ~= \"DONE\" then\n    stuck(\"unexpected status\")\n  end\nend\n",
        "resume me",
    );

    // Simulate a previous engine process dying mid-agent: the record is
    // stuck in running and the agent's signal landed on disk.
    let storage = Storage::open(&harness.config.db_path).expect("storage");
    let mut exec = Execution {
        id: 0,
        run_id: run.id,
        agent_name: "a".to_string(),
        session_id: "sess-before-crash".to_string(),
        status: ExecStatus::Running,
        exit_code: None,
        started_at: Some(1_700_000_000),
        completed_at: None,
        output_signal: None,
        sequence_num: 1,
        call_index: 1,
        prompt: "resume me".to_string(),
        pid: None,
    };
    exec.id = storage.create_execution(&exec).expect("seed running exec");
    fs::create_dir_all(repo_dir(&run).join(".agents/signals")).expect("signals dir");
    fs::write(
        repo_dir(&run).join(".agents/signals/a.json"),
        "{\"status\":\"DONE\",\"summary\":\"finished before the crash\"}",
    )
    .expect("signal on disk");

    let run = harness.orchestrator.execute(run.id).expect("execute");
    assert_eq!(run.status, RunStatus::Complete);

    let execs = executions(&harness, run.id);
    assert_eq!(execs.len(), 1);
    assert_eq!(execs[0].status, ExecStatus::Complete);
    assert_eq!(execs[0].signal_status(), Some("DONE"));
    assert_eq!(execs[0].session_id, "sess-before-crash");

    assert!(
        invocations(&run).is_empty(),
        "the agent must not run again when its signal is on disk"
    );
}

#[test]
fn script_edit_divergence_invalidates_the_tail() {
    let harness = harness(DONE_MOCK);
    let run = start(
        &harness,
        "edited",
        "function workflow(p)\n  run(\"x\", p)\n  run(\"y\")\n  run(\"z\")\nend\n",
        "three steps",
    );

    let run = harness.orchestrator.execute(run.id).expect("first pass");
    assert_eq!(run.status, RunStatus::Complete);
    assert_eq!(invocations(&run), ["x", "y", "z"]);

    // The operator edits the script between runs.
    write_spec(
        &harness,
        "edited",
        "function workflow(p)\n  run(\"x\", p)\n  run(\"q\")\n  run(\"z\")\nend\n",
    );

    let run = harness.orchestrator.resume(run.id).expect("resume");
    assert_eq!(run.status, RunStatus::Complete);

    let execs = executions(&harness, run.id);
    let by_index: Vec<(i64, String)> = execs
        .iter()
        .map(|exec| (exec.call_index, exec.agent_name.clone()))
        .collect();
    assert_eq!(
        by_index,
        [
            (1, "x".to_string()),
            (2, "q".to_string()),
            (3, "z".to_string()),
        ]
    );

    // Call 1 replayed from the log; q and z ran fresh.
    assert_eq!(invocations(&run), ["x", "y", "z", "q", "z"]);

    let log = fs::read_to_string(harness.config.data_dir.join("logs/shop.log")).expect("log");
    assert!(log.contains("determinism violation at call 2"));
    assert!(log.contains("expected y, got q"));
}

#[test]
fn checkpoint_stop_marks_the_run_stuck_before_the_gated_call() {
    let harness = harness(CHECKPOINT_MOCK);
    let script = r#"
function workflow(p)
  local ok = pause("deploy?")
  if not ok.continue then
    return stuck(ok.reason)
  end
  run("deployer")
end
"#;
    let run = start(&harness, "deploy-gate", script, "ship it");

    let run = harness.orchestrator.execute(run.id).expect("execute");
    assert_eq!(run.status, RunStatus::WaitingHuman);
    assert_eq!(run.waiting_reason, "deploy?");
    assert_eq!(run.current_agent, "_checkpoint");

    // The engine seeded the waiting signal since the checkpoint agent
    // wrote none.
    let seeded: serde_json::Value = serde_json::from_str(
        &fs::read_to_string(repo_dir(&run).join(".agents/signals/_checkpoint.json"))
            .expect("seeded signal"),
    )
    .expect("parse");
    assert_eq!(seeded.get("status"), Some(&json!("NEEDS_HUMAN")));

    fs::write(
        repo_dir(&run).join(".agents/signals/_checkpoint.json"),
        "{\"status\":\"STOP\",\"reason\":\"maintenance window\"}",
    )
    .expect("human decision");

    let run = harness.orchestrator.resume(run.id).expect("resume");
    assert_eq!(run.status, RunStatus::Stuck);
    assert_eq!(run.error, "maintenance window");

    let execs = executions(&harness, run.id);
    assert_eq!(execs.len(), 1, "no deployer execution may exist");
    assert_eq!(execs[0].agent_name, "_checkpoint");
    assert_eq!(execs[0].status, ExecStatus::Complete);
    assert!(!invocations(&run).iter().any(|line| line == "agent:deployer"));
}

#[test]
fn checkpoint_continue_releases_the_gated_call() {
    let harness = harness(CHECKPOINT_MOCK);
    let script = r#"
function workflow(p)
  local ok = pause("deploy?")
  if not ok.continue then
    return stuck(ok.reason)
  end
  run("deployer")
end
"#;
    let run = start(&harness, "deploy-gate", script, "ship it");

    let run = harness.orchestrator.execute(run.id).expect("execute");
    assert_eq!(run.status, RunStatus::WaitingHuman);

    fs::write(
        repo_dir(&run).join(".agents/signals/_checkpoint.json"),
        "{\"status\":\"CONTINUE\",\"message\":\"go ahead\"}",
    )
    .expect("human decision");

    let run = harness.orchestrator.resume(run.id).expect("resume");
    assert_eq!(run.status, RunStatus::Complete);

    let execs = executions(&harness, run.id);
    assert_eq!(execs.len(), 2);
    assert_eq!(execs[0].agent_name, "_checkpoint");
    assert_eq!(execs[1].agent_name, "deployer");
    assert_eq!(execs[1].status, ExecStatus::Complete);
    assert!(invocations(&run).iter().any(|line| line == "agent:deployer"));
}

#[test]
fn zero_call_script_completes_with_no_executions() {
    let harness = harness(DONE_MOCK);
    let run = start(&harness, "empty", "function workflow(p)\nend\n", "noop");

    let run = harness.orchestrator.execute(run.id).expect("execute");
    assert_eq!(run.status, RunStatus::Complete);
    assert!(run.completed_at.is_some());
    assert!(executions(&harness, run.id).is_empty());
}

#[test]
fn stuck_call_records_the_reason() {
    let harness = harness(DONE_MOCK);
    let run = start(
        &harness,
        "stuck",
        "function workflow(p)\n  stuck(\"blocked on infra\")\nend\n",
        "try",
    );

    let run = harness.orchestrator.execute(run.id).expect("execute");
    assert_eq!(run.status, RunStatus::Stuck);
    assert_eq!(run.error, "blocked on infra");
    assert!(run.completed_at.is_some());
}

#[test]
fn uncaught_script_error_fails_the_run() {
    let harness = harness(DONE_MOCK);
    let run = start(
        &harness,
        "broken",
        "function workflow(p)\n  error(\"boom\")\nend\n",
        "try",
    );

    let err = harness
        .orchestrator
        .execute(run.id)
        .expect_err("should fail");
    assert!(err.to_string().contains("workflow execution failed"));

    let run = harness.orchestrator.get_run(run.id).expect("get");
    assert_eq!(run.status, RunStatus::Failed);
    assert!(run.error.contains("boom"));
    assert!(run.completed_at.is_some());
}

#[test]
fn script_without_workflow_function_fails_the_run() {
    let harness = harness(DONE_MOCK);
    let run = start(&harness, "no-entry", "local x = 1\n", "try");

    harness
        .orchestrator
        .execute(run.id)
        .expect_err("should fail");
    let run = harness.orchestrator.get_run(run.id).expect("get");
    assert_eq!(run.status, RunStatus::Failed);
    assert!(run.error.contains("workflow"));
}

#[test]
fn launch_failure_surfaces_an_error_signal_to_the_script() {
    let dir = tempdir().expect("tempdir");
    let config = Config::with_data_dir(dir.path().join("data"));
    config.ensure_data_dir().expect("data dir");
    let orchestrator = Orchestrator::new(config.clone())
        .expect("orchestrator")
        .with_runner(AgentRunner::new(
            dir.path().join("no-such-binary").display().to_string(),
        ));

    let spec_path = config.user_spec_dir.join("error-branch.lua");
    fs::write(
        &spec_path,
        r#"
function workflow(p)
  local s = run("coder", p)
  if s.status == "ERROR" then
    log("agent error: " .. s.reason)
    return
  end
  stuck("expected an error signal")
end
"#,
    )
    .expect("spec");

    let run = orchestrator
        .start_run(&spec_path, "error-branch", "try", None)
        .expect("start");
    let run = orchestrator.execute(run.id).expect("execute");
    assert_eq!(run.status, RunStatus::Complete);

    let execs = orchestrator.executions_for_run(run.id).expect("execs");
    assert_eq!(execs.len(), 1);
    assert_eq!(execs[0].status, ExecStatus::Failed);

    let log = fs::read_to_string(config.data_dir.join("logs/shop.log")).expect("log");
    assert!(log.contains("agent error:"));
}

#[test]
fn resume_of_a_completed_run_replays_without_invoking_agents() {
    let harness = harness(DONE_MOCK);
    let run = start(
        &harness,
        "replay",
        "function workflow(p)\n  run(\"a\", p)\n  run(\"b\")\nend\n",
        "build it",
    );

    let run = harness.orchestrator.execute(run.id).expect("execute");
    assert_eq!(run.status, RunStatus::Complete);
    assert_eq!(invocations(&run).len(), 2);

    let run = harness.orchestrator.resume(run.id).expect("resume");
    assert_eq!(run.status, RunStatus::Complete);
    assert_eq!(
        executions(&harness, run.id).len(),
        2,
        "no new execution records on replay"
    );
    assert_eq!(
        invocations(&run).len(),
        2,
        "agents are invoked at most once per completed call"
    );
}

#[test]
fn sandbox_blocks_ambient_authority_from_scripts() {
    let harness = harness(DONE_MOCK);
    let script = r#"
function workflow(p)
  if os ~= nil or io ~= nil or load ~= nil or dofile ~= nil then
    stuck("sandbox leak")
  end
  if math.random ~= nil then
    stuck("nondeterministic math available")
  end
end
"#;
    let run = start(&harness, "sandboxed", script, "inspect");

    let run = harness.orchestrator.execute(run.id).expect("execute");
    assert_eq!(run.status, RunStatus::Complete);
}

#[test]
fn script_logs_reach_the_engine_log() {
    let harness = harness(DONE_MOCK);
    let run = start(
        &harness,
        "logged",
        "function workflow(p)\n  log(\"hello from lua\")\nend\n",
        "say hi",
    );

    harness.orchestrator.execute(run.id).expect("execute");
    let log = fs::read_to_string(harness.config.data_dir.join("logs/shop.log")).expect("log");
    assert!(log.contains("hello from lua"));
    assert!(log.contains(&format!("run_id={}", run.id)));
}
