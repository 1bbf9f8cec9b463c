/// Render the prompt handed to an agent for one `run()` call. The script
/// controls the task text; the engine appends the workspace protocol
/// directives every agent needs.
pub fn build_agent_prompt(
    agent: &str,
    spec_name: &str,
    prompt: &str,
    initial_prompt: &str,
    call_index: i64,
) -> String {
    let mut result = if prompt.is_empty() {
        initial_prompt.to_string()
    } else {
        prompt.to_string()
    };

    if call_index > 1 {
        result.push_str("\n\n---\n");
        result.push_str(
            "IMPORTANT: Read `.agents/context.md` for context from previous agents before starting work.",
        );
    }

    result.push_str(&format!(
        "\n\nYou are the '{agent}' agent in the '{spec_name}' workflow."
    ));

    result.push_str("\n\n---\n");
    result.push_str("IMPORTANT: When you have completed your task, you MUST write a JSON signal file.\n\n");
    result.push_str(&format!("Write to: .agents/signals/{agent}.json\n\n"));
    result.push_str(
        "Example:\n```json\n{\"status\": \"DONE\", \"summary\": \"Completed the task.\"}\n```\n",
    );

    result
}

/// The built-in checkpoint prompt used by `pause()`. The checkpoint agent
/// is expected to consult the human and then write CONTINUE or STOP.
pub fn build_checkpoint_prompt(message: &str) -> String {
    format!(
        r#"The workflow has paused for human input.

**Checkpoint:** {message}

**What to do:**
1. Review the workspace state
2. Check recent changes and test results
3. Decide whether to continue or stop

When ready, write your decision to .agents/signals/_checkpoint.json:

To continue:
```json
{{"status": "CONTINUE", "message": "Your optional note here"}}
```

To stop:
```json
{{"status": "STOP", "reason": "Reason for stopping"}}
```

Wait for the human to provide guidance before writing your decision."#
    )
}
