//! Translator client: turns one plan step into a single-line shell command.

use std::sync::LazyLock;

use serde_json::Map;
use serde_json::Value;
use serde_json::json;

use crate::client;
use crate::client::ModelClient;
use crate::config::Config;
use crate::error::Result;
use crate::error::TerminusErr;
use crate::models;
use crate::models::ResponseItem;
use crate::models::ResponsesApiResponse;

pub(crate) const EXECUTOR_MODEL: &str = "gpt-oss-20b";

const TRANSLATOR_SYSTEM_PROMPT: &str = "You are a Translator. Output only one valid single-line bash command for the sub-task.\n\
No explanations, no comments, no multi-line, no prompts for confirmation.";

/// Strict function-calling tool forcing the model to return a single-line
/// bash command.
static EMIT_BASH_TOOLS: LazyLock<Value> = LazyLock::new(|| {
    json!([{
        "type": "function",
        "name": "emit_bash",
        "description": "Return a single-line executable bash command for the given sub-task. No comments.",
        "parameters": {
            "type": "object",
            "properties": {
                "command": {
                    "type": "string",
                    "description": "Single-line bash command. Must not contain newlines."
                }
            },
            "required": ["command"],
            "additionalProperties": false
        },
        "strict": true
    }])
});

/// Translate `sub_task` into a single-line bash command. The result is
/// normalized before it is returned so downstream invariants hold prior to
/// sanitization.
pub async fn translate(
    client: &ModelClient,
    config: &Config,
    sub_task: &str,
    session_id: &str,
    previous_response_id: Option<&str>,
) -> Result<String> {
    if config.offline {
        return Ok(offline_command(sub_task));
    }

    let strict = config.executor_strict_function;

    let mut payload = Map::new();
    payload.insert("model".to_string(), json!(EXECUTOR_MODEL));
    payload.insert(
        "input".to_string(),
        client::input_messages(TRANSLATOR_SYSTEM_PROMPT, sub_task),
    );
    payload.insert("reasoning".to_string(), json!({"effort": "minimal"}));
    payload.insert("text".to_string(), json!({"verbosity": "low"}));
    payload.insert(
        "metadata".to_string(),
        client::safety_tag(&config.safety_identifier_prefix, session_id),
    );
    if strict {
        payload.insert("tools".to_string(), EMIT_BASH_TOOLS.clone());
        payload.insert(
            "tool_choice".to_string(),
            json!({
                "type": "allowed_tools",
                "mode": "required",
                "tools": [{"type": "function", "name": "emit_bash"}],
            }),
        );
    }
    if let Some(prev) = previous_response_id {
        payload.insert("previous_response_id".to_string(), json!(prev));
    }

    let resp = client.responses(payload).await?;

    let raw = if strict {
        extract_function_call_command(&resp)
            .unwrap_or_else(|| models::extract_output_text(&resp))
    } else {
        let text = models::extract_output_text(&resp);
        sniff_command_json(&text).unwrap_or(text)
    };

    let command = normalize_command(&raw);
    if command.is_empty() {
        return Err(TerminusErr::EmptyCommand);
    }
    Ok(command)
}

/// Collapse a shell snippet to a stable single line: newlines, carriage
/// returns and tabs become spaces and runs of whitespace are squashed.
/// Idempotent; never introduces a newline.
pub fn normalize_command(cmd: &str) -> String {
    cmd.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Extract the `command` argument from a strict `emit_bash` function call.
/// Empty commands are treated as absent so the caller can fall back to
/// output text.
fn extract_function_call_command(resp: &ResponsesApiResponse) -> Option<String> {
    resp.output.iter().find_map(|item| match item {
        ResponseItem::FunctionCall {
            name, arguments, ..
        } if name == "emit_bash" => {
            let args: Value = serde_json::from_str(arguments).ok()?;
            let command = args.get("command")?.as_str()?.trim().to_string();
            if command.is_empty() { None } else { Some(command) }
        }
        _ => None,
    })
}

/// Non-strict responses may still be a `{"command": ...}` object; prefer the
/// embedded command when they are.
fn sniff_command_json(raw: &str) -> Option<String> {
    let value: Value = serde_json::from_str(raw.trim()).ok()?;
    let command = value.get("command")?.as_str()?.trim();
    if command.is_empty() {
        None
    } else {
        Some(command.to_string())
    }
}

/// Deterministic sub-task → command map used when no upstream credentials
/// are configured, so end-to-end runs work without network access.
fn offline_command(sub_task: &str) -> String {
    let task = sub_task.trim().to_ascii_lowercase();
    if task.contains("print hello") {
        "echo hello".to_string()
    } else if task.contains("print completion") || task.contains("print done") {
        "echo done".to_string()
    } else if task.contains("cause failure") {
        // Force a non-zero exit to exercise the error path.
        "bash -lc 'exit 1'".to_string()
    } else if task.contains("remediate") {
        "echo remediate".to_string()
    } else {
        "echo noop".to_string()
    }
}
