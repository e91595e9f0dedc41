//! Planner client: decomposes a goal (or a failure context) into an ordered
//! list of imperative steps.

use std::sync::LazyLock;

use serde_json::Map;
use serde_json::Value;
use serde_json::json;

use crate::client;
use crate::client::ModelClient;
use crate::config::Config;
use crate::error::Result;
use crate::models;

pub(crate) const PLANNER_MODEL: &str = "gpt-5";

const PLANNER_SYSTEM_PROMPT: &str = "You are an expert DevOps and systems engineer Planner.\n\
Task: Decompose the user's goal into a minimal, correct step-by-step plan.\n\
Output STRICT JSON with a single key \"plan\": a JSON array of short, imperative steps.\n\
Do not include explanations, only the JSON object.";

/// Structured-output schema a strict-JSON plan must conform to.
static PLAN_SCHEMA: LazyLock<Value> = LazyLock::new(|| {
    json!({
        "name": "plan_schema",
        "schema": {
            "type": "object",
            "additionalProperties": false,
            "required": ["plan"],
            "properties": {
                "plan": {
                    "type": "array",
                    "minItems": 1,
                    "maxItems": 50,
                    "items": {"type": "string", "minLength": 1}
                }
            }
        },
        "strict": true
    })
});

/// Ask the planner for a plan. `previous_response_id` chains the request to
/// an earlier response when the upstream supports it.
pub async fn plan(
    client: &ModelClient,
    config: &Config,
    user_goal: &str,
    session_id: &str,
    previous_response_id: Option<&str>,
) -> Result<Vec<String>> {
    if config.offline {
        return Ok(offline_plan(user_goal));
    }

    let mut payload = Map::new();
    payload.insert("model".to_string(), json!(PLANNER_MODEL));
    payload.insert(
        "input".to_string(),
        client::input_messages(PLANNER_SYSTEM_PROMPT, user_goal),
    );
    payload.insert("reasoning".to_string(), json!({"effort": "medium"}));
    payload.insert("text".to_string(), json!({"verbosity": "low"}));
    payload.insert(
        "metadata".to_string(),
        client::safety_tag(&config.safety_identifier_prefix, session_id),
    );
    if config.planner_strict_json {
        payload.insert(
            "response_format".to_string(),
            json!({"type": "json_schema", "json_schema": PLAN_SCHEMA.clone()}),
        );
    }
    let (tools, tool_choice) = build_planner_tools(config);
    if !tools.is_empty() {
        payload.insert("tools".to_string(), Value::Array(tools));
        if let Some(choice) = tool_choice {
            payload.insert("tool_choice".to_string(), choice);
        }
    }
    if let Some(prev) = previous_response_id {
        payload.insert("previous_response_id".to_string(), json!(prev));
    }

    let resp = client.responses(payload).await?;
    let text = models::extract_output_text(&resp);

    let mut steps = if config.planner_strict_json {
        parse_strict_json_plan(&text).unwrap_or_else(|| parse_plan_text(&text))
    } else {
        parse_plan_text(&text)
    };
    if steps.is_empty() {
        // Safety fallback: a one-step plan.
        steps = vec![format!("Analyze and begin: {user_goal}")];
    }
    Ok(steps)
}

/// Tool and tool-choice payloads for the planner call. Tools are opt-in via
/// configuration; the choice object constrains which tools may be used.
fn build_planner_tools(config: &Config) -> (Vec<Value>, Option<Value>) {
    let mut tools = Vec::new();
    let mut allowed = Vec::new();

    if config.enable_planner_web_search {
        tools.push(json!({"type": "web_search_preview"}));
        allowed.push(json!({"type": "web_search_preview"}));
    }
    if config.enable_planner_file_search {
        tools.push(json!({
            "type": "file_search",
            "vector_store_ids": config.planner_vector_store_ids,
        }));
        allowed.push(json!({"type": "file_search"}));
    }
    if config.enable_planner_mcp {
        for srv in &config.planner_mcp_servers {
            tools.push(json!({
                "type": "mcp",
                "server_label": srv.server_label,
                "server_url": srv.server_url,
                "require_approval": srv.require_approval,
            }));
            allowed.push(json!({"type": "mcp", "server_label": srv.server_label}));
        }
    }

    let tool_choice = (!allowed.is_empty())
        .then(|| json!({"type": "allowed_tools", "mode": "auto", "tools": allowed}));
    (tools, tool_choice)
}

/// Strict path: the text must be a JSON object with a `plan` array.
/// `None` means the shape did not match and the lenient parser should run.
fn parse_strict_json_plan(text: &str) -> Option<Vec<String>> {
    let value: Value = serde_json::from_str(text).ok()?;
    let plan = value.get("plan")?.as_array()?;
    Some(plan.iter().filter_map(value_to_step).collect())
}

/// Accepts either a JSON plan (object or bare array) or a plain-text bullet
/// list; returns the trimmed, non-empty steps.
fn parse_plan_text(plan_text: &str) -> Vec<String> {
    if let Ok(value) = serde_json::from_str::<Value>(plan_text) {
        match &value {
            Value::Object(map) => {
                if let Some(Value::Array(items)) = map.get("plan") {
                    return items.iter().filter_map(value_to_step).collect();
                }
            }
            Value::Array(items) => {
                return items.iter().filter_map(value_to_step).collect();
            }
            _ => {}
        }
    }

    plan_text
        .lines()
        .map(strip_bullet)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect()
}

fn value_to_step(value: &Value) -> Option<String> {
    let step = match value {
        Value::String(s) => s.trim().to_string(),
        other => other.to_string(),
    };
    if step.is_empty() { None } else { Some(step) }
}

/// Strip common bullet and numbering prefixes from one plan line.
fn strip_bullet(line: &str) -> &str {
    let trimmed = line.trim();
    for prefix in ["- ", "* ", "\u{2022} "] {
        if let Some(rest) = trimmed.strip_prefix(prefix) {
            return rest.trim();
        }
    }
    if let Some(dot) = trimmed.find(". ")
        && dot > 0
        && trimmed[..dot].chars().all(|c| c.is_ascii_digit())
    {
        return trimmed[dot + 2..].trim();
    }
    trimmed
}

/// Deterministic plan used when no upstream credentials are configured.
///
/// A fresh goal is split on `->` into its steps. A re-plan prompt (recognized
/// by the `Original goal:` / `Failed step:` lines the engine embeds) resumes
/// the original step list after the failed step, so failure-remediation runs
/// terminate without network access.
pub(crate) fn offline_plan(user_goal: &str) -> Vec<String> {
    if let Some((goal, failed_step)) = parse_replan_context(user_goal) {
        let steps = split_goal_steps(&goal);
        if let Some(pos) = steps.iter().position(|s| *s == failed_step) {
            let rest = steps[pos + 1..].to_vec();
            if !rest.is_empty() {
                return rest;
            }
        }
        return vec!["Confirm completion".to_string()];
    }

    let steps = split_goal_steps(user_goal);
    if steps.is_empty() {
        vec![format!("Analyze and begin: {user_goal}")]
    } else {
        steps
    }
}

fn split_goal_steps(goal: &str) -> Vec<String> {
    goal.split("->")
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn parse_replan_context(prompt: &str) -> Option<(String, String)> {
    let mut goal = None;
    let mut failed = None;
    for line in prompt.lines() {
        if let Some(rest) = line.strip_prefix("Original goal: ") {
            goal = Some(rest.trim().to_string());
        } else if let Some(rest) = line.strip_prefix("Failed step: ") {
            failed = Some(rest.trim().to_string());
        }
    }
    Some((goal?, failed?))
}
