use std::time::Duration;

use crate::flags;

/// Engine configuration, snapshotted from the environment at startup.
///
/// Call sites own a plain value; tests construct one directly (typically via
/// [`Config::from_env`] plus field overrides) instead of mutating the process
/// environment.
#[derive(Debug, Clone)]
pub struct Config {
    /// Reject goals longer than this many characters.
    pub max_goal_len: usize,

    /// Per-client minimum interval between accepted `execute_goal` requests.
    pub execute_goal_min_interval: Duration,

    /// Sanitizer length cap for candidate commands.
    pub max_command_len: usize,

    /// Reject ASCII control characters (tab excluded) in commands.
    pub strict_sanitize: bool,

    /// First-token allowlist; `None` disables the gate.
    pub cmd_allowlist: Option<Vec<String>>,

    /// Identity to drop to when the privilege-drop wrapper is available.
    pub sandbox_user: String,

    /// Bypass privilege drop and run commands as the current user.
    pub sandbox_force_local: bool,

    /// Skip the startup check that the sandbox identity exists.
    pub sandbox_skip_user_check: bool,

    /// Request strict structured-JSON plans from the planner model.
    pub planner_strict_json: bool,

    /// Force the translator model through the `emit_bash` function call.
    pub executor_strict_function: bool,

    pub enable_planner_web_search: bool,
    pub enable_planner_file_search: bool,
    pub enable_planner_mcp: bool,

    /// Vector store ids attached to the planner's file-search tool.
    pub planner_vector_store_ids: Vec<String>,

    /// Remote tool servers offered to the planner when MCP is enabled.
    pub planner_mcp_servers: Vec<McpServerSpec>,

    /// Prefix for the `safety_identifier` correlation tag.
    pub safety_identifier_prefix: String,

    pub api_key: Option<String>,
    pub api_base: String,

    /// Deterministic offline mode: the planner splits the goal on `->` and
    /// the translator maps fixed substrings to commands, so end-to-end runs
    /// need no network.
    pub offline: bool,

    /// Retries for transient upstream errors.
    pub request_max_retries: u64,

    /// Re-plans allowed per workflow before a terminal planner error.
    pub max_replans: u32,

    /// In-memory step records retained per workflow.
    pub max_history: usize,
}

/// Remote tool server attachment offered to the planner.
#[derive(Debug, Clone)]
pub struct McpServerSpec {
    pub server_label: String,
    pub server_url: String,
    pub require_approval: String,
}

impl Config {
    pub fn from_env() -> Self {
        let api_key = flags::OPENAI_API_KEY.map(str::to_string);
        let offline = *flags::TERMINUS_FAKE || api_key.is_none();
        Self {
            max_goal_len: *flags::MAX_GOAL_LEN,
            execute_goal_min_interval: Duration::try_from_secs_f64(
                *flags::EXECUTE_GOAL_MIN_INTERVAL_SEC,
            )
            .unwrap_or_default(),
            max_command_len: *flags::MAX_COMMAND_LEN,
            strict_sanitize: *flags::SANDBOX_STRICT_SANITIZE,
            cmd_allowlist: parse_allowlist(&flags::SANDBOX_CMD_ALLOWLIST),
            sandbox_user: flags::SANDBOX_USER.to_string(),
            sandbox_force_local: *flags::SANDBOX_FORCE_LOCAL,
            sandbox_skip_user_check: *flags::SANDBOX_SKIP_USER_CHECK,
            planner_strict_json: *flags::PLANNER_STRICT_JSON,
            executor_strict_function: *flags::EXECUTOR_STRICT_FUNCTION,
            enable_planner_web_search: *flags::ENABLE_PLANNER_WEB_SEARCH,
            enable_planner_file_search: *flags::ENABLE_PLANNER_FILE_SEARCH,
            enable_planner_mcp: *flags::ENABLE_PLANNER_MCP,
            planner_vector_store_ids: Vec::new(),
            planner_mcp_servers: Vec::new(),
            safety_identifier_prefix: flags::SAFETY_IDENTIFIER_PREFIX.to_string(),
            api_key,
            api_base: flags::OPENAI_API_BASE.to_string(),
            offline,
            request_max_retries: *flags::TERMINUS_REQUEST_MAX_RETRIES,
            max_replans: *flags::TERMINUS_MAX_REPLANS,
            max_history: *flags::TERMINUS_MAX_HISTORY,
        }
    }
}

fn parse_allowlist(raw: &str) -> Option<Vec<String>> {
    let entries: Vec<String> = raw
        .split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(str::to_string)
        .collect();
    if entries.is_empty() { None } else { Some(entries) }
}
