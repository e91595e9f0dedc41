use env_flags::env_flags;

env_flags! {
    /// Reject goals longer than this many characters.
    pub MAX_GOAL_LEN: usize = 2000;

    /// Minimum interval, in seconds, between accepted `execute_goal`
    /// requests on one client connection.
    pub EXECUTE_GOAL_MIN_INTERVAL_SEC: f64 = 2.0;

    /// Sanitizer length cap for candidate commands.
    pub MAX_COMMAND_LEN: usize = 2000;

    /// Reject ASCII control characters (tab excluded) in commands.
    pub SANDBOX_STRICT_SANITIZE: bool = true;

    /// Comma-separated first-token allowlist; empty disables the gate.
    pub SANDBOX_CMD_ALLOWLIST: &str = "";

    /// Identity commands are executed as when privilege drop is available.
    pub SANDBOX_USER: &str = "sandboxuser";

    /// Run commands directly instead of dropping privileges via sudo.
    pub SANDBOX_FORCE_LOCAL: bool = false;

    /// Skip the startup check that the sandbox identity exists.
    pub SANDBOX_SKIP_USER_CHECK: bool = false;

    /// Request strict structured-JSON plans from the planner model.
    pub PLANNER_STRICT_JSON: bool = true;

    /// Force the translator model through the `emit_bash` function call.
    pub EXECUTOR_STRICT_FUNCTION: bool = true;

    pub ENABLE_PLANNER_WEB_SEARCH: bool = false;
    pub ENABLE_PLANNER_FILE_SEARCH: bool = false;
    pub ENABLE_PLANNER_MCP: bool = false;

    /// Prefix for the `safety_identifier` tag attached to upstream requests.
    pub SAFETY_IDENTIFIER_PREFIX: &str = "terminus-";

    pub OPENAI_API_KEY: Option<&str> = None;
    pub OPENAI_API_BASE: &str = "https://api.openai.com/v1";

    /// Deterministic offline mode; implied when no API key is configured.
    pub TERMINUS_FAKE: bool = false;

    /// Retries for transient upstream errors (429/500/502/503/504).
    pub TERMINUS_REQUEST_MAX_RETRIES: u64 = 2;

    /// Re-plans allowed per workflow before a terminal planner error.
    pub TERMINUS_MAX_REPLANS: u32 = 10;

    /// In-memory step records retained per workflow.
    pub TERMINUS_MAX_HISTORY: usize = 64;
}
