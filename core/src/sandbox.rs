//! Sandboxed command execution.
//!
//! Commands run under a login shell, dropped to an unprivileged identity via
//! `sudo` when the wrapper is available. The sanitizer is consulted before
//! every spawn; rejected commands never reach a shell.

use std::path::Path;
use std::path::PathBuf;
use std::process::ExitStatus;
use std::process::Stdio;

use tracing::debug;

use crate::config::Config;
use crate::sanitize;
use crate::sanitize::SanitizePolicy;

/// Exit code reported when the sanitizer rejects a command without spawning.
pub const EXIT_CODE_REJECTED: i32 = -2;

/// Exit code reported when the executor itself fails to spawn the child.
pub const EXIT_CODE_SPAWN_FAILED: i32 = -1;

/// Captured output of one sandboxed command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecResult {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl ExecResult {
    fn rejected(reason: &str) -> Self {
        Self {
            stdout: String::new(),
            stderr: format!("Rejected: {reason}"),
            exit_code: EXIT_CODE_REJECTED,
        }
    }

    fn spawn_failed(message: String) -> Self {
        Self {
            stdout: String::new(),
            stderr: message,
            exit_code: EXIT_CODE_SPAWN_FAILED,
        }
    }

    fn from_captured(status: ExitStatus, stdout: Vec<u8>, stderr: Vec<u8>) -> Self {
        Self {
            stdout: String::from_utf8_lossy(&stdout).to_string(),
            stderr: String::from_utf8_lossy(&stderr).to_string(),
            exit_code: status.code().unwrap_or(-1),
        }
    }
}

/// How commands are spawned. Resolved once at startup so the per-command
/// path is branch-free apart from the argv choice.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SandboxMode {
    /// `sudo -u <user> bash -lc <cmd>`.
    PrivilegeDrop { sudo_path: PathBuf, user: String },
    /// `bash -lc <cmd>` as the current user.
    Local,
}

macro_rules! shell_command {
    ($cmd_type:path, $argv:expr) => {{
        let mut cmd = <$cmd_type>::new(&$argv[0]);
        cmd.args(&$argv[1..]);

        // Do not create a file descriptor for stdin: some commands probe an
        // inherited stdin and hang forever waiting for input.
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
        cmd
    }};
}

/// Spawns sanitized commands under the mode fixed at construction time.
/// Holds no per-session state.
#[derive(Debug, Clone)]
pub struct Sandboxer {
    mode: SandboxMode,
    policy: SanitizePolicy,
}

impl Sandboxer {
    /// Probe capabilities and fix the execution mode. A missing `sudo`
    /// silently falls back to local execution so the same binary serves
    /// hardened deployments and developer machines.
    pub fn from_config(config: &Config) -> Self {
        let mode = if config.sandbox_force_local {
            SandboxMode::Local
        } else if let Some(sudo_path) = find_on_path("sudo") {
            SandboxMode::PrivilegeDrop {
                sudo_path,
                user: config.sandbox_user.clone(),
            }
        } else {
            debug!("sudo not found on PATH; running commands locally");
            SandboxMode::Local
        };
        Self {
            mode,
            policy: SanitizePolicy::from_config(config),
        }
    }

    pub fn with_mode(mode: SandboxMode, policy: SanitizePolicy) -> Self {
        Self { mode, policy }
    }

    pub fn mode(&self) -> &SandboxMode {
        &self.mode
    }

    fn argv(&self, command: &str) -> Vec<String> {
        match &self.mode {
            SandboxMode::PrivilegeDrop { sudo_path, user } => vec![
                sudo_path.to_string_lossy().into_owned(),
                "-u".to_string(),
                user.clone(),
                "bash".to_string(),
                "-lc".to_string(),
                command.to_string(),
            ],
            SandboxMode::Local => vec![
                "bash".to_string(),
                "-lc".to_string(),
                command.to_string(),
            ],
        }
    }

    /// Run `command` and capture its output in full. The returned exit code
    /// is the child's verbatim; sanitizer rejections and spawn failures are
    /// encoded as [`EXIT_CODE_REJECTED`] and [`EXIT_CODE_SPAWN_FAILED`].
    pub async fn execute(&self, command: &str) -> ExecResult {
        if let Err(reason) = sanitize::check_command(command, &self.policy) {
            return ExecResult::rejected(&reason);
        }
        let argv = self.argv(command);
        let mut cmd = shell_command!(tokio::process::Command, argv);
        cmd.kill_on_drop(true);
        match cmd.output().await {
            Ok(output) => ExecResult::from_captured(output.status, output.stdout, output.stderr),
            Err(e) => ExecResult::spawn_failed(e.to_string()),
        }
    }

    /// Blocking form of [`Sandboxer::execute`] with identical semantics, for
    /// callers without a Tokio runtime.
    pub fn execute_blocking(&self, command: &str) -> ExecResult {
        if let Err(reason) = sanitize::check_command(command, &self.policy) {
            return ExecResult::rejected(&reason);
        }
        let argv = self.argv(command);
        let mut cmd = shell_command!(std::process::Command, argv);
        match cmd.output() {
            Ok(output) => ExecResult::from_captured(output.status, output.stdout, output.stderr),
            Err(e) => ExecResult::spawn_failed(e.to_string()),
        }
    }
}

/// Verify the sandbox identity exists (`id -u <user>`). Used by the startup
/// readiness probe; a missing identity degrades the service but does not
/// refuse connections.
pub fn check_sandbox_user(config: &Config) -> Result<(), String> {
    if config.sandbox_skip_user_check {
        return Ok(());
    }
    let status = std::process::Command::new("id")
        .arg("-u")
        .arg(&config.sandbox_user)
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status();
    match status {
        Ok(status) if status.success() => Ok(()),
        Ok(_) => Err(format!(
            "sandbox user '{}' does not exist",
            config.sandbox_user
        )),
        Err(e) => Err(format!(
            "could not check sandbox user '{}': {e}",
            config.sandbox_user
        )),
    }
}

/// Locate `program` on `PATH`. Only plain files with an execute bit count.
fn find_on_path(program: &str) -> Option<PathBuf> {
    let path = std::env::var_os("PATH")?;
    std::env::split_paths(&path)
        .map(|dir| dir.join(program))
        .find(|candidate| is_executable(candidate))
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    path.metadata()
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}
