//! Lexical gate for candidate shell commands.
//!
//! The sanitizer is the single authoritative gate in front of the sandbox:
//! the executor consults it before every spawn and never bypasses it.

use crate::config::Config;

/// Sanitization policy, derived from [`Config`].
#[derive(Debug, Clone)]
pub struct SanitizePolicy {
    /// Maximum command length in characters.
    pub max_len: usize,
    /// Reject ASCII control characters other than tab.
    pub strict: bool,
    /// First-token allowlist; `None` disables the gate.
    pub allowlist: Option<Vec<String>>,
}

impl SanitizePolicy {
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_len: config.max_command_len,
            strict: config.strict_sanitize,
            allowlist: config.cmd_allowlist.clone(),
        }
    }
}

/// Decide whether `command` may be handed to a shell. `Err` carries the
/// rejection reason.
pub fn check_command(command: &str, policy: &SanitizePolicy) -> Result<(), String> {
    if command.trim().is_empty() {
        return Err("command is empty".to_string());
    }

    let len = command.chars().count();
    if len > policy.max_len {
        return Err(format!(
            "command length {len} exceeds the maximum of {}",
            policy.max_len
        ));
    }

    if command.contains('\n') || command.contains('\r') {
        return Err("command contains a newline or carriage return".to_string());
    }
    if command.contains('\0') {
        return Err("command contains a NUL byte".to_string());
    }

    if policy.strict
        && let Some(c) = command.chars().find(|&c| c.is_ascii_control() && c != '\t')
    {
        return Err(format!(
            "command contains the control character {:#04x}",
            c as u32
        ));
    }

    if let Some(allowlist) = &policy.allowlist {
        let Some(words) = shlex::split(command) else {
            return Err("command could not be tokenized".to_string());
        };
        match words.first() {
            Some(first) if allowlist.iter().any(|entry| entry == first) => {}
            Some(first) => {
                return Err(format!("command '{first}' is not permitted by the allowlist"));
            }
            None => return Err("command is empty".to_string()),
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    #![allow(clippy::expect_used)]

    use super::*;

    fn policy() -> SanitizePolicy {
        SanitizePolicy {
            max_len: 256,
            strict: true,
            allowlist: None,
        }
    }

    #[test]
    fn rejects_empty_and_whitespace_commands() {
        assert!(check_command("", &policy()).is_err());
        assert!(check_command("   \t ", &policy()).is_err());
    }

    #[test]
    fn rejects_newlines_with_a_newline_reason() {
        let reason = check_command("echo hello\necho world", &policy())
            .expect_err("newline must be rejected");
        assert!(reason.contains("newline"));
        assert!(check_command("echo hi\rls", &policy()).is_err());
    }

    #[test]
    fn rejects_nul_bytes() {
        assert!(check_command("echo \0", &policy()).is_err());
    }

    #[test]
    fn rejects_excessive_length() {
        let short = SanitizePolicy {
            max_len: 10,
            ..policy()
        };
        let reason =
            check_command("echo this is too long", &short).expect_err("length must be rejected");
        assert!(reason.contains("exceeds"));
    }

    #[test]
    fn strict_mode_rejects_control_chars_but_allows_tab() {
        let reason = check_command("echo \u{7}", &policy()).expect_err("bell must be rejected");
        assert!(reason.contains("control"));

        assert!(check_command("echo\tok", &policy()).is_ok());

        let relaxed = SanitizePolicy {
            strict: false,
            ..policy()
        };
        assert!(check_command("echo \u{7}", &relaxed).is_ok());
    }

    #[test]
    fn allowlist_blocks_unlisted_first_tokens() {
        let gated = SanitizePolicy {
            allowlist: Some(vec!["echo".to_string()]),
            ..policy()
        };
        let reason = check_command("uname -a", &gated).expect_err("uname must be rejected");
        assert!(reason.contains("not permitted"));
        assert!(check_command("echo ok", &gated).is_ok());
    }

    #[test]
    fn allowlist_rejects_untokenizable_commands() {
        let gated = SanitizePolicy {
            allowlist: Some(vec!["echo".to_string()]),
            ..policy()
        };
        assert!(check_command("echo 'unterminated", &gated).is_err());
    }

    #[test]
    fn decision_is_total_over_arbitrary_unicode() {
        assert!(check_command("echo héllo wörld ✓", &policy()).is_ok());
    }
}
