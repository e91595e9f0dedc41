use std::io;

use reqwest::StatusCode;
use thiserror::Error;
use tokio::task::JoinError;

pub type Result<T> = std::result::Result<T, TerminusErr>;

#[derive(Error, Debug)]
pub enum TerminusErr {
    /// Unexpected, non-transient HTTP status from the upstream model API.
    /// The body is included so callers see the exact upstream message
    /// instead of an opaque status line.
    #[error("unexpected status {0}: {1}")]
    UnexpectedStatus(StatusCode, String),

    /// Transient-error retry budget exhausted.
    #[error("exceeded retry limit, last status: {0}")]
    RetryLimit(StatusCode),

    /// The translator produced no usable command.
    #[error("translator returned an empty command")]
    EmptyCommand,

    /// Engine loop died unexpectedly.
    #[error("internal error; engine loop died unexpectedly")]
    EngineDied,

    #[error("{0}")]
    EnvVar(EnvVarError),

    // -----------------------------------------------------------------
    // Automatic conversions for common external error types
    // -----------------------------------------------------------------
    #[error(transparent)]
    Io(#[from] io::Error),

    #[error(transparent)]
    Reqwest(#[from] reqwest::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    TokioJoin(#[from] JoinError),
}

#[derive(Debug)]
pub struct EnvVarError {
    /// Name of the environment variable that is missing.
    pub var: String,

    /// Optional instructions to help the user get a valid value for the
    /// variable and set it.
    pub instructions: Option<String>,
}

impl std::fmt::Display for EnvVarError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Missing environment variable: `{}`.", self.var)?;
        if let Some(instructions) = &self.instructions {
            write!(f, " {instructions}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_var_error_includes_instructions() {
        let err = EnvVarError {
            var: "OPENAI_API_KEY".to_string(),
            instructions: Some("Set it or enable TERMINUS_FAKE=true.".to_string()),
        };
        assert_eq!(
            err.to_string(),
            "Missing environment variable: `OPENAI_API_KEY`. Set it or enable TERMINUS_FAKE=true."
        );
    }
}
