//! Defines the wire protocol between a client and the engine.
//!
//! The transport is a bidirectional, per-client channel carrying JSON
//! envelopes of the shape `{"type": ..., "payload": ...}`. Inbound envelopes
//! deserialize to [`Op`]; outbound envelopes serialize from [`EventMsg`].
//! Delivery order to a single client matches emission order.

use serde::Deserialize;
use serde::Serialize;
use strum_macros::Display;

/// Request from the client.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
#[non_exhaustive]
pub enum Op {
    /// Start a workflow for a natural-language goal. At most one workflow
    /// runs per client; a new goal supersedes (and cancels) a running one.
    ExecuteGoal(ExecuteGoalParams),
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct ExecuteGoalParams {
    pub goal: String,
}

/// Event from the engine.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
#[non_exhaustive]
pub enum EventMsg {
    /// Connection-level notice (first event after connecting).
    Status(StatusEvent),

    /// A plan was produced, either initially or after a re-plan.
    PlanGenerated(PlanGeneratedEvent),

    /// A step is about to run in the sandbox.
    StepExecuting(StepExecutingEvent),

    /// Captured output of a finished step.
    StepResult(StepResultEvent),

    /// A failure was detected; see [`ErrorCategory`] for the taxonomy.
    ErrorDetected(ErrorDetectedEvent),

    /// The engine is asking the planner for a revised plan.
    RePlanning(RePlanningEvent),

    /// Terminal event of a successful workflow.
    WorkflowComplete(WorkflowCompleteEvent),
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct StatusEvent {
    pub message: String,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct PlanGeneratedEvent {
    pub plan: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct StepExecutingEvent {
    /// The plan step as produced by the planner.
    pub step: String,
    /// The shell command derived from the step, when one was determined.
    pub command: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct StepResultEvent {
    pub stdout: String,
    pub stderr: String,
    /// The child's exit code verbatim; `-2` means the sanitizer rejected the
    /// command, `-1` means the executor itself failed to spawn it.
    pub exit_code: i32,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct ErrorDetectedEvent {
    /// Human-readable error, prefixed with the bracketed category token,
    /// e.g. `"[sandbox] exit status 1"`.
    pub error: String,
    /// The plan step (or lifecycle stage) that failed.
    pub failed_step: String,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct RePlanningEvent {}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct WorkflowCompleteEvent {
    pub status: String,
}

impl WorkflowCompleteEvent {
    pub fn success() -> Self {
        Self {
            status: "success".to_string(),
        }
    }
}

/// Failure class of an [`ErrorDetectedEvent`], rendered as the bracketed
/// prefix of its `error` string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "snake_case")]
pub enum ErrorCategory {
    Validation,
    RateLimit,
    Planner,
    Executor,
    Sandbox,
    Cancelled,
}

impl ErrorDetectedEvent {
    pub fn new(
        category: ErrorCategory,
        detail: impl AsRef<str>,
        failed_step: impl Into<String>,
    ) -> Self {
        Self {
            error: format!("[{category}] {}", detail.as_ref()),
            failed_step: failed_step.into(),
        }
    }

    /// Whether this error carries the given category prefix.
    pub fn is_category(&self, category: ErrorCategory) -> bool {
        self.error.starts_with(&format!("[{category}]"))
    }
}
