// Poisoned mutex should fail the program
#![allow(clippy::unwrap_used)]

//! The per-client engine: session state, admission and the workflow state
//! machine.
//!
//! Operates as a queue pair: the transport submits [`Op`]s and receives
//! [`EventMsg`]s, in FIFO order. A session runs at most one workflow at a
//! time; a new `execute_goal` supersedes (and cancels) a running one.

use std::sync::Arc;
use std::sync::Mutex;
use std::time::Instant;

use async_channel::Receiver;
use async_channel::Sender;
use serde::Serialize;
use tokio::sync::Notify;
use tokio::task::AbortHandle;
use tracing::debug;
use tracing::error;
use tracing::info;
use uuid::Uuid;

use terminus_protocol::ErrorCategory;
use terminus_protocol::ErrorDetectedEvent;
use terminus_protocol::EventMsg;
use terminus_protocol::ExecuteGoalParams;
use terminus_protocol::Op;
use terminus_protocol::PlanGeneratedEvent;
use terminus_protocol::RePlanningEvent;
use terminus_protocol::StatusEvent;
use terminus_protocol::StepExecutingEvent;
use terminus_protocol::StepResultEvent;
use terminus_protocol::WorkflowCompleteEvent;

use crate::client::ModelClient;
use crate::config::Config;
use crate::error::Result as TerminusResult;
use crate::error::TerminusErr;
use crate::planner;
use crate::sandbox::Sandboxer;
use crate::translator;
use crate::util::truncate_chars;

/// Steps that are already shell commands: when a plan step's first token is
/// one of these, the step is executed verbatim instead of being translated.
const DIRECT_COMMAND_PREFIXES: &[&str] = &[
    "if", "while", "curl", "sudo", "rm", "wget", "apt", "apt-get", "dnf", "yum", "brew", "bash",
    "echo", "cat", "ls", "cd", "mkdir", "touch",
];

/// Command prefixes that are never executed, matched case-insensitively on
/// the derived command.
const FORBIDDEN_COMMAND_PREFIXES: &[&str] =
    &["open -a terminal", "cmd ", "cmd.exe", "start ", "powershell"];

/// Caps applied when failure context is embedded in a re-plan prompt.
const REPLAN_HISTORY_MAX_CHARS: usize = 4_000;
const REPLAN_STDERR_MAX_CHARS: usize = 2_000;

/// The high-level interface to one client's engine. It operates as a queue
/// pair where you submit operations and receive events.
pub struct Engine {
    tx_op: Sender<Op>,
    rx_event: Receiver<EventMsg>,
}

impl Engine {
    /// Spawn the engine loop for one client connection. The first emitted
    /// event is `status{message:"connected"}`.
    pub fn spawn(config: Config, ctrl_c: Arc<Notify>) -> Engine {
        let (tx_op, rx_op) = async_channel::bounded(64);
        let (tx_event, rx_event) = async_channel::bounded(64);
        tokio::spawn(submission_loop(Arc::new(config), rx_op, tx_event, ctrl_c));
        Engine { tx_op, rx_event }
    }

    pub async fn submit(&self, op: Op) -> TerminusResult<()> {
        self.tx_op
            .send(op)
            .await
            .map_err(|_| TerminusErr::EngineDied)
    }

    pub async fn next_event(&self) -> TerminusResult<EventMsg> {
        self.rx_event
            .recv()
            .await
            .map_err(|_| TerminusErr::EngineDied)
    }
}

/// Context for one connected client.
pub(crate) struct Session {
    client_id: Uuid,
    config: Arc<Config>,
    upstream: ModelClient,
    sandboxer: Sandboxer,
    tx_event: Sender<EventMsg>,
    state: Mutex<State>,
}

/// Mutable state of the session.
#[derive(Default)]
struct State {
    current_task: Option<WorkflowTask>,
    last_accepted: Option<Instant>,
}

impl Session {
    /// Sends the event to the client, swallowing send failures (the client
    /// may already be gone).
    async fn send_event(&self, msg: EventMsg) {
        if let Err(e) = self.tx_event.send(msg).await {
            error!(client_id = %self.client_id, "failed to send event: {e}");
        }
    }

    async fn send_error(&self, category: ErrorCategory, detail: impl AsRef<str>, failed_step: &str) {
        self.send_event(EventMsg::ErrorDetected(ErrorDetectedEvent::new(
            category,
            detail,
            failed_step,
        )))
        .await;
    }

    /// Rate-limit gate for `execute_goal`. The acceptance timestamp is only
    /// updated when the request passes.
    fn accept_request(&self) -> bool {
        let mut state = self.state.lock().unwrap();
        if let Some(last) = state.last_accepted
            && last.elapsed() < self.config.execute_goal_min_interval
        {
            return false;
        }
        state.last_accepted = Some(Instant::now());
        true
    }

    fn set_task(&self, task: WorkflowTask) {
        let mut state = self.state.lock().unwrap();
        if let Some(prev) = state.current_task.take() {
            prev.abort();
        }
        state.current_task = Some(task);
    }

    fn remove_task(&self, workflow_id: &str) {
        let mut state = self.state.lock().unwrap();
        if let Some(task) = &state.current_task
            && task.workflow_id == workflow_id
        {
            state.current_task.take();
        }
    }

    /// Cancel the running workflow, if any, and tell the client while the
    /// channel is still up. Completes before a superseding workflow emits
    /// its first event.
    async fn cancel_current_workflow(&self) {
        let task = { self.state.lock().unwrap().current_task.take() };
        if let Some(task) = task
            && task.abort()
        {
            self.send_error(ErrorCategory::Cancelled, "workflow cancelled", "cancel")
                .await;
        }
    }

    /// Abort the running workflow without emitting; used when the transport
    /// is already gone.
    fn abort_current_workflow(&self) {
        let task = { self.state.lock().unwrap().current_task.take() };
        if let Some(task) = task {
            task.abort();
        }
    }
}

/// A running workflow bound to its session.
struct WorkflowTask {
    workflow_id: String,
    handle: AbortHandle,
}

impl WorkflowTask {
    fn spawn(sess: Arc<Session>, workflow_id: String, goal: String) -> Self {
        let handle = tokio::spawn(run_workflow(sess, workflow_id.clone(), goal)).abort_handle();
        Self {
            workflow_id,
            handle,
        }
    }

    /// Returns true when a still-running task was aborted.
    fn abort(self) -> bool {
        if self.handle.is_finished() {
            return false;
        }
        self.handle.abort();
        true
    }
}

async fn submission_loop(
    config: Arc<Config>,
    rx_op: Receiver<Op>,
    tx_event: Sender<EventMsg>,
    ctrl_c: Arc<Notify>,
) {
    let client_id = Uuid::new_v4();
    let sess = Arc::new(Session {
        client_id,
        upstream: ModelClient::new(&config),
        sandboxer: Sandboxer::from_config(&config),
        config,
        tx_event,
        state: Mutex::new(State::default()),
    });

    sess.send_event(EventMsg::Status(StatusEvent {
        message: "connected".to_string(),
    }))
    .await;
    info!(%client_id, "client connected");

    loop {
        let interrupted = ctrl_c.notified();
        let op = tokio::select! {
            res = rx_op.recv() => match res {
                Ok(op) => op,
                Err(_) => break,
            },
            _ = interrupted => {
                sess.cancel_current_workflow().await;
                continue;
            }
        };

        debug!(?op, "submission");
        match op {
            Op::ExecuteGoal(params) => handle_execute_goal(&sess, params).await,
            _ => debug!("ignoring unsupported op"),
        }
    }

    // The transport dropped its end; make sure nothing keeps running.
    sess.abort_current_workflow();
    debug!(%client_id, "engine loop exited");
}

async fn handle_execute_goal(sess: &Arc<Session>, params: ExecuteGoalParams) {
    // Rate limit first: a rejected request leaves the running workflow
    // untouched and does not update the acceptance timestamp.
    if !sess.accept_request() {
        let min = sess.config.execute_goal_min_interval;
        sess.send_error(
            ErrorCategory::RateLimit,
            format!("execute_goal accepted at most once per {min:?} per client"),
            "rate_limit",
        )
        .await;
        return;
    }

    // Supersede: the prior workflow observes cancellation before the new one
    // emits its first event.
    sess.cancel_current_workflow().await;
    tokio::task::yield_now().await;

    let goal = params.goal.trim().to_string();
    if goal.is_empty() {
        sess.send_error(ErrorCategory::Validation, "goal is empty", "validate")
            .await;
        return;
    }
    if goal.chars().count() > sess.config.max_goal_len {
        sess.send_error(
            ErrorCategory::Validation,
            format!(
                "goal exceeds the maximum length of {} characters",
                sess.config.max_goal_len
            ),
            "validate",
        )
        .await;
        return;
    }

    let session_id = new_session_id();
    info!(client_id = %sess.client_id, %session_id, "starting workflow");
    let task = WorkflowTask::spawn(Arc::clone(sess), session_id, goal);
    sess.set_task(task);
}

/// Workflow-scoped session token: 12 hex chars, minted per `execute_goal`.
/// Also forms the upstream `safety_identifier` suffix.
fn new_session_id() -> String {
    let mut id = Uuid::new_v4().simple().to_string();
    id.truncate(12);
    id
}

/// One attempt at one step, retained for re-plan context.
#[derive(Serialize)]
struct StepRecord {
    step: String,
    command: String,
    stdout: String,
    stderr: String,
    exit_code: i32,
    /// Seconds spent in the sandbox, rounded to one decimal place.
    sandbox_latency: f32,
}

async fn run_workflow(sess: Arc<Session>, session_id: String, goal: String) {
    let mut plan =
        match planner::plan(&sess.upstream, &sess.config, &goal, &session_id, None).await {
            Ok(plan) => plan,
            Err(e) => {
                sess.send_error(ErrorCategory::Planner, format!("planner error: {e}"), "planning")
                    .await;
                sess.remove_task(&session_id);
                return;
            }
        };
    sess.send_event(EventMsg::PlanGenerated(PlanGeneratedEvent {
        plan: plan.clone(),
    }))
    .await;

    let mut history: Vec<StepRecord> = Vec::new();
    let mut step_index = 0usize;
    let mut replans = 0u32;

    while step_index < plan.len() {
        // Cancellation point at the top of every iteration.
        tokio::task::yield_now().await;
        let step = plan[step_index].clone();

        let command = match derive_command(&sess, &step, &session_id).await {
            Ok(command) => command,
            Err(message) => {
                sess.send_error(ErrorCategory::Executor, &message, &step).await;
                match replan(
                    &sess,
                    &session_id,
                    &goal,
                    &step,
                    &message,
                    None,
                    &history,
                    &mut replans,
                )
                .await
                {
                    Some(new_plan) => {
                        plan = new_plan;
                        step_index = 0;
                        continue;
                    }
                    None => {
                        sess.remove_task(&session_id);
                        return;
                    }
                }
            }
        };

        sess.send_event(EventMsg::StepExecuting(StepExecutingEvent {
            step: step.clone(),
            command: Some(command.clone()),
        }))
        .await;

        let started = Instant::now();
        let result = sess.sandboxer.execute(&command).await;
        let sandbox_latency = (started.elapsed().as_secs_f32() * 10.0).round() / 10.0;

        sess.send_event(EventMsg::StepResult(StepResultEvent {
            stdout: result.stdout.clone(),
            stderr: result.stderr.clone(),
            exit_code: result.exit_code,
        }))
        .await;

        push_record(
            &mut history,
            StepRecord {
                step: step.clone(),
                command: command.clone(),
                stdout: result.stdout.clone(),
                stderr: result.stderr.clone(),
                exit_code: result.exit_code,
                sandbox_latency,
            },
            sess.config.max_history,
        );

        if result.exit_code != 0 {
            let detail = if result.stderr.is_empty() {
                "unknown error".to_string()
            } else {
                truncate_chars(&result.stderr, REPLAN_STDERR_MAX_CHARS)
            };
            sess.send_error(ErrorCategory::Sandbox, &detail, &step).await;
            match replan(
                &sess,
                &session_id,
                &goal,
                &step,
                &detail,
                Some((&command, &result.stderr)),
                &history,
                &mut replans,
            )
            .await
            {
                Some(new_plan) => {
                    plan = new_plan;
                    step_index = 0;
                    continue;
                }
                None => {
                    sess.remove_task(&session_id);
                    return;
                }
            }
        }

        step_index += 1;
    }

    sess.remove_task(&session_id);
    sess.send_event(EventMsg::WorkflowComplete(WorkflowCompleteEvent::success()))
        .await;
}

/// Determine the command for a step: direct passthrough for steps that are
/// already shell commands, translation otherwise. `Err` carries the
/// translator-failure message.
async fn derive_command(sess: &Session, step: &str, session_id: &str) -> Result<String, String> {
    let command = if starts_with_direct_prefix(step) {
        step.to_string()
    } else {
        translator::translate(&sess.upstream, &sess.config, step, session_id, None)
            .await
            .map_err(|e| format!("translator error: {e}"))?
    };
    if let Some(prefix) = forbidden_prefix(&command) {
        return Err(format!("refusing command with forbidden prefix '{prefix}'"));
    }
    Ok(command)
}

fn starts_with_direct_prefix(step: &str) -> bool {
    step.split_whitespace()
        .next()
        .map(|token| {
            let token = token.to_ascii_lowercase();
            DIRECT_COMMAND_PREFIXES.contains(&token.as_str())
        })
        .unwrap_or(false)
}

fn forbidden_prefix(command: &str) -> Option<&'static str> {
    let lowered = command.to_ascii_lowercase();
    FORBIDDEN_COMMAND_PREFIXES
        .iter()
        .copied()
        .find(|prefix| lowered.starts_with(prefix))
}

/// Emit `re_planning`, ask the planner for a revised plan and emit it.
/// `None` means a terminal planner error was emitted (budget exhausted or
/// planner failure) and the workflow must stop.
#[allow(clippy::too_many_arguments)]
async fn replan(
    sess: &Session,
    session_id: &str,
    goal: &str,
    failed_step: &str,
    error: &str,
    failed_command: Option<(&str, &str)>,
    history: &[StepRecord],
    replans: &mut u32,
) -> Option<Vec<String>> {
    *replans += 1;
    if *replans > sess.config.max_replans {
        sess.send_error(
            ErrorCategory::Planner,
            format!("re-plan budget of {} exhausted", sess.config.max_replans),
            failed_step,
        )
        .await;
        return None;
    }

    sess.send_event(EventMsg::RePlanning(RePlanningEvent::default()))
        .await;

    let prompt = build_replan_prompt(goal, failed_step, error, failed_command, history);
    match planner::plan(&sess.upstream, &sess.config, &prompt, session_id, None).await {
        Ok(plan) => {
            sess.send_event(EventMsg::PlanGenerated(PlanGeneratedEvent {
                plan: plan.clone(),
            }))
            .await;
            Some(plan)
        }
        Err(e) => {
            sess.send_error(
                ErrorCategory::Planner,
                format!("re-planning failed: {e}"),
                failed_step,
            )
            .await;
            None
        }
    }
}

/// Failure context handed back to the planner. History is serialized and
/// truncated so the prompt stays bounded regardless of workflow length.
fn build_replan_prompt(
    goal: &str,
    failed_step: &str,
    error: &str,
    failed_command: Option<(&str, &str)>,
    history: &[StepRecord],
) -> String {
    let history_json = serde_json::to_string(history).unwrap_or_else(|_| "[]".to_string());
    let history_json = truncate_chars(&history_json, REPLAN_HISTORY_MAX_CHARS);
    match failed_command {
        Some((command, stderr)) => format!(
            "Re-plan after command failure.\nOriginal goal: {goal}\nFailed step: {failed_step}\n\
             Command: {command}\nstderr: {stderr}\nHistory: {history_json}",
            stderr = truncate_chars(stderr, REPLAN_STDERR_MAX_CHARS),
        ),
        None => format!(
            "Revise plan after failure.\nOriginal goal: {goal}\nFailed step: {failed_step}\n\
             Error: {error}\nHistory: {history_json}"
        ),
    }
}

fn push_record(history: &mut Vec<StepRecord>, record: StepRecord, max: usize) {
    history.push(record);
    if history.len() > max {
        let excess = history.len() - max;
        history.drain(..excess);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn record(step: &str) -> StepRecord {
        StepRecord {
            step: step.to_string(),
            command: "echo".to_string(),
            stdout: String::new(),
            stderr: String::new(),
            exit_code: 0,
            sandbox_latency: 0.0,
        }
    }

    #[test]
    fn direct_prefixes_match_on_the_first_token() {
        assert!(starts_with_direct_prefix("echo hello"));
        assert!(starts_with_direct_prefix("apt-get install -y jq"));
        assert!(starts_with_direct_prefix("Bash -lc 'true'"));
        assert!(!starts_with_direct_prefix("echoing the results"));
        assert!(!starts_with_direct_prefix("print hello"));
        assert!(!starts_with_direct_prefix("   "));
    }

    #[test]
    fn forbidden_prefixes_are_case_insensitive() {
        assert_eq!(forbidden_prefix("PowerShell -c dir"), Some("powershell"));
        assert_eq!(forbidden_prefix("open -a Terminal foo"), Some("open -a terminal"));
        assert_eq!(forbidden_prefix("CMD.EXE /c dir"), Some("cmd.exe"));
        assert_eq!(forbidden_prefix("echo start"), None);
    }

    #[test]
    fn session_ids_are_twelve_hex_chars() {
        let id = new_session_id();
        assert_eq!(id.len(), 12);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn replan_prompts_embed_and_truncate_failure_context() {
        let history = vec![record("step one")];
        let long_stderr = "e".repeat(5000);
        let prompt = build_replan_prompt(
            "do things",
            "step two",
            "unused",
            Some(("bash -lc 'exit 1'", &long_stderr)),
            &history,
        );
        assert!(prompt.starts_with("Re-plan after command failure."));
        assert!(prompt.contains("Original goal: do things"));
        assert!(prompt.contains("Failed step: step two"));
        assert!(prompt.contains("Command: bash -lc 'exit 1'"));
        assert!(!prompt.contains(&"e".repeat(2001)));

        let prompt = build_replan_prompt("do things", "step two", "boom", None, &history);
        assert!(prompt.starts_with("Revise plan after failure."));
        assert!(prompt.contains("Error: boom"));
        assert!(prompt.contains("\"step\":\"step one\""));
    }

    #[test]
    fn history_is_bounded_oldest_first() {
        let mut history = Vec::new();
        for i in 0..5 {
            push_record(&mut history, record(&format!("step {i}")), 3);
        }
        let steps: Vec<&str> = history.iter().map(|r| r.step.as_str()).collect();
        assert_eq!(steps, vec!["step 2", "step 3", "step 4"]);
    }
}
