#![allow(clippy::unwrap_used, clippy::expect_used)]

//! Engine-level scenarios driven end to end in the deterministic offline
//! mode: no network, real sandbox spawns (forced local).

use std::sync::Arc;
use std::time::Duration;

use terminus_core::Engine;
use terminus_core::config::Config;
use terminus_protocol::ErrorCategory;
use terminus_protocol::EventMsg;
use terminus_protocol::ExecuteGoalParams;
use terminus_protocol::Op;
use tokio::sync::Notify;
use tokio::time::timeout;

const EVENT_TIMEOUT: Duration = Duration::from_secs(10);

fn offline_config() -> Config {
    let mut config = Config::from_env();
    config.offline = true;
    config.sandbox_force_local = true;
    config.execute_goal_min_interval = Duration::ZERO;
    config.cmd_allowlist = None;
    config
}

fn spawn_engine(config: Config) -> Engine {
    Engine::spawn(config, Arc::new(Notify::new()))
}

async fn submit_goal(engine: &Engine, goal: &str) {
    engine
        .submit(Op::ExecuteGoal(ExecuteGoalParams {
            goal: goal.to_string(),
        }))
        .await
        .expect("submit should succeed");
}

async fn next_event(engine: &Engine) -> EventMsg {
    timeout(EVENT_TIMEOUT, engine.next_event())
        .await
        .expect("timed out waiting for an event")
        .expect("engine died")
}

/// Collect events until (and including) the workflow's terminal event.
async fn collect_until_complete(engine: &Engine) -> Vec<EventMsg> {
    let mut events = Vec::new();
    loop {
        let event = next_event(engine).await;
        let done = matches!(event, EventMsg::WorkflowComplete(_));
        events.push(event);
        if done {
            return events;
        }
    }
}

/// Every `step_result` must be preceded by exactly one matching
/// `step_executing`, and every `plan_generated` after the first by a
/// `re_planning`.
fn assert_event_ordering(events: &[EventMsg]) {
    let mut executing = 0usize;
    let mut results = 0usize;
    let mut plans = 0usize;
    let mut replans = 0usize;
    for event in events {
        match event {
            EventMsg::StepExecuting(_) => executing += 1,
            EventMsg::StepResult(_) => {
                results += 1;
                assert!(results <= executing, "step_result before step_executing");
            }
            EventMsg::PlanGenerated(_) => {
                plans += 1;
                assert!(
                    plans == 1 || replans >= plans - 1,
                    "plan_generated without a preceding re_planning"
                );
            }
            EventMsg::RePlanning(_) => replans += 1,
            _ => {}
        }
    }
    assert_eq!(results, executing, "unbalanced step events");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn happy_path_emits_ordered_events() {
    let engine = spawn_engine(offline_config());

    let EventMsg::Status(status) = next_event(&engine).await else {
        panic!("expected status first");
    };
    assert_eq!(status.message, "connected");

    submit_goal(&engine, "print hello").await;
    let events = collect_until_complete(&engine).await;

    let EventMsg::PlanGenerated(plan) = &events[0] else {
        panic!("expected plan_generated, got {:?}", events[0]);
    };
    assert_eq!(plan.plan, vec!["print hello"]);

    let EventMsg::StepExecuting(executing) = &events[1] else {
        panic!("expected step_executing, got {:?}", events[1]);
    };
    assert_eq!(executing.step, "print hello");
    assert_eq!(executing.command.as_deref(), Some("echo hello"));

    let EventMsg::StepResult(result) = &events[2] else {
        panic!("expected step_result, got {:?}", events[2]);
    };
    assert_eq!(result.stdout, "hello\n");
    assert_eq!(result.stderr, "");
    assert_eq!(result.exit_code, 0);

    let EventMsg::WorkflowComplete(complete) = &events[3] else {
        panic!("expected workflow_complete, got {:?}", events[3]);
    };
    assert_eq!(complete.status, "success");
    assert_eq!(events.len(), 4);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn failed_step_triggers_replan_and_recovery() {
    let engine = spawn_engine(offline_config());
    let _ = next_event(&engine).await; // status

    submit_goal(&engine, "print hello -> cause failure -> remediate -> done").await;
    let events = collect_until_complete(&engine).await;
    assert_event_ordering(&events);

    let EventMsg::PlanGenerated(first_plan) = &events[0] else {
        panic!("expected plan_generated first");
    };
    assert_eq!(first_plan.plan.len(), 4);

    let failure_idx = events
        .iter()
        .position(
            |e| matches!(e, EventMsg::StepResult(r) if r.exit_code == 1),
        )
        .expect("the forced failure should surface as a step_result");

    let EventMsg::ErrorDetected(error) = &events[failure_idx + 1] else {
        panic!("expected error_detected after the failing step_result");
    };
    assert!(error.is_category(ErrorCategory::Sandbox));
    assert!(error.error.contains("unknown error"));
    assert_eq!(error.failed_step, "cause failure");

    assert!(matches!(events[failure_idx + 2], EventMsg::RePlanning(_)));
    let EventMsg::PlanGenerated(revised) = &events[failure_idx + 3] else {
        panic!("expected the revised plan after re_planning");
    };
    assert_eq!(revised.plan, vec!["remediate", "done"]);

    assert!(matches!(
        events.last(),
        Some(EventMsg::WorkflowComplete(c)) if c.status == "success"
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn empty_goal_yields_exactly_one_validation_error() {
    let engine = spawn_engine(offline_config());
    let _ = next_event(&engine).await; // status

    submit_goal(&engine, "   ").await;

    let EventMsg::ErrorDetected(error) = next_event(&engine).await else {
        panic!("expected error_detected");
    };
    assert!(error.is_category(ErrorCategory::Validation));
    assert_eq!(error.failed_step, "validate");

    // No further events for a terminated validation failure.
    assert!(
        timeout(Duration::from_millis(300), engine.next_event())
            .await
            .is_err()
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn oversized_goal_is_rejected() {
    let mut config = offline_config();
    config.max_goal_len = 16;
    let engine = spawn_engine(config);
    let _ = next_event(&engine).await; // status

    submit_goal(&engine, &"x".repeat(17)).await;
    let EventMsg::ErrorDetected(error) = next_event(&engine).await else {
        panic!("expected error_detected");
    };
    assert!(error.is_category(ErrorCategory::Validation));
    assert_eq!(error.failed_step, "validate");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn second_request_inside_interval_is_rate_limited() {
    let mut config = offline_config();
    config.execute_goal_min_interval = Duration::from_secs(60);
    let engine = spawn_engine(config);
    let _ = next_event(&engine).await; // status

    submit_goal(&engine, "print hello").await;
    submit_goal(&engine, "print hello").await;

    let mut events = Vec::new();
    loop {
        let event = next_event(&engine).await;
        let done = matches!(event, EventMsg::WorkflowComplete(_));
        events.push(event);
        if done {
            break;
        }
    }
    // Wait out any stragglers: the rate-limit rejection may land after the
    // first workflow finished.
    while let Ok(Ok(event)) = timeout(Duration::from_millis(300), engine.next_event()).await {
        events.push(event);
    }

    let rate_limited: Vec<_> = events
        .iter()
        .filter_map(|e| match e {
            EventMsg::ErrorDetected(err) if err.is_category(ErrorCategory::RateLimit) => Some(err),
            _ => None,
        })
        .collect();
    assert_eq!(rate_limited.len(), 1);
    assert_eq!(rate_limited[0].failed_step, "rate_limit");

    // The first workflow ran to completion: one plan, one success.
    let plans = events
        .iter()
        .filter(|e| matches!(e, EventMsg::PlanGenerated(_)))
        .count();
    assert_eq!(plans, 1);
    assert!(
        events
            .iter()
            .any(|e| matches!(e, EventMsg::WorkflowComplete(_)))
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn new_goal_cancels_the_running_workflow_first() {
    let engine = spawn_engine(offline_config());
    let _ = next_event(&engine).await; // status

    // The first step is a direct command that parks in the sandbox.
    submit_goal(&engine, "bash -lc 'sleep 5' -> print hello").await;

    // Wait until the long-running step is actually executing.
    loop {
        match next_event(&engine).await {
            EventMsg::StepExecuting(executing) => {
                assert_eq!(executing.command.as_deref(), Some("bash -lc 'sleep 5'"));
                break;
            }
            EventMsg::PlanGenerated(_) => continue,
            other => panic!("unexpected event before execution: {other:?}"),
        }
    }

    submit_goal(&engine, "print hello").await;
    let events = collect_until_complete(&engine).await;

    let cancelled_idx = events
        .iter()
        .position(|e| {
            matches!(e, EventMsg::ErrorDetected(err)
                if err.is_category(ErrorCategory::Cancelled) && err.failed_step == "cancel")
        })
        .expect("superseded workflow should emit a cancelled error");

    let new_plan_idx = events
        .iter()
        .position(|e| matches!(e, EventMsg::PlanGenerated(p) if p.plan == vec!["print hello"]))
        .expect("the superseding workflow should emit its plan");

    // The prior workflow observes cancellation before the new one emits.
    assert!(cancelled_idx < new_plan_idx);

    // The aborted sleep never produced a result; only the new workflow's
    // step ran to completion.
    let results: Vec<_> = events
        .iter()
        .filter_map(|e| match e {
            EventMsg::StepResult(r) => Some(r),
            _ => None,
        })
        .collect();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].stdout, "hello\n");
}
