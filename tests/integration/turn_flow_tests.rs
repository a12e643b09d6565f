//! Integration tests for the turn orchestrator's event loop.
//!
//! Drives the state machine through a hand-built event channel and an
//! idle process handle, covering the terminal-report rules:
//! result-then-exit ordering, the fallback completion, failure
//! classification, and the silent kill exit.

use std::time::Instant;

use agent_courier::models::turn::{TurnOutcome, TurnStatus};
use agent_courier::runner::process::AgentProcess;
use agent_courier::runner::{AgentEvent, AgentFailure};

use super::test_helpers::{default_rig, event_channel, test_request};

fn init_event(session_id: &str) -> AgentEvent {
    AgentEvent::Init {
        session_id: session_id.to_owned(),
        model: Some("claude-opus-4".to_owned()),
    }
}

fn text_event(text: &str) -> AgentEvent {
    AgentEvent::Text {
        text: text.to_owned(),
    }
}

// ── Completion ───────────────────────────────────────────────

/// The happy path: output coalesces, the result flushes it, the
/// completion line carries the cost, and the post-kill exit is silent.
#[tokio::test]
async fn completed_turn_reports_once_with_cost() {
    let rig = default_rig();
    let request = test_request(&rig, "C_TEST:100", false);
    let handle = AgentProcess::new(&request.conversation_id);
    let (tx, rx) = event_channel();

    tx.send(init_event("sess-1")).await.expect("send init");
    tx.send(text_event("Reading files.")).await.expect("send text");
    tx.send(text_event("Running tests.")).await.expect("send text");
    tx.send(AgentEvent::Result {
        result_text: Some("All green.".to_owned()),
        cost_usd: Some(0.0312),
    })
    .await
    .expect("send result");
    tx.send(AgentEvent::Exit { code: None }).await.expect("send exit");

    let (outcome, follow_up) = rig.runner.drive(&request, &handle, rx, Instant::now()).await;
    assert_eq!(outcome, TurnOutcome::Completed);
    assert!(follow_up.is_none());

    let texts = rig.sink.texts().await;
    assert_eq!(texts.len(), 2, "expected flush + completion, got {texts:?}");
    assert_eq!(texts[0], "Reading files.\nRunning tests.");
    assert!(texts[1].starts_with("\u{2705} Done in"), "got: {}", texts[1]);
    assert!(texts[1].contains("$0.0312"), "cost missing: {}", texts[1]);

    assert_eq!(
        rig.sink.statuses().await,
        vec![TurnStatus::Working, TurnStatus::Completed]
    );

    let sessions = rig.index.recorded_sessions().await;
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0].session_id, "sess-1");
    assert_eq!(sessions[0].conversation_id, "C_TEST:100");
}

/// A clean exit without a result record still completes the turn, with
/// the bare fallback line.
#[tokio::test]
async fn clean_exit_without_result_reports_fallback() {
    let rig = default_rig();
    let request = test_request(&rig, "C_TEST:100", false);
    let handle = AgentProcess::new(&request.conversation_id);
    let (tx, rx) = event_channel();

    tx.send(init_event("sess-1")).await.expect("send init");
    tx.send(text_event("Half done")).await.expect("send text");
    tx.send(AgentEvent::Exit { code: Some(0) }).await.expect("send exit");

    let (outcome, _) = rig.runner.drive(&request, &handle, rx, Instant::now()).await;
    assert_eq!(outcome, TurnOutcome::Completed);
    assert_eq!(
        rig.sink.texts().await,
        vec!["Half done".to_owned(), "\u{2705} Done.".to_owned()]
    );
}

/// A result followed by a clean exit reports exactly once.
#[tokio::test]
async fn result_then_clean_exit_reports_once() {
    let rig = default_rig();
    let request = test_request(&rig, "C_TEST:100", false);
    let handle = AgentProcess::new(&request.conversation_id);
    let (tx, rx) = event_channel();

    tx.send(init_event("sess-1")).await.expect("send init");
    tx.send(AgentEvent::Result {
        result_text: Some("ok".to_owned()),
        cost_usd: None,
    })
    .await
    .expect("send result");
    tx.send(AgentEvent::Exit { code: Some(0) }).await.expect("send exit");

    let (outcome, _) = rig.runner.drive(&request, &handle, rx, Instant::now()).await;
    assert_eq!(outcome, TurnOutcome::Completed);

    let texts = rig.sink.texts().await;
    assert_eq!(texts.len(), 1, "exactly one terminal report: {texts:?}");
    assert_eq!(
        rig.sink.statuses().await,
        vec![TurnStatus::Working, TurnStatus::Completed],
        "no second Completed from the exit path"
    );
}

// ── Silence rules ────────────────────────────────────────────

/// A kill exit with no preceding activity reports nothing at all.
#[tokio::test]
async fn silent_kill_exit_reports_nothing() {
    let rig = default_rig();
    let request = test_request(&rig, "C_TEST:100", false);
    let handle = AgentProcess::new(&request.conversation_id);
    let (tx, rx) = event_channel();

    tx.send(AgentEvent::Exit { code: None }).await.expect("send exit");

    let (outcome, follow_up) = rig.runner.drive(&request, &handle, rx, Instant::now()).await;
    assert_eq!(outcome, TurnOutcome::Superseded);
    assert!(follow_up.is_none());
    assert!(
        rig.sink.calls().await.is_empty(),
        "a kill exit must stay silent"
    );
}

// ── Failures ─────────────────────────────────────────────────

/// A nonzero exit flushes buffered output first, then reports the
/// failure exactly once.
#[tokio::test]
async fn failure_exit_reports_after_flushing() {
    let rig = default_rig();
    let request = test_request(&rig, "C_TEST:100", false);
    let handle = AgentProcess::new(&request.conversation_id);
    let (tx, rx) = event_channel();

    tx.send(init_event("sess-1")).await.expect("send init");
    tx.send(text_event("partial output")).await.expect("send text");
    tx.send(AgentEvent::Exit { code: Some(2) }).await.expect("send exit");

    let (outcome, _) = rig.runner.drive(&request, &handle, rx, Instant::now()).await;
    assert_eq!(outcome, TurnOutcome::Failed);
    assert_eq!(
        rig.sink.texts().await,
        vec![
            "partial output".to_owned(),
            "\u{26a0}\u{fe0f} The agent run failed. Check the server logs for details.".to_owned(),
        ]
    );
    assert_eq!(
        rig.sink.statuses().await,
        vec![TurnStatus::Working, TurnStatus::Failed]
    );
}

/// A missing binary gets its own actionable message, and the exit that
/// follows the spawn failure stays silent.
#[tokio::test]
async fn missing_binary_reports_install_hint() {
    let rig = default_rig();
    let request = test_request(&rig, "C_TEST:100", false);
    let handle = AgentProcess::new(&request.conversation_id);
    let (tx, rx) = event_channel();

    tx.send(AgentEvent::Error {
        cause: AgentFailure::BinaryNotFound {
            binary: "claude".to_owned(),
        },
    })
    .await
    .expect("send error");
    tx.send(AgentEvent::Exit { code: None }).await.expect("send exit");

    let (outcome, _) = rig.runner.drive(&request, &handle, rx, Instant::now()).await;
    assert_eq!(outcome, TurnOutcome::Failed);

    let texts = rig.sink.texts().await;
    assert_eq!(texts.len(), 1);
    assert!(
        texts[0].contains("`claude` CLI is not installed"),
        "expected the install hint, got: {}",
        texts[0]
    );
    assert_eq!(rig.sink.statuses().await, vec![TurnStatus::Failed]);
}

/// Other spawn failures report the generic startup message.
#[tokio::test]
async fn spawn_failure_reports_generic_message() {
    let rig = default_rig();
    let request = test_request(&rig, "C_TEST:100", false);
    let handle = AgentProcess::new(&request.conversation_id);
    let (tx, rx) = event_channel();

    tx.send(AgentEvent::Error {
        cause: AgentFailure::Spawn {
            detail: "permission denied".to_owned(),
        },
    })
    .await
    .expect("send error");
    tx.send(AgentEvent::Exit { code: Some(1) }).await.expect("send exit");

    let (outcome, _) = rig.runner.drive(&request, &handle, rx, Instant::now()).await;
    assert_eq!(outcome, TurnOutcome::Failed);

    let texts = rig.sink.texts().await;
    assert_eq!(
        texts.len(),
        1,
        "the exit after a reported error must stay silent: {texts:?}"
    );
    assert!(texts[0].contains("failed to start"));
}

// ── Progress and sessions ────────────────────────────────────

/// Ordinary tool uses post progress; the interactive tools do not,
/// since their dedicated events take over the turn.
#[tokio::test]
async fn tool_use_posts_progress_except_interactive_tools() {
    let rig = default_rig();
    let request = test_request(&rig, "C_TEST:100", false);
    let handle = AgentProcess::new(&request.conversation_id);
    let (tx, rx) = event_channel();

    tx.send(init_event("sess-1")).await.expect("send init");
    tx.send(AgentEvent::ToolUse {
        id: Some("t1".to_owned()),
        name: "Bash".to_owned(),
        input: serde_json::json!({"command": "ls"}),
    })
    .await
    .expect("send tool use");
    tx.send(AgentEvent::ToolUse {
        id: Some("t2".to_owned()),
        name: "AskUserQuestion".to_owned(),
        input: serde_json::json!({}),
    })
    .await
    .expect("send interactive tool use");
    tx.send(AgentEvent::Exit { code: Some(0) }).await.expect("send exit");

    let _ = rig.runner.drive(&request, &handle, rx, Instant::now()).await;
    assert_eq!(rig.sink.progress_labels().await, vec!["Bash".to_owned()]);
}

/// A resumed turn refreshes the existing binding instead of recording
/// a new session.
#[tokio::test]
async fn resumed_turn_touches_instead_of_rebinding() {
    let rig = default_rig();
    let mut request = test_request(&rig, "C_TEST:100", false);
    request.session_id = Some("sess-old".to_owned());
    let handle = AgentProcess::new(&request.conversation_id);
    let (tx, rx) = event_channel();

    tx.send(init_event("sess-old")).await.expect("send init");
    tx.send(AgentEvent::Exit { code: Some(0) }).await.expect("send exit");

    let _ = rig.runner.drive(&request, &handle, rx, Instant::now()).await;
    assert_eq!(rig.index.touched_sessions().await, vec!["sess-old".to_owned()]);
    assert!(rig.index.recorded_sessions().await.is_empty());
}

// ── Deadline flush ───────────────────────────────────────────

/// Buffered output flushes on the window deadline even when the agent
/// keeps the turn open.
#[tokio::test]
async fn buffered_output_flushes_on_the_deadline() {
    let rig = default_rig();
    let request = test_request(&rig, "C_TEST:100", false);
    let handle = AgentProcess::new(&request.conversation_id);
    let (tx, rx) = event_channel();

    let drive_task = tokio::spawn({
        let runner = std::sync::Arc::clone(&rig.runner);
        let request = request.clone();
        let handle = handle.clone();
        async move { runner.drive(&request, &handle, rx, Instant::now()).await }
    });

    tx.send(init_event("sess-1")).await.expect("send init");
    tx.send(text_event("early chunk")).await.expect("send text");

    // The 100ms test window passes with the turn still open.
    tokio::time::sleep(std::time::Duration::from_millis(400)).await;
    assert_eq!(
        rig.sink.texts().await,
        vec!["early chunk".to_owned()],
        "the deadline must flush without waiting for the turn to end"
    );

    tx.send(AgentEvent::Exit { code: Some(0) }).await.expect("send exit");
    let (outcome, _) = drive_task.await.expect("drive task");
    assert_eq!(outcome, TurnOutcome::Completed);

    let texts = rig.sink.texts().await;
    assert_eq!(texts.len(), 2, "fallback completion follows: {texts:?}");
}
