//! Integration tests for the exit-during-handler race.
//!
//! When the process dies while an interactive handler is mid-flight, the
//! exit path owns the failure report and the handler must abandon its
//! resume. The recording sink's gate parks the handler inside its flush
//! so the test can drive the interleaving deterministically.

use std::sync::Arc;
use std::time::{Duration, Instant};

use agent_courier::models::turn::{TurnOutcome, TurnStatus};
use agent_courier::runner::process::AgentProcess;
use agent_courier::runner::AgentEvent;

use super::test_helpers::{default_rig, event_channel, question, test_request, RecordingSink};

const FAILURE_TEXT: &str = "The agent run failed";

async fn wait_for_failure_text(sink: &Arc<RecordingSink>) {
    tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            if sink
                .texts()
                .await
                .iter()
                .any(|text| text.contains(FAILURE_TEXT))
            {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("exit path must report while the handler is parked");
}

/// The process dies while the handler is still flushing buffered output.
/// The exit path reports the failure exactly once; the resumed handler
/// sees the early-exit flag and abandons both the render and the resume.
#[tokio::test]
async fn exit_during_handler_flush_reports_failure_once() {
    let rig = default_rig();
    let request = test_request(&rig, "C_TEST:100", true);
    let handle = AgentProcess::new(&request.conversation_id);
    let (tx, rx) = event_channel();

    let drive_task = tokio::spawn({
        let runner = Arc::clone(&rig.runner);
        let request = request.clone();
        let handle = handle.clone();
        async move { runner.drive(&request, &handle, rx, Instant::now()).await }
    });

    tx.send(AgentEvent::Init {
        session_id: "sess-9".to_owned(),
        model: None,
    })
    .await
    .expect("send init");
    tx.send(AgentEvent::Text {
        text: "buffered output".to_owned(),
    })
    .await
    .expect("send text");

    // Park the handler inside its flush, then let the process die.
    let gate = rig.sink.hold_next_text().await;
    tx.send(AgentEvent::AskUser {
        questions: vec![question("Deploy?", &["Yes", "No"])],
    })
    .await
    .expect("send ask");
    rig.sink.wait_until_parked().await;

    tx.send(AgentEvent::Exit { code: Some(1) }).await.expect("send exit");
    wait_for_failure_text(&rig.sink).await;
    gate.notify_one();

    let (outcome, follow_up) = drive_task.await.expect("drive task");
    assert_eq!(outcome, TurnOutcome::Failed);
    assert!(
        follow_up.is_none(),
        "a dead process must never be resumed by its handler"
    );

    let texts = rig.sink.texts().await;
    let failures = texts
        .iter()
        .filter(|text| text.contains(FAILURE_TEXT))
        .count();
    assert_eq!(failures, 1, "exactly one failure report: {texts:?}");
    assert!(
        rig.sink.question_renders().await.is_empty(),
        "the abandoned handler must not render its questions"
    );
    assert_eq!(
        rig.sink.statuses().await,
        vec![TurnStatus::Working, TurnStatus::Failed]
    );
}

/// A nonzero exit right after a result is still a failure: the
/// completion already went out, and the death is reported once on top.
#[tokio::test]
async fn failure_exit_after_result_reports_both_once() {
    let rig = default_rig();
    let request = test_request(&rig, "C_TEST:100", false);
    let handle = AgentProcess::new(&request.conversation_id);
    let (tx, rx) = event_channel();

    tx.send(AgentEvent::Init {
        session_id: "sess-9".to_owned(),
        model: None,
    })
    .await
    .expect("send init");
    tx.send(AgentEvent::Result {
        result_text: Some("done".to_owned()),
        cost_usd: None,
    })
    .await
    .expect("send result");
    tx.send(AgentEvent::Exit { code: Some(3) }).await.expect("send exit");

    let (outcome, _) = rig.runner.drive(&request, &handle, rx, Instant::now()).await;
    assert_eq!(outcome, TurnOutcome::Failed, "the late death wins the outcome");

    let texts = rig.sink.texts().await;
    assert_eq!(texts.len(), 2, "completion then failure: {texts:?}");
    assert!(texts[0].starts_with("\u{2705} Done in"));
    assert!(texts[1].contains(FAILURE_TEXT));
}

/// Duplicate exit-style failures cannot happen: once an error was
/// reported, a following exit event adds nothing.
#[tokio::test]
async fn reported_error_silences_the_exit() {
    let rig = default_rig();
    let request = test_request(&rig, "C_TEST:100", false);
    let handle = AgentProcess::new(&request.conversation_id);
    let (tx, rx) = event_channel();

    tx.send(AgentEvent::Error {
        cause: agent_courier::runner::AgentFailure::Spawn {
            detail: "fork failed".to_owned(),
        },
    })
    .await
    .expect("send error");
    tx.send(AgentEvent::Exit { code: Some(70) }).await.expect("send exit");

    let (outcome, _) = rig.runner.drive(&request, &handle, rx, Instant::now()).await;
    assert_eq!(outcome, TurnOutcome::Failed);
    assert_eq!(
        rig.sink.texts().await.len(),
        1,
        "the exit after a reported error must stay silent"
    );
}
