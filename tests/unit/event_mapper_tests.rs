//! Unit tests for the event mapper's de-duplication rules.
//!
//! The CLI repeats records on some stream variants; the mapper guarantees
//! downstream consumers see one init, one result, and one tool use per id,
//! while tool uses without ids always pass through. It also splits the
//! interactive tools into their dedicated events.

use agent_courier::runner::process::EventMapper;
use agent_courier::runner::AgentEvent;

fn init_line(session_id: &str) -> String {
    format!(r#"{{"type":"system","subtype":"init","session_id":"{session_id}","model":"m"}}"#)
}

fn tool_use_line(id: Option<&str>, name: &str) -> String {
    let id_field = id.map(|id| format!(r#""id":"{id}","#)).unwrap_or_default();
    format!(
        r#"{{"type":"assistant","message":{{"content":[{{"type":"tool_use",{id_field}"name":"{name}","input":{{}}}}]}}}}"#
    )
}

// ── Init de-duplication ──────────────────────────────────────

/// Only the first init record becomes an event.
#[test]
fn duplicate_init_records_are_dropped() {
    let mut mapper = EventMapper::new();
    let first = mapper.map_line(&init_line("sess-1"));
    assert!(
        matches!(first.as_slice(), [AgentEvent::Init { session_id, .. }] if session_id == "sess-1"),
        "first init must map, got: {first:?}"
    );
    let second = mapper.map_line(&init_line("sess-1"));
    assert!(second.is_empty(), "repeated init must be dropped");
    let different = mapper.map_line(&init_line("sess-2"));
    assert!(
        different.is_empty(),
        "any further init is a duplicate regardless of session id"
    );
}

// ── Result de-duplication ────────────────────────────────────

/// Only the first result record becomes an event.
#[test]
fn duplicate_result_records_are_dropped() {
    let mut mapper = EventMapper::new();
    let first = mapper.map_line(r#"{"type":"result","result":"done"}"#);
    assert!(
        matches!(
            first.as_slice(),
            [AgentEvent::Result { result_text: Some(text), .. }] if text == "done"
        ),
        "first result must map, got: {first:?}"
    );
    let second = mapper.map_line(r#"{"type":"result","result":"done again"}"#);
    assert!(second.is_empty(), "repeated result must be dropped");
}

// ── Tool-use de-duplication ──────────────────────────────────

/// A tool-use id is forwarded once; repeats of the same id are dropped.
#[test]
fn duplicate_tool_use_ids_are_dropped() {
    let mut mapper = EventMapper::new();
    let first = mapper.map_line(&tool_use_line(Some("toolu_01"), "Bash"));
    assert_eq!(first.len(), 1, "first occurrence must map");
    let repeat = mapper.map_line(&tool_use_line(Some("toolu_01"), "Bash"));
    assert!(repeat.is_empty(), "same id must not map twice");
    let other = mapper.map_line(&tool_use_line(Some("toolu_02"), "Bash"));
    assert_eq!(other.len(), 1, "a new id must map");
}

/// Tool uses without ids cannot be distinguished, so every one passes
/// through rather than risking a dropped real invocation.
#[test]
fn id_less_tool_uses_always_pass_through() {
    let mut mapper = EventMapper::new();
    for _ in 0..3 {
        let events = mapper.map_line(&tool_use_line(None, "Bash"));
        assert!(
            matches!(
                events.as_slice(),
                [AgentEvent::ToolUse { id: None, name, .. }] if name == "Bash"
            ),
            "id-less tool use must pass through every time, got: {events:?}"
        );
    }
}

// ── Interactive tool splitting ───────────────────────────────

/// `AskUserQuestion` yields the generic tool use plus the typed event.
#[test]
fn ask_user_tool_yields_dedicated_event() {
    let mut mapper = EventMapper::new();
    let line = r#"{"type":"assistant","message":{"content":[{"type":"tool_use","id":"q1","name":"AskUserQuestion","input":{"questions":[{"question":"Deploy now?","options":[{"label":"Yes"},{"label":"No"}]}]}}]}}"#;
    let events = mapper.map_line(line);
    assert_eq!(events.len(), 2, "expected tool use plus AskUser");
    assert!(matches!(&events[0], AgentEvent::ToolUse { name, .. } if name == "AskUserQuestion"));
    match &events[1] {
        AgentEvent::AskUser { questions } => {
            assert_eq!(questions.len(), 1);
            assert_eq!(questions[0].text, "Deploy now?");
            assert_eq!(questions[0].options.len(), 2);
        }
        other => panic!("expected AskUser, got: {other:?}"),
    }
}

/// Malformed `AskUserQuestion` input degrades to the generic tool use
/// alone instead of suppressing the record.
#[test]
fn malformed_ask_user_input_degrades_to_tool_use() {
    let mut mapper = EventMapper::new();
    let line = r#"{"type":"assistant","message":{"content":[{"type":"tool_use","id":"q1","name":"AskUserQuestion","input":{"questions":"not a list"}}]}}"#;
    let events = mapper.map_line(line);
    assert!(
        matches!(
            events.as_slice(),
            [AgentEvent::ToolUse { name, .. }] if name == "AskUserQuestion"
        ),
        "malformed input must keep the plain tool use, got: {events:?}"
    );
}

/// `ExitPlanMode` yields its dedicated event.
#[test]
fn exit_plan_mode_yields_dedicated_event() {
    let mut mapper = EventMapper::new();
    let line = r#"{"type":"assistant","message":{"content":[{"type":"tool_use","id":"p1","name":"ExitPlanMode","input":{"plan":"1. Do the thing"}}]}}"#;
    let events = mapper.map_line(line);
    assert_eq!(events.len(), 2);
    assert!(
        matches!(&events[1], AgentEvent::ExitPlanMode),
        "expected ExitPlanMode, got: {:?}",
        events[1]
    );
}

/// De-duplication applies before splitting: a repeated AskUser id maps
/// to nothing at all.
#[test]
fn duplicate_ask_user_id_is_fully_dropped() {
    let mut mapper = EventMapper::new();
    let line = r#"{"type":"assistant","message":{"content":[{"type":"tool_use","id":"q1","name":"AskUserQuestion","input":{"questions":[{"question":"Again?"}]}}]}}"#;
    assert_eq!(mapper.map_line(line).len(), 2);
    assert!(
        mapper.map_line(line).is_empty(),
        "repeated interactive tool use must not re-trigger the handler"
    );
}

// ── Mixed streams ────────────────────────────────────────────

/// Text events are never de-duplicated; identical fragments are common.
#[test]
fn repeated_text_fragments_all_map() {
    let mut mapper = EventMapper::new();
    let line = r#"{"type":"assistant","message":{"content":[{"type":"text","text":"tick"}]}}"#;
    assert_eq!(mapper.map_line(line).len(), 1);
    assert_eq!(mapper.map_line(line).len(), 1);
}

/// Noise lines map to nothing without disturbing de-dup state.
#[test]
fn noise_lines_map_to_nothing() {
    let mut mapper = EventMapper::new();
    assert!(mapper.map_line("not json at all").is_empty());
    assert!(mapper.map_line("").is_empty());
    let events = mapper.map_line(&init_line("sess-1"));
    assert_eq!(events.len(), 1, "init after noise must still map");
}
