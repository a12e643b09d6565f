//! Unit tests for the question model and the autopilot answer policy.
//!
//! Covers recommendation detection, single- and multi-select selection
//! rules, and the combined resume-prompt builder.

use agent_courier::models::question::{combined_auto_answer, Question, QuestionOption};

fn option(label: &str) -> QuestionOption {
    QuestionOption {
        label: label.to_owned(),
        description: None,
    }
}

fn question(text: &str, labels: &[&str], multi_select: bool) -> Question {
    Question {
        text: text.to_owned(),
        header: None,
        options: labels.iter().map(|label| option(label)).collect(),
        multi_select,
    }
}

// ── Recommendation detection ─────────────────────────────────

/// The marker is matched case-insensitively inside the label text.
#[test]
fn recommendation_marker_is_case_insensitive() {
    assert!(option("Use sqlite (recommended)").is_recommended());
    assert!(option("Use sqlite (Recommended)").is_recommended());
    assert!(option("Use sqlite (RECOMMENDED)").is_recommended());
    assert!(!option("Use sqlite").is_recommended());
    assert!(!option("Recommended reading").is_recommended());
}

// ── Single-select policy ─────────────────────────────────────

/// Single-select picks the recommended option wherever it sits.
#[test]
fn single_select_prefers_recommended() {
    let q = question(
        "Which database?",
        &["Postgres", "SQLite (recommended)", "MySQL"],
        false,
    );
    let picked = q.auto_selected();
    assert_eq!(picked.len(), 1);
    assert_eq!(picked[0].label, "SQLite (recommended)");
}

/// Without a recommendation, single-select falls back to the first option.
#[test]
fn single_select_falls_back_to_first() {
    let q = question("Which database?", &["Postgres", "MySQL"], false);
    let picked = q.auto_selected();
    assert_eq!(picked.len(), 1);
    assert_eq!(picked[0].label, "Postgres");
}

/// Multiple recommendations on a single-select still pick only one.
#[test]
fn single_select_takes_first_of_several_recommendations() {
    let q = question(
        "Pick one",
        &["A", "B (recommended)", "C (recommended)"],
        false,
    );
    let picked = q.auto_selected();
    assert_eq!(picked.len(), 1);
    assert_eq!(picked[0].label, "B (recommended)");
}

// ── Multi-select policy ──────────────────────────────────────

/// Multi-select takes every recommended option.
#[test]
fn multi_select_takes_all_recommendations() {
    let q = question(
        "Which features?",
        &["Auth (recommended)", "Billing", "Logging (recommended)"],
        true,
    );
    let labels: Vec<&str> = q.auto_selected().iter().map(|o| o.label.as_str()).collect();
    assert_eq!(labels, vec!["Auth (recommended)", "Logging (recommended)"]);
}

/// Without recommendations, multi-select falls back to the first option
/// alone rather than selecting everything.
#[test]
fn multi_select_falls_back_to_first_only() {
    let q = question("Which features?", &["Auth", "Billing", "Logging"], true);
    let labels: Vec<&str> = q.auto_selected().iter().map(|o| o.label.as_str()).collect();
    assert_eq!(labels, vec!["Auth"]);
}

/// A question with no options selects nothing.
#[test]
fn option_less_question_selects_nothing() {
    let q = question("Free-form thoughts?", &[], false);
    assert!(q.auto_selected().is_empty());
}

// ── Combined resume prompt ───────────────────────────────────

/// One answer line per question, in question order.
#[test]
fn combined_answer_lists_each_question() {
    let questions = vec![
        question("Which database?", &["SQLite (recommended)", "Postgres"], false),
        question("Run migrations?", &["Yes", "No"], false),
    ];
    let answer = combined_auto_answer(&questions);
    assert_eq!(
        answer,
        "Answer to \"Which database?\": SQLite (recommended)\nAnswer to \"Run migrations?\": Yes"
    );
}

/// Multi-select answers join their labels on one line.
#[test]
fn combined_answer_joins_multi_select_labels() {
    let questions = vec![question(
        "Which features?",
        &["Auth (recommended)", "Billing (recommended)"],
        true,
    )];
    let answer = combined_auto_answer(&questions);
    assert_eq!(
        answer,
        "Answer to \"Which features?\": Auth (recommended), Billing (recommended)"
    );
}

/// Questions without options are skipped; answerable ones still appear.
#[test]
fn combined_answer_skips_option_less_questions() {
    let questions = vec![
        question("Anything else?", &[], false),
        question("Proceed?", &["Yes"], false),
    ];
    assert_eq!(combined_auto_answer(&questions), "Answer to \"Proceed?\": Yes");
}

/// With nothing selectable the resumed agent still gets an instruction.
#[test]
fn combined_answer_falls_back_to_continue() {
    let questions = vec![question("Anything else?", &[], false)];
    assert_eq!(combined_auto_answer(&questions), "Continue.");
    assert_eq!(combined_auto_answer(&[]), "Continue.");
}
