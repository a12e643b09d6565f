//! Slack Block Kit message builders.
//!
//! Provides helpers for constructing the runner's outbound messages:
//! status indicator lines, question renders with answer buttons, and plain
//! markdown sections.

use std::fmt::Write as _;

use slack_morphism::prelude::{
    SlackActionBlockElement, SlackActionsBlock, SlackBlock, SlackBlockButtonElement, SlackBlockId,
    SlackBlockPlainTextOnly, SlackBlockText, SlackSectionBlock,
};

use crate::models::question::Question;
use crate::models::turn::TurnStatus;

/// Prefix routing question answer buttons to the interaction handler.
pub const ANSWER_ACTION_PREFIX: &str = "answer_";

/// Build a markdown section block.
#[must_use]
pub fn text_section(text: &str) -> SlackBlock {
    SlackBlock::Section(SlackSectionBlock::new().with_text(SlackBlockText::MarkDown(text.into())))
}

/// Build an actions block with the given buttons as
/// `(action_id, label, value)` triples.
#[must_use]
pub fn action_buttons(block_id: &str, buttons: &[(String, String, String)]) -> SlackBlock {
    let elements: Vec<SlackActionBlockElement> = buttons
        .iter()
        .map(|(action_id, text, value)| {
            SlackActionBlockElement::Button(
                SlackBlockButtonElement::new(
                    action_id.clone().into(),
                    SlackBlockPlainTextOnly::from(text.as_str()),
                )
                .with_value(value.clone()),
            )
        })
        .collect();
    SlackBlock::Actions(
        SlackActionsBlock::new(elements).with_block_id(SlackBlockId(block_id.into())),
    )
}

/// Render a question set.
///
/// Interactive renders (no `answered` labels) attach one button per option;
/// each button's value carries `session_id|label` so the interaction
/// handler can resume the right agent session with the chosen answer.
/// Answered renders are a static record of the choice with no controls.
#[must_use]
pub fn question_blocks(
    questions: &[Question],
    answered: Option<&[String]>,
    session_id: Option<&str>,
) -> Vec<SlackBlock> {
    let mut rendered = Vec::new();
    for (index, question) in questions.iter().enumerate() {
        rendered.push(text_section(&question_text(question, answered.is_none())));
        if answered.is_none() && !question.options.is_empty() {
            rendered.push(answer_buttons(
                index,
                session_id.unwrap_or_default(),
                question,
            ));
        }
    }
    if let Some(labels) = answered {
        let line = if labels.is_empty() {
            "\u{2705} Answered".to_owned()
        } else {
            format!("\u{2705} Answered: {}", labels.join(", "))
        };
        rendered.push(text_section(&line));
    }
    rendered
}

/// Markdown body for one question: bold header, question text, and (for
/// interactive renders) any option descriptions the buttons cannot carry.
fn question_text(question: &Question, include_descriptions: bool) -> String {
    let mut text = String::new();
    if let Some(header) = &question.header {
        let _ = writeln!(text, "*{header}*");
    }
    text.push_str(&question.text);
    if include_descriptions {
        for option in &question.options {
            if let Some(description) = &option.description {
                let _ = write!(text, "\n\u{2022} *{}*: {description}", option.label);
            }
        }
    }
    text
}

/// Answer buttons for one question, `action_id` unique within the message.
fn answer_buttons(index: usize, session_id: &str, question: &Question) -> SlackBlock {
    let buttons: Vec<(String, String, String)> = question
        .options
        .iter()
        .enumerate()
        .map(|(option_index, option)| {
            (
                format!("{ANSWER_ACTION_PREFIX}{index}_{option_index}"),
                option.label.clone(),
                format!("{session_id}|{}", option.label),
            )
        })
        .collect();
    action_buttons(&format!("question_{index}"), &buttons)
}

/// Status indicator line for the per-conversation status message.
#[must_use]
pub fn status_line(status: TurnStatus) -> String {
    match status {
        TurnStatus::Received => "\u{1f4e5} Received".to_owned(),
        TurnStatus::Working => "\u{2699}\u{fe0f} Working\u{2026}".to_owned(),
        TurnStatus::AwaitingAnswer => "\u{2753} Waiting for your answer".to_owned(),
        TurnStatus::Completed => "\u{2705} Completed".to_owned(),
        TurnStatus::Failed => "\u{26a0}\u{fe0f} Failed".to_owned(),
    }
}

/// Status line variant naming the tool the agent is currently running.
#[must_use]
pub fn progress_line(tool_label: &str) -> String {
    format!("\u{2699}\u{fe0f} Working \u{b7} `{tool_label}`")
}
