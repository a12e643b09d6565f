//! Interactive question entities parsed from the agent's `AskUserQuestion`
//! tool input, plus the autopilot answer-selection policy.

use serde::{Deserialize, Serialize};

/// Substring that marks an option label as the agent's recommendation.
const RECOMMENDED_MARKER: &str = "(recommended)";

/// One selectable answer for a question.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct QuestionOption {
    /// Short label shown on the answer control.
    pub label: String,
    /// Optional longer explanation of the option.
    #[serde(default)]
    pub description: Option<String>,
}

impl QuestionOption {
    /// Whether the agent flagged this option as its recommendation.
    ///
    /// The CLI encodes the recommendation inside the label text rather than
    /// as a structured field, so detection is a case-insensitive substring
    /// match on `"(recommended)"`.
    #[must_use]
    pub fn is_recommended(&self) -> bool {
        self.label.to_lowercase().contains(RECOMMENDED_MARKER)
    }
}

/// A single question the agent wants answered before continuing.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Question {
    /// Question text.
    #[serde(rename = "question")]
    pub text: String,
    /// Optional short topic header.
    #[serde(default)]
    pub header: Option<String>,
    /// Candidate answers; may be empty for free-form questions.
    #[serde(default)]
    pub options: Vec<QuestionOption>,
    /// Whether several options may be chosen together.
    #[serde(rename = "multiSelect", default)]
    pub multi_select: bool,
}

impl Question {
    /// Options the autopilot would pick for this question.
    ///
    /// Single-select: the first recommended option, falling back to the
    /// first listed one. Multi-select: every recommended option, falling
    /// back to the first listed one. Empty when the question has no options.
    #[must_use]
    pub fn auto_selected(&self) -> Vec<&QuestionOption> {
        if self.multi_select {
            let recommended: Vec<&QuestionOption> =
                self.options.iter().filter(|o| o.is_recommended()).collect();
            if recommended.is_empty() {
                self.options.first().into_iter().collect()
            } else {
                recommended
            }
        } else {
            self.options
                .iter()
                .find(|o| o.is_recommended())
                .or_else(|| self.options.first())
                .into_iter()
                .collect()
        }
    }
}

/// Combine autopilot selections across questions into one resume prompt.
///
/// One line per answerable question; questions without options are skipped.
/// Falls back to a bare continuation prompt when nothing was selectable so
/// the resumed agent still receives an instruction.
#[must_use]
pub fn combined_auto_answer(questions: &[Question]) -> String {
    let lines: Vec<String> = questions
        .iter()
        .filter_map(|q| {
            let labels: Vec<&str> = q.auto_selected().iter().map(|o| o.label.as_str()).collect();
            if labels.is_empty() {
                None
            } else {
                Some(format!("Answer to \"{}\": {}", q.text, labels.join(", ")))
            }
        })
        .collect();
    if lines.is_empty() {
        "Continue.".to_string()
    } else {
        lines.join("\n")
    }
}
