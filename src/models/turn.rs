//! Turn-level request and lifecycle types.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Binary attachment forwarded to the agent alongside the prompt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptAttachment {
    /// MIME type, e.g. `image/png`.
    pub media_type: String,
    /// Raw attachment bytes; base64-encoded on the wire.
    pub data: Vec<u8>,
}

/// Everything needed to run one agent turn for a conversation.
#[derive(Debug, Clone)]
pub struct TurnRequest {
    /// Chat conversation key the turn belongs to.
    pub conversation_id: String,
    /// Project directory the agent process runs in.
    pub directory: PathBuf,
    /// Prompt text for the agent.
    pub prompt: String,
    /// Prior agent session to resume; `None` starts a fresh session.
    pub session_id: Option<String>,
    /// Image attachments; non-empty switches the launch to attachment mode.
    pub attachments: Vec<PromptAttachment>,
    /// Whether interactive questions are answered automatically.
    pub autopilot: bool,
}

impl TurnRequest {
    /// Build a follow-up request that resumes `session_id` with a new
    /// prompt, inheriting conversation, directory, and autopilot mode.
    #[must_use]
    pub fn follow_up(&self, session_id: Option<String>, prompt: String) -> Self {
        Self {
            conversation_id: self.conversation_id.clone(),
            directory: self.directory.clone(),
            prompt,
            session_id,
            attachments: Vec::new(),
            autopilot: self.autopilot,
        }
    }
}

/// Human-visible lifecycle status of a turn.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TurnStatus {
    /// Request accepted, process not yet producing output.
    Received,
    /// Agent process is streaming output.
    Working,
    /// A question was rendered; the turn is suspended on a human answer.
    AwaitingAnswer,
    /// Turn finished successfully.
    Completed,
    /// Turn finished with a failure.
    Failed,
}

impl TurnStatus {
    /// Stable textual form used in logs and persisted fields.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Received => "received",
            Self::Working => "working",
            Self::AwaitingAnswer => "awaiting_answer",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

/// Final outcome of a driven turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnOutcome {
    /// The agent produced a result (or exited cleanly) and completion was
    /// reported.
    Completed,
    /// A failure was reported (spawn error, runtime error, or bad exit).
    Failed,
    /// A question was rendered in manual mode; the turn suspended.
    AwaitingAnswer,
    /// The process was killed intentionally (supersede, timeout, or stop)
    /// and the turn ended without a report of its own.
    Superseded,
}
