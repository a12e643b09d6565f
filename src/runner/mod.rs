//! Process-backed session runner core.
//!
//! The runner drives one agent CLI subprocess per chat conversation:
//! [`decoder`] frames and parses the CLI's stream-json stdout,
//! [`process`] owns subprocess lifecycle and the typed event stream,
//! [`registry`] enforces at-most-one live process per conversation with an
//! inactivity watchdog, [`batcher`] coalesces streamed text into
//! chat-friendly chunks, and [`turn`] orchestrates a full turn from launch
//! to exactly one terminal report.
//!
//! The chat platform and the durable session index sit behind the
//! [`MessageSink`] and [`SessionIndex`] traits so the core stays
//! platform-agnostic.

pub mod batcher;
pub mod decoder;
pub mod process;
pub mod registry;
pub mod turn;

use std::future::Future;
use std::pin::Pin;

use serde_json::Value;

use crate::models::question::Question;
use crate::models::session::{NewSession, SessionRecord};
use crate::models::turn::TurnStatus;
use crate::Result;

/// Events emitted by the agent process driver into the turn event channel.
///
/// `Exit` is always the final event of a stream; the channel closes after
/// it. When the process produced a result record, the `Result` event
/// precedes `Exit`.
#[derive(Debug, Clone)]
pub enum AgentEvent {
    /// The CLI announced its session, once per process.
    Init {
        /// Agent-internal session id, used for `--resume`.
        session_id: String,
        /// Model name when the CLI reports one.
        model: Option<String>,
    },
    /// Assistant text output.
    Text {
        /// Raw text block content.
        text: String,
    },
    /// The agent invoked a tool. Also emitted for the special interactive
    /// tools, alongside their dedicated events.
    ToolUse {
        /// Invocation id when the CLI provided one. Invocations without an
        /// id bypass de-duplication; ids are never synthesized for them.
        id: Option<String>,
        /// Tool name.
        name: String,
        /// Tool input payload, verbatim.
        input: Value,
    },
    /// The agent asked the human one or more questions
    /// (`AskUserQuestion` tool).
    AskUser {
        /// Parsed questions in presentation order.
        questions: Vec<Question>,
    },
    /// The agent finished planning and wants approval to act
    /// (`ExitPlanMode` tool).
    ExitPlanMode,
    /// Terminal result record, once per process.
    Result {
        /// Final result text when present.
        result_text: Option<String>,
        /// Total cost in USD when the CLI reports it.
        cost_usd: Option<f64>,
    },
    /// The process could not be launched or failed out-of-band.
    Error {
        /// Failure classification.
        cause: AgentFailure,
    },
    /// The process terminated. `None` means killed by signal, or killed
    /// intentionally through the handle.
    Exit {
        /// OS exit code when the process exited on its own.
        code: Option<i32>,
    },
}

/// Why an agent process failed before producing a normal exit.
#[derive(Debug, Clone)]
pub enum AgentFailure {
    /// The configured agent binary was not found on this host.
    BinaryNotFound {
        /// The binary name or path that was attempted.
        binary: String,
    },
    /// Any other spawn or stream setup failure.
    Spawn {
        /// Underlying error detail, for logs only.
        detail: String,
    },
}

/// Outbound chat surface the orchestrator reports through.
///
/// Implementations deliver to a real platform (Slack here); tests record
/// calls. All methods are fallible; the orchestrator logs and swallows
/// failures rather than aborting a turn over a delivery problem.
pub trait MessageSink: Send + Sync {
    /// Post a plain text message to the conversation.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Slack`](crate::AppError::Slack) when delivery
    /// fails after retries.
    fn post_text(
        &self,
        conversation_id: &str,
        text: &str,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;

    /// Render an interactive question set.
    ///
    /// With `answered` labels the render is a static record of the choice;
    /// without them the options become interactive controls. `session_id`
    /// is the agent session an answer should resume; interactive renders
    /// embed it so the answer path can start the follow-up turn.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Slack`](crate::AppError::Slack) when delivery
    /// fails after retries.
    fn render_question(
        &self,
        conversation_id: &str,
        questions: &[Question],
        answered: Option<&[String]>,
        session_id: Option<&str>,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;

    /// Surface a cosmetic progress hint for a running tool.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Slack`](crate::AppError::Slack) when delivery
    /// fails after retries.
    fn post_progress(
        &self,
        conversation_id: &str,
        tool_label: &str,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;

    /// Update the conversation's turn status indicator.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Slack`](crate::AppError::Slack) when delivery
    /// fails after retries.
    fn set_status(
        &self,
        conversation_id: &str,
        status: TurnStatus,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;
}

/// Durable conversation ↔ agent-session mapping.
pub trait SessionIndex: Send + Sync {
    /// Look up a session by its agent-internal id.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Db`](crate::AppError::Db) on query failure.
    fn lookup_by_session_id(
        &self,
        session_id: &str,
    ) -> Pin<Box<dyn Future<Output = Result<Option<SessionRecord>>> + Send + '_>>;

    /// Look up the session bound to a conversation.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Db`](crate::AppError::Db) on query failure.
    fn lookup_by_conversation_id(
        &self,
        conversation_id: &str,
    ) -> Pin<Box<dyn Future<Output = Result<Option<SessionRecord>>> + Send + '_>>;

    /// Register a brand-new session. A conversation holds one binding;
    /// recording a new session for an already-bound conversation replaces
    /// the old binding.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Db`](crate::AppError::Db) on write failure.
    fn record_new_session(
        &self,
        session: NewSession,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;

    /// Refresh the last-activity timestamp of an existing session.
    /// Unknown ids are a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Db`](crate::AppError::Db) on write failure.
    fn touch_activity(
        &self,
        session_id: &str,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;
}
