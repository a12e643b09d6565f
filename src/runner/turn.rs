//! Turn orchestration: one agent process per chat turn, driven from launch
//! to exactly one terminal report.
//!
//! [`TurnRunner::start_turn`] runs a work-queue loop: a turn may produce a
//! follow-up request (autopilot answer, plan approval) which is run next,
//! until a turn ends without one. Each turn registers its process with the
//! [`ActiveRunners`] registry, consumes the typed event stream in a single
//! `select!` loop, and reports through the injected [`MessageSink`].
//!
//! Interactive events (`AskUser`, `ExitPlanMode`) hand off to a spawned
//! handler task. Two flags coordinate the handoff with the event loop:
//! `handler_takeover` marks that the handler owns the turn's ending, and
//! `process_exited_early` is set by the exit path when the process dies
//! while the handler is mid-flight, which suppresses the handler's resume
//! and lets the exit path report the failure exactly once.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::config::GlobalConfig;
use crate::models::question::{combined_auto_answer, Question};
use crate::models::session::NewSession;
use crate::models::turn::{TurnOutcome, TurnRequest, TurnStatus};
use crate::runner::batcher::{self, OutputBatcher};
use crate::runner::process::{AgentProcess, LaunchSpec, ASK_USER_TOOL, EXIT_PLAN_TOOL};
use crate::runner::registry::{ActiveRunners, TimeoutHandler};
use crate::runner::{AgentEvent, AgentFailure, MessageSink, SessionIndex};

/// Fixed resume prompt sent when the agent requests plan approval.
pub const PLAN_APPROVAL_PROMPT: &str = "The plan is approved. Proceed with the implementation.";

/// Mutable turn state shared between the event loop and interactive
/// handler tasks.
#[derive(Debug, Default)]
struct TurnState {
    result_seen: bool,
    completion_reported: bool,
    error_reported: bool,
    handler_takeover: bool,
    process_exited_early: bool,
    outcome: Option<TurnOutcome>,
    follow_up: Option<TurnRequest>,
}

type SharedTurnState = Arc<Mutex<TurnState>>;

/// What an interactive handler task has to resolve.
enum Interaction {
    Questions(Vec<Question>),
    PlanApproval,
}

/// Drives agent turns for conversations.
pub struct TurnRunner {
    config: Arc<GlobalConfig>,
    registry: Arc<ActiveRunners>,
    sink: Arc<dyn MessageSink>,
    index: Arc<dyn SessionIndex>,
}

impl TurnRunner {
    /// Assemble a runner from its collaborators.
    #[must_use]
    pub fn new(
        config: Arc<GlobalConfig>,
        registry: Arc<ActiveRunners>,
        sink: Arc<dyn MessageSink>,
        index: Arc<dyn SessionIndex>,
    ) -> Self {
        Self {
            config,
            registry,
            sink,
            index,
        }
    }

    /// Run a turn and any follow-up turns it produces, returning the final
    /// turn's outcome.
    ///
    /// Follow-ups come from autopilot answers and plan approvals; the loop
    /// is iterative so a long ask/answer chain cannot grow the stack.
    pub async fn start_turn(&self, request: TurnRequest) -> TurnOutcome {
        let mut queue = VecDeque::from([request]);
        let mut last = TurnOutcome::Superseded;
        while let Some(request) = queue.pop_front() {
            let turn_id = Uuid::new_v4().to_string();
            let span = info_span!(
                "turn",
                conversation_id = %request.conversation_id,
                %turn_id,
                resume = request.session_id.is_some(),
            );
            let (outcome, follow_up) = self.run_turn(request).instrument(span).await;
            last = outcome;
            if let Some(next) = follow_up {
                queue.push_back(next);
            }
        }
        last
    }

    /// Launch and drive a single turn.
    async fn run_turn(&self, request: TurnRequest) -> (TurnOutcome, Option<TurnRequest>) {
        let started_at = Instant::now();
        info!(
            prompt_chars = request.prompt.chars().count(),
            attachments = request.attachments.len(),
            autopilot = request.autopilot,
            "starting agent turn"
        );
        if let Err(err) = self
            .sink
            .set_status(&request.conversation_id, TurnStatus::Received)
            .await
        {
            warn!(%err, "failed to post received status");
        }

        let handle = AgentProcess::new(&request.conversation_id);
        let on_timeout = self.timeout_handler(&request.conversation_id);
        self.registry
            .register(&request.conversation_id, handle.clone(), Some(on_timeout))
            .await;

        let spec = LaunchSpec::for_request(
            &request,
            &self.config.agent_binary,
            &self.config.agent_args,
        );
        let events = handle.start(spec);
        let result = self.drive(&request, &handle, events, started_at).await;
        // Normal paths unregister on exit; this covers a stream that ended
        // without an exit event.
        self.registry
            .unregister(&request.conversation_id, &handle)
            .await;
        result
    }

    /// Consume the event stream of one process until it exits.
    ///
    /// Public seam: tests feed a hand-built channel through an idle handle
    /// to exercise the state machine without spawning real processes.
    #[allow(clippy::too_many_lines)] // Exhaustive event dispatch.
    pub async fn drive(
        &self,
        request: &TurnRequest,
        handle: &AgentProcess,
        mut events: mpsc::Receiver<AgentEvent>,
        started_at: Instant,
    ) -> (TurnOutcome, Option<TurnRequest>) {
        let state: SharedTurnState = Arc::new(Mutex::new(TurnState::default()));
        let mut batcher = OutputBatcher::new(self.config.flush_window());
        let mut handler_tasks: Vec<JoinHandle<()>> = Vec::new();

        loop {
            let deadline = batcher.deadline();
            tokio::select! {
                maybe = events.recv() => {
                    let Some(event) = maybe else {
                        debug!("event stream closed without exit event");
                        break;
                    };
                    self.registry
                        .refresh_activity(&request.conversation_id, handle)
                        .await;
                    match event {
                        AgentEvent::Init { session_id, model } => {
                            self.on_init(request, &session_id, model.as_deref()).await;
                        }
                        AgentEvent::Text { text } => batcher.append(&text),
                        AgentEvent::ToolUse { name, .. } => {
                            if name != ASK_USER_TOOL && name != EXIT_PLAN_TOOL {
                                if let Err(err) = self
                                    .sink
                                    .post_progress(&request.conversation_id, &name)
                                    .await
                                {
                                    debug!(%err, tool = %name, "failed to post tool progress");
                                }
                            }
                        }
                        AgentEvent::AskUser { questions } => {
                            let task = self
                                .spawn_interactive(
                                    request,
                                    handle,
                                    &state,
                                    &mut batcher,
                                    Interaction::Questions(questions),
                                )
                                .await;
                            handler_tasks.push(task);
                        }
                        AgentEvent::ExitPlanMode => {
                            let task = self
                                .spawn_interactive(
                                    request,
                                    handle,
                                    &state,
                                    &mut batcher,
                                    Interaction::PlanApproval,
                                )
                                .await;
                            handler_tasks.push(task);
                        }
                        AgentEvent::Result { result_text, cost_usd } => {
                            self.on_result(
                                request,
                                handle,
                                &state,
                                &mut batcher,
                                result_text.as_deref(),
                                cost_usd,
                                started_at,
                            )
                            .await;
                        }
                        AgentEvent::Error { cause } => {
                            self.on_error(request, handle, &state, &mut batcher, &cause)
                                .await;
                        }
                        AgentEvent::Exit { code } => {
                            self.on_exit(request, handle, &state, &mut batcher, code)
                                .await;
                            break;
                        }
                    }
                }
                () = batcher::wait_for_deadline(deadline), if deadline.is_some() => {
                    self.flush(&request.conversation_id, &mut batcher).await;
                }
            }
        }

        for task in handler_tasks {
            if let Err(err) = task.await {
                warn!(%err, "interactive handler task failed");
            }
        }

        let mut guard = state.lock().await;
        let outcome = guard.outcome.take().unwrap_or(TurnOutcome::Superseded);
        let follow_up = guard.follow_up.take();
        drop(guard);
        info!(?outcome, follow_up = follow_up.is_some(), "turn finished");
        (outcome, follow_up)
    }

    /// Handle the session announcement: bind brand-new conversations in the
    /// index, refresh resumed ones, and move the status to Working.
    async fn on_init(&self, request: &TurnRequest, session_id: &str, model: Option<&str>) {
        info!(
            session_id,
            model = model.unwrap_or("unknown"),
            "agent session announced"
        );
        match &request.session_id {
            None => {
                let record = NewSession {
                    session_id: session_id.to_owned(),
                    conversation_id: request.conversation_id.clone(),
                    directory: request.directory.display().to_string(),
                };
                if let Err(err) = self.index.record_new_session(record).await {
                    warn!(%err, "failed to record new session");
                }
            }
            Some(prior) => {
                if let Err(err) = self.index.touch_activity(prior).await {
                    warn!(%err, "failed to refresh session activity");
                }
            }
        }
        if let Err(err) = self
            .sink
            .set_status(&request.conversation_id, TurnStatus::Working)
            .await
        {
            warn!(%err, "failed to post working status");
        }
    }

    /// Mark the takeover, take the pending buffer text, and spawn the
    /// interactive handler task.
    ///
    /// The takeover flag is set from the event loop, before any exit event
    /// can be processed, so the exit path always sees it.
    async fn spawn_interactive(
        &self,
        request: &TurnRequest,
        handle: &AgentProcess,
        state: &SharedTurnState,
        batcher: &mut OutputBatcher,
        interaction: Interaction,
    ) -> JoinHandle<()> {
        state.lock().await.handler_takeover = true;
        let pending = batcher.take();
        let sink = Arc::clone(&self.sink);
        let state = Arc::clone(state);
        let request = request.clone();
        let handle = handle.clone();
        tokio::spawn(
            interactive_handler(sink, state, request, handle, interaction, pending)
                .instrument(info_span!("interactive_handler")),
        )
    }

    /// Handle the result record: flush, report completion once, and kill
    /// the lingering process.
    #[allow(clippy::too_many_arguments)] // Internal event-arm plumbing.
    async fn on_result(
        &self,
        request: &TurnRequest,
        handle: &AgentProcess,
        state: &SharedTurnState,
        batcher: &mut OutputBatcher,
        result_text: Option<&str>,
        cost_usd: Option<f64>,
        started_at: Instant,
    ) {
        debug!(
            result_chars = result_text.map_or(0, |t| t.chars().count()),
            cost_usd = ?cost_usd,
            "result record received"
        );
        self.flush(&request.conversation_id, batcher).await;

        let mut guard = state.lock().await;
        guard.result_seen = true;
        let report = !guard.completion_reported;
        if report {
            guard.completion_reported = true;
            guard.outcome = Some(TurnOutcome::Completed);
        }
        drop(guard);

        if report {
            let message = completion_message(cost_usd, started_at.elapsed());
            if let Err(err) = self.sink.post_text(&request.conversation_id, &message).await {
                warn!(%err, "failed to post completion message");
            }
            if let Err(err) = self
                .sink
                .set_status(&request.conversation_id, TurnStatus::Completed)
                .await
            {
                warn!(%err, "failed to post completed status");
            }
        }
        // The CLI lingers briefly after its result record; killing here is
        // a convenience and the subsequent exit event stays silent.
        handle.kill().await;
    }

    /// Handle an in-band process failure (spawn errors, mostly).
    async fn on_error(
        &self,
        request: &TurnRequest,
        handle: &AgentProcess,
        state: &SharedTurnState,
        batcher: &mut OutputBatcher,
        cause: &AgentFailure,
    ) {
        self.flush(&request.conversation_id, batcher).await;
        self.registry
            .unregister(&request.conversation_id, handle)
            .await;

        let mut guard = state.lock().await;
        guard.error_reported = true;
        guard.outcome = Some(TurnOutcome::Failed);
        drop(guard);

        let message = match cause {
            AgentFailure::BinaryNotFound { binary } => {
                warn!(binary = %binary, "agent binary not found");
                format!(
                    "\u{26a0}\u{fe0f} The `{binary}` CLI is not installed on this host, \
                     so the turn could not start."
                )
            }
            AgentFailure::Spawn { detail } => {
                warn!(detail = %detail, "agent process failed to start");
                "\u{26a0}\u{fe0f} The agent process failed to start. \
                 Check the server logs for details."
                    .to_owned()
            }
        };
        if let Err(err) = self.sink.post_text(&request.conversation_id, &message).await {
            warn!(%err, "failed to post error message");
        }
        if let Err(err) = self
            .sink
            .set_status(&request.conversation_id, TurnStatus::Failed)
            .await
        {
            warn!(%err, "failed to post failed status");
        }
    }

    /// Handle process termination with the ordered silence checks.
    async fn on_exit(
        &self,
        request: &TurnRequest,
        handle: &AgentProcess,
        state: &SharedTurnState,
        batcher: &mut OutputBatcher,
        code: Option<i32>,
    ) {
        self.flush(&request.conversation_id, batcher).await;
        self.registry
            .unregister(&request.conversation_id, handle)
            .await;

        let mut guard = state.lock().await;
        let Some(code) = code else {
            // Intentional kill: supersede, timeout, stop, or the cleanup
            // kill after a result or question. Whoever killed reported.
            debug!("agent exited after intentional kill");
            return;
        };
        if guard.error_reported {
            debug!(code, "exit after an already-reported failure");
            return;
        }
        if guard.handler_takeover {
            // The process died while an interactive handler was between
            // its flush and its resume decision.
            guard.process_exited_early = true;
            guard.error_reported = true;
            guard.outcome = Some(TurnOutcome::Failed);
            drop(guard);
            warn!(
                code,
                stderr_tail = %handle.stderr_tail(),
                "agent exited while an interactive handler was in flight"
            );
            self.report_failure(&request.conversation_id).await;
            return;
        }
        if code == 0 {
            if guard.result_seen {
                debug!("clean exit after result");
                return;
            }
            if guard.completion_reported {
                return;
            }
            guard.completion_reported = true;
            guard.outcome = Some(TurnOutcome::Completed);
            drop(guard);
            info!("clean exit without a result record; reporting fallback completion");
            if let Err(err) = self
                .sink
                .post_text(&request.conversation_id, "\u{2705} Done.")
                .await
            {
                warn!(%err, "failed to post fallback completion");
            }
            if let Err(err) = self
                .sink
                .set_status(&request.conversation_id, TurnStatus::Completed)
                .await
            {
                warn!(%err, "failed to post completed status");
            }
            return;
        }
        guard.error_reported = true;
        guard.outcome = Some(TurnOutcome::Failed);
        drop(guard);
        warn!(
            code,
            stderr_tail = %handle.stderr_tail(),
            "agent exited with failure"
        );
        self.report_failure(&request.conversation_id).await;
    }

    /// Post the generic failure message and move the status to Failed.
    /// Diagnostic detail stays in the logs.
    async fn report_failure(&self, conversation_id: &str) {
        if let Err(err) = self
            .sink
            .post_text(
                conversation_id,
                "\u{26a0}\u{fe0f} The agent run failed. Check the server logs for details.",
            )
            .await
        {
            warn!(%err, "failed to post failure message");
        }
        if let Err(err) = self.sink.set_status(conversation_id, TurnStatus::Failed).await {
            warn!(%err, "failed to post failed status");
        }
    }

    /// Deliver any buffered output; a no-op when the buffer is empty.
    async fn flush(&self, conversation_id: &str, batcher: &mut OutputBatcher) {
        let Some(text) = batcher.take() else { return };
        if let Err(err) = self.sink.post_text(conversation_id, &text).await {
            warn!(%err, "failed to deliver buffered agent output");
        }
    }

    /// Build the registry timeout callback for a conversation.
    fn timeout_handler(&self, conversation_id: &str) -> TimeoutHandler {
        let sink = Arc::clone(&self.sink);
        let conversation_id = conversation_id.to_owned();
        let idle_seconds = self.config.runner.inactivity_timeout_seconds;
        Arc::new(move || {
            let sink = Arc::clone(&sink);
            let conversation_id = conversation_id.clone();
            Box::pin(async move {
                sink.post_text(
                    &conversation_id,
                    &format!(
                        "\u{23f1}\u{fe0f} The agent produced no output for {idle_seconds}s \
                         and was stopped."
                    ),
                )
                .await?;
                sink.set_status(&conversation_id, TurnStatus::Failed).await?;
                Ok(())
            })
        })
    }
}

// ── Interactive handlers ──────────────────────────────────────────────────────

/// Resolve an interactive takeover: flush first, then answer, suspend, or
/// approve, then clear the takeover flag.
async fn interactive_handler(
    sink: Arc<dyn MessageSink>,
    state: SharedTurnState,
    request: TurnRequest,
    handle: AgentProcess,
    interaction: Interaction,
    pending: Option<String>,
) {
    if let Some(text) = pending {
        if let Err(err) = sink.post_text(&request.conversation_id, &text).await {
            warn!(%err, "failed to flush buffered output before interaction");
        }
    }
    {
        let mut guard = state.lock().await;
        if guard.process_exited_early {
            // The process died during the flush await and the exit path
            // already reported the failure.
            guard.handler_takeover = false;
            return;
        }
    }

    match interaction {
        Interaction::Questions(questions) => {
            if request.autopilot {
                autopilot_answer(&sink, &state, &request, &handle, &questions).await;
            } else {
                manual_suspend(&sink, &state, &request, &handle, &questions).await;
            }
        }
        Interaction::PlanApproval => plan_approval(&sink, &state, &request, &handle).await,
    }

    state.lock().await.handler_takeover = false;
}

/// Autopilot: pick answers, show them, kill the process, and queue the
/// resume turn.
async fn autopilot_answer(
    sink: &Arc<dyn MessageSink>,
    state: &SharedTurnState,
    request: &TurnRequest,
    handle: &AgentProcess,
    questions: &[Question],
) {
    let answer = combined_auto_answer(questions);
    let selected: Vec<String> = questions
        .iter()
        .flat_map(|q| q.auto_selected().into_iter().map(|o| o.label.clone()))
        .collect();
    info!(
        questions = questions.len(),
        selected = selected.len(),
        "autopilot answering questions"
    );
    if let Err(err) = sink
        .render_question(&request.conversation_id, questions, Some(&selected), None)
        .await
    {
        warn!(%err, "failed to render answered questions");
    }
    handle.kill().await;

    let mut guard = state.lock().await;
    if !guard.process_exited_early {
        guard.follow_up = Some(request.follow_up(handle.current_session_id(), answer));
    }
}

/// Manual mode: render the question interactively and suspend the turn.
async fn manual_suspend(
    sink: &Arc<dyn MessageSink>,
    state: &SharedTurnState,
    request: &TurnRequest,
    handle: &AgentProcess,
    questions: &[Question],
) {
    let session_id = handle.current_session_id();
    info!(
        questions = questions.len(),
        "rendering questions for a human answer"
    );
    if let Err(err) = sink
        .render_question(
            &request.conversation_id,
            questions,
            None,
            session_id.as_deref(),
        )
        .await
    {
        warn!(%err, "failed to render question");
    }
    if let Err(err) = sink
        .set_status(&request.conversation_id, TurnStatus::AwaitingAnswer)
        .await
    {
        warn!(%err, "failed to post awaiting-answer status");
    }
    handle.kill().await;

    let mut guard = state.lock().await;
    if !guard.process_exited_early {
        guard.outcome = Some(TurnOutcome::AwaitingAnswer);
    }
}

/// Plan approval is always automatic: approve, kill, resume.
async fn plan_approval(
    sink: &Arc<dyn MessageSink>,
    state: &SharedTurnState,
    request: &TurnRequest,
    handle: &AgentProcess,
) {
    info!("approving agent plan");
    if let Err(err) = sink
        .post_text(
            &request.conversation_id,
            "\u{2705} Plan approved automatically; continuing.",
        )
        .await
    {
        warn!(%err, "failed to post plan approval notice");
    }
    handle.kill().await;

    let mut guard = state.lock().await;
    if !guard.process_exited_early {
        guard.follow_up = Some(
            request.follow_up(handle.current_session_id(), PLAN_APPROVAL_PROMPT.to_owned()),
        );
    }
}

// ── Private helpers ───────────────────────────────────────────────────────────

/// Completion line with elapsed time and optional cost.
fn completion_message(cost_usd: Option<f64>, elapsed: Duration) -> String {
    use std::fmt::Write as _;

    let mut message = format!("\u{2705} Done in {}", format_elapsed(elapsed));
    if let Some(cost) = cost_usd {
        let _ = write!(message, " \u{b7} ${cost:.4}");
    }
    message
}

/// Render a duration as `34s` or `2m 5s`.
fn format_elapsed(elapsed: Duration) -> String {
    let secs = elapsed.as_secs();
    if secs >= 60 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else {
        format!("{secs}s")
    }
}
