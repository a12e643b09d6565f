//! Slack Socket Mode event dispatch.
//!
//! Push events in the configured channel become agent turns: a top-level
//! message starts a fresh conversation in its own thread, a thread reply
//! resumes the session bound to that thread. Block action presses answer a
//! rendered question by resuming the session the button value carries.
//!
//! Every inbound event passes a centralized authorization guard before any
//! work happens. Unauthorized attempts are silently ignored from the Slack
//! user's perspective but logged as security events.

use std::path::PathBuf;
use std::sync::Arc;

use slack_morphism::prelude::{
    SlackBasicChannelInfo, SlackClient, SlackClientEventsUserState, SlackClientHyperHttpsConnector,
    SlackEventCallbackBody, SlackHistoryMessage, SlackInteractionEvent, SlackMessageEvent,
    SlackPushEventCallback,
};
use tracing::{debug, info, warn};

use crate::models::turn::TurnRequest;
use crate::slack::blocks::{self, ANSWER_ACTION_PREFIX};
use crate::slack::{conversation_key, shared_context, EventContext};

/// Verify that the acting Slack user may drive the agent.
///
/// Returns `true` when authorized. On failure, logs a security event and
/// returns `false`; the caller should silently drop the event so the
/// unauthorized user receives no feedback.
fn is_authorized(user_id: &str, context: &EventContext) -> bool {
    if context.config.ensure_authorized(user_id).is_ok() {
        return true;
    }
    warn!(
        user_id,
        "unauthorized user attempted slack interaction (silently ignored)"
    );
    false
}

/// Handle message push events delivered via Socket Mode.
///
/// # Errors
///
/// Never fails; problems are logged and the event is dropped.
pub async fn handle_push(
    event: SlackPushEventCallback,
    _client: Arc<SlackClient<SlackClientHyperHttpsConnector>>,
    state: SlackClientEventsUserState,
) -> slack_morphism::UserCallbackResult<()> {
    let Some(context) = shared_context(&state).await else {
        warn!("event context not available; ignoring push event");
        return Ok(());
    };

    if let SlackEventCallbackBody::Message(message) = event.event {
        handle_message(message, &context).await;
    }
    Ok(())
}

/// Turn a channel message into an agent turn when it qualifies.
async fn handle_message(message: SlackMessageEvent, context: &Arc<EventContext>) {
    // Plain user messages only: edits, deletions, joins and bot chatter
    // (including our own posts) all carry a subtype or a bot id.
    if message.subtype.is_some() || message.sender.bot_id.is_some() {
        return;
    }
    let Some(channel) = message.origin.channel.clone() else {
        return;
    };
    if channel.to_string() != context.config.slack.channel_id {
        debug!(channel = %channel, "message outside the configured channel; ignoring");
        return;
    }
    let Some(user_id) = message.sender.user.as_ref().map(ToString::to_string) else {
        return;
    };
    if !is_authorized(&user_id, context) {
        return;
    }
    let Some(text) = message.content.as_ref().and_then(|content| content.text.clone()) else {
        return;
    };
    let prompt = text.trim();
    if prompt.is_empty() {
        return;
    }

    let thread_root = message
        .origin
        .thread_ts
        .clone()
        .unwrap_or_else(|| message.origin.ts.clone());
    let conversation_id = conversation_key(&channel, &thread_root);
    info!(
        conversation_id = %conversation_id,
        user_id,
        prompt_chars = prompt.chars().count(),
        "starting turn from slack message"
    );
    spawn_turn(
        context,
        conversation_id,
        channel.to_string(),
        prompt.to_owned(),
        None,
    )
    .await;
}

/// Handle interactive payloads (answer buttons) delivered via Socket Mode.
///
/// # Errors
///
/// Never fails; problems are logged and the interaction is dropped.
pub async fn handle_interaction(
    event: SlackInteractionEvent,
    _client: Arc<SlackClient<SlackClientHyperHttpsConnector>>,
    state: SlackClientEventsUserState,
) -> slack_morphism::UserCallbackResult<()> {
    let Some(context) = shared_context(&state).await else {
        warn!("event context not available; cannot process interaction");
        return Ok(());
    };

    match &event {
        SlackInteractionEvent::BlockActions(block_event) => {
            let user_id = block_event
                .user
                .as_ref()
                .map(|user| user.id.to_string())
                .unwrap_or_default();
            if user_id.is_empty() {
                warn!("block action with empty user id; ignoring");
                return Ok(());
            }
            if !is_authorized(&user_id, &context) {
                return Ok(());
            }

            if let Some(actions) = &block_event.actions {
                for action in actions {
                    let action_id = action.action_id.to_string();
                    if !action_id.starts_with(ANSWER_ACTION_PREFIX) {
                        warn!(action_id, "unknown action id prefix");
                        continue;
                    }
                    let Some(value) = action.value.as_deref() else {
                        warn!(action_id, "answer button without a value");
                        continue;
                    };
                    info!(action_id, user_id, "dispatching answer action");
                    handle_answer_action(
                        value,
                        block_event.channel.as_ref(),
                        block_event.message.as_ref(),
                        &context,
                    )
                    .await;
                }
            }
        }
        _ => {
            debug!("unhandled interaction event type");
        }
    }
    Ok(())
}

/// Resolve one answer button press: freeze the question message, then
/// resume the carried session with the chosen label as the next prompt.
async fn handle_answer_action(
    value: &str,
    channel: Option<&SlackBasicChannelInfo>,
    message: Option<&SlackHistoryMessage>,
    context: &Arc<EventContext>,
) {
    let (session_part, label) = value.split_once('|').unwrap_or(("", value));
    if label.trim().is_empty() {
        warn!(value, "answer button value carries no label");
        return;
    }
    let Some(channel_id) = channel.map(|info| info.id.clone()) else {
        warn!("answer action without channel info");
        return;
    };
    let Some(message) = message else {
        warn!("answer action without its source message");
        return;
    };

    // Replace the buttons before any slow work so a second tap on the same
    // message cannot answer twice.
    let frozen = vec![blocks::text_section(&format!("\u{2705} {label}"))];
    if let Err(err) = context
        .slack
        .update_message(channel_id.clone(), message.origin.ts.clone(), frozen)
        .await
    {
        warn!(%err, "failed to freeze answered question message");
    }

    let thread_root = message
        .origin
        .thread_ts
        .clone()
        .unwrap_or_else(|| message.origin.ts.clone());
    let conversation_id = conversation_key(&channel_id, &thread_root);
    let session_id = (!session_part.is_empty()).then(|| session_part.to_owned());
    info!(
        conversation_id = %conversation_id,
        resume = session_id.is_some(),
        "starting answer turn"
    );
    spawn_turn(
        context,
        conversation_id,
        channel_id.to_string(),
        label.to_owned(),
        session_id,
    )
    .await;
}

/// Build a turn request for a conversation and run it detached.
///
/// With no explicit `session_id` the conversation's stored binding (when
/// any) decides between resume and fresh start; the stored record also
/// pins the working directory for the life of the conversation.
async fn spawn_turn(
    context: &Arc<EventContext>,
    conversation_id: String,
    channel_id: String,
    prompt: String,
    session_id: Option<String>,
) {
    let stored = match context
        .index
        .lookup_by_conversation_id(&conversation_id)
        .await
    {
        Ok(record) => record,
        Err(err) => {
            warn!(%err, "session lookup failed; treating conversation as new");
            None
        }
    };
    let session_id = session_id.or_else(|| stored.as_ref().map(|record| record.session_id.clone()));
    let directory = stored.map_or_else(
        || context.config.workspace_for(&channel_id),
        |record| PathBuf::from(record.directory),
    );

    let request = TurnRequest {
        conversation_id,
        directory,
        prompt,
        session_id,
        attachments: Vec::new(),
        autopilot: context.config.runner.autopilot,
    };
    let runner = Arc::clone(&context.runner);
    tokio::spawn(async move {
        let outcome = runner.start_turn(request).await;
        debug!(?outcome, "slack-initiated turn finished");
    });
}
