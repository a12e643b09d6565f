//! Slack chat layer.
//!
//! [`client`] owns the Socket Mode connection and an ordered outbound send
//! queue, [`sink`] adapts it to the runner's `MessageSink` seam, [`blocks`]
//! builds the Block Kit payloads, and [`events`] / [`commands`] dispatch
//! inbound Socket Mode traffic into agent turns.
//!
//! A conversation is one Slack thread: the key is `channel:thread_ts`,
//! where `thread_ts` is the root message of the thread. A top-level message
//! starts a new conversation keyed by its own `ts`, and the bot answers in
//! that thread from then on.

pub mod blocks;
pub mod client;
pub mod commands;
pub mod events;
pub mod sink;

use std::sync::Arc;

use slack_morphism::prelude::{SlackChannelId, SlackClientEventsUserState, SlackTs};

use crate::config::GlobalConfig;
use crate::runner::registry::ActiveRunners;
use crate::runner::turn::TurnRunner;
use crate::runner::SessionIndex;
use crate::slack::client::SlackService;

/// Shared state handed to Socket Mode callbacks via user-state injection.
pub struct EventContext {
    /// Loaded server configuration.
    pub config: Arc<GlobalConfig>,
    /// Turn orchestrator that inbound messages and answers feed into.
    pub runner: Arc<TurnRunner>,
    /// Registry of live agent processes, for stop commands.
    pub registry: Arc<ActiveRunners>,
    /// Durable conversation to session mapping.
    pub index: Arc<dyn SessionIndex>,
    /// Outbound Slack service, for in-place message edits.
    pub slack: Arc<SlackService>,
}

/// Read the shared [`EventContext`] back out of the callback user state.
pub async fn shared_context(state: &SlackClientEventsUserState) -> Option<Arc<EventContext>> {
    let guard = state.read().await;
    guard.get_user_state::<Arc<EventContext>>().cloned()
}

/// Conversation key for a message thread.
#[must_use]
pub fn conversation_key(channel: &SlackChannelId, thread_root: &SlackTs) -> String {
    format!("{channel}:{thread_root}")
}

/// Split a conversation key back into its channel and thread root.
///
/// Keys without a thread part map to the bare channel, so sinks degrade to
/// top-level posts rather than failing.
#[must_use]
pub fn conversation_parts(conversation_id: &str) -> (SlackChannelId, Option<SlackTs>) {
    match conversation_id.split_once(':') {
        Some((channel, thread_root)) => (
            SlackChannelId(channel.to_owned()),
            Some(SlackTs(thread_root.to_owned())),
        ),
        None => (SlackChannelId(conversation_id.to_owned()), None),
    }
}
