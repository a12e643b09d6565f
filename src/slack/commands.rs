//! Slack slash command router.

use std::sync::Arc;

use slack_morphism::prelude::{
    SlackClient, SlackClientEventsUserState, SlackClientHyperHttpsConnector, SlackCommandEvent,
    SlackCommandEventResponse, SlackMessageContent, SlackMessageResponseType,
};
use tracing::{info, warn};

use crate::slack::shared_context;

/// Handle incoming slash commands routed via Socket Mode.
///
/// `/stop` kills every live agent run on this server; anything else gets a
/// short ephemeral notice. Responses are always ephemeral so the channel
/// stays free of command noise.
///
/// # Errors
///
/// Returns an error if the command response cannot be constructed.
pub async fn handle_command(
    event: SlackCommandEvent,
    _client: Arc<SlackClient<SlackClientHyperHttpsConnector>>,
    state: SlackClientEventsUserState,
) -> slack_morphism::AnyStdResult<SlackCommandEventResponse> {
    info!(command = ?event.command, user = ?event.user_id, "received slash command");

    let Some(context) = shared_context(&state).await else {
        warn!("event context not available; acknowledging command without action");
        return Ok(ephemeral("The server is still starting up; try again."));
    };

    let user_id = event.user_id.to_string();
    if context.config.ensure_authorized(&user_id).is_err() {
        warn!(user_id, "unauthorized slash command");
        return Ok(ephemeral("You are not authorized to control this agent."));
    }

    let text = match event.command.0.as_str() {
        "/stop" => {
            let stopped = context.registry.kill_all().await;
            info!(stopped, "stop command killed active runs");
            if stopped == 0 {
                "No active agent runs.".to_owned()
            } else {
                format!("Stopped {stopped} agent run(s).")
            }
        }
        other => format!("Unknown command `{other}`."),
    };
    Ok(ephemeral(&text))
}

/// Build an ephemeral text-only command response.
fn ephemeral(text: &str) -> SlackCommandEventResponse {
    SlackCommandEventResponse {
        content: SlackMessageContent {
            text: Some(text.to_owned()),
            blocks: None,
            attachments: None,
            upload: None,
            files: None,
            reactions: None,
            metadata: None,
        },
        response_type: Some(SlackMessageResponseType::Ephemeral),
    }
}
