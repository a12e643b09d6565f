//! `MessageSink` implementation over the Slack service.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use slack_morphism::prelude::SlackTs;
use tokio::sync::Mutex;
use tracing::debug;

use crate::models::question::Question;
use crate::models::turn::TurnStatus;
use crate::runner::MessageSink;
use crate::slack::client::{SlackMessage, SlackService};
use crate::slack::{blocks, conversation_parts};
use crate::Result;

/// Delivers runner output to Slack threads.
///
/// Plain text and question renders go through the service's ordered send
/// queue, so a flush that was awaited before a question render is also
/// delivered before it. Status updates keep one indicator message per
/// conversation: posted directly on first use (the queue cannot return the
/// created `ts`) and edited in place from then on.
pub struct SlackSink {
    service: Arc<SlackService>,
    status_messages: Mutex<HashMap<String, SlackTs>>,
}

impl SlackSink {
    /// Wrap a connected Slack service.
    #[must_use]
    pub fn new(service: Arc<SlackService>) -> Self {
        Self {
            service,
            status_messages: Mutex::new(HashMap::new()),
        }
    }

    /// Post or edit the conversation's status indicator message.
    ///
    /// Terminal statuses drop the stored `ts` so the next turn in the
    /// conversation posts a fresh indicator instead of resurrecting one
    /// far up the thread.
    async fn deliver_status(&self, conversation_id: &str, status: TurnStatus) -> Result<()> {
        let (channel, thread_ts) = conversation_parts(conversation_id);
        let line = blocks::status_line(status);
        let mut statuses = self.status_messages.lock().await;
        if let Some(ts) = statuses.get(conversation_id) {
            self.service
                .update_message(channel, ts.clone(), vec![blocks::text_section(&line)])
                .await?;
        } else {
            let mut message = SlackMessage::plain(channel, line);
            message.thread_ts = thread_ts;
            let ts = self.service.post_now(message).await?;
            statuses.insert(conversation_id.to_owned(), ts);
        }
        if matches!(
            status,
            TurnStatus::Completed | TurnStatus::Failed | TurnStatus::AwaitingAnswer
        ) {
            statuses.remove(conversation_id);
        }
        Ok(())
    }

    /// Reuse the status message to name the tool the agent is running.
    /// Without a status message the hint is dropped; it is cosmetic.
    async fn deliver_progress(&self, conversation_id: &str, tool_label: &str) -> Result<()> {
        let (channel, _) = conversation_parts(conversation_id);
        let statuses = self.status_messages.lock().await;
        let Some(ts) = statuses.get(conversation_id) else {
            debug!(tool = tool_label, "no status message to carry tool progress");
            return Ok(());
        };
        let line = blocks::progress_line(tool_label);
        self.service
            .update_message(channel, ts.clone(), vec![blocks::text_section(&line)])
            .await
    }
}

impl MessageSink for SlackSink {
    fn post_text(
        &self,
        conversation_id: &str,
        text: &str,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        let (channel, thread_ts) = conversation_parts(conversation_id);
        let mut message = SlackMessage::plain(channel, text);
        message.thread_ts = thread_ts;
        Box::pin(async move { self.service.enqueue(message).await })
    }

    fn render_question(
        &self,
        conversation_id: &str,
        questions: &[Question],
        answered: Option<&[String]>,
        session_id: Option<&str>,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        let (channel, thread_ts) = conversation_parts(conversation_id);
        let rendered = blocks::question_blocks(questions, answered, session_id);
        // Notification fallback for clients that cannot show blocks.
        let preview = questions.first().map_or_else(
            || "The agent has a question.".to_owned(),
            |question| question.text.clone(),
        );
        let message = SlackMessage {
            channel,
            text: Some(preview),
            blocks: Some(rendered),
            thread_ts,
        };
        Box::pin(async move { self.service.enqueue(message).await })
    }

    fn post_progress(
        &self,
        conversation_id: &str,
        tool_label: &str,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        let conversation_id = conversation_id.to_owned();
        let tool_label = tool_label.to_owned();
        Box::pin(async move { self.deliver_progress(&conversation_id, &tool_label).await })
    }

    fn set_status(
        &self,
        conversation_id: &str,
        status: TurnStatus,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        let conversation_id = conversation_id.to_owned();
        Box::pin(async move { self.deliver_status(&conversation_id, status).await })
    }
}
