//! Session index entities: the durable mapping between chat conversations
//! and agent-internal session ids.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A recorded agent session bound to a chat conversation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct SessionRecord {
    /// Agent-internal session id announced by the init record.
    pub session_id: String,
    /// Chat conversation key (channel id, optionally `:thread_ts` scoped).
    pub conversation_id: String,
    /// Project directory the session runs in.
    pub directory: String,
    /// When the session was first recorded.
    pub started_at: DateTime<Utc>,
    /// Last time the session showed activity.
    pub last_activity_at: DateTime<Utc>,
}

/// Payload for registering a brand-new session with the index.
#[derive(Debug, Clone)]
pub struct NewSession {
    /// Agent-internal session id.
    pub session_id: String,
    /// Chat conversation key.
    pub conversation_id: String,
    /// Project directory the session runs in.
    pub directory: String,
}

impl NewSession {
    /// Expand into a full record stamped with the current time.
    #[must_use]
    pub fn into_record(self) -> SessionRecord {
        let now = Utc::now();
        SessionRecord {
            session_id: self.session_id,
            conversation_id: self.conversation_id,
            directory: self.directory,
            started_at: now,
            last_activity_at: now,
        }
    }
}
