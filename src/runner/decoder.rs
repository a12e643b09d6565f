//! NDJSON decoder for the agent CLI's stream-json output.
//!
//! Two layers: [`StreamCodec`] frames stdout bytes into UTF-8 lines with a
//! maximum line length to prevent memory exhaustion from an unterminated or
//! oversized record, and [`parse_line`] turns one line into zero or more
//! typed [`ProtocolRecord`]s.
//!
//! The stream is noisy: the CLI interleaves plain-text warnings and unknown
//! record types with the JSON protocol. Anything that is not a recognized,
//! well-formed record is skipped with a debug log and the stream continues.

use bytes::BytesMut;
use serde::Deserialize;
use serde_json::Value;
use tokio_util::codec::{Decoder, LinesCodec, LinesCodecError};
use tracing::debug;

use crate::{AppError, Result};

/// Maximum line length accepted by the decoder: 1 MiB.
///
/// Lines exceeding this limit cause [`StreamCodec::decode`] to return
/// [`AppError::Agent`] with `"line too long"` rather than allocating
/// unbounded memory for a single record.
pub const MAX_LINE_BYTES: usize = 1_048_576;

/// Line-framing codec for the agent's stdout stream.
///
/// Delegates to [`LinesCodec`] with a fixed [`MAX_LINE_BYTES`] limit. Each
/// newline-terminated UTF-8 string is one candidate protocol record.
#[derive(Debug)]
pub struct StreamCodec(LinesCodec);

impl StreamCodec {
    /// Create a new `StreamCodec` with the default [`MAX_LINE_BYTES`] limit.
    #[must_use]
    pub fn new() -> Self {
        Self(LinesCodec::new_with_max_length(MAX_LINE_BYTES))
    }
}

impl Default for StreamCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for StreamCodec {
    type Item = String;
    type Error = AppError;

    /// Decode the next newline-terminated line from `src`.
    ///
    /// Returns `Ok(None)` when `src` holds no complete line yet (buffering).
    /// Returns `Err(AppError::Agent("line too long: …"))` when the line
    /// exceeds [`MAX_LINE_BYTES`].
    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        self.0.decode(src).map_err(map_codec_error)
    }

    /// Decode the final unterminated line when the stream reaches EOF.
    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        self.0.decode_eof(src).map_err(map_codec_error)
    }
}

/// One recognized record from the agent's stream-json protocol.
///
/// A single stdout line maps to zero or more records: assistant messages
/// carry a list of content blocks, each of which becomes its own record.
#[derive(Debug, Clone, PartialEq)]
pub enum ProtocolRecord {
    /// Session announcement: `{"type":"system","subtype":"init", …}`.
    Init {
        /// Agent-internal session id.
        session_id: String,
        /// Model name when the CLI reports one.
        model: Option<String>,
    },
    /// A text content block from an assistant message.
    AssistantText {
        /// Raw assistant text.
        text: String,
    },
    /// A tool invocation content block from an assistant message.
    AssistantToolUse {
        /// Invocation id; the CLI omits it on some stream variants.
        id: Option<String>,
        /// Tool name.
        name: String,
        /// Tool input payload, passed through verbatim.
        input: Value,
    },
    /// Terminal result record: `{"type":"result", …}`.
    Result {
        /// Final result text when present.
        result: Option<String>,
        /// Total cost in USD when the CLI reports it.
        total_cost_usd: Option<f64>,
    },
}

/// Parse one stdout line into protocol records.
///
/// Returns an empty vec for blank lines, non-JSON noise, unrecognized
/// record types, and records missing required fields. All skips are
/// debug-logged; none interrupt the stream.
#[must_use]
pub fn parse_line(line: &str) -> Vec<ProtocolRecord> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return Vec::new();
    }
    let Ok(value) = serde_json::from_str::<Value>(trimmed) else {
        debug!(line_len = trimmed.len(), "skipping non-JSON stdout line");
        return Vec::new();
    };
    let Some(kind) = value.get("type").and_then(Value::as_str) else {
        debug!("skipping JSON record without a type field");
        return Vec::new();
    };
    match kind {
        "system" => parse_system(&value).into_iter().collect(),
        "assistant" => parse_assistant(&value),
        "result" => parse_result(&value).into_iter().collect(),
        other => {
            debug!(record_type = other, "skipping unrecognized record type");
            Vec::new()
        }
    }
}

// ── Private helpers ───────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct SystemRecord {
    #[serde(default)]
    subtype: Option<String>,
    #[serde(default)]
    session_id: Option<String>,
    #[serde(default)]
    model: Option<String>,
}

#[derive(Deserialize)]
struct AssistantRecord {
    message: AssistantMessage,
}

#[derive(Deserialize)]
struct AssistantMessage {
    #[serde(default)]
    content: Vec<ContentBlock>,
}

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentBlock {
    Text {
        text: String,
    },
    ToolUse {
        #[serde(default)]
        id: Option<String>,
        name: String,
        #[serde(default)]
        input: Value,
    },
    #[serde(other)]
    Other,
}

#[derive(Deserialize)]
struct ResultRecord {
    #[serde(default)]
    result: Option<String>,
    #[serde(default)]
    total_cost_usd: Option<f64>,
}

/// Only `subtype == "init"` system records matter; they require a session id.
fn parse_system(value: &Value) -> Option<ProtocolRecord> {
    let record: SystemRecord = match serde_json::from_value(value.clone()) {
        Ok(record) => record,
        Err(err) => {
            debug!(%err, "skipping malformed system record");
            return None;
        }
    };
    if record.subtype.as_deref() != Some("init") {
        debug!(subtype = ?record.subtype, "skipping non-init system record");
        return None;
    }
    let Some(session_id) = record.session_id else {
        debug!("skipping init record without session_id");
        return None;
    };
    Some(ProtocolRecord::Init {
        session_id,
        model: record.model,
    })
}

fn parse_assistant(value: &Value) -> Vec<ProtocolRecord> {
    let record: AssistantRecord = match serde_json::from_value(value.clone()) {
        Ok(record) => record,
        Err(err) => {
            debug!(%err, "skipping malformed assistant record");
            return Vec::new();
        }
    };
    record
        .message
        .content
        .into_iter()
        .filter_map(|block| match block {
            ContentBlock::Text { text } => Some(ProtocolRecord::AssistantText { text }),
            ContentBlock::ToolUse { id, name, input } => {
                Some(ProtocolRecord::AssistantToolUse { id, name, input })
            }
            ContentBlock::Other => None,
        })
        .collect()
}

fn parse_result(value: &Value) -> Option<ProtocolRecord> {
    let record: ResultRecord = match serde_json::from_value(value.clone()) {
        Ok(record) => record,
        Err(err) => {
            debug!(%err, "skipping malformed result record");
            return None;
        }
    };
    Some(ProtocolRecord::Result {
        result: record.result,
        total_cost_usd: record.total_cost_usd,
    })
}

/// Map a [`LinesCodecError`] to an [`AppError`].
fn map_codec_error(e: LinesCodecError) -> AppError {
    match e {
        LinesCodecError::MaxLineLengthExceeded => {
            AppError::Agent(format!("line too long: exceeded {MAX_LINE_BYTES} bytes"))
        }
        LinesCodecError::Io(io_err) => AppError::Io(io_err.to_string()),
    }
}
