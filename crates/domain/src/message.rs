//! The upstream agent runtime message model.
//!
//! The runtime yields a stream of newline-delimited JSON messages while it
//! orchestrates the transcribe/draft/review/export tools. The driver only
//! cares about four shapes: system bookkeeping, assistant turns (which carry
//! tool-use blocks and token usage), mid-turn stream events (tool results
//! and free text), and the terminal result.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::pin::Pin;

/// A boxed async stream, used for agent runtime responses.
pub type BoxStream<'a, T> = Pin<Box<dyn futures_core::Stream<Item = T> + Send + 'a>>;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Messages
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// One message from the upstream agent runtime.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum AgentMessage {
    #[serde(rename = "system")]
    System(SystemMessage),

    #[serde(rename = "assistant")]
    Assistant(AssistantMessage),

    #[serde(rename = "stream_event")]
    Stream(StreamPayload),

    #[serde(rename = "result")]
    Result(ResultMessage),
}

/// Runtime bookkeeping (init, compaction markers, ...).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemMessage {
    #[serde(default)]
    pub subtype: Option<String>,
    #[serde(default)]
    pub session_id: Option<String>,
}

/// One assistant turn. `id` is the provider message id when the runtime
/// passes it through; it is the primary dedup key for cost accounting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssistantMessage {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub content: Vec<ContentBlock>,
    #[serde(default)]
    pub usage: Option<UsageBlock>,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
}

/// A content block inside an assistant turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ContentBlock {
    #[serde(rename = "text")]
    Text { text: String },

    #[serde(rename = "tool_use")]
    ToolUse { name: String, input: Value },
}

/// A mid-turn stream event surfaced by the runtime.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event")]
pub enum StreamPayload {
    /// A tool finished; `content` is the raw tool output (string, object,
    /// or an array of text blocks).
    #[serde(rename = "tool_result")]
    ToolResult {
        name: String,
        #[serde(default)]
        is_error: bool,
        #[serde(default)]
        content: Value,
    },

    /// Free assistant text (the reviewer subagent's verdicts arrive here).
    #[serde(rename = "text_delta")]
    TextDelta { text: String },
}

/// The terminal message of a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultMessage {
    #[serde(default)]
    pub is_error: bool,
    #[serde(default)]
    pub subtype: Option<String>,
    /// The final payload text (usually fenced JSON).
    #[serde(default)]
    pub result: Option<String>,
    #[serde(default)]
    pub usage: Option<UsageBlock>,
    #[serde(default)]
    pub session_id: Option<String>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Usage
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Token usage attached to a message. Any subset of the fields may be
/// present on the wire; absent fields count as zero.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageBlock {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
    #[serde(default)]
    pub cache_creation_input_tokens: u64,
    #[serde(default)]
    pub cache_read_input_tokens: u64,
}

impl UsageBlock {
    pub fn is_empty(&self) -> bool {
        self.input_tokens == 0
            && self.output_tokens == 0
            && self.cache_creation_input_tokens == 0
            && self.cache_read_input_tokens == 0
    }
}
