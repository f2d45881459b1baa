//! Typed projections of the dynamic JSON carried by tool results and
//! reviewer verdicts.
//!
//! Tool payloads arrive as arbitrary JSON; each projection deserializes the
//! fields one consumer cares about and ignores the rest. Parse failures are
//! never fatal — callers treat an unparseable payload as "not for me".

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Transcription
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// One transcription tool call's output. All fields optional; `nextChunk`
/// distinguishes an explicit `null` (end of input) from an absent field.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TranscriptionPayload {
    #[serde(default)]
    pub transcript: Option<String>,
    #[serde(default)]
    pub segments: Option<Vec<Segment>>,
    #[serde(default)]
    pub processed_chunks: Option<u64>,
    #[serde(default)]
    pub total_chunks: Option<u64>,
    #[serde(default)]
    pub start_chunk: Option<u64>,
    #[serde(default, deserialize_with = "double_option")]
    pub next_chunk: Option<Option<u64>>,
    #[serde(default)]
    pub usage: Option<TranscriptionUsage>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Segment {
    #[serde(default)]
    pub text: String,
}

/// Token counts reported by the transcription provider.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TranscriptionUsage {
    #[serde(default, alias = "inputTokens")]
    pub input_tokens: u64,
    #[serde(default, alias = "outputTokens")]
    pub output_tokens: u64,
}

impl TranscriptionPayload {
    /// True when the payload carries nothing a transcription fold can use.
    pub fn is_vacant(&self) -> bool {
        self.transcript.is_none()
            && self.segments.is_none()
            && self.processed_chunks.is_none()
            && self.total_chunks.is_none()
            && self.start_chunk.is_none()
            && self.next_chunk.is_none()
    }

    /// The transcript text, synthesized from segments when absent.
    pub fn effective_transcript(&self) -> Option<String> {
        if let Some(t) = &self.transcript {
            return Some(t.clone());
        }
        self.segments.as_ref().map(|segs| {
            segs.iter()
                .map(|s| s.text.as_str())
                .collect::<Vec<_>>()
                .join("\n")
        })
    }
}

/// Keep `Some(None)` for a field that is present with a `null` value.
fn double_option<'de, D>(deserializer: D) -> Result<Option<Option<u64>>, D::Error>
where
    D: Deserializer<'de>,
{
    Option::<u64>::deserialize(deserializer).map(Some)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Reviewer verdict
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// The reviewer subagent's JSON verdict. Only a boolean `approved` makes a
/// blob of free text count as a verdict.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerdictPayload {
    pub approved: Option<bool>,
    #[serde(default)]
    pub reasons: Vec<String>,
    #[serde(default)]
    pub required_changes: Vec<String>,
    #[serde(default)]
    pub revised_draft: Option<String>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Final result
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// The parsed terminal payload of a successful run.
#[derive(Debug, Clone, Deserialize)]
pub struct FinalPayload {
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub draft: Option<String>,
    #[serde(default)]
    pub docx: Option<String>,
}

impl FinalPayload {
    pub fn is_ok(&self) -> bool {
        self.status.as_deref() == Some("ok")
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// JSON extraction helpers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Pull a JSON object out of free text.
///
/// Accepts, in order: the whole trimmed string when it is `{…}`; a fenced
/// ```` ```json ```` block; the substring from the first `{` to the last `}`
/// when that substring is itself `{…}`. Returns `None` on anything else.
pub fn extract_json_object(text: &str) -> Option<Value> {
    let trimmed = text.trim();

    if trimmed.starts_with('{') && trimmed.ends_with('}') {
        if let Ok(v @ Value::Object(_)) = serde_json::from_str(trimmed) {
            return Some(v);
        }
    }

    if let Some(fenced) = extract_fenced_block(trimmed) {
        if let Ok(v @ Value::Object(_)) = serde_json::from_str(fenced.trim()) {
            return Some(v);
        }
    }

    let first = trimmed.find('{')?;
    let last = trimmed.rfind('}')?;
    if last > first {
        let slice = &trimmed[first..=last];
        if let Ok(v @ Value::Object(_)) = serde_json::from_str(slice) {
            return Some(v);
        }
    }

    None
}

/// Strip a Markdown code fence (```json … ``` or ``` … ```) wrapping the
/// whole string. Returns the input unchanged when there is no fence.
pub fn strip_markdown_fences(text: &str) -> &str {
    let trimmed = text.trim();
    match extract_fenced_block(trimmed) {
        Some(inner) => inner.trim(),
        None => trimmed,
    }
}

fn extract_fenced_block(text: &str) -> Option<&str> {
    let rest = text.strip_prefix("```")?;
    // Skip the optional language tag on the opening fence line.
    let body_start = rest.find('\n')?;
    let body = &rest[body_start + 1..];
    let end = body.rfind("```")?;
    Some(&body[..end])
}

/// Extract the text portion of a tool-result `content` value: a bare
/// string, `{"text": …}`, or an array of `{"type":"text","text": …}`
/// blocks (joined with newlines).
pub fn tool_result_text(content: &Value) -> Option<String> {
    match content {
        Value::String(s) => Some(s.clone()),
        Value::Object(map) => map
            .get("text")
            .and_then(Value::as_str)
            .map(str::to_string),
        Value::Array(items) => {
            let parts: Vec<&str> = items
                .iter()
                .filter_map(|item| item.get("text").and_then(Value::as_str))
                .collect();
            if parts.is_empty() {
                None
            } else {
                Some(parts.join("\n"))
            }
        }
        _ => None,
    }
}
