//! Transcription progress aggregation.
//!
//! The transcription tool reports per-call chunk windows; calls can repeat,
//! overlap, or arrive with partial metadata. Folding is max-merge on the
//! counters and last-writer-wins per chunk index on the text, so replaying
//! an identical payload leaves the state unchanged.

use std::collections::BTreeMap;

use df_domain::payload::TranscriptionPayload;

/// Preview cap in characters.
const PREVIEW_MAX_CHARS: usize = 1500;

/// Folded transcription state for one run. Driver-task-local.
#[derive(Debug, Default)]
pub struct TranscriptionProgress {
    processed: u64,
    /// 0 = unknown.
    total: u64,
    /// Snippets keyed by start chunk; `u64::MAX` holds a whole-transcript
    /// replacement (payloads without a startChunk).
    snippets: BTreeMap<u64, String>,
    preview: String,
}

/// Replacement key for payloads that carry no startChunk.
const WHOLE_TRANSCRIPT: u64 = u64::MAX;

impl TranscriptionProgress {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn processed(&self) -> u64 {
        self.processed
    }

    /// Total chunks, when known.
    pub fn total(&self) -> u64 {
        self.total
    }

    /// First 1500 characters of the ordered snippet concatenation.
    pub fn preview(&self) -> &str {
        &self.preview
    }

    /// Fold one tool payload. Returns `true` when any observable state
    /// (processed, total, preview) changed.
    pub fn fold(&mut self, payload: &TranscriptionPayload) -> bool {
        if payload.is_vacant() {
            return false;
        }

        let before = (self.processed, self.total, self.preview.len());
        let preview_before = self.preview.clone();

        if let Some(total_chunks) = payload.total_chunks {
            self.total = self.total.max(total_chunks);
        }

        let start = payload.start_chunk.unwrap_or(0);
        if let Some(processed_chunks) = payload.processed_chunks {
            self.processed = self.processed.max(start + processed_chunks);
        } else if let Some(start_chunk) = payload.start_chunk {
            self.processed = self.processed.max(start_chunk);
        }

        match payload.next_chunk {
            Some(Some(next)) => self.total = self.total.max(next + 1),
            // Explicit null: the tool ran out of input, so what we have
            // processed is the whole recording.
            Some(None) => {
                if self.total == 0 && self.processed > 0 {
                    self.total = self.processed;
                }
            }
            None => {}
        }

        if let Some(text) = payload.effective_transcript() {
            match payload.start_chunk {
                Some(start_chunk) => {
                    self.snippets.insert(start_chunk, text);
                }
                None => {
                    // No chunk index: treat as a full replacement.
                    self.snippets.clear();
                    self.snippets.insert(WHOLE_TRANSCRIPT, text);
                }
            }
            self.rebuild_preview();
        }

        before != (self.processed, self.total, self.preview.len())
            || preview_before != self.preview
    }

    fn rebuild_preview(&mut self) {
        let joined = self
            .snippets
            .values()
            .map(String::as_str)
            .collect::<Vec<_>>()
            .join("\n\n");

        self.preview = match joined.char_indices().nth(PREVIEW_MAX_CHARS) {
            Some((byte_idx, _)) => joined[..byte_idx].to_string(),
            None => joined,
        };
    }
}
