//! Token accounting for a single run.
//!
//! Usage arrives twice over: on assistant/result messages from the
//! orchestrating model (claude buckets, including prompt-cache tokens) and
//! inside transcription tool results (gemini buckets). Messages can be
//! replayed by the runtime, so recording is deduplicated — exactly by
//! message id when one is present, approximately by a usage-hash bucketed
//! into 15-second windows when not.

use std::collections::{HashSet, VecDeque};

use chrono::{DateTime, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};

use df_domain::message::UsageBlock;

/// Fingerprint window for messages without stable ids.
const DEDUP_BUCKET_SECS: i64 = 15;

/// FIFO cap on remembered fingerprints.
const MAX_FINGERPRINTS: usize = 2000;

// ── Pricing (USD per million tokens) ──────────────────────────────
const CLAUDE_INPUT_PER_MTOK: f64 = 3.0;
const CLAUDE_OUTPUT_PER_MTOK: f64 = 15.0;
const CLAUDE_CACHE_WRITE_PER_MTOK: f64 = 3.75;
const CLAUDE_CACHE_READ_PER_MTOK: f64 = 0.30;
const GEMINI_INPUT_PER_MTOK: f64 = 0.30;
const GEMINI_OUTPUT_PER_MTOK: f64 = 2.50;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Summary
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BucketCost {
    pub tokens: u64,
    /// Rounded to four decimals for display.
    #[serde(rename = "costUSD")]
    pub cost_usd: f64,
}

/// Priced snapshot of the run's token consumption.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CostSummary {
    pub total_tokens: u64,
    /// Unrounded sum across buckets.
    #[serde(rename = "estimatedCostUSD")]
    pub estimated_cost_usd: f64,
    pub breakdown: CostBreakdown,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CostBreakdown {
    pub claude_input: BucketCost,
    pub claude_output: BucketCost,
    pub claude_cache_creation: BucketCost,
    pub claude_cache_read: BucketCost,
    pub gemini_input: BucketCost,
    pub gemini_output: BucketCost,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tracker
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Single-writer cost accumulator; the driver task owns it, so there is no
/// internal locking.
pub struct CostTracker {
    claude_input: u64,
    claude_output: u64,
    claude_cache_creation: u64,
    claude_cache_read: u64,
    gemini_input: u64,
    gemini_output: u64,

    seen_ids: HashSet<String>,
    fingerprints: HashSet<[u8; 32]>,
    fingerprint_order: VecDeque<[u8; 32]>,
}

impl Default for CostTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl CostTracker {
    pub fn new() -> Self {
        Self {
            claude_input: 0,
            claude_output: 0,
            claude_cache_creation: 0,
            claude_cache_read: 0,
            gemini_input: 0,
            gemini_output: 0,
            seen_ids: HashSet::new(),
            fingerprints: HashSet::new(),
            fingerprint_order: VecDeque::new(),
        }
    }

    /// Record a message's usage. Returns `true` when the counters changed
    /// (i.e. the message carried usage and was not a duplicate).
    pub fn record(
        &mut self,
        message_id: Option<&str>,
        usage: Option<&UsageBlock>,
        timestamp: Option<DateTime<Utc>>,
    ) -> bool {
        let Some(usage) = usage else {
            return false;
        };
        if usage.is_empty() {
            return false;
        }

        match message_id {
            Some(id) => {
                if !self.seen_ids.insert(id.to_string()) {
                    return false;
                }
            }
            None => {
                let at = timestamp.unwrap_or_else(Utc::now);
                let fp = fingerprint(usage, at);
                if !self.fingerprints.insert(fp) {
                    return false;
                }
                self.fingerprint_order.push_back(fp);
                if self.fingerprint_order.len() > MAX_FINGERPRINTS {
                    if let Some(evicted) = self.fingerprint_order.pop_front() {
                        self.fingerprints.remove(&evicted);
                    }
                }
            }
        }

        self.claude_input += usage.input_tokens;
        self.claude_output += usage.output_tokens;
        self.claude_cache_creation += usage.cache_creation_input_tokens;
        self.claude_cache_read += usage.cache_read_input_tokens;
        true
    }

    /// Record transcription-provider usage parsed out of a tool result.
    /// Returns `true` when anything was added.
    pub fn record_transcription(&mut self, input_tokens: u64, output_tokens: u64) -> bool {
        if input_tokens == 0 && output_tokens == 0 {
            return false;
        }
        self.gemini_input += input_tokens;
        self.gemini_output += output_tokens;
        true
    }

    pub fn summary(&self) -> CostSummary {
        let breakdown = CostBreakdown {
            claude_input: bucket(self.claude_input, CLAUDE_INPUT_PER_MTOK),
            claude_output: bucket(self.claude_output, CLAUDE_OUTPUT_PER_MTOK),
            claude_cache_creation: bucket(self.claude_cache_creation, CLAUDE_CACHE_WRITE_PER_MTOK),
            claude_cache_read: bucket(self.claude_cache_read, CLAUDE_CACHE_READ_PER_MTOK),
            gemini_input: bucket(self.gemini_input, GEMINI_INPUT_PER_MTOK),
            gemini_output: bucket(self.gemini_output, GEMINI_OUTPUT_PER_MTOK),
        };

        let total_tokens = self.claude_input
            + self.claude_output
            + self.claude_cache_creation
            + self.claude_cache_read
            + self.gemini_input
            + self.gemini_output;

        let estimated_cost_usd = cost_of(self.claude_input, CLAUDE_INPUT_PER_MTOK)
            + cost_of(self.claude_output, CLAUDE_OUTPUT_PER_MTOK)
            + cost_of(self.claude_cache_creation, CLAUDE_CACHE_WRITE_PER_MTOK)
            + cost_of(self.claude_cache_read, CLAUDE_CACHE_READ_PER_MTOK)
            + cost_of(self.gemini_input, GEMINI_INPUT_PER_MTOK)
            + cost_of(self.gemini_output, GEMINI_OUTPUT_PER_MTOK);

        CostSummary {
            total_tokens,
            estimated_cost_usd,
            breakdown,
        }
    }

    /// Drop all counters and dedup state.
    pub fn reset(&mut self) {
        *self = Self::new();
    }
}

fn cost_of(tokens: u64, per_mtok: f64) -> f64 {
    tokens as f64 / 1_000_000.0 * per_mtok
}

fn bucket(tokens: u64, per_mtok: f64) -> BucketCost {
    BucketCost {
        tokens,
        cost_usd: round4(cost_of(tokens, per_mtok)),
    }
}

fn round4(v: f64) -> f64 {
    (v * 10_000.0).round() / 10_000.0
}

/// Deterministic fingerprint: the usage counters plus the 15-second bucket
/// the message timestamp falls into.
fn fingerprint(usage: &UsageBlock, at: DateTime<Utc>) -> [u8; 32] {
    let bucket = at.timestamp() / DEDUP_BUCKET_SECS;
    let mut hasher = Sha256::new();
    hasher.update(usage.input_tokens.to_le_bytes());
    hasher.update(usage.output_tokens.to_le_bytes());
    hasher.update(usage.cache_creation_input_tokens.to_le_bytes());
    hasher.update(usage.cache_read_input_tokens.to_le_bytes());
    hasher.update(bucket.to_le_bytes());
    hasher.finalize().into()
}
