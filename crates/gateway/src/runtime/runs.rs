//! Run tracking — the in-memory lifecycle store for pipeline runs.
//!
//! Each run owns a bounded ring of [`RunEvent`]s, a fire-once cancel token,
//! and a list of live subscriber channels. Subscribers atomically replay the
//! ring and then receive every later event exactly once, in order. Runs are
//! released by the TTL sweeper once terminal, unobserved, and stale.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use uuid::Uuid;

use df_domain::cancel::CancelToken;

/// Maximum buffered events per run; overflow drops from the head.
pub const RING_CAP: usize = 1000;

/// How long a terminal run stays queryable after its last update.
pub const RUN_TTL_MINUTES: i64 = 30;

/// Sweeper cadence.
pub const SWEEP_INTERVAL_SECS: u64 = 300;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Run status
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Success,
    Error,
    Aborted,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Success | Self::Error | Self::Aborted)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Events
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// The SSE event kinds a run can emit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Status,
    ToolUse,
    ToolResult,
    TranscriptChunk,
    Todo,
    JudgeRound,
    Cost,
    Log,
    Final,
    Error,
}

impl EventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Status => "status",
            Self::ToolUse => "tool_use",
            Self::ToolResult => "tool_result",
            Self::TranscriptChunk => "transcript_chunk",
            Self::Todo => "todo",
            Self::JudgeRound => "judge_round",
            Self::Cost => "cost",
            Self::Log => "log",
            Self::Final => "final",
            Self::Error => "error",
        }
    }
}

/// One append-only record in a run's ring.
#[derive(Debug, Clone, Serialize)]
pub struct RunEvent {
    /// Dense, strictly increasing per run, starting at 1.
    pub seq: u64,
    pub kind: EventKind,
    pub payload: Value,
    pub at: DateTime<Utc>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Run record
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

struct Subscriber {
    id: u64,
    tx: mpsc::UnboundedSender<RunEvent>,
}

struct RunRecord {
    status: RunStatus,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    last_error: Option<String>,
    next_seq: u64,
    events: VecDeque<RunEvent>,
    subscribers: Vec<Subscriber>,
    next_subscriber_id: u64,
    cancel: CancelToken,
}

impl RunRecord {
    fn new() -> Self {
        let now = Utc::now();
        Self {
            status: RunStatus::Pending,
            created_at: now,
            updated_at: now,
            last_error: None,
            next_seq: 1,
            events: VecDeque::new(),
            subscribers: Vec::new(),
            next_subscriber_id: 1,
            cancel: CancelToken::new(),
        }
    }

    /// Append under the store lock. Subscriber senders only enqueue into
    /// unbounded channels here; no subscriber code runs on this stack, and
    /// keeping the sends under the lock preserves total per-run ordering
    /// across concurrent appenders.
    fn append(&mut self, kind: EventKind, payload: Value) -> u64 {
        let event = RunEvent {
            seq: self.next_seq,
            kind,
            payload,
            at: Utc::now(),
        };
        self.next_seq += 1;
        self.updated_at = event.at;

        self.events.push_back(event.clone());
        if self.events.len() > RING_CAP {
            self.events.pop_front();
        }

        self.subscribers.retain(|s| s.tx.send(event.clone()).is_ok());
        event.seq
    }

    /// Abort in place. Returns false when the run is already terminal.
    fn abort(&mut self, reason: &str) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        self.cancel.cancel();
        self.status = RunStatus::Aborted;
        self.last_error = Some(reason.to_string());
        self.append(
            EventKind::Error,
            serde_json::json!({ "message": reason, "aborted": true }),
        );
        true
    }
}

/// Lightweight view for the status endpoints.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub id: Uuid,
    pub status: RunStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Run store
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Process-wide run registry. All synchronization is internal; callers from
/// any task may invoke any method.
pub struct RunStore {
    runs: Mutex<HashMap<Uuid, RunRecord>>,
}

impl Default for RunStore {
    fn default() -> Self {
        Self::new()
    }
}

impl RunStore {
    pub fn new() -> Self {
        Self {
            runs: Mutex::new(HashMap::new()),
        }
    }

    /// Allocate a new pending run. Returns its id and cancel token.
    pub fn create_run(&self) -> (Uuid, CancelToken) {
        let id = Uuid::new_v4();
        let record = RunRecord::new();
        let cancel = record.cancel.clone();
        self.runs.lock().insert(id, record);
        (id, cancel)
    }

    pub fn contains(&self, id: &Uuid) -> bool {
        self.runs.lock().contains_key(id)
    }

    pub fn status(&self, id: &Uuid) -> Option<RunStatus> {
        self.runs.lock().get(id).map(|r| r.status)
    }

    pub fn cancel_token(&self, id: &Uuid) -> Option<CancelToken> {
        self.runs.lock().get(id).map(|r| r.cancel.clone())
    }

    pub fn summary(&self, id: &Uuid) -> Option<RunSummary> {
        self.runs.lock().get(id).map(|r| RunSummary {
            id: *id,
            status: r.status,
            created_at: r.created_at,
            updated_at: r.updated_at,
            last_error: r.last_error.clone(),
        })
    }

    /// List runs, newest first.
    pub fn list(&self, limit: usize) -> Vec<RunSummary> {
        let runs = self.runs.lock();
        let mut summaries: Vec<RunSummary> = runs
            .iter()
            .map(|(id, r)| RunSummary {
                id: *id,
                status: r.status,
                created_at: r.created_at,
                updated_at: r.updated_at,
                last_error: r.last_error.clone(),
            })
            .collect();
        summaries.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        summaries.truncate(limit);
        summaries
    }

    /// Write-through status update. Terminal statuses are final: a run that
    /// has reached success/error/aborted never transitions again.
    pub fn set_status(&self, id: &Uuid, status: RunStatus, err: Option<String>) -> bool {
        let mut runs = self.runs.lock();
        let Some(record) = runs.get_mut(id) else {
            return false;
        };
        if record.status.is_terminal() {
            return false;
        }
        record.status = status;
        record.updated_at = Utc::now();
        if err.is_some() {
            record.last_error = err;
        }
        true
    }

    /// Append an event to the run's ring and fan it out to subscribers.
    /// Returns the assigned sequence id.
    pub fn append(&self, id: &Uuid, kind: EventKind, payload: Value) -> Option<u64> {
        let mut runs = self.runs.lock();
        runs.get_mut(id).map(|r| r.append(kind, payload))
    }

    /// Snapshot the ring and attach a live channel, atomically — the replay
    /// plus the channel cover every event exactly once, in order.
    pub fn subscribe(self: &Arc<Self>, id: &Uuid) -> Option<Subscription> {
        let mut runs = self.runs.lock();
        let record = runs.get_mut(id)?;

        let (tx, rx) = mpsc::unbounded_channel();
        let subscriber_id = record.next_subscriber_id;
        record.next_subscriber_id += 1;
        record.subscribers.push(Subscriber { id: subscriber_id, tx });

        Some(Subscription {
            store: Arc::clone(self),
            run_id: *id,
            subscriber_id,
            replay: record.events.iter().cloned().collect(),
            live: rx,
            cancel: record.cancel.clone(),
            unsubscribed: false,
        })
    }

    /// Abort a run: fire its cancel token, mark it aborted, and append the
    /// terminal `error` event. No-op for unknown or already-terminal runs.
    pub fn abort(&self, id: &Uuid, reason: Option<&str>) -> bool {
        let mut runs = self.runs.lock();
        match runs.get_mut(id) {
            Some(record) => record.abort(reason.unwrap_or("Run aborted")),
            None => false,
        }
    }

    /// Stamp the TTL anchor once a driver exits; the sweeper collects the
    /// run `RUN_TTL_MINUTES` later.
    pub fn finish(&self, id: &Uuid) {
        if let Some(record) = self.runs.lock().get_mut(id) {
            record.updated_at = Utc::now();
        }
    }

    fn unsubscribe(&self, run_id: &Uuid, subscriber_id: u64) {
        let mut runs = self.runs.lock();
        let Some(record) = runs.get_mut(run_id) else {
            return;
        };
        record.subscribers.retain(|s| s.id != subscriber_id);

        // Abort a still-live run once nobody is watching it.
        if record.subscribers.is_empty() && !record.status.is_terminal() {
            tracing::info!(run_id = %run_id, "last subscriber departed, aborting run");
            record.abort("Client disconnected");
        }
    }

    /// Abort every non-terminal run (process shutdown).
    pub fn abort_all(&self, reason: &str) -> usize {
        let mut runs = self.runs.lock();
        runs.values_mut().map(|r| usize::from(r.abort(reason))).sum()
    }

    /// Remove terminal, unobserved runs whose last update is older than the
    /// TTL. Returns how many were released.
    pub fn sweep(&self, now: DateTime<Utc>) -> usize {
        let ttl = Duration::minutes(RUN_TTL_MINUTES);
        let mut runs = self.runs.lock();
        let before = runs.len();
        runs.retain(|_, r| {
            !(r.status.is_terminal() && r.subscribers.is_empty() && r.updated_at + ttl <= now)
        });
        before - runs.len()
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Subscription
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// One live subscriber of a run's event stream.
///
/// Dropping the subscription unsubscribes exactly once; when the last
/// subscriber departs while the run is still pending/running, the store
/// aborts the run.
pub struct Subscription {
    store: Arc<RunStore>,
    run_id: Uuid,
    subscriber_id: u64,
    replay: VecDeque<RunEvent>,
    live: mpsc::UnboundedReceiver<RunEvent>,
    cancel: CancelToken,
    unsubscribed: bool,
}

impl Subscription {
    /// How many events the ring snapshot will replay.
    pub fn replayed_count(&self) -> usize {
        self.replay.len()
    }

    /// The not-yet-consumed replay snapshot.
    pub fn replay_events(&self) -> &VecDeque<RunEvent> {
        &self.replay
    }

    /// The run's cancel token, for observers that want to race on it.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Next event: drains the replay prefix first, then awaits live events.
    /// Returns `None` once the run record is gone and the channel is empty.
    pub async fn next_event(&mut self) -> Option<RunEvent> {
        if let Some(event) = self.replay.pop_front() {
            return Some(event);
        }
        self.live.recv().await
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if !self.unsubscribed {
            self.unsubscribed = true;
            self.store.unsubscribe(&self.run_id, self.subscriber_id);
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
