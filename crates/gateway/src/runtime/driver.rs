//! The pipeline driver — one task per run.
//!
//! [`start_run`] creates the run record and spawns the loop that drains the
//! agent runtime's message stream, feeds the cost tracker, the phase board,
//! and the transcription aggregator, and appends the typed event stream to
//! the run store. The driver checks the cancel token before every message
//! and never emits `final` on an aborted run.

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use serde_json::{json, Value};
use tracing::Instrument;
use uuid::Uuid;

use df_agent::{AgentRunRequest, AgentRuntime, SubagentSpec};
use df_domain::cancel::CancelToken;
use df_domain::config::Config;
use df_domain::error::Error;
use df_domain::message::{AgentMessage, ContentBlock, StreamPayload};
use df_domain::payload::{
    extract_json_object, strip_markdown_fences, tool_result_text, FinalPayload,
    TranscriptionPayload, VerdictPayload,
};

use super::cost::CostTracker;
use super::phases::{Phase, PhaseBoard, PhaseStatus, PhaseTransition};
use super::prompt;
use super::runs::{EventKind, RunStatus, RunStore};
use super::transcription::TranscriptionProgress;
use super::truncate_str;

/// Output files at or below this size are partial writes, not a recoverable
/// export.
const RECOVERY_MIN_BYTES: u64 = 1000;

/// Cap on the tool-input summary embedded in `tool_use` events.
const INPUT_SUMMARY_MAX: usize = 200;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Run input
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Validated, root-resolved parameters for one run.
#[derive(Debug, Clone)]
pub struct RunInput {
    pub audio: PathBuf,
    pub template: PathBuf,
    pub outdoc: PathBuf,
    /// The client-facing relative form of `outdoc`.
    pub outdoc_relative: String,
    pub input_language: String,
    pub output_language: String,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// start_run — spawn the driver task
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Create a run and spawn its driver. Returns the run id immediately;
/// progress flows through the store's event stream.
pub fn start_run(
    store: Arc<RunStore>,
    runtime: Arc<dyn AgentRuntime>,
    config: Arc<Config>,
    input: RunInput,
) -> Uuid {
    let (run_id, cancel) = store.create_run();

    let span = tracing::info_span!("run", %run_id);
    tokio::spawn(
        async move {
            tracing::debug!(audio = %input.audio.display(), "driver started");
            let mut board = PhaseBoard::new();
            let end =
                drive(&store, runtime.as_ref(), &config, run_id, &cancel, &input, &mut board)
                    .await;

            match end {
                Ok(DriveEnd::Terminal) => {}
                Ok(DriveEnd::Aborted) => finish_aborted(&store, run_id),
                Ok(DriveEnd::NoFinal) => {
                    recover_or_fail(&store, run_id, &input, None, &mut board)
                }
                Err(e) => {
                    if cancel.is_cancelled() {
                        finish_aborted(&store, run_id);
                    } else {
                        recover_or_fail(&store, run_id, &input, Some(e), &mut board);
                    }
                }
            }

            store.finish(&run_id);
            tracing::debug!(status = ?store.status(&run_id), "driver finished");
        }
        .instrument(span),
    );

    run_id
}

/// How the message loop ended.
enum DriveEnd {
    /// A result message already settled the run (success or error).
    Terminal,
    /// Cancellation observed.
    Aborted,
    /// The stream ran dry without a result message.
    NoFinal,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// The message loop
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[allow(clippy::too_many_arguments)]
async fn drive(
    store: &RunStore,
    runtime: &dyn AgentRuntime,
    config: &Config,
    run_id: Uuid,
    cancel: &CancelToken,
    input: &RunInput,
    board: &mut PhaseBoard,
) -> Result<DriveEnd, Error> {
    store.set_status(&run_id, RunStatus::Running, None);
    emit_transitions(store, run_id, board.set(Phase::Transcribe, PhaseStatus::Running), None);

    // ── Assemble the runtime request ─────────────────────────────────
    let guidelines_path = config.project.root.join(&config.project.guidelines_path);
    let guidelines = match std::fs::read_to_string(&guidelines_path) {
        Ok(text) => text,
        Err(e) => {
            tracing::warn!(
                path = %guidelines_path.display(),
                error = %e,
                "guidelines file unreadable, continuing without it"
            );
            String::new()
        }
    };

    let req = AgentRunRequest {
        prompt: prompt::build_prompt(input, &config.tools, &guidelines),
        allowed_tools: config.tools.allowed(),
        subagents: vec![SubagentSpec {
            name: prompt::REVIEWER_AGENT.into(),
            description: "Reviews drafted documents against the house guidelines".into(),
            prompt: prompt::reviewer_prompt(&guidelines),
        }],
        bypass_permissions: config.agent.bypass_permissions,
        max_turns: config.agent.max_turns,
    };

    let mut stream = runtime.run(req, cancel.clone()).await?;

    // ── Per-run trackers ─────────────────────────────────────────────
    let mut cost = CostTracker::new();
    let mut progress = TranscriptionProgress::new();
    let mut inflight = InflightRegistry::new();
    let mut judge_rounds: u32 = 0;
    let max_rounds = config.review.clamped_rounds();

    while let Some(message) = stream.next().await {
        if cancel.is_cancelled() {
            return Ok(DriveEnd::Aborted);
        }

        let message = match message {
            Ok(m) => m,
            Err(Error::Cancelled) => return Ok(DriveEnd::Aborted),
            Err(e) => return Err(e),
        };

        match message {
            AgentMessage::System(sys) => {
                if let Some(session_id) = sys.session_id {
                    emit(
                        store,
                        run_id,
                        EventKind::Log,
                        json!({
                            "level": "info",
                            "message": format!("agent session {session_id}"),
                        }),
                    );
                }
            }

            AgentMessage::Assistant(assistant) => {
                if cost.record(assistant.id.as_deref(), assistant.usage.as_ref(), assistant.timestamp)
                {
                    emit_cost(store, run_id, &cost);
                }

                for block in &assistant.content {
                    match block {
                        ContentBlock::ToolUse { name, input: tool_input } => {
                            handle_tool_use(
                                store, run_id, config, board, &mut inflight, name, tool_input,
                            );
                        }
                        ContentBlock::Text { text } => {
                            handle_free_text(
                                store,
                                run_id,
                                board,
                                &mut judge_rounds,
                                max_rounds,
                                text,
                            );
                        }
                    }
                }
            }

            AgentMessage::Stream(StreamPayload::ToolResult {
                name,
                is_error,
                content,
            }) => {
                handle_tool_result(
                    store,
                    run_id,
                    config,
                    board,
                    &mut inflight,
                    &mut progress,
                    &mut cost,
                    &name,
                    is_error,
                    &content,
                );
            }

            AgentMessage::Stream(StreamPayload::TextDelta { text }) => {
                handle_free_text(store, run_id, board, &mut judge_rounds, max_rounds, &text);
            }

            AgentMessage::Result(result) => {
                if cost.record(None, result.usage.as_ref(), None) {
                    emit_cost(store, run_id, &cost);
                }
                settle_result(store, run_id, input, board, result.is_error, result.result);
                return Ok(DriveEnd::Terminal);
            }
        }
    }

    if cancel.is_cancelled() {
        return Ok(DriveEnd::Aborted);
    }
    Ok(DriveEnd::NoFinal)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Message handlers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn handle_tool_use(
    store: &RunStore,
    run_id: Uuid,
    config: &Config,
    board: &mut PhaseBoard,
    inflight: &mut InflightRegistry,
    name: &str,
    tool_input: &Value,
) {
    let call = inflight.begin(name);
    emit(
        store,
        run_id,
        EventKind::ToolUse,
        json!({
            "id": call.id,
            "name": name,
            "startedAt": call.started_at,
            "inputSummary": truncate_str(&tool_input.to_string(), INPUT_SUMMARY_MAX),
        }),
    );

    if name == config.tools.todo {
        if let Some(todos) = tool_input.get("todos").filter(|t| t.is_array()) {
            emit(store, run_id, EventKind::Todo, json!({ "todos": todos }));
        }
    }

    if let Some(phase) = phase_for_tool(name, config) {
        emit_transitions(store, run_id, board.on_tool_use(phase), None);
    }
}

#[allow(clippy::too_many_arguments)]
fn handle_tool_result(
    store: &RunStore,
    run_id: Uuid,
    config: &Config,
    board: &mut PhaseBoard,
    inflight: &mut InflightRegistry,
    progress: &mut TranscriptionProgress,
    cost: &mut CostTracker,
    name: &str,
    is_error: bool,
    content: &Value,
) {
    let call = inflight.finish(name);
    let finished_at = Utc::now();
    let duration_ms = (finished_at - call.started_at).num_milliseconds().max(0);

    emit(
        store,
        run_id,
        EventKind::ToolResult,
        json!({
            "id": call.id,
            "name": name,
            "isError": is_error,
            "content": content,
            "finishedAt": finished_at,
            "durationMs": duration_ms,
        }),
    );

    let phase = phase_for_tool(name, config);

    if is_error {
        if let Some(phase) = phase {
            emit_transitions(store, run_id, board.on_tool_error(phase), None);
        }
        let detail = tool_result_text(content).unwrap_or_else(|| content.to_string());
        emit(
            store,
            run_id,
            EventKind::Error,
            json!({
                "message": format!("tool {name} failed"),
                "details": truncate_str(&detail, 500),
            }),
        );
        return;
    }

    // Fold transcription progress out of the payload. Non-transcription
    // payloads project to a vacant state and fall through.
    if let Some(value) = result_json(content) {
        if let Ok(payload) = serde_json::from_value::<TranscriptionPayload>(value) {
            if let Some(usage) = &payload.usage {
                if cost.record_transcription(usage.input_tokens, usage.output_tokens) {
                    emit_cost(store, run_id, cost);
                }
            }
            if progress.fold(&payload) {
                emit(
                    store,
                    run_id,
                    EventKind::TranscriptChunk,
                    json!({
                        "transcript": progress.preview(),
                        "processedChunks": progress.processed(),
                        "totalChunks": progress.total(),
                        "at": Utc::now(),
                    }),
                );
            }
        }
    }

    if let Some(phase) = phase {
        emit_transitions(store, run_id, board.on_tool_success(phase), None);
    }
}

fn handle_free_text(
    store: &RunStore,
    run_id: Uuid,
    board: &mut PhaseBoard,
    judge_rounds: &mut u32,
    max_rounds: u32,
    text: &str,
) {
    let Some(value) = extract_json_object(text) else {
        return;
    };
    let Ok(verdict) = serde_json::from_value::<VerdictPayload>(value) else {
        return;
    };
    let Some(approved) = verdict.approved else {
        return;
    };

    // Rounds beyond the cap are ignored; a cap of 0 disables the gate.
    if *judge_rounds >= max_rounds {
        return;
    }
    *judge_rounds += 1;

    emit(
        store,
        run_id,
        EventKind::JudgeRound,
        json!({
            "round": *judge_rounds,
            "approved": approved,
            "reasons": verdict.reasons,
            "required_changes": verdict.required_changes,
            "revised_draft": verdict.revised_draft,
            "at": Utc::now(),
        }),
    );

    let exhausted = *judge_rounds >= max_rounds;
    let meta = json!({ "round": *judge_rounds });
    emit_transitions(store, run_id, board.on_verdict(approved, exhausted), Some(&meta));
}

/// A result message arrived: settle the run one way or the other.
fn settle_result(
    store: &RunStore,
    run_id: Uuid,
    input: &RunInput,
    board: &mut PhaseBoard,
    is_error: bool,
    result: Option<String>,
) {
    if is_error {
        let message = result.unwrap_or_else(|| "agent runtime reported an error".into());
        // Status first: subscribers treat an error event on a terminal run
        // as end-of-stream.
        store.set_status(&run_id, RunStatus::Error, Some(message.clone()));
        emit(store, run_id, EventKind::Error, json!({ "message": message }));
        return;
    }

    let text = result.unwrap_or_default();
    let parsed = serde_json::from_str::<FinalPayload>(strip_markdown_fences(&text))
        .ok()
        .or_else(|| {
            extract_json_object(&text).and_then(|v| serde_json::from_value(v).ok())
        });

    match parsed {
        Some(payload) if payload.is_ok() => {
            emit_transitions(
                store,
                run_id,
                board.set(Phase::Export, PhaseStatus::Success),
                None,
            );
            let docx = payload
                .docx
                .unwrap_or_else(|| input.outdoc_relative.clone());
            store.set_status(&run_id, RunStatus::Success, None);
            emit(
                store,
                run_id,
                EventKind::Final,
                json!({
                    "ok": true,
                    "draft": payload.draft,
                    "docx": docx,
                    "docxRelative": input.outdoc_relative,
                }),
            );
        }
        _ => {
            let message = "run finished without an ok result".to_string();
            store.set_status(&run_id, RunStatus::Error, Some(message.clone()));
            emit(
                store,
                run_id,
                EventKind::Error,
                json!({
                    "message": message,
                    "details": truncate_str(&text, 500),
                }),
            );
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Exit paths
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Mark the run aborted. When the store's abort already settled it (client
/// disconnect or the abort endpoint), this is a no-op and no duplicate
/// error event is appended.
fn finish_aborted(store: &RunStore, run_id: Uuid) {
    let message = "Run aborted by client";
    if store.set_status(&run_id, RunStatus::Aborted, Some(message.into())) {
        emit(
            store,
            run_id,
            EventKind::Error,
            json!({ "message": message, "aborted": true }),
        );
    }
}

/// The stream failed or ran dry before a result. If the export tool already
/// produced a plausible output file, convert to a recovered success.
fn recover_or_fail(
    store: &RunStore,
    run_id: Uuid,
    input: &RunInput,
    err: Option<Error>,
    board: &mut PhaseBoard,
) {
    let recovered = std::fs::metadata(&input.outdoc)
        .map(|m| m.is_file() && m.len() > RECOVERY_MIN_BYTES)
        .unwrap_or(false);

    if recovered {
        tracing::warn!(outdoc = %input.outdoc.display(), "stream ended early, output file recovered");
        emit(
            store,
            run_id,
            EventKind::Log,
            json!({
                "level": "warn",
                "message": format!(
                    "agent stream ended early; recovered output at {}",
                    input.outdoc_relative
                ),
            }),
        );
        emit_transitions(
            store,
            run_id,
            board.set(Phase::Export, PhaseStatus::Success),
            None,
        );
        store.set_status(&run_id, RunStatus::Success, None);
        emit(
            store,
            run_id,
            EventKind::Final,
            json!({
                "ok": true,
                "draft": Value::Null,
                "docx": input.outdoc_relative,
                "docxRelative": input.outdoc_relative,
                "recovered": true,
            }),
        );
        return;
    }

    let message = match err {
        Some(e) => e.to_string(),
        None => "agent stream ended without a final result".into(),
    };
    tracing::warn!(error = %message, "run failed");
    store.set_status(&run_id, RunStatus::Error, Some(message.clone()));
    emit(store, run_id, EventKind::Error, json!({ "message": message }));
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Inflight registry
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone)]
struct InflightCall {
    id: String,
    started_at: DateTime<Utc>,
}

/// Pairs tool-result events with the tool-use that caused them. Per tool
/// name, calls resolve in FIFO order.
struct InflightRegistry {
    queues: HashMap<String, VecDeque<InflightCall>>,
    counter: u64,
}

impl InflightRegistry {
    fn new() -> Self {
        Self {
            queues: HashMap::new(),
            counter: 0,
        }
    }

    fn begin(&mut self, name: &str) -> InflightCall {
        self.counter += 1;
        let call = InflightCall {
            id: format!("tu_{}", self.counter),
            started_at: Utc::now(),
        };
        self.queues
            .entry(name.to_string())
            .or_default()
            .push_back(call.clone());
        call
    }

    /// Pop the oldest pending call for `name`, or synthesize one when the
    /// runtime reported a result we never saw a tool-use for.
    fn finish(&mut self, name: &str) -> InflightCall {
        if let Some(call) = self.queues.get_mut(name).and_then(VecDeque::pop_front) {
            return call;
        }
        self.counter += 1;
        InflightCall {
            id: format!("tu_{}", self.counter),
            started_at: Utc::now(),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Emission helpers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn phase_for_tool(name: &str, config: &Config) -> Option<Phase> {
    if name == config.tools.transcribe {
        Some(Phase::Transcribe)
    } else if name == config.tools.draft {
        Some(Phase::Draft)
    } else if name == config.tools.export {
        Some(Phase::Export)
    } else {
        None
    }
}

fn emit(store: &RunStore, run_id: Uuid, kind: EventKind, payload: Value) {
    store.append(&run_id, kind, payload);
}

fn emit_cost(store: &RunStore, run_id: Uuid, cost: &CostTracker) {
    emit(
        store,
        run_id,
        EventKind::Cost,
        json!({ "summary": cost.summary(), "at": Utc::now() }),
    );
}

fn emit_transitions(
    store: &RunStore,
    run_id: Uuid,
    transitions: impl IntoIterator<Item = PhaseTransition>,
    meta: Option<&Value>,
) {
    for t in transitions {
        let mut payload = json!({
            "step": t.phase.as_str(),
            "status": t.status,
            "at": Utc::now(),
        });
        if let Some(meta) = meta {
            payload["meta"] = meta.clone();
        }
        emit(store, run_id, EventKind::Status, payload);
    }
}

/// The tool payload as a JSON object: either the content itself or the
/// object extracted from its text portion.
fn result_json(content: &Value) -> Option<Value> {
    if content.is_object() {
        return Some(content.clone());
    }
    tool_result_text(content).and_then(|text| extract_json_object(&text))
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;
    use df_domain::error::Result as DfResult;
    use df_domain::message::{AssistantMessage, BoxStream, ResultMessage, SystemMessage};
    use std::io::Write;
    use std::sync::Mutex;
    use std::time::Duration;

    // ── Scripted runtime ───────────────────────────────────────────

    /// Yields a fixed message script; an optional delay between messages
    /// lets tests interleave aborts with the driver loop.
    struct ScriptedRuntime {
        script: Mutex<Option<Vec<DfResult<AgentMessage>>>>,
        delay: Duration,
        hang_at_end: bool,
    }

    impl ScriptedRuntime {
        fn new(script: Vec<DfResult<AgentMessage>>) -> Self {
            Self {
                script: Mutex::new(Some(script)),
                delay: Duration::ZERO,
                hang_at_end: false,
            }
        }

        fn with_delay(mut self, delay: Duration) -> Self {
            self.delay = delay;
            self
        }

        fn hanging(mut self) -> Self {
            self.hang_at_end = true;
            self
        }
    }

    #[async_trait::async_trait]
    impl AgentRuntime for ScriptedRuntime {
        async fn run(
            &self,
            _req: AgentRunRequest,
            cancel: CancelToken,
        ) -> DfResult<BoxStream<'static, DfResult<AgentMessage>>> {
            let script = self.script.lock().unwrap().take().unwrap_or_default();
            let delay = self.delay;
            let hang = self.hang_at_end;
            let stream = async_stream::stream! {
                for message in script {
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                    if cancel.is_cancelled() {
                        yield Err(Error::Cancelled);
                        return;
                    }
                    yield message;
                }
                if hang {
                    loop {
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        if cancel.is_cancelled() {
                            yield Err(Error::Cancelled);
                            return;
                        }
                    }
                }
            };
            Ok(Box::pin(stream))
        }
    }

    // ── Script builders ────────────────────────────────────────────

    fn tools() -> df_domain::config::ToolsConfig {
        df_domain::config::ToolsConfig::default()
    }

    fn assistant_tool_use(id: &str, name: &str, input: Value) -> DfResult<AgentMessage> {
        Ok(AgentMessage::Assistant(AssistantMessage {
            id: Some(id.into()),
            content: vec![ContentBlock::ToolUse {
                name: name.into(),
                input,
            }],
            usage: None,
            timestamp: None,
        }))
    }

    fn tool_result(name: &str, content: &str) -> DfResult<AgentMessage> {
        Ok(AgentMessage::Stream(StreamPayload::ToolResult {
            name: name.into(),
            is_error: false,
            content: Value::String(content.into()),
        }))
    }

    fn text_delta(text: &str) -> DfResult<AgentMessage> {
        Ok(AgentMessage::Stream(StreamPayload::TextDelta {
            text: text.into(),
        }))
    }

    fn result_ok(payload: &str) -> DfResult<AgentMessage> {
        Ok(AgentMessage::Result(ResultMessage {
            is_error: false,
            subtype: Some("success".into()),
            result: Some(payload.into()),
            usage: None,
            session_id: None,
        }))
    }

    fn happy_path_script() -> Vec<DfResult<AgentMessage>> {
        let t = tools();
        vec![
            Ok(AgentMessage::System(SystemMessage {
                subtype: Some("init".into()),
                session_id: Some("s-1".into()),
            })),
            assistant_tool_use("m1", &t.transcribe, json!({"audio": "uploads/m.mp3"})),
            tool_result(
                &t.transcribe,
                r#"{"transcript":"hello world","processedChunks":1,"totalChunks":1,"nextChunk":null}"#,
            ),
            assistant_tool_use("m2", &t.draft, json!({"transcript": "hello world"})),
            tool_result(&t.draft, r#"{"draft":"D"}"#),
            text_delta(r#"{"approved":true}"#),
            assistant_tool_use("m3", &t.export, json!({"draft": "D"})),
            tool_result(&t.export, r#"{"ok":true}"#),
            result_ok(r#"{"status":"ok","draft":"D","docx":"exports/pip-1.docx"}"#),
        ]
    }

    fn test_input(root: &std::path::Path) -> RunInput {
        RunInput {
            audio: root.join("uploads/m.mp3"),
            template: root.join("templates/pip-template.docx"),
            outdoc: root.join("exports/pip-1.docx"),
            outdoc_relative: "exports/pip-1.docx".into(),
            input_language: "auto".into(),
            output_language: "en".into(),
        }
    }

    fn test_config(root: &std::path::Path) -> Arc<Config> {
        let mut config = Config::default();
        config.project.root = root.to_path_buf();
        Arc::new(config)
    }

    /// Drive a script to completion and return every event in order.
    async fn run_script(
        script: Vec<DfResult<AgentMessage>>,
        root: &std::path::Path,
    ) -> (Arc<RunStore>, Uuid, Vec<super::super::runs::RunEvent>) {
        let store = Arc::new(RunStore::new());
        let runtime = Arc::new(ScriptedRuntime::new(script));
        let run_id = start_run(
            store.clone(),
            runtime,
            test_config(root),
            test_input(root),
        );

        let mut sub = store.subscribe(&run_id).expect("run exists");
        let mut events = Vec::new();
        loop {
            let event = tokio::time::timeout(Duration::from_secs(5), sub.next_event())
                .await
                .expect("driver stalled")
                .expect("stream closed early");
            let terminal = matches!(event.kind, EventKind::Final)
                || (matches!(event.kind, EventKind::Error)
                    && store
                        .status(&run_id)
                        .map(|s| s.is_terminal())
                        .unwrap_or(true));
            events.push(event);
            if terminal {
                break;
            }
        }
        (store, run_id, events)
    }

    fn statuses(events: &[super::super::runs::RunEvent]) -> Vec<(String, String)> {
        events
            .iter()
            .filter(|e| e.kind == EventKind::Status)
            .map(|e| {
                (
                    e.payload["step"].as_str().unwrap().to_string(),
                    e.payload["status"].as_str().unwrap().to_string(),
                )
            })
            .collect()
    }

    // ── Scenario 1: happy path ─────────────────────────────────────

    #[tokio::test]
    async fn happy_path_single_chunk() {
        let dir = tempfile::tempdir().unwrap();
        let (store, run_id, events) = run_script(happy_path_script(), dir.path()).await;

        assert_eq!(store.status(&run_id), Some(RunStatus::Success));

        assert_eq!(
            statuses(&events),
            vec![
                ("transcribe".into(), "running".into()),
                ("transcribe".into(), "success".into()),
                ("draft".into(), "running".into()),
                ("draft".into(), "success".into()),
                ("review".into(), "running".into()),
                ("review".into(), "success".into()),
                ("export".into(), "running".into()),
                ("export".into(), "success".into()),
            ]
        );

        let chunk = events
            .iter()
            .find(|e| e.kind == EventKind::TranscriptChunk)
            .unwrap();
        assert_eq!(chunk.payload["transcript"], "hello world");
        assert_eq!(chunk.payload["processedChunks"], 1);
        assert_eq!(chunk.payload["totalChunks"], 1);

        let judge = events
            .iter()
            .find(|e| e.kind == EventKind::JudgeRound)
            .unwrap();
        assert_eq!(judge.payload["round"], 1);
        assert_eq!(judge.payload["approved"], true);

        let final_event = events.last().unwrap();
        assert_eq!(final_event.kind, EventKind::Final);
        assert_eq!(final_event.payload["ok"], true);
        assert_eq!(final_event.payload["draft"], "D");
        assert_eq!(final_event.payload["docx"], "exports/pip-1.docx");

        // The session log and both tool lifecycles are present too.
        assert!(events.iter().any(|e| e.kind == EventKind::Log));
        assert_eq!(
            events.iter().filter(|e| e.kind == EventKind::ToolUse).count(),
            3
        );
        assert_eq!(
            events
                .iter()
                .filter(|e| e.kind == EventKind::ToolResult)
                .count(),
            3
        );
    }

    #[tokio::test]
    async fn final_is_unique_and_last() {
        let dir = tempfile::tempdir().unwrap();
        let (store, run_id, events) = run_script(happy_path_script(), dir.path()).await;

        let finals = events.iter().filter(|e| e.kind == EventKind::Final).count();
        assert_eq!(finals, 1);
        assert_eq!(events.last().unwrap().kind, EventKind::Final);

        // Nothing is appended after final.
        tokio::time::sleep(Duration::from_millis(50)).await;
        let sub = store.subscribe(&run_id).unwrap();
        assert_eq!(sub.replayed_count(), events.len());
    }

    // ── Scenario 2: chunked transcription ──────────────────────────

    #[tokio::test]
    async fn chunked_transcription_previews_accumulate() {
        let t = tools();
        let script = vec![
            assistant_tool_use("m1", &t.transcribe, json!({"startChunk": 0})),
            tool_result(
                &t.transcribe,
                r#"{"transcript":"a","startChunk":0,"processedChunks":1,"totalChunks":3,"nextChunk":1}"#,
            ),
            assistant_tool_use("m2", &t.transcribe, json!({"startChunk": 1})),
            tool_result(
                &t.transcribe,
                r#"{"transcript":"b","startChunk":1,"processedChunks":1,"totalChunks":3,"nextChunk":2}"#,
            ),
            result_ok(r#"{"status":"ok","draft":"D","docx":"exports/pip-1.docx"}"#),
        ];

        let dir = tempfile::tempdir().unwrap();
        let (_, _, events) = run_script(script, dir.path()).await;

        let chunks: Vec<_> = events
            .iter()
            .filter(|e| e.kind == EventKind::TranscriptChunk)
            .collect();
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].payload["transcript"], "a");
        assert_eq!(chunks[0].payload["processedChunks"], 1);
        assert_eq!(chunks[0].payload["totalChunks"], 3);
        assert_eq!(chunks[1].payload["transcript"], "a\n\nb");
        assert_eq!(chunks[1].payload["processedChunks"], 2);
        assert_eq!(chunks[1].payload["totalChunks"], 3);
    }

    // ── Scenario 3: reviewer rejects ───────────────────────────────

    #[tokio::test]
    async fn reviewer_rejection_fails_review_then_run() {
        let t = tools();
        let script = vec![
            assistant_tool_use("m1", &t.transcribe, json!({})),
            tool_result(&t.transcribe, r#"{"transcript":"x","processedChunks":1,"totalChunks":1,"nextChunk":null}"#),
            assistant_tool_use("m2", &t.draft, json!({})),
            tool_result(&t.draft, r#"{"draft":"D"}"#),
            text_delta(r#"{"approved":false,"required_changes":["tighten tone"]}"#),
            // The runtime gives up; the stream ends with no result message.
        ];

        let dir = tempfile::tempdir().unwrap();
        let (store, run_id, events) = run_script(script, dir.path()).await;

        assert_eq!(store.status(&run_id), Some(RunStatus::Error));

        let judge = events
            .iter()
            .find(|e| e.kind == EventKind::JudgeRound)
            .unwrap();
        assert_eq!(judge.payload["round"], 1);
        assert_eq!(judge.payload["approved"], false);
        assert_eq!(judge.payload["required_changes"][0], "tighten tone");

        assert!(statuses(&events).contains(&("review".into(), "error".into())));
        assert_eq!(events.last().unwrap().kind, EventKind::Error);
        assert!(!events.iter().any(|e| e.kind == EventKind::Final));
    }

    #[tokio::test]
    async fn verdicts_beyond_the_round_cap_are_ignored() {
        let t = tools();
        let script = vec![
            assistant_tool_use("m1", &t.draft, json!({})),
            tool_result(&t.draft, r#"{"draft":"D"}"#),
            text_delta(r#"{"approved":false}"#),
            text_delta(r#"{"approved":true}"#),
            result_ok(r#"{"status":"ok","draft":"D","docx":"exports/pip-1.docx"}"#),
        ];

        let dir = tempfile::tempdir().unwrap();
        let (_, _, events) = run_script(script, dir.path()).await;

        let rounds: Vec<_> = events
            .iter()
            .filter(|e| e.kind == EventKind::JudgeRound)
            .collect();
        assert_eq!(rounds.len(), 1);
        assert_eq!(rounds[0].payload["approved"], false);
        // Review failed at round 1 and, being terminal, stayed failed.
        assert!(statuses(&events).contains(&("review".into(), "error".into())));
    }

    // ── Scenario 4: abort mid-run ──────────────────────────────────

    #[tokio::test]
    async fn client_disconnect_aborts_the_run() {
        let t = tools();
        let script = vec![assistant_tool_use("m1", &t.transcribe, json!({}))];
        let runtime =
            Arc::new(ScriptedRuntime::new(script).with_delay(Duration::from_millis(10)).hanging());

        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(RunStore::new());
        let run_id = start_run(
            store.clone(),
            runtime,
            test_config(dir.path()),
            test_input(dir.path()),
        );

        let mut sub = store.subscribe(&run_id).unwrap();
        // Wait for the first status event, then disconnect.
        let first = tokio::time::timeout(Duration::from_secs(5), sub.next_event())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.kind, EventKind::Status);
        drop(sub);

        // The store aborts on last-subscriber departure; the driver observes
        // the token on its next step and settles without a final event.
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while store.status(&run_id) != Some(RunStatus::Aborted)
            && std::time::Instant::now() < deadline
        {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(store.status(&run_id), Some(RunStatus::Aborted));

        tokio::time::sleep(Duration::from_millis(100)).await;
        let replay = store.subscribe(&run_id).unwrap();
        let errors: Vec<_> = replay
            .replay_events()
            .iter()
            .filter(|e| e.kind == EventKind::Error)
            .cloned()
            .collect();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].payload["aborted"], true);
        assert!(!replay
            .replay_events()
            .iter()
            .any(|e| e.kind == EventKind::Final));
    }

    #[tokio::test]
    async fn explicit_abort_emits_single_error() {
        let t = tools();
        let script = vec![assistant_tool_use("m1", &t.transcribe, json!({}))];
        let runtime =
            Arc::new(ScriptedRuntime::new(script).with_delay(Duration::from_millis(10)).hanging());

        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(RunStore::new());
        let run_id = start_run(
            store.clone(),
            runtime,
            test_config(dir.path()),
            test_input(dir.path()),
        );

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(store.abort(&run_id, Some("Run aborted by client")));

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(store.status(&run_id), Some(RunStatus::Aborted));

        let replay = store.subscribe(&run_id).unwrap();
        let errors = replay
            .replay_events()
            .iter()
            .filter(|e| e.kind == EventKind::Error)
            .count();
        assert_eq!(errors, 1);
    }

    // ── Scenario 5: recovery probe ─────────────────────────────────

    #[tokio::test]
    async fn stream_failure_recovers_from_output_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("exports")).unwrap();
        let mut file = std::fs::File::create(dir.path().join("exports/pip-1.docx")).unwrap();
        file.write_all(&vec![0u8; 4096]).unwrap();

        let t = tools();
        let script = vec![
            assistant_tool_use("m1", &t.export, json!({})),
            tool_result(&t.export, r#"{"ok":true}"#),
            Err(Error::Http("connection reset".into())),
        ];

        let (store, run_id, events) = run_script(script, dir.path()).await;

        assert_eq!(store.status(&run_id), Some(RunStatus::Success));

        let log = events
            .iter()
            .find(|e| e.kind == EventKind::Log && e.payload["level"] == "warn")
            .unwrap();
        assert!(log.payload["message"]
            .as_str()
            .unwrap()
            .contains("recovered"));

        assert!(statuses(&events).contains(&("export".into(), "success".into())));

        let final_event = events.last().unwrap();
        assert_eq!(final_event.kind, EventKind::Final);
        assert_eq!(final_event.payload["ok"], true);
        assert_eq!(final_event.payload["recovered"], true);
        assert_eq!(final_event.payload["docx"], "exports/pip-1.docx");
    }

    #[tokio::test]
    async fn stream_failure_without_output_fails_the_run() {
        let dir = tempfile::tempdir().unwrap();
        let script = vec![Err(Error::Http("connection reset".into()))];

        let (store, run_id, events) = run_script(script, dir.path()).await;

        assert_eq!(store.status(&run_id), Some(RunStatus::Error));
        let last = events.last().unwrap();
        assert_eq!(last.kind, EventKind::Error);
        assert!(last.payload["message"]
            .as_str()
            .unwrap()
            .contains("connection reset"));
    }

    #[tokio::test]
    async fn small_output_file_is_not_a_recovery() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("exports")).unwrap();
        std::fs::write(dir.path().join("exports/pip-1.docx"), b"tiny").unwrap();

        let script = vec![Err(Error::Http("gone".into()))];
        let (store, run_id, _) = run_script(script, dir.path()).await;
        assert_eq!(store.status(&run_id), Some(RunStatus::Error));
    }

    // ── Tool errors, todos, result parsing ─────────────────────────

    #[tokio::test]
    async fn tool_error_fails_the_phase_and_emits_error() {
        let t = tools();
        let script = vec![
            assistant_tool_use("m1", &t.transcribe, json!({})),
            Ok(AgentMessage::Stream(StreamPayload::ToolResult {
                name: t.transcribe.clone(),
                is_error: true,
                content: Value::String("ffmpeg exploded".into()),
            })),
        ];

        let dir = tempfile::tempdir().unwrap();
        let (store, run_id, events) = run_script(script, dir.path()).await;

        assert_eq!(store.status(&run_id), Some(RunStatus::Error));
        assert!(statuses(&events).contains(&("transcribe".into(), "error".into())));

        let tool_result_event = events
            .iter()
            .find(|e| e.kind == EventKind::ToolResult)
            .unwrap();
        assert_eq!(tool_result_event.payload["isError"], true);

        let tool_error = events
            .iter()
            .find(|e| e.kind == EventKind::Error && e.payload["details"] == "ffmpeg exploded")
            .unwrap();
        assert!(tool_error.payload["message"]
            .as_str()
            .unwrap()
            .contains("failed"));
    }

    #[tokio::test]
    async fn todo_tool_emits_todo_event() {
        let t = tools();
        let todos = json!([
            {"content": "transcribe audio", "status": "in_progress", "activeForm": "Transcribing"}
        ]);
        let script = vec![
            assistant_tool_use("m1", &t.todo, json!({ "todos": todos })),
            result_ok(r#"{"status":"ok","draft":"D","docx":"exports/pip-1.docx"}"#),
        ];

        let dir = tempfile::tempdir().unwrap();
        let (_, _, events) = run_script(script, dir.path()).await;

        let todo = events.iter().find(|e| e.kind == EventKind::Todo).unwrap();
        assert_eq!(todo.payload["todos"][0]["content"], "transcribe audio");
    }

    #[tokio::test]
    async fn fenced_final_payload_parses() {
        let script = vec![result_ok(
            "```json\n{\"status\":\"ok\",\"draft\":\"D\",\"docx\":\"exports/pip-1.docx\"}\n```",
        )];
        let dir = tempfile::tempdir().unwrap();
        let (store, run_id, events) = run_script(script, dir.path()).await;

        assert_eq!(store.status(&run_id), Some(RunStatus::Success));
        assert_eq!(events.last().unwrap().payload["docx"], "exports/pip-1.docx");
    }

    #[tokio::test]
    async fn non_ok_final_payload_fails_the_run() {
        let script = vec![result_ok(r#"{"status":"failed","reason":"export refused"}"#)];
        let dir = tempfile::tempdir().unwrap();
        let (store, run_id, events) = run_script(script, dir.path()).await;

        assert_eq!(store.status(&run_id), Some(RunStatus::Error));
        assert_eq!(events.last().unwrap().kind, EventKind::Error);
        assert!(!events.iter().any(|e| e.kind == EventKind::Final));
    }

    #[tokio::test]
    async fn assistant_usage_emits_cost_once_per_message() {
        let usage = df_domain::message::UsageBlock {
            input_tokens: 100,
            output_tokens: 10,
            ..Default::default()
        };
        let assistant = AgentMessage::Assistant(AssistantMessage {
            id: Some("m1".into()),
            content: vec![],
            usage: Some(usage),
            timestamp: None,
        });
        let script = vec![
            Ok(assistant.clone()),
            Ok(assistant), // replayed message: deduped, no second cost event
            result_ok(r#"{"status":"ok","draft":"D","docx":"exports/pip-1.docx"}"#),
        ];

        let dir = tempfile::tempdir().unwrap();
        let (_, _, events) = run_script(script, dir.path()).await;

        let costs: Vec<_> = events.iter().filter(|e| e.kind == EventKind::Cost).collect();
        assert_eq!(costs.len(), 1);
        assert_eq!(costs[0].payload["summary"]["totalTokens"], 110);
    }

    #[tokio::test]
    async fn transcription_usage_feeds_gemini_buckets() {
        let t = tools();
        let script = vec![
            assistant_tool_use("m1", &t.transcribe, json!({})),
            tool_result(
                &t.transcribe,
                r#"{"transcript":"x","processedChunks":1,"totalChunks":1,"nextChunk":null,
                    "usage":{"inputTokens":1000,"outputTokens":50}}"#,
            ),
            result_ok(r#"{"status":"ok","draft":"D","docx":"exports/pip-1.docx"}"#),
        ];

        let dir = tempfile::tempdir().unwrap();
        let (_, _, events) = run_script(script, dir.path()).await;

        let cost = events.iter().find(|e| e.kind == EventKind::Cost).unwrap();
        assert_eq!(cost.payload["summary"]["breakdown"]["geminiInput"]["tokens"], 1000);
        assert_eq!(cost.payload["summary"]["breakdown"]["geminiOutput"]["tokens"], 50);
    }

    #[tokio::test]
    async fn tool_results_pair_fifo_with_tool_uses() {
        let t = tools();
        let script = vec![
            assistant_tool_use("m1", &t.transcribe, json!({"startChunk": 0})),
            assistant_tool_use("m2", &t.transcribe, json!({"startChunk": 1})),
            tool_result(&t.transcribe, r#"{"transcript":"a","startChunk":0,"processedChunks":1}"#),
            tool_result(&t.transcribe, r#"{"transcript":"b","startChunk":1,"processedChunks":1}"#),
            result_ok(r#"{"status":"ok","draft":"D","docx":"exports/pip-1.docx"}"#),
        ];

        let dir = tempfile::tempdir().unwrap();
        let (_, _, events) = run_script(script, dir.path()).await;

        let uses: Vec<_> = events
            .iter()
            .filter(|e| e.kind == EventKind::ToolUse)
            .map(|e| e.payload["id"].as_str().unwrap().to_string())
            .collect();
        let results: Vec<_> = events
            .iter()
            .filter(|e| e.kind == EventKind::ToolResult)
            .map(|e| e.payload["id"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(uses, results);
        assert!(events
            .iter()
            .filter(|e| e.kind == EventKind::ToolResult)
            .all(|e| e.payload["durationMs"].as_i64().unwrap() >= 0));
    }
}
