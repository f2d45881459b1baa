//! Run API endpoints — the client surface of the pipeline.
//!
//! - `POST /runs`            — validate body, create run, spawn driver
//! - `GET  /runs`            — list runs (lightweight view)
//! - `GET  /runs/:id`        — current status
//! - `GET  /runs/:id/stream` — SSE stream: ring replay, then live events
//! - `POST /runs/:id/abort`  — client-driven abort

use std::convert::Infallible;
use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::http::header::{HeaderName, HeaderValue, CACHE_CONTROL, CONTENT_TYPE};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Json, Response};
use serde::Deserialize;
use uuid::Uuid;

use df_domain::validate;

use crate::runtime::runs::{EventKind, RunStatus};
use crate::runtime::{start_run, RunInput};
use crate::state::AppState;

/// SSE comment heartbeat cadence.
const HEARTBEAT_SECS: u64 = 15;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Request shape
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateRunRequest {
    /// Relative audio path; falls back to the configured default.
    #[serde(default)]
    pub audio: Option<String>,
    /// Relative `.docx` template path.
    #[serde(default)]
    pub template: Option<String>,
    /// Relative `.docx` output path.
    #[serde(default)]
    pub outdoc: Option<String>,
    /// ISO code or `auto`.
    #[serde(default)]
    pub input_language: Option<String>,
    /// ISO code; `auto` disallowed.
    #[serde(default)]
    pub output_language: Option<String>,
}

/// Validated request with the sanitized relative paths echoed to the client.
#[derive(Debug)]
struct ValidatedRun {
    input: RunInput,
    audio: String,
    template: String,
}

fn validate_request(
    state: &AppState,
    body: &CreateRunRequest,
) -> Result<ValidatedRun, serde_json::Value> {
    let project = &state.config.project;

    let audio = body
        .audio
        .clone()
        .unwrap_or_else(|| project.default_audio.clone());
    validate::validate_audio_path(&audio).map_err(|e| field_error("audio", e))?;

    let template = body
        .template
        .clone()
        .unwrap_or_else(|| project.default_template.clone());
    validate::validate_docx_path(&template).map_err(|e| field_error("template", e))?;

    let outdoc = body
        .outdoc
        .clone()
        .unwrap_or_else(|| project.default_outdoc.clone());
    validate::validate_docx_path(&outdoc).map_err(|e| field_error("outdoc", e))?;

    let input_language = body
        .input_language
        .clone()
        .unwrap_or_else(|| "auto".into());
    validate::validate_input_language(&input_language)
        .map_err(|e| field_error("inputLanguage", e))?;

    let output_language = body.output_language.clone().unwrap_or_else(|| "en".into());
    validate::validate_output_language(&output_language)
        .map_err(|e| field_error("outputLanguage", e))?;

    Ok(ValidatedRun {
        input: RunInput {
            audio: project.root.join(&audio),
            template: project.root.join(&template),
            outdoc: project.root.join(&outdoc),
            outdoc_relative: outdoc,
            input_language,
            output_language,
        },
        audio,
        template,
    })
}

fn field_error(field: &str, detail: String) -> serde_json::Value {
    serde_json::json!({
        "error": "invalid_request",
        "field": field,
        "detail": detail,
    })
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// POST /runs
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub async fn create_run(
    State(state): State<AppState>,
    Json(body): Json<CreateRunRequest>,
) -> Response {
    let validated = match validate_request(&state, &body) {
        Ok(v) => v,
        Err(detail) => {
            return (StatusCode::BAD_REQUEST, Json(detail)).into_response();
        }
    };

    let run_id = start_run(
        state.run_store.clone(),
        state.agent.clone(),
        state.config.clone(),
        validated.input.clone(),
    );
    tracing::info!(run_id = %run_id, audio = %validated.audio, "run created");

    (
        StatusCode::CREATED,
        Json(serde_json::json!({
            "runId": run_id,
            "audio": validated.audio,
            "template": validated.template,
            "outdoc": validated.input.outdoc_relative,
            "inputLanguage": validated.input.input_language,
            "outputLanguage": validated.input.output_language,
        })),
    )
        .into_response()
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// GET /runs
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Deserialize)]
pub struct ListRunsQuery {
    #[serde(default = "default_limit")]
    pub limit: usize,
}

fn default_limit() -> usize {
    50
}

pub async fn list_runs(
    State(state): State<AppState>,
    Query(q): Query<ListRunsQuery>,
) -> impl IntoResponse {
    let runs = state.run_store.list(q.limit.min(200));
    let items: Vec<serde_json::Value> = runs
        .iter()
        .map(|r| {
            serde_json::json!({
                "runId": r.id,
                "status": r.status,
                "createdAt": r.created_at,
                "updatedAt": r.updated_at,
            })
        })
        .collect();

    Json(serde_json::json!({ "runs": items, "count": items.len() }))
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// GET /runs/:id
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub async fn get_run(State(state): State<AppState>, Path(run_id): Path<Uuid>) -> Response {
    match state.run_store.status(&run_id) {
        Some(status) => Json(serde_json::json!({
            "runId": run_id,
            "status": status,
        }))
        .into_response(),
        None => not_found(),
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// POST /runs/:id/abort
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub async fn abort_run(State(state): State<AppState>, Path(run_id): Path<Uuid>) -> Response {
    if !state.run_store.contains(&run_id) {
        return not_found();
    }
    // Idempotent: aborting a terminal run changes nothing and still
    // acknowledges.
    state
        .run_store
        .abort(&run_id, Some("Run aborted by client"));
    Json(serde_json::json!({ "ok": true })).into_response()
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// GET /runs/:id/stream (SSE)
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub async fn stream_run(State(state): State<AppState>, Path(run_id): Path<Uuid>) -> Response {
    let Some(subscription) = state.run_store.subscribe(&run_id) else {
        return not_found();
    };
    tracing::debug!(run_id = %run_id, replay = subscription.replayed_count(), "stream subscriber attached");

    let store = state.run_store.clone();
    let stream = async_stream::stream! {
        let mut sub = subscription;
        while let Some(event) = sub.next_event().await {
            let kind = event.kind;
            yield Ok::<_, Infallible>(
                Event::default()
                    .event(kind.as_str())
                    .data(event.payload.to_string()),
            );

            // Terminal frames close the stream: `final` always, `error`
            // once the run has settled. Dropping the subscription
            // unsubscribes exactly once.
            match kind {
                EventKind::Final => break,
                EventKind::Error => {
                    let live = matches!(
                        store.status(&run_id),
                        Some(RunStatus::Pending | RunStatus::Running)
                    );
                    if !live {
                        break;
                    }
                }
                _ => {}
            }
        }
    };

    let mut response = Sse::new(stream)
        .keep_alive(
            KeepAlive::new()
                .interval(Duration::from_secs(HEARTBEAT_SECS))
                .text("keep-alive"),
        )
        .into_response();

    let headers = response.headers_mut();
    headers.insert(
        CONTENT_TYPE,
        HeaderValue::from_static("text/event-stream; charset=utf-8"),
    );
    headers.insert(
        CACHE_CONTROL,
        HeaderValue::from_static("no-cache, no-transform"),
    );
    // Disable proxy buffering so events reach the client as they happen.
    headers.insert(
        HeaderName::from_static("x-accel-buffering"),
        HeaderValue::from_static("no"),
    );
    response
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Helpers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn not_found() -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(serde_json::json!({ "error": "run not found" })),
    )
        .into_response()
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
