//! HTTP adapter for the agent runtime.
//!
//! The runtime serves `POST /v1/runs/stream` and answers with
//! newline-delimited JSON, one [`AgentMessage`] per line. The adapter
//! buffers chunks, drains complete lines, and feeds each to the message
//! parser. Unparseable lines are logged and skipped; the orchestration
//! must survive a runtime that interleaves diagnostics into the stream.

use std::time::Duration;

use df_domain::cancel::CancelToken;
use df_domain::error::{Error, Result};
use df_domain::message::{AgentMessage, BoxStream};

use crate::{AgentRunRequest, AgentRuntime};

pub struct HttpAgentRuntime {
    client: reqwest::Client,
    base_url: String,
}

impl HttpAgentRuntime {
    pub fn new(base_url: impl Into<String>, request_timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| Error::Http(e.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait::async_trait]
impl AgentRuntime for HttpAgentRuntime {
    async fn run(
        &self,
        req: AgentRunRequest,
        cancel: CancelToken,
    ) -> Result<BoxStream<'static, Result<AgentMessage>>> {
        let url = format!("{}/v1/runs/stream", self.base_url);
        let response = self
            .client
            .post(&url)
            .json(&req)
            .send()
            .await
            .map_err(from_reqwest)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Agent(format!(
                "runtime returned {status}: {}",
                body.trim()
            )));
        }

        Ok(message_stream(response, cancel))
    }
}

/// Build the message stream from a streaming response body.
fn message_stream(
    response: reqwest::Response,
    cancel: CancelToken,
) -> BoxStream<'static, Result<AgentMessage>> {
    let stream = async_stream::stream! {
        let mut response = response;
        let mut buffer = String::new();

        loop {
            if cancel.is_cancelled() {
                yield Err(Error::Cancelled);
                break;
            }

            match response.chunk().await {
                Ok(Some(bytes)) => {
                    buffer.push_str(&String::from_utf8_lossy(&bytes));
                    for line in drain_lines(&mut buffer) {
                        if let Some(msg) = parse_line(&line) {
                            yield Ok(msg);
                        }
                    }
                }
                Ok(None) => {
                    // Body closed; flush a trailing unterminated line.
                    let rest = std::mem::take(&mut buffer);
                    if let Some(msg) = parse_line(&rest) {
                        yield Ok(msg);
                    }
                    break;
                }
                Err(e) => {
                    yield Err(from_reqwest(e));
                    break;
                }
            }
        }
    };

    Box::pin(stream)
}

/// Remove complete lines from the buffer, leaving a trailing partial line
/// in place for the next chunk.
fn drain_lines(buffer: &mut String) -> Vec<String> {
    let mut lines = Vec::new();
    while let Some(pos) = buffer.find('\n') {
        let line: String = buffer.drain(..=pos).collect();
        let line = line.trim();
        if !line.is_empty() {
            lines.push(line.to_string());
        }
    }
    lines
}

fn parse_line(line: &str) -> Option<AgentMessage> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    match serde_json::from_str::<AgentMessage>(line) {
        Ok(msg) => Some(msg),
        Err(e) => {
            tracing::debug!(error = %e, "skipping unparseable runtime line");
            None
        }
    }
}

fn from_reqwest(e: reqwest::Error) -> Error {
    if e.is_timeout() {
        Error::Timeout(e.to_string())
    } else {
        Error::Http(e.to_string())
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
