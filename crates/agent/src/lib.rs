//! The upstream agent runtime interface.
//!
//! The runtime hosts the orchestrating model and its MCP tools; Dictaflow
//! hands it an instruction prompt and drains the message stream it yields.
//! [`AgentRuntime`] is the seam: the gateway drives whatever sits behind it,
//! and tests substitute a scripted stream.

pub mod http;

use serde::Serialize;

use df_domain::cancel::CancelToken;
use df_domain::error::Result;
use df_domain::message::{AgentMessage, BoxStream};

pub use http::HttpAgentRuntime;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Request types
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A subordinate agent made available to the run (the document reviewer).
#[derive(Debug, Clone, Serialize)]
pub struct SubagentSpec {
    pub name: String,
    pub description: String,
    pub prompt: String,
}

/// One orchestration request handed to the runtime.
#[derive(Debug, Clone, Default, Serialize)]
pub struct AgentRunRequest {
    /// The full instruction prompt (tool names, argument shapes, guidelines).
    pub prompt: String,
    /// Tools the model may invoke.
    pub allowed_tools: Vec<String>,
    /// Subordinate agents (reviewer).
    pub subagents: Vec<SubagentSpec>,
    /// Skip interactive permission prompts; runs are headless.
    pub bypass_permissions: bool,
    /// Turn budget before the runtime force-stops.
    pub max_turns: u32,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Runtime trait
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Trait every agent runtime adapter must implement.
///
/// The returned stream yields runtime messages until the terminal result.
/// Implementations must observe `cancel` between messages and stop early
/// with [`df_domain::Error::Cancelled`] rather than swallowing it.
#[async_trait::async_trait]
pub trait AgentRuntime: Send + Sync {
    async fn run(
        &self,
        req: AgentRunRequest,
        cancel: CancelToken,
    ) -> Result<BoxStream<'static, Result<AgentMessage>>>;
}
