use serde::{Deserialize, Serialize};
use std::path::PathBuf;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Top-level config
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub project: ProjectConfig,
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub tools: ToolsConfig,
    #[serde(default)]
    pub review: ReviewConfig,
}

impl Config {
    /// Sanity-check the configuration. Errors prevent startup; warnings are
    /// logged and served anyway.
    pub fn validate(&self) -> Vec<ConfigIssue> {
        let mut issues = Vec::new();

        if self.agent.base_url.trim().is_empty() {
            issues.push(ConfigIssue::error("agent.base_url is empty"));
        }
        if self.agent.request_timeout_secs == 0 {
            issues.push(ConfigIssue::error("agent.request_timeout_secs must be > 0"));
        }
        if self.agent.max_turns == 0 {
            issues.push(ConfigIssue::error("agent.max_turns must be > 0"));
        }
        if self.review.max_rounds > 1 {
            issues.push(ConfigIssue::warning(format!(
                "review.max_rounds = {} is clamped to 1",
                self.review.max_rounds
            )));
        }
        if !self.project.root.exists() {
            issues.push(ConfigIssue::warning(format!(
                "project.root does not exist: {}",
                self.project.root.display()
            )));
        }
        for (label, path) in [
            ("project.prompt_path", &self.project.prompt_path),
            ("project.guidelines_path", &self.project.guidelines_path),
        ] {
            if !self.project.root.join(path).exists() {
                issues.push(ConfigIssue::warning(format!(
                    "{label} not found under project root: {}",
                    path.display()
                )));
            }
        }
        for (label, name) in [
            ("tools.transcribe", &self.tools.transcribe),
            ("tools.draft", &self.tools.draft),
            ("tools.export", &self.tools.export),
        ] {
            if name.trim().is_empty() {
                issues.push(ConfigIssue::error(format!("{label} is empty")));
            }
        }

        issues
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Validation issues
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigSeverity {
    Warning,
    Error,
}

#[derive(Debug, Clone)]
pub struct ConfigIssue {
    pub severity: ConfigSeverity,
    pub message: String,
}

impl ConfigIssue {
    fn error(message: impl Into<String>) -> Self {
        Self {
            severity: ConfigSeverity::Error,
            message: message.into(),
        }
    }

    fn warning(message: impl Into<String>) -> Self {
        Self {
            severity: ConfigSeverity::Warning,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for ConfigIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Server
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "d_port")]
    pub port: u16,
    #[serde(default = "d_host")]
    pub host: String,
    #[serde(default)]
    pub cors: CorsConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: d_port(),
            host: d_host(),
            cors: CorsConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorsConfig {
    /// Origins allowed for CORS. Use `["*"]` for permissive (NOT recommended).
    /// Defaults to localhost-only.
    #[serde(default = "d_cors_origins")]
    pub allowed_origins: Vec<String>,
}

impl Default for CorsConfig {
    fn default() -> Self {
        Self {
            allowed_origins: d_cors_origins(),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Project layout
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Where run inputs and outputs live. All request paths are resolved
/// relative to `root`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectConfig {
    #[serde(default = "d_root")]
    pub root: PathBuf,
    /// Orchestration prompt template, relative to `root`.
    #[serde(default = "d_prompt_path")]
    pub prompt_path: PathBuf,
    /// Review guidelines handed to the reviewer subagent, relative to `root`.
    #[serde(default = "d_guidelines_path")]
    pub guidelines_path: PathBuf,
    #[serde(default = "d_default_audio")]
    pub default_audio: String,
    #[serde(default = "d_default_template")]
    pub default_template: String,
    #[serde(default = "d_default_outdoc")]
    pub default_outdoc: String,
}

impl Default for ProjectConfig {
    fn default() -> Self {
        Self {
            root: d_root(),
            prompt_path: d_prompt_path(),
            guidelines_path: d_guidelines_path(),
            default_audio: d_default_audio(),
            default_template: d_default_template(),
            default_outdoc: d_default_outdoc(),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Agent runtime
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    #[serde(default = "d_agent_url")]
    pub base_url: String,
    /// Tool invocations run through the runtime; transcription of a long
    /// recording can take minutes.
    #[serde(default = "d_600")]
    pub request_timeout_secs: u64,
    #[serde(default = "d_50")]
    pub max_turns: u32,
    #[serde(default = "d_true")]
    pub bypass_permissions: bool,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            base_url: d_agent_url(),
            request_timeout_secs: 600,
            max_turns: 50,
            bypass_permissions: true,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tool names
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// The MCP tool names the runtime exposes. Phase transitions key off these.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolsConfig {
    #[serde(default = "d_tool_transcribe")]
    pub transcribe: String,
    #[serde(default = "d_tool_draft")]
    pub draft: String,
    #[serde(default = "d_tool_export")]
    pub export: String,
    #[serde(default = "d_tool_todo")]
    pub todo: String,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            transcribe: d_tool_transcribe(),
            draft: d_tool_draft(),
            export: d_tool_export(),
            todo: d_tool_todo(),
        }
    }
}

impl ToolsConfig {
    pub fn allowed(&self) -> Vec<String> {
        vec![
            self.transcribe.clone(),
            self.draft.clone(),
            self.export.clone(),
            self.todo.clone(),
        ]
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Review
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewConfig {
    /// Judge rounds before review fails. Clamped to 0..=1 at use sites;
    /// 0 disables the judge gate entirely.
    #[serde(default = "d_1")]
    pub max_rounds: u32,
}

impl Default for ReviewConfig {
    fn default() -> Self {
        Self { max_rounds: 1 }
    }
}

impl ReviewConfig {
    pub fn clamped_rounds(&self) -> u32 {
        self.max_rounds.min(1)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Serde default helpers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn d_port() -> u16 {
    4800
}
fn d_host() -> String {
    "127.0.0.1".into()
}
fn d_cors_origins() -> Vec<String> {
    vec![
        "http://localhost:5173".into(),
        "http://127.0.0.1:5173".into(),
    ]
}
fn d_root() -> PathBuf {
    PathBuf::from(".")
}
fn d_prompt_path() -> PathBuf {
    PathBuf::from("prompts/orchestrator.md")
}
fn d_guidelines_path() -> PathBuf {
    PathBuf::from("prompts/guidelines.md")
}
fn d_default_audio() -> String {
    "uploads/input.mp3".into()
}
fn d_default_template() -> String {
    "templates/report-template.docx".into()
}
fn d_default_outdoc() -> String {
    "exports/report.docx".into()
}
fn d_agent_url() -> String {
    "http://127.0.0.1:4710".into()
}
fn d_600() -> u64 {
    600
}
fn d_50() -> u32 {
    50
}
fn d_1() -> u32 {
    1
}
fn d_true() -> bool {
    true
}
fn d_tool_transcribe() -> String {
    "mcp__transcriber__transcribe_audio".into()
}
fn d_tool_draft() -> String {
    "mcp__drafter__generate_draft".into()
}
fn d_tool_export() -> String {
    "mcp__exporter__export_docx".into()
}
fn d_tool_todo() -> String {
    "TodoWrite".into()
}
