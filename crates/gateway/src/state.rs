use std::sync::Arc;

use df_agent::AgentRuntime;
use df_domain::config::Config;

use crate::runtime::runs::RunStore;

/// Shared application state passed to all API handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    /// Run lifecycle tracker — the only shared mutable surface.
    pub run_store: Arc<RunStore>,
    /// Upstream agent runtime client.
    pub agent: Arc<dyn AgentRuntime>,
}
