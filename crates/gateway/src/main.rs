use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use axum::http::HeaderValue;
use clap::Parser;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tracing_subscriber::EnvFilter;

use df_agent::{AgentRuntime, HttpAgentRuntime};
use df_domain::config::{Config, ConfigSeverity, CorsConfig};
use df_gateway::api;
use df_gateway::cli::{Cli, Command, ConfigCommand};
use df_gateway::runtime::runs::{RunStore, SWEEP_INTERVAL_SECS};
use df_gateway::state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        // Default to serve when no subcommand is given.
        None | Some(Command::Serve) => {
            init_tracing();
            let config = df_gateway::cli::load_config(&cli.config)?;
            run_server(Arc::new(config)).await
        }
        Some(Command::Config(ConfigCommand::Validate)) => {
            let config = df_gateway::cli::load_config(&cli.config)?;
            if !df_gateway::cli::validate(&config, &cli.config) {
                std::process::exit(1);
            }
            Ok(())
        }
        Some(Command::Config(ConfigCommand::Show)) => {
            let config = df_gateway::cli::load_config(&cli.config)?;
            df_gateway::cli::show(&config);
            Ok(())
        }
        Some(Command::Version) => {
            println!("dictaflow {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

/// Initialize structured JSON tracing (only for the `serve` command).
fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,df_gateway=debug")),
        )
        .json()
        .init();
}

/// Start the gateway with the given configuration.
async fn run_server(config: Arc<Config>) -> anyhow::Result<()> {
    tracing::info!("Dictaflow starting");

    // ── Config validation ────────────────────────────────────────────
    let issues = config.validate();
    for issue in &issues {
        match issue.severity {
            ConfigSeverity::Warning => tracing::warn!("config: {issue}"),
            ConfigSeverity::Error => tracing::error!("config: {issue}"),
        }
    }
    if issues.iter().any(|i| i.severity == ConfigSeverity::Error) {
        anyhow::bail!(
            "config validation failed with {} error(s)",
            issues
                .iter()
                .filter(|i| i.severity == ConfigSeverity::Error)
                .count()
        );
    }

    // ── Run store ────────────────────────────────────────────────────
    let run_store = Arc::new(RunStore::new());
    tracing::info!("run store ready");

    // ── Agent runtime client ─────────────────────────────────────────
    let agent: Arc<dyn AgentRuntime> = Arc::new(
        HttpAgentRuntime::new(
            config.agent.base_url.clone(),
            Duration::from_secs(config.agent.request_timeout_secs),
        )
        .context("initializing agent runtime client")?,
    );
    tracing::info!(
        url = %config.agent.base_url,
        timeout_secs = config.agent.request_timeout_secs,
        "agent runtime client ready"
    );

    let state = AppState {
        config: config.clone(),
        run_store: run_store.clone(),
        agent,
    };

    // ── TTL sweeper (expired runs) ───────────────────────────────────
    {
        let run_store = run_store.clone();
        tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(Duration::from_secs(SWEEP_INTERVAL_SECS));
            loop {
                interval.tick().await;
                let removed = run_store.sweep(chrono::Utc::now());
                if removed > 0 {
                    tracing::info!(removed, "swept expired runs");
                }
            }
        });
    }
    tracing::info!("run sweeper started ({SWEEP_INTERVAL_SECS}s tick)");

    // ── CORS layer (config-aware) ────────────────────────────────────
    let cors_layer = build_cors_layer(&config.server.cors);

    // ── Concurrency limit (backpressure protection) ──────────────────
    let max_concurrent = std::env::var("DF_MAX_CONCURRENT_REQUESTS")
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or(256);
    tracing::info!(max_concurrent, "concurrency limit set");

    // ── Router ───────────────────────────────────────────────────────
    let app = api::router()
        .layer(cors_layer)
        .layer(tower::limit::ConcurrencyLimitLayer::new(max_concurrent))
        .with_state(state);

    // ── Bind ─────────────────────────────────────────────────────────
    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding to {addr}"))?;

    tracing::info!(addr = %addr, "Dictaflow listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(run_store))
        .await
        .context("axum server error")?;

    Ok(())
}

/// Wait for Ctrl-C, then fire every live run's cancel token so drivers and
/// tool invocations short-circuit before the process exits.
async fn shutdown_signal(run_store: Arc<RunStore>) {
    let _ = tokio::signal::ctrl_c().await;
    let aborted = run_store.abort_all("Server shutting down");
    tracing::info!(aborted, "shutdown signal received");
}

/// Build a [`CorsLayer`] from the configured allowed origins. A literal
/// `"*"` allows all origins (not recommended for production).
fn build_cors_layer(cors: &CorsConfig) -> CorsLayer {
    use axum::http::{header, Method};

    if cors.allowed_origins.len() == 1 && cors.allowed_origins[0] == "*" {
        tracing::warn!("CORS configured with wildcard \"*\" — all origins allowed");
        return CorsLayer::new()
            .allow_origin(tower_http::cors::Any)
            .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
            .allow_headers([header::CONTENT_TYPE]);
    }

    let origins: Vec<HeaderValue> = cors
        .allowed_origins
        .iter()
        .filter_map(|origin| match origin.parse::<HeaderValue>() {
            Ok(hv) => Some(hv),
            Err(_) => {
                tracing::warn!(origin = %origin, "invalid CORS origin, skipping");
                None
            }
        })
        .collect();

    CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE])
}
