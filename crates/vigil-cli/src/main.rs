#![warn(missing_docs)]

//! Vigil audit script runner.
//!
//! `vigil [serve]` starts the session server. `vigil run <script> [payload]`
//! evaluates one script non-interactively and prints the response record.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing_subscriber::EnvFilter;
use vigil_config::VigilConfig;
use vigil_sandbox::audit::{AuditLogger, JsonLinesAuditLogger, TracingAuditLogger};
use vigil_sandbox::{
    EvaluationOptions, ExecutionContext, GatewayConfig, GatewayIpfsFetcher, ReqwestTransport,
    ScriptGateway, ScriptSource,
};
use vigil_server::{AppState, InMemoryScriptStore, Response, SessionConfig};

const DEFAULT_BIND: &str = "127.0.0.1:8080";
const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 30;
const DEFAULT_IPFS_TIMEOUT_SECS: u64 = 30;

/// Build GatewayConfig from config overrides.
fn build_gateway_config(overrides: &vigil_config::SandboxOverrides) -> GatewayConfig {
    let mut config = GatewayConfig::default();
    if let Some(timeout) = overrides.timeout_secs {
        config.timeout = Duration::from_secs(timeout);
    }
    if let Some(heap) = overrides.max_heap_mb {
        config.max_heap_size = heap * 1024 * 1024;
    }
    if let Some(concurrent) = overrides.max_concurrent {
        config.max_concurrent = concurrent;
    }
    if let Some(sessions) = overrides.max_sessions {
        config.max_sessions = sessions;
    }
    if let Some(kb) = overrides.max_code_size_kb {
        config.max_script_size = kb * 1024;
    }
    if let Some(calls) = overrides.max_http_calls {
        config.max_http_calls = calls;
    }
    config
}

/// Build SessionConfig from config overrides.
fn build_session_config(overrides: &vigil_config::SessionOverrides) -> SessionConfig {
    let mut config = SessionConfig::default();
    if let Some(secs) = overrides.prompt_timeout_secs {
        config.prompt_timeout = Duration::from_secs(secs);
    }
    config.execution_timeout = overrides.execution_timeout_secs.map(Duration::from_secs);
    config
}

/// JSON-lines file logger when `[audit] log_file` is set, tracing otherwise.
async fn build_audit_logger(settings: &vigil_config::AuditSettings) -> Result<Arc<dyn AuditLogger>> {
    let Some(path) = &settings.log_file else {
        return Ok(Arc::new(TracingAuditLogger));
    };
    let file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await
        .with_context(|| format!("failed to open audit log {}", path.display()))?;
    tracing::info!(path = %path.display(), "writing audit entries");
    Ok(Arc::new(JsonLinesAuditLogger::new(file)))
}

/// Wire transports, IPFS, properties and audit logging into a gateway.
fn build_gateway(config: &VigilConfig, audit_logger: Arc<dyn AuditLogger>) -> ScriptGateway {
    let user_agent = config
        .http
        .user_agent
        .clone()
        .unwrap_or_else(|| concat!("vigil/", env!("CARGO_PKG_VERSION")).to_string());
    let transport = ReqwestTransport::new(
        Duration::from_secs(config.http.timeout_secs.unwrap_or(DEFAULT_HTTP_TIMEOUT_SECS)),
        user_agent,
    );

    let mut gateway = ScriptGateway::new(build_gateway_config(&config.sandbox))
        .with_http_transport(Arc::new(transport))
        .with_properties(config.properties.clone())
        .with_audit_logger(audit_logger);

    if let Some(ipfs) = &config.ipfs {
        tracing::info!(gateway = %ipfs.gateway_url, "ipfs enabled");
        gateway = gateway.with_ipfs_fetcher(Arc::new(GatewayIpfsFetcher::new(
            ipfs.gateway_url.clone(),
            Duration::from_secs(ipfs.timeout_secs.unwrap_or(DEFAULT_IPFS_TIMEOUT_SECS)),
        )));
    }
    gateway
}

fn load_config() -> Result<VigilConfig> {
    match vigil_config::find_config_file() {
        Some(path) => {
            tracing::info!(path = %path.display(), "loading config");
            VigilConfig::from_file_with_env(&path)
                .with_context(|| format!("failed to load config from {}", path.display()))
        }
        None => {
            tracing::info!("no config file found, using defaults");
            Ok(VigilConfig::from_toml("")?)
        }
    }
}

/// Evaluate one script file and print the response record.
async fn run_once(gateway: &ScriptGateway, path: &Path, payload: Option<&str>) -> Result<()> {
    let source = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read script {}", path.display()))?;
    let payload = payload
        .map(serde_json::from_str::<serde_json::Value>)
        .transpose()
        .context("payload is not valid JSON")?;

    let options = EvaluationOptions {
        payload,
        ..Default::default()
    };
    let outcome = gateway
        .evaluate_with_options(&ScriptSource::from(source), ExecutionContext::noop(), options)
        .await;

    println!(
        "{}",
        serde_json::to_string_pretty(&Response::from_outcome(&outcome))?
    );
    outcome.map(|_| ()).map_err(|e| anyhow::anyhow!("{}: {e}", e.code()))
}

async fn serve(config: &VigilConfig, gateway: ScriptGateway) -> Result<()> {
    let store = InMemoryScriptStore::new();
    if let Some(dir) = &config.scripts.dir {
        let loaded = store
            .load_directory(dir)
            .with_context(|| format!("failed to load scripts from {}", dir.display()))?;
        tracing::info!(dir = %dir.display(), scripts = loaded, "scripts loaded");
    }

    let state = AppState {
        gateway: Arc::new(gateway),
        store: Arc::new(store),
        session: build_session_config(&config.session),
    };
    let bind = config.server.bind.as_deref().unwrap_or(DEFAULT_BIND);
    vigil_server::serve(bind, state)
        .await
        .with_context(|| format!("server on {bind} failed"))
}

#[tokio::main]
async fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().collect();
    if args.iter().any(|a| a == "--version" || a == "-V") {
        println!("vigil {}", env!("CARGO_PKG_VERSION"));
        return Ok(());
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = load_config()?;
    let audit_logger = build_audit_logger(&config.audit).await?;
    let gateway = build_gateway(&config, audit_logger);

    match args.get(1).map(String::as_str) {
        None | Some("serve") => serve(&config, gateway).await,
        Some("run") => {
            let path = args
                .get(2)
                .context("usage: vigil run <script.js> [payload-json]")?;
            run_once(&gateway, Path::new(path), args.get(3).map(String::as_str)).await
        }
        Some(other) => anyhow::bail!(
            "unknown command '{}' (expected 'serve' or 'run')",
            other
        ),
    }
}
