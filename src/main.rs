//! Gleip - intercepting HTTP(S) proxy and request flow runner
//!
//! Captures and edits traffic through a MITM proxy, and replays, transforms
//! and fuzzes requests as multi-step flows.

mod app;
mod chef;
mod error;
mod flow;
mod fuzzer;
mod http;
mod proxy;
mod scripting;

#[cfg(test)]
mod test_support;

pub use error::*;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::app::{AppEvent, Config, EventSink};
use crate::flow::{FlowEngine, FlowStore, GleipFlow, RunStatus, StepServices};
use crate::http::HttpSender;
use crate::proxy::{CertificateAuthority, CertificateProvider, InterceptQueue, ProxyHistory, ProxyServer};
use crate::scripting::{JsScriptExecutor, ScriptExecutor};

/// Intercepting HTTP(S) proxy and request flow runner
#[derive(Parser, Debug)]
#[command(name = "gleip")]
#[command(author, version, about = "Intercepting HTTP(S) proxy and request flow runner", long_about = None)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, env = "GLEIP_CONFIG")]
    config: Option<PathBuf>,

    /// Proxy listen port (overrides the configuration file)
    #[arg(short, long, env = "GLEIP_PROXY_PORT")]
    port: Option<u16>,

    /// Start with interception enabled
    #[arg(long, env = "GLEIP_INTERCEPT")]
    intercept: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", env = "GLEIP_LOG_LEVEL")]
    log_level: String,

    /// Log file name or path (enables file logging)
    #[arg(long, env = "GLEIP_LOG_FILE")]
    log_file: Option<String>,

    /// Enable JSON structured logging
    #[arg(long, env = "GLEIP_LOG_JSON")]
    log_json: bool,

    /// Run a flow (file path or stored flow id) and exit
    #[arg(long, value_name = "FLOW")]
    run_flow: Option<String>,

    /// Write the root CA certificate (PEM) to this path and exit
    #[arg(long, value_name = "PATH")]
    export_ca: Option<PathBuf>,

    /// Generate default configuration and exit
    #[arg(long)]
    generate_config: bool,

    /// Validate configuration and exit
    #[arg(long)]
    validate_config: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Install rustls ring crypto provider (required for rustls 0.23+)
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("Failed to install rustls crypto provider"))?;

    let cli = Cli::parse();

    if cli.generate_config {
        return generate_default_config();
    }

    let config = load_config(&cli)?;
    let _log_guard = init_logging(&cli, &config)?;

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "Starting Gleip");

    if cli.validate_config {
        tracing::info!("Configuration is valid");
        return Ok(());
    }

    if let Some(path) = &cli.export_ca {
        return export_ca(&config, path);
    }

    let (events, rx) = EventSink::channel(config.general.event_buffer);
    let observer = spawn_observer(rx);

    let result = match &cli.run_flow {
        Some(flow) => run_flow(&config, flow, events).await,
        None => run_proxy(&config, events).await,
    };

    // connection tasks may still hold a sink briefly after shutdown
    let _ = tokio::time::timeout(Duration::from_secs(1), observer).await;
    tracing::info!("Gleip shutting down gracefully");

    result
}

/// Initialize the logging system.
///
/// The returned guard flushes the non-blocking file writer on drop.
fn init_logging(cli: &Cli, config: &Config) -> Result<Option<tracing_appender::non_blocking::WorkerGuard>> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    let subscriber = tracing_subscriber::registry().with(env_filter);

    let Some(log_path) = &cli.log_file else {
        if cli.log_json {
            subscriber.with(fmt::layer().json()).init();
        } else {
            subscriber.with(fmt::layer()).init();
        }
        return Ok(None);
    };

    let path = Path::new(log_path);
    let (dir, filename) = if path.parent().is_some_and(|p| !p.as_os_str().is_empty()) {
        let dir = path.parent().map(Path::to_path_buf).unwrap_or_else(|| PathBuf::from("."));
        let filename = path
            .file_name()
            .and_then(|s| s.to_str())
            .unwrap_or("gleip.log")
            .to_string();
        (dir, filename)
    } else {
        // bare file name: keep logs under the data directory
        let dir = config
            .data_dir()
            .map(|d| d.join("logs"))
            .unwrap_or_else(|_| PathBuf::from("."));
        (dir, log_path.clone())
    };
    std::fs::create_dir_all(&dir).with_context(|| format!("Failed to create log directory {:?}", dir))?;

    let file_appender = RollingFileAppender::new(Rotation::DAILY, dir, filename);
    let (writer, guard) = tracing_appender::non_blocking(file_appender);

    if cli.log_json {
        subscriber
            .with(fmt::layer().json().with_writer(writer).with_ansi(false))
            .init();
    } else {
        subscriber.with(fmt::layer().with_writer(writer).with_ansi(false)).init();
    }

    Ok(Some(guard))
}

/// Load configuration with CLI overrides
fn load_config(cli: &Cli) -> Result<Config> {
    let mut config = Config::load(cli.config.as_deref()).context("Failed to load configuration")?;

    if let Some(port) = cli.port {
        config.proxy.listen_port = port;
    }
    if cli.intercept {
        config.proxy.intercept_enabled = true;
    }

    config.validate().context("Invalid configuration")?;
    Ok(config)
}

/// Generate default configuration file
fn generate_default_config() -> Result<()> {
    let config = Config::default();
    let toml = toml::to_string_pretty(&config).context("Failed to serialize configuration")?;

    println!("{}", toml);
    Ok(())
}

fn load_authority(config: &Config) -> Result<(CertificateAuthority, PathBuf)> {
    let (cert_path, key_path) = config.ca_paths()?;
    let ca = CertificateAuthority::load_or_create(&cert_path, &key_path)
        .with_context(|| format!("Failed to load or create CA at {:?}", cert_path))?;
    Ok((ca, cert_path))
}

fn export_ca(config: &Config, path: &Path) -> Result<()> {
    let (ca, _) = load_authority(config)?;
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, ca.cert_pem()).with_context(|| format!("Failed to write CA certificate to {:?}", path))?;

    tracing::info!("Exported CA certificate to {:?}", path);
    println!("{}", path.display());
    Ok(())
}

/// Run the proxy until a shutdown signal arrives
async fn run_proxy(config: &Config, events: EventSink) -> Result<()> {
    let (ca, ca_path) = load_authority(config)?;
    let provider = Arc::new(CertificateProvider::new(ca, ca_path, &config.tls.default_hostname));
    let sender = HttpSender::new(config)?;

    let proxy = ProxyServer::new(
        &config.proxy,
        provider.clone(),
        Arc::new(InterceptQueue::new()),
        Arc::new(ProxyHistory::new(config.general.max_history_items)),
        sender,
        events,
    )?;

    let addr = proxy.start().await?;
    tracing::info!(
        "Proxy listening on {} (intercept {}); trust {:?} to inspect HTTPS",
        addr,
        if proxy.intercept_enabled() { "on" } else { "off" },
        provider.ca_path()
    );

    wait_for_shutdown().await?;
    proxy.stop().await;

    tracing::info!(
        captured = proxy.history().len(),
        certificates = provider.issued_count(),
        "Proxy stopped"
    );
    Ok(())
}

/// Run one flow headless; Ctrl-C cancels it
async fn run_flow(config: &Config, reference: &str, events: EventSink) -> Result<()> {
    let flow = resolve_flow(config, reference)?;

    let scripts: Option<Arc<dyn ScriptExecutor>> = if config.scripting.enabled {
        Some(Arc::new(JsScriptExecutor::new(&config.scripting)))
    } else {
        None
    };
    let services = StepServices::new(config, HttpSender::new(config)?, scripts);
    let engine = FlowEngine::new(services, events);

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    let signals = tokio::spawn(async move {
        if wait_for_shutdown().await.is_ok() {
            trigger.cancel();
        }
    });

    let context = engine.run(&flow, &cancel).await;
    signals.abort();

    println!(
        "{}",
        serde_json::to_string_pretty(&context).context("Failed to serialize run result")?
    );

    match context.status {
        RunStatus::Completed => Ok(()),
        status => anyhow::bail!(
            "Flow '{}' {}: {}",
            flow.name,
            status,
            context.error.as_deref().unwrap_or("no error recorded")
        ),
    }
}

/// A flow file path, or the id of a stored flow
fn resolve_flow(config: &Config, reference: &str) -> Result<GleipFlow> {
    let path = Path::new(reference);
    if path.is_file() {
        return flow::load_file(path).with_context(|| format!("Failed to load flow from {:?}", path));
    }

    let store = FlowStore::new(config.flows_dir()?);
    store
        .load(reference)
        .with_context(|| format!("No flow file or stored flow named '{}' in {:?}", reference, store.dir()))
}

/// Handle shutdown signals
async fn wait_for_shutdown() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigint = signal(SignalKind::interrupt()).context("Failed to register SIGINT handler")?;
        let mut sigterm = signal(SignalKind::terminate()).context("Failed to register SIGTERM handler")?;

        tokio::select! {
            _ = sigint.recv() => tracing::info!("Received SIGINT, initiating shutdown"),
            _ = sigterm.recv() => tracing::info!("Received SIGTERM, initiating shutdown"),
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await.context("Failed to register Ctrl+C handler")?;
        tracing::info!("Received Ctrl+C, initiating shutdown");
    }

    Ok(())
}

/// Log every application event
fn spawn_observer(mut rx: mpsc::Receiver<AppEvent>) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            log_event(&event);
        }
    })
}

fn log_event(event: &AppEvent) {
    match event {
        AppEvent::ProxyStarted { addr } => tracing::info!(%addr, "Proxy started"),
        AppEvent::ProxyStopped => tracing::info!("Proxy stopped"),
        AppEvent::NewTransaction(tx) => {
            tracing::debug!(id = %tx.id, method = %tx.request.method, url = %tx.request.url, "Captured request")
        }
        AppEvent::TransactionUpdate(tx) => match (&tx.error, tx.status()) {
            (Some(error), _) => tracing::warn!(id = %tx.id, url = %tx.request.url, %error, "Request failed"),
            (None, status) => tracing::info!(
                id = %tx.id,
                method = %tx.request.method,
                url = %tx.request.url,
                status = ?status,
                duration_ms = ?tx.duration_ms,
                "Request completed"
            ),
        },
        AppEvent::InterceptQueued { id, transaction } => tracing::info!(
            id,
            method = %transaction.request.method,
            url = %transaction.request.url,
            "Request held for operator"
        ),
        AppEvent::FlowStarted { flow_id, run_id } => tracing::debug!(%flow_id, %run_id, "Flow started"),
        AppEvent::StepExecuted { step_index, results, .. } => {
            if let Some(result) = results.last() {
                tracing::debug!(step = step_index, status = ?result.status, "Step executed");
            }
        }
        AppEvent::FuzzUpdate { step_id, results, .. } => {
            tracing::trace!(%step_id, collected = results.len(), "Fuzz progress")
        }
        AppEvent::FlowFinished { run_id, status, error, .. } => {
            tracing::debug!(%run_id, %status, error = ?error, "Flow finished")
        }
    }
}
