//! Cloud Tasks emulator
//!
//! A local stand-in for the managed Cloud Tasks service: clients create
//! queues and tasks through the v2 REST surface, and the emulator schedules,
//! dispatches and retries the outbound HTTP requests. State lives in memory
//! and disappears on restart.
// This is the main entry point for the emulator. It is responsible for:
// - Initializing logging and configuration.
// - Building the signer, dispatcher and queue registry.
// - Serving the REST facade until a shutdown signal arrives.

// Use jemalloc as the global allocator for better performance
#[cfg(not(target_os = "windows"))]
#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};

mod api;
mod clock;
mod dispatcher;
mod oidc;
mod queue;
mod rate_limiter;
mod registry;
mod task;

#[cfg(test)]
mod tests;

use api::AppState;
use dispatcher::HttpDispatcher;
use oidc::OidcSigner;
use registry::QueueRegistry;
use shared::config::EmulatorConfig;

/// Command-line arguments for the emulator
#[derive(Parser, Debug)]
#[command(name = "emulator")]
#[command(about = "Cloud Tasks API emulator for local development", long_about = None)]
struct CliArgs {
    /// Path to an optional emulator.toml configuration file
    #[arg(long = "config", value_name = "FILE")]
    config: Option<PathBuf>,

    /// Override the listen host from the config file
    #[arg(long = "host", value_name = "HOST")]
    host: Option<String>,

    /// Override the listen port from the config file
    #[arg(long = "port", value_name = "PORT")]
    port: Option<u16>,

    /// Queue to create on startup; may be given multiple times
    #[arg(long = "initial-queue", value_name = "QUEUE_NAME")]
    initial_queues: Vec<String>,

    /// Host used to resolve App Engine task targets
    #[arg(long = "app-engine-emulator-host", value_name = "HOST")]
    app_engine_emulator_host: Option<String>,

    /// Issuer claim for minted OIDC tokens; enables the discovery endpoint
    #[arg(long = "openid-issuer", value_name = "URL")]
    openid_issuer: Option<String>,

    /// Make PurgeQueue synchronous and forget purged task names
    #[arg(long = "hard-reset-on-purge-queue")]
    hard_reset_on_purge_queue: bool,

    /// Directory for rolling JSON log files; logs go to stdout when unset
    #[arg(long = "log-directory", value_name = "DIR")]
    log_directory: Option<String>,
}

impl CliArgs {
    /// Loads the config file (when given) and applies command-line
    /// overrides on top.
    fn resolve_config(&self) -> Result<EmulatorConfig> {
        let mut config = match &self.config {
            Some(path) => EmulatorConfig::load(path)?,
            None => EmulatorConfig::default(),
        };

        if let Some(host) = &self.host {
            config.host = host.clone();
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        if !self.initial_queues.is_empty() {
            config.initial_queues.extend(self.initial_queues.clone());
        }
        if let Some(host) = &self.app_engine_emulator_host {
            config.app_engine_emulator_host = Some(host.clone());
        }
        if let Some(issuer) = &self.openid_issuer {
            config.openid_issuer = Some(issuer.clone());
        }
        if self.hard_reset_on_purge_queue {
            config.hard_reset_on_purge_queue = true;
        }
        if let Some(dir) = &self.log_directory {
            config.log_directory = Some(dir.clone());
        }

        // The flag mirrors the environment variable other emulators in the
        // local stack already export.
        if config.app_engine_emulator_host.is_none() {
            if let Ok(host) = std::env::var("APP_ENGINE_EMULATOR_HOST") {
                if !host.is_empty() {
                    config.app_engine_emulator_host = Some(host);
                }
            }
        }

        Ok(config)
    }
}

/// Initializes the `tracing` subscriber: JSON rolling files when a log
/// directory is configured, plain stdout otherwise.
fn init_logging(config: &EmulatorConfig) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("emulator=info,shared=info"));

    match &config.log_directory {
        Some(directory) => {
            let file_appender = tracing_appender::rolling::daily(directory, "emulator.log");
            let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
            tracing_subscriber::fmt()
                .with_env_filter(env_filter)
                .json()
                .with_current_span(false)
                .with_span_list(false)
                .with_writer(non_blocking)
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::fmt().with_env_filter(env_filter).init();
            None
        }
    }
}

// The `#[tokio::main]` attribute transforms the `async fn main` into a
// synchronous `fn main` that initializes a tokio runtime and runs the async
// code.
#[tokio::main]
async fn main() -> Result<()> {
    let cli_args = CliArgs::parse();

    let config = cli_args.resolve_config()?;
    let _log_guard = init_logging(&config);

    info!("Cloud Tasks emulator starting up");

    if let Err(e) = config.validate() {
        error!("Invalid configuration: {}", e);
        std::process::exit(1);
    }

    // The signer's key material is generated once here and shared read-only
    // with every dispatch.
    let signer = Arc::new(
        OidcSigner::new(config.openid_issuer.clone())
            .context("Failed to initialize OIDC signer")?,
    );
    let dispatcher = Arc::new(
        HttpDispatcher::new(config.app_engine_authority(), signer.clone())
            .context("Failed to initialize HTTP dispatcher")?,
    );
    let registry = Arc::new(QueueRegistry::new(
        dispatcher,
        config.hard_reset_on_purge_queue,
    ));

    for name in &config.initial_queues {
        registry
            .create_queue_from_name(name)
            .await
            .with_context(|| format!("Failed to create initial queue '{}'", name))?;
        info!(queue = %name, "Initial queue created");
    }

    let state = AppState {
        registry: registry.clone(),
        signer,
        config: Arc::new(config.clone()),
    };
    let router = api::create_router(state);

    let listen_address = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&listen_address)
        .await
        .with_context(|| format!("Failed to bind {}", listen_address))?;
    info!(address = %listen_address, "Emulator listening");

    // Set up signal handling for graceful shutdown; every queue's dispatch
    // loop is joined before the process exits.
    let shutdown_signal = async {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            let mut sigterm =
                signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
            let mut sigint =
                signal(SignalKind::interrupt()).expect("failed to install SIGINT handler");

            tokio::select! {
                _ = sigterm.recv() => {
                    info!("Received SIGTERM");
                },
                _ = sigint.recv() => {
                    info!("Received SIGINT");
                },
            }
        }

        #[cfg(not(unix))]
        {
            tokio::signal::ctrl_c()
                .await
                .expect("failed to install Ctrl+C handler");
            info!("Received Ctrl+C");
        }
    };

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal)
        .await
        .context("Server error")?;

    registry.shutdown_all().await;
    info!("Emulator shutdown complete");
    Ok(())
}
