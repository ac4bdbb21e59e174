//! # pagesnap server
//!
//! Accepts screenshot requests over HTTP and renders them on a pool of
//! headless-browser workers. The same binary runs the API, the workers or
//! both, selected by `--role` (or `server.role` in configuration). API and
//! worker processes share state through Redis and the artifact directory.

use std::{net::SocketAddr, path::PathBuf, sync::Arc};

use anyhow::Context;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use pagesnap_config::{Config, ConfigLoad, ConfigLoader, Role};
use pagesnap_core::{
    capture::{
        BrowserBackend,
        chromium::{ChromiumBackend, ChromiumOptions},
    },
    ssrf::SsrfGuard,
    worker::WorkerPool,
};
use pagesnap_server::{
    infra::startup::{Backends, build_state, build_worker_pool},
    routes,
};

/// CLI entry point
#[derive(Parser, Debug)]
#[command(name = "pagesnap-server")]
#[command(about = "Asynchronous web page screenshot service")]
struct Cli {
    /// Path to a pagesnap.toml configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Path to a .env file (defaults to ./.env when present)
    #[arg(long)]
    env_file: Option<PathBuf>,

    /// Which parts of the service to run (overrides config)
    #[arg(long, value_enum)]
    role: Option<Role>,

    /// Server port (overrides config)
    #[arg(short, long, env = "SERVER_PORT")]
    port: Option<u16>,

    /// Server host (overrides config)
    #[arg(long, env = "SERVER_HOST")]
    host: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = load_runtime_config(&cli)?;
    let role = config.server.role;

    let shutdown = CancellationToken::new();
    tokio::spawn(cancel_on_signal(shutdown.clone()));

    let backends = Backends::connect(&config).await?;
    if config.redis.is_none() && role != Role::All {
        warn!(%role, "without Redis this process cannot share jobs with other roles");
    }

    let workers = if role.runs_workers() {
        Some(start_workers(&config, &backends, shutdown.clone()).await?)
    } else {
        None
    };

    let served = if role.runs_api() {
        serve_api(&config, &backends, shutdown.clone()).await
    } else {
        shutdown.cancelled().await;
        Ok(())
    };
    // Make sure workers stop even when the listener failed.
    shutdown.cancel();

    if let Some((pool, browser)) = workers {
        pool.shutdown().await;
        if let Err(err) = browser.shutdown().await {
            warn!("browser shutdown failed: {err}");
        }
    }

    info!("pagesnap stopped");
    served
}

fn load_runtime_config(cli: &Cli) -> anyhow::Result<Config> {
    let mut loader = ConfigLoader::new();
    if let Some(path) = &cli.config {
        loader = loader.with_config_path(path);
    }
    if let Some(path) = &cli.env_file {
        loader = loader.with_env_file(path);
    }

    let ConfigLoad {
        mut config,
        warnings,
    } = loader.load().context("failed to load configuration")?;

    if let Some(port) = cli.port {
        config.server.port = port;
    }
    if let Some(host) = cli.host.clone() {
        config.server.host = host;
    }
    if let Some(role) = cli.role {
        config.server.role = role;
    }

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,pagesnap=info,tower_http=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    if config.metadata.env_file_loaded {
        info!("loaded .env file");
    }
    if let Some(path) = &config.metadata.config_path {
        info!(path = %path.display(), "configuration file in effect");
    }
    for warning in warnings.iter() {
        match &warning.hint {
            Some(hint) => {
                warn!(message = %warning.message, hint = %hint, "configuration warning")
            }
            None => warn!(message = %warning.message, "configuration warning"),
        }
    }

    config
        .ensure_directories()
        .context("failed to create artifact directory")?;

    info!(
        role = %config.server.role,
        storage.root = %config.storage.root.display(),
        storage.public_url = %config.storage.public_url,
        worker.concurrency = config.worker.concurrency,
        worker.rate_limit = config.worker.rate_limit_max,
        worker.lock_secs = config.worker.lock_duration.as_secs(),
        capture.timeout_secs = config.capture.timeout.as_secs(),
        "configuration in effect"
    );

    Ok(config)
}

async fn start_workers(
    config: &Config,
    backends: &Backends,
    shutdown: CancellationToken,
) -> anyhow::Result<(WorkerPool, Arc<dyn BrowserBackend>)> {
    let browser: Arc<dyn BrowserBackend> = Arc::new(
        ChromiumBackend::launch(ChromiumOptions {
            executable: config.capture.chrome_executable.clone(),
            window: config.capture.default_viewport,
            request_timeout: config.capture.navigation_timeout,
        })
        .await
        .context("failed to launch headless browser")?,
    );

    let pool = build_worker_pool(
        config,
        backends,
        Arc::clone(&browser),
        SsrfGuard::default(),
        shutdown,
    )?;
    pool.start().await;
    Ok((pool, browser))
}

async fn serve_api(
    config: &Config,
    backends: &Backends,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let state = build_state(config, backends, SsrfGuard::default());
    let app = routes::create_app(state, Some(config.storage.root.clone()));

    let listener =
        tokio::net::TcpListener::bind((config.server.host.as_str(), config.server.port))
            .await
            .with_context(|| {
                format!("failed to bind {}:{}", config.server.host, config.server.port)
            })?;
    let addr: SocketAddr = listener.local_addr()?;
    info!("Listening on http://{addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .context("HTTP server failed")
}

async fn cancel_on_signal(shutdown: CancellationToken) {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!("failed to listen for Ctrl-C: {err}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => {
                error!("failed to listen for SIGTERM: {err}");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    info!("Shutdown signal received");
    shutdown.cancel();
}
