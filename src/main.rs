use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tethergate::config::Config;
use tethergate::error::SupervisorError;
use tethergate::proxy::{Gateway, ProxyServer};
use tethergate::supervisor::Supervisor;
use tethergate::{PKG_NAME, VERSION};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};

/// Config file picked up from the working directory when no path is given
const DEFAULT_CONFIG_FILE: &str = "tethergate.toml";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("tethergate=info".parse().expect("valid log directive")),
        )
        .init();

    let config = load_config().map_err(|e| {
        error!(error = %e, "Failed to load configuration");
        e
    })?;

    print_startup_banner(&config);

    let supervisor = Supervisor::new(config.backend.clone());

    // Launch the backend before accepting traffic. A spawn failure here is fatal.
    if config.server.warm_up {
        match supervisor.ensure_started().await {
            Ok(true) => info!(port = supervisor.port(), "Backend ready"),
            Ok(false) => warn!("Backend not ready yet, requests will retry the start"),
            Err(e) => {
                error!(error = %e, "Cannot launch backend, aborting");
                return Err(e.into());
            }
        }
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (fatal_tx, mut fatal_rx) = mpsc::unbounded_channel::<SupervisorError>();

    let gateway = Arc::new(Gateway::new(Arc::clone(&supervisor)).with_fatal_errors(fatal_tx));

    let bind_addr: SocketAddr = format!("{}:{}", config.server.bind, config.server.port)
        .parse()
        .map_err(|e| {
            error!(bind = %config.server.bind, port = config.server.port, error = %e, "Invalid bind address");
            anyhow::anyhow!("Invalid bind address: {}", e)
        })?;

    let listener = TcpListener::bind(bind_addr).await.map_err(|e| {
        error!(addr = %bind_addr, error = %e, "Failed to bind proxy listener");
        e
    })?;

    let proxy = ProxyServer::new(bind_addr, gateway, shutdown_rx);
    let proxy_handle = tokio::spawn(async move {
        if let Err(e) = proxy.serve(listener).await {
            error!(error = %e, "Proxy server error");
        }
    });

    let fatal = wait_for_shutdown(&mut fatal_rx).await;

    // Signal shutdown
    let _ = shutdown_tx.send(true);

    info!("Stopping backend...");
    supervisor.stop().await;

    let _ = tokio::time::timeout(Duration::from_secs(5), proxy_handle).await;

    if let Some(e) = fatal {
        return Err(e.into());
    }

    info!("Shutdown complete");
    Ok(())
}

/// Wait for SIGINT/SIGTERM or a fatal supervisor error, returning the latter
#[cfg(unix)]
async fn wait_for_shutdown(
    fatal_rx: &mut mpsc::UnboundedReceiver<SupervisorError>,
) -> Option<SupervisorError> {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigterm = signal(SignalKind::terminate()).expect("Failed to install SIGTERM handler");

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received SIGINT (Ctrl+C), shutting down...");
            None
        }
        _ = sigterm.recv() => {
            info!("Received SIGTERM, shutting down...");
            None
        }
        Some(e) = fatal_rx.recv() => {
            error!(error = %e, "Backend can no longer be launched, shutting down");
            Some(e)
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown(
    fatal_rx: &mut mpsc::UnboundedReceiver<SupervisorError>,
) -> Option<SupervisorError> {
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down...");
            None
        }
        Some(e) = fatal_rx.recv() => {
            error!(error = %e, "Backend can no longer be launched, shutting down");
            Some(e)
        }
    }
}

/// Config from the first CLI argument, else `tethergate.toml` if present, else defaults.
/// Environment overrides are applied last.
fn load_config() -> anyhow::Result<Config> {
    let explicit = std::env::args().nth(1).map(PathBuf::from);

    let mut config = match explicit {
        Some(path) => load_file(&path)?,
        None if Path::new(DEFAULT_CONFIG_FILE).exists() => load_file(Path::new(DEFAULT_CONFIG_FILE))?,
        None => {
            info!("No configuration file, using defaults");
            Config::default()
        }
    };

    config.apply_env_overrides(|key| std::env::var(key).ok())?;
    config.validate()?;
    Ok(config)
}

fn load_file(path: &Path) -> anyhow::Result<Config> {
    let config = Config::load(path)
        .map_err(|e| anyhow::anyhow!("{}: {}", path.display(), e))?;
    info!(path = %path.display(), "Configuration loaded");
    Ok(config)
}

fn print_startup_banner(config: &Config) {
    info!(name = PKG_NAME, version = VERSION, "Starting supervising proxy");
    info!(
        bind = %config.server.bind,
        port = config.server.port,
        warm_up = config.server.warm_up,
        "Server configuration"
    );
    info!(
        command = %config.backend.command,
        args = ?config.backend.args,
        working_dir = ?config.backend.working_dir,
        port = config.backend.port,
        port_env = %config.backend.port_env,
        "Backend configuration"
    );
    info!(
        health_path = %config.backend.health_path,
        health_check_interval_ms = config.backend.health_check_interval_ms,
        health_check_attempts = config.backend.health_check_attempts,
        health_check_timeout_ms = config.backend.health_check_timeout_ms,
        "Health check settings"
    );
    info!(
        shutdown_grace_period_secs = config.backend.shutdown_grace_period_secs,
        "Shutdown settings"
    );
}
