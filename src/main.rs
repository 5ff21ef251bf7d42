use gostly::admin::{AdminServer, PKG_NAME, VERSION};
use gostly::app::GostlyHandle;
use gostly::config::Config;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("gostly=debug".parse()?),
        )
        .init();

    // Load configuration
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("gostly.toml"));

    let config = Config::load_or_default(&config_path).map_err(|e| {
        error!(path = %config_path.display(), error = %e, "Failed to load configuration");
        e
    })?;

    info!(path = %config_path.display(), "Configuration loaded");
    print_startup_banner(&config);

    let database_path = config.server.database_path();
    let handle = GostlyHandle::new(config.clone());
    let gostly = handle.get().await.map_err(|e| {
        error!(path = %database_path.display(), error = %e, "Failed to open database");
        e
    })?;
    info!(path = %database_path.display(), "Database opened");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let admin_addr: SocketAddr = format!("{}:{}", config.server.admin_bind, config.server.admin_port)
        .parse()
        .map_err(|e| {
            error!(
                admin_bind = %config.server.admin_bind,
                admin_port = config.server.admin_port,
                error = %e,
                "Invalid control API bind address"
            );
            anyhow::anyhow!("Invalid control API bind address: {}", e)
        })?;

    // Generate or use configured admin token
    let admin_token = config.server.admin_token.clone().unwrap_or_else(|| {
        let token = uuid::Uuid::new_v4().to_string();
        info!(token = %token, "Generated control API token (configure admin_token to set a fixed value)");
        token
    });

    let admin_server = AdminServer::new(admin_addr, Arc::clone(&gostly), shutdown_rx, admin_token);
    let admin_handle = tokio::spawn(async move {
        if let Err(e) = admin_server.run().await {
            error!(error = %e, "Control API error");
        }
    });

    if let Some(listen) = config.router.listen.as_deref() {
        if let Err(e) = gostly.start_router(listen).await {
            warn!(addr = %listen, error = %e, "Host router did not start");
        }
    }

    wait_for_signal().await?;

    info!("Stopping host router and workers...");
    gostly.close().await;

    let _ = shutdown_tx.send(true);
    if tokio::time::timeout(Duration::from_secs(5), admin_handle).await.is_err() {
        warn!("Control API did not stop within 5s");
    }

    info!("Shutdown complete");
    Ok(())
}

/// Block until Ctrl+C, or SIGTERM on unix
async fn wait_for_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;

        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                result?;
                info!("Received SIGINT (Ctrl+C), shutting down...");
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        info!("Received Ctrl+C, shutting down...");
    }

    Ok(())
}

fn print_startup_banner(config: &Config) {
    info!(name = PKG_NAME, version = VERSION, "Starting gostly");
    info!(
        admin = %format!("{}:{}", config.server.admin_bind, config.server.admin_port),
        router = config.router.listen.as_deref().unwrap_or("(stopped)"),
        default_origin = %config.router.default_origin,
        "Listeners"
    );
    info!(
        command = %config.worker.command,
        scratch_dir = %config.worker.scratch_dir().display(),
        shutdown_grace_secs = config.worker.shutdown_grace().as_secs(),
        "Worker settings"
    );
}
