use appgate::config::Config;
use appgate::credentials;
use appgate::frontend::FrontendServer;
use appgate::pool::{ConnectionPool, PoolConfig};
use appgate::process::Supervisor;
use appgate::proxy::ReverseProxy;
use appgate::{PKG_NAME, VERSION};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("appgate=debug".parse().expect("valid log directive")),
        )
        .init();

    // Load configuration
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("appgate.toml"));

    let config = Config::load(&config_path).map_err(|e| {
        error!(path = %config_path.display(), error = %e, "Failed to load configuration");
        e
    })?;

    info!(path = %config_path.display(), "Configuration loaded");

    // The credential is read once, before anything listens
    let credential = credentials::load(&config.credentials).map_err(|e| {
        error!(error = %e, "Failed to load credential");
        e
    })?;

    match credential {
        Some(ref c) => info!(env_var = c.env_var(), "Credential loaded, children will inherit it"),
        None => info!(env_var = %config.credentials.env_var, "No credential configured for children"),
    }

    print_startup_banner(&config);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let supervisor = Supervisor::new(config.descriptors(), credential);

    let pool_config = PoolConfig {
        max_idle_per_host: config.server.pool_max_idle_per_host,
        idle_timeout: Duration::from_secs(config.server.pool_idle_timeout_secs),
    };
    let pool = Arc::new(ConnectionPool::new(pool_config));

    let proxy = Arc::new(ReverseProxy::new(Arc::clone(&supervisor), pool));

    let addr: SocketAddr = format!("{}:{}", config.server.bind, config.server.port)
        .parse()
        .map_err(|e| {
            error!(bind = %config.server.bind, port = config.server.port, error = %e, "Invalid bind address");
            anyhow::anyhow!("Invalid bind address: {}", e)
        })?;

    let server = FrontendServer::bind(addr, proxy, shutdown_rx).await.map_err(|e| {
        error!(addr = %addr, error = %e, "Failed to bind front end");
        e
    })?;

    let server_handle = tokio::spawn(async move {
        if let Err(e) = server.run().await {
            error!(error = %e, "Front end server error");
        }
    });

    // Wait for shutdown signal (Ctrl+C or SIGTERM)
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
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

    let _ = shutdown_tx.send(true);

    info!("Stopping all applications...");
    supervisor.stop_all().await;

    let _ = tokio::time::timeout(Duration::from_secs(5), server_handle).await;

    info!("Shutdown complete");
    Ok(())
}

fn print_startup_banner(config: &Config) {
    info!(name = PKG_NAME, version = VERSION, "Starting application gateway");
    info!(
        bind = %config.server.bind,
        port = config.server.port,
        "Server configuration"
    );
    info!(
        pool_max_idle = config.server.pool_max_idle_per_host,
        pool_idle_timeout_secs = config.server.pool_idle_timeout_secs,
        "Connection pool settings"
    );
    info!(
        command = %config.defaults.command,
        headless = config.defaults.headless,
        startup_timeout_secs = config.defaults.startup_timeout_secs,
        poll_interval_ms = config.defaults.poll_interval_ms,
        request_timeout_secs = config.defaults.request_timeout_secs,
        "Application defaults"
    );
    for (name, app) in &config.apps {
        info!(app = %name, port = app.port, script = %app.script, "Configured application");
    }
}
