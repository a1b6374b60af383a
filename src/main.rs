use pathgate::config::{Config, PORT_ENV};
use pathgate::gateway::{Gateway, ShutdownTrigger};
use pathgate::{PKG_NAME, VERSION};
use std::path::PathBuf;
use tracing::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("pathgate=debug".parse().expect("valid log directive")),
        )
        .init();

    // Load configuration
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("gateway.toml"));

    let mut config = Config::load(&config_path).map_err(|e| {
        error!(path = %config_path.display(), error = %e, "Failed to load configuration");
        e
    })?;

    config.apply_port_override(std::env::var(PORT_ENV).ok().as_deref())?;
    config.validate()?;

    info!(path = %config_path.display(), "Configuration loaded");

    print_startup_banner(&config);

    let gateway = Gateway::start(config).await.map_err(|e| {
        error!(error = %e, "Gateway failed to start");
        e
    })?;

    tokio::spawn(wait_for_signal(gateway.shutdown_trigger()));

    let report = gateway.run().await?;
    info!(
        signalled = report.signalled,
        backends = report.supervisor.len(),
        "Shutdown complete"
    );

    Ok(())
}

/// Trigger shutdown on SIGTERM or Ctrl+C
async fn wait_for_signal(trigger: ShutdownTrigger) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(sigterm) => sigterm,
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                return;
            }
        };

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
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            return;
        }
        info!("Received Ctrl+C, shutting down...");
    }

    trigger.trigger();
}

fn print_startup_banner(config: &Config) {
    info!(name = PKG_NAME, version = VERSION, "Starting gateway");
    info!(
        bind = %config.server.bind,
        port = config.server.port,
        backends = config.backends.len(),
        "Server configuration"
    );
    info!(
        pool_max_idle = config.server.pool_max_idle_per_host,
        pool_idle_timeout_secs = config.server.pool_idle_timeout_secs,
        "Connection pool settings"
    );
    info!(
        request_timeout_secs = config.defaults.request_timeout_secs,
        wait_for_ready = config.defaults.wait_for_ready,
        ready_timeout_secs = config.defaults.ready_timeout_secs,
        "Backend defaults"
    );
    for backend in &config.backends {
        info!(
            name = %backend.name,
            command = %backend.command,
            port = backend.port,
            prefix = %backend.path_prefix,
            stdio = ?backend.stdio,
            "Backend configured"
        );
    }
}
