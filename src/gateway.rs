//! Gateway lifecycle: launch backends, register routes, serve, shut down
//!
//! A [`Gateway`] is an ordinary value; several can run in one process, each
//! with its own subprocesses, route table and listener.

use crate::config::Config;
use crate::error::GatewayError;
use crate::pool::PoolConfig;
use crate::process::{wait_for_port, Supervisor};
use crate::proxy::ProxyServer;
use crate::router::{Route, RouteTable};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Lifecycle of a gateway; transitions only move forward
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum GatewayState {
    Initializing,
    Listening,
    ShuttingDown,
    Terminated,
}

/// Cloneable handle that asks a running gateway to shut down
#[derive(Clone)]
pub struct ShutdownTrigger {
    tx: Arc<watch::Sender<bool>>,
}

impl ShutdownTrigger {
    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_triggered(&self) -> bool {
        *self.tx.borrow()
    }
}

/// Outcome of [`Gateway::run`]
pub struct ShutdownReport {
    /// Subprocesses that received a termination signal during shutdown
    pub signalled: usize,
    /// The subprocesses, handed back so callers can observe their exit
    pub supervisor: Supervisor,
}

pub struct Gateway {
    supervisor: Supervisor,
    server: ProxyServer,
    state_tx: watch::Sender<GatewayState>,
    shutdown_tx: Arc<watch::Sender<bool>>,
    shutdown_rx: watch::Receiver<bool>,
}

impl Gateway {
    /// Launch every backend, register its route and bind the public listener.
    ///
    /// Any failure is fatal; children already launched are killed when the
    /// partially built gateway is dropped.
    pub async fn start(config: Config) -> Result<Self, GatewayError> {
        let (state_tx, _) = watch::channel(GatewayState::Initializing);

        config
            .validate()
            .map_err(|e| GatewayError::Config(e.to_string()))?;

        let bind_addr: SocketAddr = format!("{}:{}", config.server.bind, config.server.port)
            .parse()
            .map_err(|e| {
                GatewayError::Config(format!(
                    "invalid bind address {}:{}: {}",
                    config.server.bind, config.server.port, e
                ))
            })?;

        let mut routes = RouteTable::new();
        for backend in &config.backends {
            routes.register(Route::from_backend(backend, &config.defaults))?;
        }

        let supervisor = Supervisor::launch_all(&config.backends)?;

        if config.defaults.wait_for_ready {
            let timeout = Duration::from_secs(config.defaults.ready_timeout_secs);
            for subprocess in supervisor.iter() {
                if wait_for_port(subprocess.port(), timeout).await {
                    info!(name = subprocess.name(), port = subprocess.port(), "Backend accepting connections");
                } else {
                    warn!(
                        name = subprocess.name(),
                        port = subprocess.port(),
                        timeout_secs = timeout.as_secs(),
                        "Backend not reachable yet, continuing startup"
                    );
                }
            }
        }

        let pool_config = PoolConfig {
            max_idle_per_host: config.server.pool_max_idle_per_host,
            idle_timeout: Duration::from_secs(config.server.pool_idle_timeout_secs),
        };

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let server = ProxyServer::bind(
            bind_addr,
            routes,
            pool_config,
            config.server.health_message.clone(),
            shutdown_rx.clone(),
        )
        .await?;

        for route in server.routes().routes() {
            info!(
                name = %route.name,
                prefix = %route.path_prefix,
                port = route.target_port,
                websocket = route.allow_websocket,
                "Route registered"
            );
        }

        state_tx.send_replace(GatewayState::Listening);
        info!(
            addr = %server.local_addr(),
            backends = supervisor.len(),
            "Gateway listening"
        );

        Ok(Self {
            supervisor,
            server,
            state_tx,
            shutdown_tx: Arc::new(shutdown_tx),
            shutdown_rx,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.server.local_addr()
    }

    pub fn state(&self) -> GatewayState {
        *self.state_tx.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<GatewayState> {
        self.state_tx.subscribe()
    }

    pub fn supervisor(&self) -> &Supervisor {
        &self.supervisor
    }

    pub fn routes(&self) -> &RouteTable {
        self.server.routes()
    }

    pub fn shutdown_trigger(&self) -> ShutdownTrigger {
        ShutdownTrigger {
            tx: Arc::clone(&self.shutdown_tx),
        }
    }

    /// Serve until shutdown is triggered, then signal every subprocess once.
    ///
    /// In-flight requests are not cancelled; their backends may go away
    /// underneath them.
    pub async fn run(self) -> anyhow::Result<ShutdownReport> {
        let Gateway {
            supervisor,
            server,
            state_tx,
            shutdown_tx,
            mut shutdown_rx,
        } = self;

        let server_handle = tokio::spawn(server.run());

        // `shutdown_tx` is held for the whole call, so this only ends on trigger
        let _ = shutdown_rx.wait_for(|triggered| *triggered).await;
        state_tx.send_replace(GatewayState::ShuttingDown);
        info!("Shutdown requested, stopping backends");

        let signalled = supervisor.kill_all();
        for subprocess in supervisor.iter() {
            debug!(
                name = subprocess.name(),
                command = subprocess.command(),
                pid = ?subprocess.pid(),
                state = ?subprocess.state(),
                "Backend state at shutdown"
            );
        }
        info!(signalled, total = supervisor.len(), "Backends signalled");

        match server_handle.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(error = %e, "Proxy server stopped with error"),
            Err(e) => warn!(error = %e, "Proxy server task failed"),
        }

        drop(shutdown_tx);
        state_tx.send_replace(GatewayState::Terminated);
        info!("Gateway terminated");

        Ok(ShutdownReport {
            signalled,
            supervisor,
        })
    }
}
