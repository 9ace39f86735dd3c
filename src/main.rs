use edge_router::config::Config;
use edge_router::forward::{Forwarder, PoolConfig};
use edge_router::ports::PortAllocator;
use edge_router::registry::WorkerRegistry;
use edge_router::router::RouterServer;
use edge_router::supervisor::Supervisor;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};

const PKG_NAME: &str = env!("CARGO_PKG_NAME");
const VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("edge_router=debug".parse().expect("valid log directive")),
        )
        .init();

    let config = load_config().map_err(|e| {
        error!(error = %e, "Failed to load configuration");
        e
    })?;

    print_startup_banner(&config);

    let catalog = config.functions.catalog();
    if catalog.is_empty() {
        warn!("No functions configured, every function request will be rejected");
    }

    let bind_ip: IpAddr = config
        .server
        .bind
        .parse()
        .map_err(|e| anyhow::anyhow!("Invalid bind address '{}': {}", config.server.bind, e))?;
    let bind_addr = SocketAddr::new(bind_ip, config.server.port);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let supervisor = Supervisor::new(
        config.runtime.clone(),
        config.functions.dir.clone(),
        config.functions.worker_host.clone(),
    );
    let registry = WorkerRegistry::new(PortAllocator::new(config.functions.base_port), supervisor);

    let pool_config = PoolConfig {
        max_idle_per_host: config.server.pool_max_idle_per_host,
        idle_timeout: config.server.pool_idle_timeout(),
    };
    let forwarder = Forwarder::new(
        pool_config,
        config.functions.worker_host.clone(),
        config.server.request_timeout(),
    );
    let forward_stats = forwarder.stats();

    let router = RouterServer::new(bind_addr, catalog, Arc::clone(&registry), forwarder, shutdown_rx);
    let mut router_handle = tokio::spawn(router.run());

    // Wait for shutdown signal (Ctrl+C or SIGTERM), or for the router to fail
    tokio::select! {
        result = &mut router_handle => {
            registry.stop_all().await;
            return match result {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => {
                    error!(addr = %bind_addr, error = %e, "Router failed");
                    Err(e)
                }
                Err(e) => Err(anyhow::anyhow!("Router task failed: {}", e)),
            };
        }
        _ = shutdown_signal() => {}
    }

    let _ = shutdown_tx.send(true);

    info!(
        spawns = registry.spawn_count(),
        forwarded = forward_stats.get_total_requests(),
        failed = forward_stats.get_failed_requests(),
        "Request statistics"
    );

    info!(workers = ?registry.snapshot_names(), "Stopping all workers...");
    registry.stop_all().await;

    // Wait for the accept loop to stop (with timeout)
    let _ = tokio::time::timeout(Duration::from_secs(5), router_handle).await;

    info!("Shutdown complete");
    Ok(())
}

/// Config file from the first argument if given, then environment overrides
fn load_config() -> anyhow::Result<Config> {
    let Some(path) = std::env::args().nth(1).map(PathBuf::from) else {
        return Config::from_env();
    };

    let mut config = Config::load(&path)
        .map_err(|e| anyhow::anyhow!("Failed to read {}: {}", path.display(), e))?;
    info!(path = %path.display(), "Configuration loaded");
    config.apply_env()?;
    config.validate()?;
    Ok(config)
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(sigterm) => sigterm,
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler, only Ctrl+C will stop the router");
                let _ = tokio::signal::ctrl_c().await;
                info!("Received SIGINT (Ctrl+C), shutting down...");
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
        let _ = tokio::signal::ctrl_c().await;
        info!("Received Ctrl+C, shutting down...");
    }
}

fn print_startup_banner(config: &Config) {
    info!(name = PKG_NAME, version = VERSION, "Starting edge router");
    info!(
        bind = %config.server.bind,
        port = config.server.port,
        request_timeout_secs = config.server.request_timeout_secs,
        "Server configuration"
    );
    info!(
        pool_max_idle = config.server.pool_max_idle_per_host,
        pool_idle_timeout_secs = config.server.pool_idle_timeout_secs,
        "Connection pool settings"
    );
    info!(
        dir = %config.functions.dir.display(),
        base_port = config.functions.base_port,
        worker_host = %config.functions.worker_host,
        functions = ?config.functions.catalog(),
        "Function catalog"
    );
    info!(
        command = %config.runtime.command,
        args = ?config.runtime.args,
        startup_timeout_secs = config.runtime.startup_timeout_secs,
        probe_interval_ms = config.runtime.probe_interval_ms,
        settle_ms = config.runtime.settle_ms,
        shutdown_grace_period_secs = config.runtime.shutdown_grace_period_secs,
        "Runtime settings"
    );
}
