//! sqlmux router
//!
//! Runs the routing worker fleet behind one or more TCP listeners.
//!
//! This binary:
//! - Loads configuration from the environment
//! - Starts one routing worker per configured thread
//! - Relays client connections to the configured backend servers
//! - Periodically logs aggregated worker statistics and runs the watchdog
//! - Shuts the fleet down cleanly on Ctrl-C

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use sqlmux_router::config::Config;
use sqlmux_router::proxy::{Listener, PassthroughFactory};
use sqlmux_router::{Fleet, FleetConfig, Server, Service};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;

    // Initialize tracing (prefer RUST_LOG, fallback to SQLMUX_LOG_LEVEL)
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting sqlmux router");
    info!(
        threads = config.threads,
        listener_count = config.listen.len(),
        server_count = config.servers.len(),
        persist_pool_max = config.persist_pool_max,
        "Configuration loaded"
    );

    let servers: Vec<Arc<Server>> = config
        .servers
        .iter()
        .map(|s| {
            Arc::new(
                Server::new(s.name.clone(), s.address)
                    .with_pool(config.persist_pool_max, config.persist_max_time)
                    .with_connect_timeout(config.connect_timeout),
            )
        })
        .collect();

    let service = Arc::new(
        Service::new("router", servers.clone(), Arc::new(PassthroughFactory))
            .with_idle_timeout(config.idle_timeout)
            .with_write_timeout(config.write_timeout),
    );

    let fleet = Arc::new(
        Fleet::init(FleetConfig::new(config.threads)).context("Failed to initialize worker fleet")?,
    );

    for addr in &config.listen {
        let listener = Listener::bind(*addr, Arc::clone(&service))
            .with_context(|| format!("Failed to bind listener on {addr}"))?;
        fleet
            .add_listener(Arc::new(listener))
            .with_context(|| format!("Failed to register listener on {addr}"))?;
    }

    fleet.start_workers().context("Failed to start workers")?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let admin = tokio::spawn(run_admin_loop(
        Arc::clone(&fleet),
        servers,
        config.clone(),
        shutdown_rx,
    ));

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("Shutdown signal received");

    let _ = shutdown_tx.send(true);
    if let Err(e) = admin.await {
        error!(error = %e, "Admin loop failed");
    }

    let stopping = Arc::clone(&fleet);
    tokio::task::spawn_blocking(move || {
        stopping.shutdown_all();
        stopping.join_workers();
    })
    .await
    .context("Worker shutdown task failed")?;

    let fleet = Arc::try_unwrap(fleet).map_err(|_| anyhow!("Worker fleet still referenced at shutdown"))?;
    fleet.finish();

    info!("sqlmux router stopped");
    Ok(())
}

/// Periodic statistics and watchdog.
async fn run_admin_loop(
    fleet: Arc<Fleet>,
    servers: Vec<Arc<Server>>,
    config: Config,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut stats_tick = tokio::time::interval(config.stats_interval);
    stats_tick.tick().await;

    let watchdog_every = config.watchdog_interval.unwrap_or(Duration::MAX);
    let mut watchdog_tick = tokio::time::interval(watchdog_every.min(Duration::from_secs(86_400)));
    watchdog_tick.tick().await;

    loop {
        tokio::select! {
            _ = stats_tick.tick() => {
                let f = Arc::clone(&fleet);
                match tokio::task::spawn_blocking(move || f.statistics()).await {
                    Ok(stats) => info!(
                        reads = stats.n_read,
                        writes = stats.n_write,
                        errors = stats.n_error,
                        hangups = stats.n_hup,
                        accepts = stats.n_accept,
                        avg_event_queue_length = stats.evq_avg,
                        max_event_queue_length = stats.evq_max,
                        max_exec_time_ms = stats.maxexectime,
                        max_queue_time_ms = stats.maxqtime,
                        "Worker statistics"
                    ),
                    Err(e) => error!(error = %e, "Statistics task failed"),
                }

                for server in &servers {
                    let snap = server.snapshot();
                    info!(
                        server = %snap.name,
                        address = %snap.address,
                        running = snap.running,
                        current = snap.n_current,
                        total = snap.n_connections,
                        pooled = snap.n_persistent,
                        from_pool = snap.n_from_pool,
                        persistmax = snap.persistmax,
                        "Server statistics"
                    );
                }
            }
            _ = watchdog_tick.tick(), if config.watchdog_interval.is_some() => {
                let f = Arc::clone(&fleet);
                let timeout = watchdog_every;
                match tokio::task::spawn_blocking(move || f.watchdog(timeout)).await {
                    Ok(true) => {}
                    Ok(false) => warn!("Watchdog check failed"),
                    Err(e) => error!(error = %e, "Watchdog task failed"),
                }
            }
            _ = shutdown.changed() => {
                info!("Admin loop stopping");
                break;
            }
        }
    }
}
