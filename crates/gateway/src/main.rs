//! Server entry point.
//!
//! Wires the quote hub, dispatcher, and upstream session pool together and
//! serves the downstream WebSocket endpoint.

use anyhow::Result;
use common::{Catalogue, ServerConfig};
use dispatcher::Dispatcher;
use gateway::{create_router, run_wake_pump, AppState, ClientRegistry};
use metrics_exporter_prometheus::PrometheusBuilder;
use quotes::QuoteHub;
use std::env;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use upstream::{FeedConnector, SessionPool, SimConnector, UpstreamSession};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("starting market data server");

    let config_path = env::var("MD_CONFIG").unwrap_or_else(|_| "config.json".to_string());
    let config = if Path::new(&config_path).exists() {
        ServerConfig::load(Path::new(&config_path))?
    } else {
        warn!(path = %config_path, "config file not found, using defaults");
        ServerConfig::default()
    };
    let metrics_port: u16 = env::var("METRICS_PORT")
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(9187);

    info!(
        port = config.port,
        upstreams = config.upstreams.len(),
        health_check_interval_secs = config.health_check_interval_secs,
        maintenance_interval_secs = config.maintenance_interval_secs,
        "configuration loaded"
    );

    PrometheusBuilder::new()
        .with_http_listener(([0, 0, 0, 0], metrics_port))
        .install()?;
    info!(port = metrics_port, "prometheus exporter up");

    // The shared-memory catalogue is informational; a missing region is
    // created empty and never blocks startup.
    match Catalogue::open_or_create() {
        Ok(catalogue) => info!(
            instruments = catalogue.len(),
            "instrument catalogue attached"
        ),
        Err(err) => warn!(%err, "running without an instrument catalogue"),
    }

    let (hub, wake_rx) = QuoteHub::new(config.cache_capacity);
    let hub = Arc::new(hub);
    let running = Arc::new(AtomicBool::new(true));

    let dispatcher = Dispatcher::new(
        config.max_retry_count,
        Duration::from_secs(config.maintenance_interval_secs),
        config.auto_failover,
    );
    let pool = SessionPool::new(
        Duration::from_secs(config.health_check_interval_secs),
        running.clone(),
    );

    // The native vendor binding is an out-of-tree drop-in behind
    // FeedConnector; the built-in simulator drives local runs.
    let connector: Arc<dyn FeedConnector> = Arc::new(SimConnector::default());
    for upstream_config in config.enabled_upstreams() {
        let session = UpstreamSession::new(
            upstream_config.clone(),
            connector.clone(),
            dispatcher.clone(),
            hub.clone(),
            running.clone(),
        );
        pool.add(session);
    }
    dispatcher.attach_pool(pool.clone());

    pool.start_all();
    dispatcher.start_maintenance();

    let state = Arc::new(AppState {
        registry: Arc::new(ClientRegistry::new()),
        dispatcher: dispatcher.clone(),
        hub,
        pool: pool.clone(),
    });

    tokio::spawn(run_wake_pump(state.clone(), wake_rx));

    let app = create_router(state);
    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let listener = TcpListener::bind(addr).await.map_err(|err| {
        error!(%addr, %err, "failed to bind downstream port");
        err
    })?;
    info!(%addr, "gateway listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("shutting down");
    running.store(false, Ordering::Release);
    dispatcher.shutdown();
    pool.stop_all();

    info!("market data server stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received ctrl+c"),
        _ = terminate => info!("received terminate signal"),
    }
}
