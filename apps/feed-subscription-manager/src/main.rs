//! Feed Subscription Manager Binary
//!
//! Loads the instrument catalog, opens the feed connection pool, preloads
//! the always-on set and keeps subscriptions within capacity until shutdown.
//!
//! # Usage
//!
//! ```bash
//! cargo run --bin feed-subscription-manager
//! ```
//!
//! # Environment Variables
//!
//! ## Required
//! - `FEED_API_KEY`: upstream API key
//! - `FEED_ACCESS_TOKEN`: upstream session token
//!
//! ## Optional
//! - `FEED_WS_URL`: upstream WebSocket URL (default: wss://ws.kite.trade)
//! - `FEED_CONNECTIONS`: connection pool size (default: 5)
//! - `FEED_CONNECTION_CAPACITY`: instruments per connection (default: 5000)
//! - `FEED_GLOBAL_CAPACITY`: global ceiling (default: connections × capacity)
//! - `INSTRUMENT_CATALOG_PATH`: JSON Lines catalog (default: data/instruments.jsonl)
//! - `ALWAYS_ON_SYMBOLS`: comma-separated trading symbols
//! - `SESSION_CLEAR_TIME`: local end-of-day clear time (default: 15:35)
//! - `HEALTH_PORT`: health/status HTTP port (default: 8083)
//! - `OTEL_ENABLED`, `OTEL_EXPORTER_OTLP_ENDPOINT`, `OTEL_SERVICE_NAME`
//! - `RUST_LOG`: log filter

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use feed_subscription_manager::application::ports::{
    RunMarkerStore, SubscriptionLogRepository, WatchlistRepository,
};
use feed_subscription_manager::infrastructure::broadcast::TickHub;
use feed_subscription_manager::infrastructure::feed::{
    ChannelFeedTransport, FeedClient, FeedClientConfig, ReconnectConfig,
};
use feed_subscription_manager::infrastructure::health::{HealthServer, HealthServerState};
use feed_subscription_manager::infrastructure::persistence::{
    FileRunMarkerStore, InMemorySubscriptionLog, InMemoryWatchlistRepository,
};
use feed_subscription_manager::infrastructure::telemetry;
use feed_subscription_manager::{
    AtmEngine, ConnectionEvent, ConnectionPool, InstrumentRegistry, ServiceConfig,
    SessionScheduler, SubscriptionLedger, WatchlistService, init_metrics,
};
use tokio::signal;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

/// Graceful shutdown timeout.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// Buffered connection events.
const EVENT_CHANNEL_CAPACITY: usize = 256;

#[tokio::main]
#[allow(clippy::expect_used, clippy::too_many_lines)]
async fn main() -> anyhow::Result<()> {
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("Failed to install rustls crypto provider");

    load_dotenv();

    let _telemetry_guard = telemetry::init();

    tracing::info!("Starting feed subscription manager");

    let _metrics_handle = init_metrics();

    let config = ServiceConfig::from_env().context("invalid configuration")?;
    log_config(&config);

    let (registry, report) = InstrumentRegistry::from_path(&config.catalog.path)
        .with_context(|| format!("loading catalog {}", config.catalog.path.display()))?;
    tracing::info!(
        loaded = report.loaded,
        skipped = report.skipped,
        path = %config.catalog.path.display(),
        "Instrument catalog loaded"
    );
    let registry = Arc::new(registry);

    let shutdown_token = CancellationToken::new();
    let tracker = TaskTracker::new();

    // Subscription core
    let atm = Arc::new(AtmEngine::new(Arc::clone(&registry), config.catalog.strike_window));
    let ledger = SubscriptionLedger::new(
        ConnectionPool::new(config.pool.connections, config.pool.connection_capacity),
        config.pool.global_capacity,
    );
    let (transport, command_receivers) = ChannelFeedTransport::new(config.pool.connections);

    let watchlist: Arc<dyn WatchlistRepository> = Arc::new(InMemoryWatchlistRepository::new());
    let audit_log: Arc<dyn SubscriptionLogRepository> = Arc::new(InMemorySubscriptionLog::default());
    let marker: Arc<dyn RunMarkerStore> =
        Arc::new(FileRunMarkerStore::new(config.session.marker_path.clone()));

    let service = Arc::new(WatchlistService::new(
        Arc::clone(&registry),
        atm,
        ledger,
        watchlist,
        audit_log,
        Arc::new(transport),
    ));

    service.restore().await.context("restoring watchlist")?;
    let preload = service.preload_always_on(&config.catalog.always_on_symbols).await;
    if !preload.failed.is_empty() {
        tracing::warn!(
            failed = preload.failed.len(),
            requested = preload.requested,
            "Some always-on instruments were not subscribed"
        );
    }

    // Connection events
    let (event_tx, event_rx) = mpsc::channel::<ConnectionEvent>(EVENT_CHANNEL_CAPACITY);
    tracker.spawn(handle_connection_events(event_rx, Arc::clone(&service)));

    // Feed clients, one per slot
    let tick_hub = TickHub::new(config.feed.tick_channel_capacity);
    let feed_url = config.feed_url();
    let reconnect = ReconnectConfig::from_feed_settings(&config.feed);
    for (connection_id, commands) in (0..config.pool.connections).zip(command_receivers) {
        let client = FeedClient::new(
            FeedClientConfig::new(connection_id, feed_url.clone(), reconnect.clone()),
            commands,
            event_tx.clone(),
            tick_hub.clone(),
            shutdown_token.clone(),
        );
        tracker.spawn(async move {
            if let Err(e) = client.run().await {
                tracing::error!(connection_id, error = %e, "Feed client stopped with error");
            }
        });
    }
    drop(event_tx);

    // Session scheduler
    let scheduler = SessionScheduler::new(
        Arc::clone(&service),
        marker,
        config.session.clear_at,
        config.session.utc_offset,
    );
    tracker.spawn(scheduler.run(shutdown_token.clone()));

    // Reconciliation
    tracker.spawn(run_reconciliation(
        Arc::clone(&service),
        config.session.reconcile_interval,
        shutdown_token.clone(),
    ));

    // Health server
    let health_state = Arc::new(HealthServerState::new(
        env!("CARGO_PKG_VERSION").to_string(),
        Arc::clone(&service),
        tick_hub,
    ));
    let health_server = HealthServer::new(config.server.health_port, health_state, shutdown_token.clone());
    tracker.spawn(async move {
        if let Err(e) = health_server.run().await {
            tracing::error!(error = %e, "Health server error");
        }
    });

    tracker.close();
    tracing::info!("Feed subscription manager ready");

    await_shutdown(shutdown_token).await;

    if tokio::time::timeout(SHUTDOWN_TIMEOUT, tracker.wait()).await.is_err() {
        tracing::warn!("Shutdown timed out with tasks still running");
    }

    tracing::info!("Feed subscription manager stopped");
    Ok(())
}

/// Apply connection lifecycle events to the ledger.
async fn handle_connection_events(mut rx: mpsc::Receiver<ConnectionEvent>, service: Arc<WatchlistService>) {
    while let Some(event) = rx.recv().await {
        let connection_id = event.connection();
        let report = service.on_connection_event(event).await;
        if report.moved > 0 || report.queued > 0 {
            tracing::info!(
                connection_id,
                moved = report.moved,
                queued = report.queued,
                "Subscriptions rebalanced after connection event"
            );
        }
    }
}

/// Periodically assign queued instruments.
async fn run_reconciliation(service: Arc<WatchlistService>, period: Duration, cancel: CancellationToken) {
    let mut interval = tokio::time::interval(period.max(Duration::from_secs(1)));
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            () = cancel.cancelled() => return,
            _ = interval.tick() => {
                let report = service.reconcile().await;
                if report.moved > 0 {
                    tracing::info!(moved = report.moved, queued = report.queued, "Reconciled queued subscriptions");
                } else if report.queued > 0 {
                    tracing::debug!(queued = report.queued, "Subscriptions still waiting for a connection");
                }
            }
        }
    }
}

/// Load .env file from current or ancestor directories.
fn load_dotenv() {
    if dotenvy::dotenv().is_ok() {
        return;
    }

    if let Ok(cwd) = std::env::current_dir() {
        let mut dir = cwd.as_path();
        while let Some(parent) = dir.parent() {
            let env_path = parent.join(".env");
            if env_path.exists() {
                let _ = dotenvy::from_path(&env_path);
                return;
            }
            dir = parent;
        }
    }
}

/// Log the parsed configuration.
fn log_config(config: &ServiceConfig) {
    tracing::info!(
        connections = config.pool.connections,
        connection_capacity = config.pool.connection_capacity,
        global_capacity = config.pool.global_capacity,
        always_on = config.catalog.always_on_symbols.len(),
        clear_at = %config.session.clear_at,
        health_port = config.server.health_port,
        "Configuration loaded"
    );
    tracing::debug!(url = %config.feed.url, "Feed endpoint");
}

/// Wait for shutdown signal (SIGTERM or SIGINT).
#[allow(clippy::expect_used)]
async fn await_shutdown(shutdown_token: CancellationToken) {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("signal handler installation is critical for graceful shutdown");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("SIGTERM handler installation is critical for graceful shutdown")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating shutdown");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM, initiating shutdown");
        }
    }

    shutdown_token.cancel();

    tracing::info!(
        timeout_secs = SHUTDOWN_TIMEOUT.as_secs(),
        "Graceful shutdown started"
    );
}
