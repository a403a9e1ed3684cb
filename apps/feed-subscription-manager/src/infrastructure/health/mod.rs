//! Health Check and Status Endpoint
//!
//! HTTP endpoint for health checks, ledger status and Prometheus metrics.
//!
//! # Endpoints
//!
//! - `GET /health` - JSON health status with the full ledger snapshot
//! - `GET /healthz` - liveness probe (simple OK)
//! - `GET /readyz` - readiness probe (at least one feed connection up)
//! - `GET /metrics` - Prometheus metrics in text format
//! - `GET /subscriptions?tier=always_on|on_demand` - active subscriptions

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::application::services::WatchlistService;
use crate::domain::ledger::{LedgerStatus, Tier};
use crate::domain::pool::{ConnectionStatus, SlotState};
use crate::infrastructure::broadcast::TickHub;
use crate::infrastructure::metrics::get_metrics_handle;

// =============================================================================
// Health Response Types
// =============================================================================

/// Health check response.
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    /// Overall status.
    pub status: HealthStatus,
    /// Service version.
    pub version: String,
    /// Uptime in seconds.
    pub uptime_secs: u64,
    /// Current time.
    pub current_time: DateTime<Utc>,
    /// Tick consumers attached to the hub.
    pub tick_receivers: usize,
    /// Ledger and connection snapshot.
    pub ledger: LedgerStatus,
}

/// Overall health status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// Every connection is up.
    Healthy,
    /// Some connections are up.
    Degraded,
    /// No connection is up.
    Unhealthy,
}

#[derive(Debug, Deserialize)]
struct SubscriptionsQuery {
    tier: Option<String>,
}

// =============================================================================
// Health Server State
// =============================================================================

/// Shared state for the health server.
pub struct HealthServerState {
    version: String,
    started_at: Instant,
    service: Arc<WatchlistService>,
    ticks: TickHub,
}

impl HealthServerState {
    /// Create new health server state.
    #[must_use]
    pub fn new(version: String, service: Arc<WatchlistService>, ticks: TickHub) -> Self {
        Self {
            version,
            started_at: Instant::now(),
            service,
            ticks,
        }
    }
}

// =============================================================================
// Health Server
// =============================================================================

/// Health check HTTP server.
pub struct HealthServer {
    port: u16,
    state: Arc<HealthServerState>,
    cancel: CancellationToken,
}

impl HealthServer {
    /// Create a new health server.
    #[must_use]
    pub const fn new(port: u16, state: Arc<HealthServerState>, cancel: CancellationToken) -> Self {
        Self { port, state, cancel }
    }

    /// Run the health server until cancelled.
    ///
    /// # Errors
    ///
    /// Returns `HealthServerError` if binding fails or the HTTP server
    /// encounters a fatal error while running.
    pub async fn run(self) -> Result<(), HealthServerError> {
        let app = router(self.state);

        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| HealthServerError::BindFailed(self.port, e.to_string()))?;

        tracing::info!(port = self.port, "Health server listening");

        axum::serve(listener, app)
            .with_graceful_shutdown(self.cancel.cancelled_owned())
            .await
            .map_err(|e| HealthServerError::ServerFailed(e.to_string()))?;

        tracing::info!("Health server stopped");
        Ok(())
    }
}

fn router(state: Arc<HealthServerState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/healthz", get(liveness_handler))
        .route("/readyz", get(readiness_handler))
        .route("/metrics", get(metrics_handler))
        .route("/subscriptions", get(subscriptions_handler))
        .with_state(state)
}

// =============================================================================
// HTTP Handlers
// =============================================================================

async fn health_handler(State(state): State<Arc<HealthServerState>>) -> impl IntoResponse {
    let ledger = state.service.status().await;
    let status = determine_health_status(&ledger.connections);
    let status_code = match status {
        HealthStatus::Healthy | HealthStatus::Degraded => StatusCode::OK,
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };

    let response = HealthResponse {
        status,
        version: state.version.clone(),
        uptime_secs: state.started_at.elapsed().as_secs(),
        current_time: Utc::now(),
        tick_receivers: state.ticks.receiver_count(),
        ledger,
    };
    (status_code, Json(response))
}

async fn liveness_handler() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

async fn readiness_handler(State(state): State<Arc<HealthServerState>>) -> impl IntoResponse {
    let ledger = state.service.status().await;
    if connected_count(&ledger.connections) > 0 {
        (StatusCode::OK, "READY")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "NOT READY")
    }
}

async fn metrics_handler() -> impl IntoResponse {
    get_metrics_handle().map_or_else(
        || {
            (
                StatusCode::SERVICE_UNAVAILABLE,
                [("content-type", "text/plain")],
                "Metrics not initialized".to_string(),
            )
        },
        |handle| {
            (
                StatusCode::OK,
                [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
                handle.render(),
            )
        },
    )
}

async fn subscriptions_handler(
    State(state): State<Arc<HealthServerState>>,
    Query(query): Query<SubscriptionsQuery>,
) -> Response {
    let tier = match parse_tier(query.tier.as_deref()) {
        Ok(tier) => tier,
        Err(message) => return (StatusCode::BAD_REQUEST, message).into_response(),
    };
    Json(state.service.list_active_subscriptions(tier).await).into_response()
}

fn parse_tier(raw: Option<&str>) -> Result<Option<Tier>, String> {
    match raw.map(str::trim) {
        None | Some("") => Ok(None),
        Some(value) => value.parse().map(Some),
    }
}

fn connected_count(connections: &[ConnectionStatus]) -> usize {
    connections
        .iter()
        .filter(|c| c.state == SlotState::Connected)
        .count()
}

fn determine_health_status(connections: &[ConnectionStatus]) -> HealthStatus {
    match connected_count(connections) {
        0 => HealthStatus::Unhealthy,
        n if n == connections.len() => HealthStatus::Healthy,
        _ => HealthStatus::Degraded,
    }
}

// =============================================================================
// Errors
// =============================================================================

/// Health server errors.
#[derive(Debug, thiserror::Error)]
pub enum HealthServerError {
    /// Failed to bind to port.
    #[error("failed to bind to port {0}: {1}")]
    BindFailed(u16, String),

    /// Server error.
    #[error("server error: {0}")]
    ServerFailed(String),
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn slot(id: u16, state: SlotState) -> ConnectionStatus {
        ConnectionStatus {
            id,
            state,
            load: 0,
            capacity: 5000,
            reconnect_attempts: 0,
            last_error: None,
            last_connected_at: None,
        }
    }

    #[test]
    fn health_status_serialization() {
        assert_eq!(serde_json::to_string(&HealthStatus::Healthy).unwrap(), "\"healthy\"");
        assert_eq!(serde_json::to_string(&HealthStatus::Unhealthy).unwrap(), "\"unhealthy\"");
    }

    #[test]
    fn status_follows_connected_slots() {
        let all_up = [slot(0, SlotState::Connected), slot(1, SlotState::Connected)];
        assert_eq!(determine_health_status(&all_up), HealthStatus::Healthy);

        let partial = [slot(0, SlotState::Connected), slot(1, SlotState::Reconnecting)];
        assert_eq!(determine_health_status(&partial), HealthStatus::Degraded);

        let starting = [slot(0, SlotState::Connecting), slot(1, SlotState::Degraded)];
        assert_eq!(determine_health_status(&starting), HealthStatus::Unhealthy);
        assert_eq!(connected_count(&starting), 0);
    }

    #[test]
    fn tier_query_parsing() {
        assert_eq!(parse_tier(None), Ok(None));
        assert_eq!(parse_tier(Some(" ")), Ok(None));
        assert_eq!(parse_tier(Some("always_on")), Ok(Some(Tier::AlwaysOn)));
        assert_eq!(parse_tier(Some("ON_DEMAND")), Ok(Some(Tier::OnDemand)));
        assert!(parse_tier(Some("weekly")).is_err());
    }
}
