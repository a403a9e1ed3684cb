//! Prometheus Metrics Module
//!
//! # Metrics Categories
//!
//! - **Subscriptions**: active counts by tier, utilization, queued instruments
//! - **Connections**: per-connection load, reconnect attempts, ticks
//! - **Churn**: subscribes, unsubscribes, evictions, capacity rejections
//! - **Session**: end-of-day clears
//!
//! Exposed at `/metrics` on the health server port. Recording functions are
//! no-ops until [`init_metrics`] installs the recorder.

use std::sync::OnceLock;

use metrics::{counter, describe_counter, describe_gauge, gauge};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

use crate::domain::ledger::{AuditAction, LedgerEffects, LedgerStatus};
use crate::domain::pool::ConnectionId;

// =============================================================================
// Global Metrics Handle
// =============================================================================

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Initialize the Prometheus metrics recorder.
///
/// # Panics
///
/// Panics if the recorder cannot be installed.
#[allow(clippy::expect_used)]
pub fn init_metrics() -> PrometheusHandle {
    PROMETHEUS_HANDLE
        .get_or_init(|| {
            let handle = PrometheusBuilder::new()
                .install_recorder()
                .expect("failed to install Prometheus recorder");

            register_metrics();
            handle
        })
        .clone()
}

/// Get the Prometheus handle for rendering metrics.
///
/// Returns `None` if metrics have not been initialized.
#[must_use]
pub fn get_metrics_handle() -> Option<PrometheusHandle> {
    PROMETHEUS_HANDLE.get().cloned()
}

// =============================================================================
// Metric Registration
// =============================================================================

fn register_metrics() {
    describe_gauge!(
        "feed_manager_subscriptions_active",
        "Active subscriptions by tier"
    );
    describe_gauge!(
        "feed_manager_subscriptions_pending",
        "Active subscriptions waiting for a connection"
    );
    describe_gauge!(
        "feed_manager_utilization_ratio",
        "Active subscriptions divided by the global ceiling"
    );
    describe_gauge!(
        "feed_manager_connection_load",
        "Instruments assigned to each feed connection"
    );

    describe_counter!(
        "feed_manager_subscribes_total",
        "Instruments accepted into the ledger"
    );
    describe_counter!(
        "feed_manager_unsubscribes_total",
        "Instruments released from the ledger"
    );
    describe_counter!(
        "feed_manager_evicted_groups_total",
        "Watchlist groups evicted to make room"
    );
    describe_counter!(
        "feed_manager_evicted_instruments_total",
        "Instruments evicted to make room"
    );
    describe_counter!(
        "feed_manager_rejections_total",
        "Subscribe requests rejected, by error kind"
    );
    describe_counter!(
        "feed_manager_reconnects_total",
        "Feed reconnection attempts"
    );
    describe_counter!(
        "feed_manager_ticks_received_total",
        "Frames received per feed connection"
    );
    describe_counter!(
        "feed_manager_eod_clears_total",
        "End-of-day clears executed"
    );
}

// =============================================================================
// Metric Recording Functions
// =============================================================================

/// Publish ledger gauges from a status snapshot.
#[allow(clippy::cast_precision_loss)]
pub fn record_ledger_status(status: &LedgerStatus) {
    gauge!("feed_manager_subscriptions_active", "tier" => "always_on").set(status.always_on as f64);
    gauge!("feed_manager_subscriptions_active", "tier" => "on_demand").set(status.on_demand as f64);
    gauge!("feed_manager_subscriptions_pending").set(status.pending as f64);
    gauge!("feed_manager_utilization_ratio").set(status.utilization);

    for connection in &status.connections {
        gauge!(
            "feed_manager_connection_load",
            "connection" => connection.id.to_string()
        )
        .set(connection.load as f64);
    }
}

/// Count churn from a batch of ledger effects.
pub fn record_effects(effects: &LedgerEffects) {
    let mut subscribes = 0u64;
    let mut unsubscribes = 0u64;
    for entry in &effects.audit {
        match entry.action {
            AuditAction::Subscribe => subscribes += 1,
            AuditAction::Unsubscribe | AuditAction::Evict => unsubscribes += 1,
            AuditAction::Rebalance | AuditAction::BulkClear => {}
        }
    }

    if subscribes > 0 {
        counter!("feed_manager_subscribes_total").increment(subscribes);
    }
    if unsubscribes > 0 {
        counter!("feed_manager_unsubscribes_total").increment(unsubscribes);
    }
    if !effects.evicted_groups.is_empty() {
        counter!("feed_manager_evicted_groups_total").increment(effects.evicted_groups.len() as u64);
        counter!("feed_manager_evicted_instruments_total").increment(effects.evicted_instruments as u64);
    }
}

/// Record a rejected subscribe request.
pub fn record_rejection(kind: &'static str) {
    counter!("feed_manager_rejections_total", "kind" => kind).increment(1);
}

/// Record a feed reconnection attempt.
pub fn record_reconnect(connection: ConnectionId) {
    counter!(
        "feed_manager_reconnects_total",
        "connection" => connection.to_string()
    )
    .increment(1);
}

/// Record a frame received on a feed connection.
pub fn record_tick(connection: ConnectionId) {
    counter!(
        "feed_manager_ticks_received_total",
        "connection" => connection.to_string()
    )
    .increment(1);
}

/// Record an end-of-day clear.
pub fn record_eod_clear() {
    counter!("feed_manager_eod_clears_total").increment(1);
}
