//! Infrastructure Layer - Adapters and external integrations.
//!
//! Concrete implementations of the application ports plus the process
//! plumbing around them.

/// Upstream WebSocket clients, reconnect policy and command transport.
pub mod feed;

/// Tick fan-out to downstream consumers.
pub mod broadcast;

/// Environment-driven configuration.
pub mod config;

/// Health, status and metrics HTTP endpoint.
pub mod health;

/// Prometheus metrics instrumentation.
pub mod metrics;

/// Repository and run-marker adapters.
pub mod persistence;

/// Logging and OpenTelemetry tracing.
pub mod telemetry;
