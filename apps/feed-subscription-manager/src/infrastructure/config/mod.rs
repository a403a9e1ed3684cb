//! Configuration Module
//!
//! Environment-driven configuration for the subscription manager.

mod settings;

pub use settings::{
    CatalogSettings, ConfigError, Credentials, FeedSettings, PoolSettings, ServerSettings,
    ServiceConfig, SessionSettings,
};
