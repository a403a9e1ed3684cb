//! Service Configuration Settings
//!
//! Configuration types for the subscription manager, loaded from environment
//! variables.

use std::path::PathBuf;
use std::time::Duration;

use chrono::{FixedOffset, NaiveTime, Offset, Utc};

use crate::domain::strikes::StrikeWindowConfig;

/// Upstream feed credentials.
#[derive(Clone)]
pub struct Credentials {
    api_key: String,
    access_token: String,
}

impl Credentials {
    /// Create new credentials.
    #[must_use]
    pub const fn new(api_key: String, access_token: String) -> Self {
        Self {
            api_key,
            access_token,
        }
    }

    /// Get the API key.
    #[must_use]
    pub fn api_key(&self) -> &str {
        &self.api_key
    }

    /// Get the session access token.
    #[must_use]
    pub fn access_token(&self) -> &str {
        &self.access_token
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("api_key", &"[REDACTED]")
            .field("access_token", &"[REDACTED]")
            .finish()
    }
}

/// Feed WebSocket settings.
#[derive(Debug, Clone)]
pub struct FeedSettings {
    /// Base WebSocket URL.
    pub url: String,
    /// Initial reconnection delay.
    pub reconnect_delay_initial: Duration,
    /// Maximum reconnection delay.
    pub reconnect_delay_max: Duration,
    /// Reconnection delay multiplier for exponential backoff.
    pub reconnect_delay_multiplier: f64,
    /// Reconnection attempts before a connection is marked degraded.
    pub max_reconnect_attempts: u32,
    /// Capacity of the tick broadcast channel.
    pub tick_channel_capacity: usize,
}

impl Default for FeedSettings {
    fn default() -> Self {
        Self {
            url: "wss://ws.kite.trade".to_string(),
            reconnect_delay_initial: Duration::from_millis(500),
            reconnect_delay_max: Duration::from_secs(30),
            reconnect_delay_multiplier: 2.0,
            max_reconnect_attempts: 10,
            tick_channel_capacity: 50_000,
        }
    }
}

/// Connection pool sizing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolSettings {
    /// Number of upstream connections.
    pub connections: u16,
    /// Instruments per connection.
    pub connection_capacity: usize,
    /// Global ceiling across all connections.
    pub global_capacity: usize,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            connections: 5,
            connection_capacity: 5_000,
            global_capacity: 25_000,
        }
    }
}

/// Instrument catalog and strike window settings.
#[derive(Debug, Clone)]
pub struct CatalogSettings {
    /// JSON Lines catalog path.
    pub path: PathBuf,
    /// Trading symbols subscribed as always-on at startup.
    pub always_on_symbols: Vec<String>,
    /// Strike window sizing.
    pub strike_window: StrikeWindowConfig,
}

impl Default for CatalogSettings {
    fn default() -> Self {
        Self {
            path: PathBuf::from("data/instruments.jsonl"),
            always_on_symbols: vec!["NIFTY 50".to_string(), "NIFTY BANK".to_string()],
            strike_window: StrikeWindowConfig::default(),
        }
    }
}

/// Session lifecycle settings.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    /// Local time of the end-of-day clear.
    pub clear_at: NaiveTime,
    /// Exchange UTC offset.
    pub utc_offset: FixedOffset,
    /// Run marker file.
    pub marker_path: PathBuf,
    /// Interval of the reconciliation pass.
    pub reconcile_interval: Duration,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            clear_at: NaiveTime::from_hms_opt(15, 35, 0).unwrap_or(NaiveTime::MIN),
            utc_offset: FixedOffset::east_opt(330 * 60).unwrap_or_else(|| Utc.fix()),
            marker_path: PathBuf::from("data/session_marker.json"),
            reconcile_interval: Duration::from_secs(60),
        }
    }
}

/// Server port settings.
#[derive(Debug, Clone)]
pub struct ServerSettings {
    /// Health check HTTP port.
    pub health_port: u16,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self { health_port: 8083 }
    }
}

/// Complete service configuration.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Feed credentials.
    pub credentials: Credentials,
    /// Feed WebSocket settings.
    pub feed: FeedSettings,
    /// Connection pool sizing.
    pub pool: PoolSettings,
    /// Catalog and strike windows.
    pub catalog: CatalogSettings,
    /// Session lifecycle.
    pub session: SessionSettings,
    /// Server port settings.
    pub server: ServerSettings,
}

impl ServiceConfig {
    /// Create configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if required environment variables are missing or a
    /// value is out of range.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Create configuration from an arbitrary key lookup.
    ///
    /// # Errors
    ///
    /// Same as [`from_env`](Self::from_env).
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let env = Env(&lookup);

        let api_key = env.required("FEED_API_KEY")?;
        let access_token = env.required("FEED_ACCESS_TOKEN")?;

        let feed_defaults = FeedSettings::default();
        let feed = FeedSettings {
            url: env.string("FEED_WS_URL").unwrap_or(feed_defaults.url),
            reconnect_delay_initial: env.duration_millis(
                "FEED_RECONNECT_DELAY_INITIAL_MS",
                feed_defaults.reconnect_delay_initial,
            ),
            reconnect_delay_max: env.duration_secs(
                "FEED_RECONNECT_DELAY_MAX_SECS",
                feed_defaults.reconnect_delay_max,
            ),
            reconnect_delay_multiplier: env.parse(
                "FEED_RECONNECT_DELAY_MULTIPLIER",
                feed_defaults.reconnect_delay_multiplier,
            ),
            max_reconnect_attempts: env.parse(
                "FEED_MAX_RECONNECT_ATTEMPTS",
                feed_defaults.max_reconnect_attempts,
            ),
            tick_channel_capacity: env.parse(
                "TICK_CHANNEL_CAPACITY",
                feed_defaults.tick_channel_capacity,
            ),
        };

        let pool = Self::pool_settings(&env)?;

        let catalog_defaults = CatalogSettings::default();
        let window_defaults = catalog_defaults.strike_window;
        let catalog = CatalogSettings {
            path: env
                .string("INSTRUMENT_CATALOG_PATH")
                .map_or(catalog_defaults.path, PathBuf::from),
            always_on_symbols: env
                .string("ALWAYS_ON_SYMBOLS")
                .map_or(catalog_defaults.always_on_symbols, |raw| parse_symbol_list(&raw)),
            strike_window: StrikeWindowConfig {
                index_radius: env.parse("STRIKE_WINDOW_INDEX_RADIUS", window_defaults.index_radius),
                stock_radius: env.parse("STRIKE_WINDOW_STOCK_RADIUS", window_defaults.stock_radius),
                cache_ttl: env.duration_secs("ATM_CACHE_TTL_SECS", window_defaults.cache_ttl),
            },
        };

        let session_defaults = SessionSettings::default();
        let clear_at = match env.string("SESSION_CLEAR_TIME") {
            Some(raw) => NaiveTime::parse_from_str(raw.trim(), "%H:%M")
                .map_err(|_| ConfigError::InvalidValue("SESSION_CLEAR_TIME".to_string(), raw))?,
            None => session_defaults.clear_at,
        };
        let utc_offset = match env.string("SESSION_UTC_OFFSET_MINUTES") {
            Some(raw) => raw
                .trim()
                .parse::<i32>()
                .ok()
                .and_then(|minutes| FixedOffset::east_opt(minutes.checked_mul(60)?))
                .ok_or_else(|| ConfigError::InvalidValue("SESSION_UTC_OFFSET_MINUTES".to_string(), raw))?,
            None => session_defaults.utc_offset,
        };
        let session = SessionSettings {
            clear_at,
            utc_offset,
            marker_path: env
                .string("SESSION_MARKER_PATH")
                .map_or(session_defaults.marker_path, PathBuf::from),
            reconcile_interval: env.duration_secs(
                "RECONCILE_INTERVAL_SECS",
                session_defaults.reconcile_interval,
            ),
        };

        let server = ServerSettings {
            health_port: env.parse("HEALTH_PORT", ServerSettings::default().health_port),
        };

        Ok(Self {
            credentials: Credentials::new(api_key, access_token),
            feed,
            pool,
            catalog,
            session,
            server,
        })
    }

    fn pool_settings(env: &Env<'_>) -> Result<PoolSettings, ConfigError> {
        let defaults = PoolSettings::default();
        let connections: u16 = env.parse("FEED_CONNECTIONS", defaults.connections);
        let connection_capacity: usize =
            env.parse("FEED_CONNECTION_CAPACITY", defaults.connection_capacity);

        if connections == 0 {
            return Err(ConfigError::InvalidValue(
                "FEED_CONNECTIONS".to_string(),
                "0".to_string(),
            ));
        }
        if connection_capacity == 0 {
            return Err(ConfigError::InvalidValue(
                "FEED_CONNECTION_CAPACITY".to_string(),
                "0".to_string(),
            ));
        }

        let pool_capacity = usize::from(connections)
            .checked_mul(connection_capacity)
            .ok_or_else(|| {
                ConfigError::InvalidValue(
                    "FEED_CONNECTION_CAPACITY".to_string(),
                    format!("{connection_capacity} (pool total overflows with {connections} connections)"),
                )
            })?;
        let global_capacity = env.parse("FEED_GLOBAL_CAPACITY", pool_capacity);
        if global_capacity == 0 || global_capacity > pool_capacity {
            return Err(ConfigError::InvalidValue(
                "FEED_GLOBAL_CAPACITY".to_string(),
                format!("{global_capacity} (must be 1..={pool_capacity})"),
            ));
        }

        Ok(PoolSettings {
            connections,
            connection_capacity,
            global_capacity,
        })
    }

    /// WebSocket URL for the upstream feed, with credentials.
    #[must_use]
    pub fn feed_url(&self) -> String {
        format!(
            "{}?api_key={}&access_token={}",
            self.feed.url.trim_end_matches('/'),
            self.credentials.api_key(),
            self.credentials.access_token()
        )
    }
}

/// Configuration error.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    MissingEnvVar(String),
    /// Environment variable has empty value.
    #[error("environment variable {0} cannot be empty")]
    EmptyValue(String),
    /// Environment variable has an unusable value.
    #[error("environment variable {0} has invalid value: {1}")]
    InvalidValue(String, String),
}

// =============================================================================
// Env Helpers
// =============================================================================

struct Env<'a>(&'a dyn Fn(&str) -> Option<String>);

impl Env<'_> {
    fn string(&self, key: &str) -> Option<String> {
        (self.0)(key).filter(|v| !v.trim().is_empty())
    }

    fn required(&self, key: &str) -> Result<String, ConfigError> {
        let value = (self.0)(key).ok_or_else(|| ConfigError::MissingEnvVar(key.to_string()))?;
        if value.is_empty() {
            return Err(ConfigError::EmptyValue(key.to_string()));
        }
        Ok(value)
    }

    fn parse<T: std::str::FromStr>(&self, key: &str, default: T) -> T {
        self.string(key)
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(default)
    }

    fn duration_secs(&self, key: &str, default: Duration) -> Duration {
        self.string(key)
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map_or(default, Duration::from_secs)
    }

    fn duration_millis(&self, key: &str, default: Duration) -> Duration {
        self.string(key)
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map_or(default, Duration::from_millis)
    }
}

fn parse_symbol_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(ToString::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn config(pairs: &[(&str, &str)]) -> Result<ServiceConfig, ConfigError> {
        let mut vars: HashMap<String, String> = HashMap::from([
            ("FEED_API_KEY".to_string(), "key123".to_string()),
            ("FEED_ACCESS_TOKEN".to_string(), "token456".to_string()),
        ]);
        for (k, v) in pairs {
            vars.insert((*k).to_string(), (*v).to_string());
        }
        ServiceConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn defaults() {
        let config = config(&[]).unwrap();
        assert_eq!(config.pool, PoolSettings::default());
        assert_eq!(config.pool.global_capacity, 25_000);
        assert_eq!(config.catalog.always_on_symbols, vec!["NIFTY 50", "NIFTY BANK"]);
        assert_eq!(config.catalog.strike_window.index_radius, 50);
        assert_eq!(config.catalog.strike_window.stock_radius, 12);
        assert_eq!(config.session.clear_at, NaiveTime::from_hms_opt(15, 35, 0).unwrap());
        assert_eq!(config.session.utc_offset.local_minus_utc(), 330 * 60);
        assert_eq!(config.feed.max_reconnect_attempts, 10);
        assert_eq!(config.server.health_port, 8083);
    }

    #[test]
    fn missing_credentials() {
        let err = ServiceConfig::from_lookup(|_| None).unwrap_err();
        assert!(matches!(err, ConfigError::MissingEnvVar(ref k) if k == "FEED_API_KEY"));

        let err = ServiceConfig::from_lookup(|k| (k == "FEED_API_KEY").then(String::new)).unwrap_err();
        assert!(matches!(err, ConfigError::EmptyValue(_)));
    }

    #[test]
    fn global_capacity_defaults_to_pool_total() {
        let config = config(&[("FEED_CONNECTIONS", "3"), ("FEED_CONNECTION_CAPACITY", "100")]).unwrap();
        assert_eq!(config.pool.global_capacity, 300);
    }

    #[test]
    fn global_capacity_above_pool_total_rejected() {
        let err = config(&[
            ("FEED_CONNECTIONS", "2"),
            ("FEED_CONNECTION_CAPACITY", "10"),
            ("FEED_GLOBAL_CAPACITY", "21"),
        ])
        .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue(ref k, _) if k == "FEED_GLOBAL_CAPACITY"));

        assert!(config(&[("FEED_GLOBAL_CAPACITY", "0")]).is_err());
        assert!(config(&[("FEED_CONNECTIONS", "0")]).is_err());
    }

    #[test]
    fn pool_total_overflow_rejected() {
        let huge = usize::MAX.to_string();
        let err = config(&[("FEED_CONNECTIONS", "2"), ("FEED_CONNECTION_CAPACITY", &huge)]).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue(ref k, _) if k == "FEED_CONNECTION_CAPACITY"));
    }

    #[test]
    fn session_overrides() {
        let config = config(&[
            ("SESSION_CLEAR_TIME", "16:05"),
            ("SESSION_UTC_OFFSET_MINUTES", "-300"),
            ("ALWAYS_ON_SYMBOLS", " NIFTY 50 , ,SENSEX"),
        ])
        .unwrap();
        assert_eq!(config.session.clear_at, NaiveTime::from_hms_opt(16, 5, 0).unwrap());
        assert_eq!(config.session.utc_offset.local_minus_utc(), -300 * 60);
        assert_eq!(config.catalog.always_on_symbols, vec!["NIFTY 50", "SENSEX"]);

        assert!(config_err("SESSION_CLEAR_TIME", "25:99"));
        assert!(config_err("SESSION_UTC_OFFSET_MINUTES", "abc"));
    }

    fn config_err(key: &str, value: &str) -> bool {
        matches!(config(&[(key, value)]), Err(ConfigError::InvalidValue(..)))
    }

    #[test]
    fn credentials_redacted_debug() {
        let config = config(&[]).unwrap();
        let debug = format!("{config:?}");
        assert!(!debug.contains("key123"));
        assert!(!debug.contains("token456"));
        assert!(debug.contains("[REDACTED]"));
    }

    #[test]
    fn feed_url_carries_credentials() {
        let config = config(&[("FEED_WS_URL", "wss://feed.example/")]).unwrap();
        assert_eq!(
            config.feed_url(),
            "wss://feed.example?api_key=key123&access_token=token456"
        );
    }
}
