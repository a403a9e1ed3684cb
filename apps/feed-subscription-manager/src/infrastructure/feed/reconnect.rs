//! Reconnection Policy
//!
//! Bounded exponential backoff with jitter for feed connections. Once the
//! attempt budget is spent the connection is reported degraded and is not
//! retried again.

use std::time::Duration;

use rand::Rng;

use crate::infrastructure::config::FeedSettings;

/// Backoff configuration.
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Delay before the first attempt.
    pub initial_delay: Duration,
    /// Delay ceiling.
    pub max_delay: Duration,
    /// Growth factor per attempt.
    pub multiplier: f64,
    /// Jitter as a fraction of the delay (0.1 = ±10%).
    pub jitter_factor: f64,
    /// Attempts before giving up. Always at least one.
    pub max_attempts: u32,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            jitter_factor: 0.1,
            max_attempts: 10,
        }
    }
}

impl ReconnectConfig {
    /// Build from feed settings.
    #[must_use]
    pub fn from_feed_settings(settings: &FeedSettings) -> Self {
        Self {
            initial_delay: settings.reconnect_delay_initial,
            max_delay: settings.reconnect_delay_max,
            multiplier: settings.reconnect_delay_multiplier,
            jitter_factor: 0.1,
            max_attempts: settings.max_reconnect_attempts.max(1),
        }
    }

    /// Un-jittered delay before attempt `attempt` (1-based).
    #[must_use]
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        #[allow(clippy::cast_precision_loss)]
        let initial = self.initial_delay.as_millis() as f64;
        let scaled = initial * self.multiplier.max(1.0).powi(exponent);

        #[allow(clippy::cast_precision_loss)]
        let ceiling = self.max_delay.as_millis() as f64;
        let millis = if scaled.is_finite() { scaled.min(ceiling) } else { ceiling };

        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let millis = millis.max(0.0) as u64;
        Duration::from_millis(millis)
    }
}

/// Attempt counter over a [`ReconnectConfig`].
#[derive(Debug)]
pub struct ReconnectPolicy {
    config: ReconnectConfig,
    attempts: u32,
}

impl ReconnectPolicy {
    /// Create a policy with no attempts made.
    #[must_use]
    pub const fn new(config: ReconnectConfig) -> Self {
        Self {
            config,
            attempts: 0,
        }
    }

    /// Delay before the next attempt, or `None` once the budget is spent.
    #[must_use]
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.attempts >= self.config.max_attempts {
            return None;
        }
        self.attempts += 1;
        Some(self.jitter(self.config.base_delay(self.attempts)))
    }

    /// Forget previous attempts after a successful connect.
    pub const fn reset(&mut self) {
        self.attempts = 0;
    }

    /// Attempts made since the last reset.
    #[must_use]
    pub const fn attempt_count(&self) -> u32 {
        self.attempts
    }

    /// Attempt budget.
    #[must_use]
    pub const fn max_attempts(&self) -> u32 {
        self.config.max_attempts
    }

    fn jitter(&self, duration: Duration) -> Duration {
        if self.config.jitter_factor <= 0.0 {
            return duration;
        }

        #[allow(clippy::cast_precision_loss)]
        let base = duration.as_millis() as f64;
        let spread = base * self.config.jitter_factor;
        let offset: f64 = rand::rng().random_range(-spread..=spread);

        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let millis = (base + offset).max(1.0) as u64;
        Duration::from_millis(millis)
    }
}

/// Reconnection failure.
#[derive(Debug, thiserror::Error)]
pub enum ReconnectError {
    /// Attempt budget spent.
    #[error("gave up after {attempts} reconnection attempts: {last_error}")]
    Exhausted {
        /// Attempts made.
        attempts: u32,
        /// Error from the final attempt.
        last_error: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(max_attempts: u32) -> ReconnectConfig {
        ReconnectConfig {
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(3),
            multiplier: 2.0,
            jitter_factor: 0.0,
            max_attempts,
        }
    }

    #[test]
    fn delays_double_until_ceiling() {
        let mut policy = ReconnectPolicy::new(config(6));
        let delays: Vec<_> = std::iter::from_fn(|| policy.next_delay())
            .map(|d| d.as_millis())
            .collect();
        assert_eq!(delays, vec![500, 1000, 2000, 3000, 3000, 3000]);
    }

    #[test]
    fn budget_is_bounded_and_resets() {
        let mut policy = ReconnectPolicy::new(config(2));
        assert!(policy.next_delay().is_some());
        assert!(policy.next_delay().is_some());
        assert!(policy.next_delay().is_none());
        assert_eq!(policy.attempt_count(), 2);

        policy.reset();
        assert_eq!(policy.next_delay(), Some(Duration::from_millis(500)));
    }

    #[test]
    fn settings_never_allow_unbounded_retries() {
        let settings = FeedSettings {
            max_reconnect_attempts: 0,
            ..FeedSettings::default()
        };
        assert_eq!(ReconnectConfig::from_feed_settings(&settings).max_attempts, 1);
    }

    #[test]
    fn jitter_stays_in_band() {
        let mut cfg = config(1);
        cfg.jitter_factor = 0.1;
        for _ in 0..100 {
            let millis = ReconnectPolicy::new(cfg.clone()).next_delay().unwrap().as_millis();
            assert!((450..=550).contains(&millis), "delay {millis}ms outside jitter band");
        }
    }
}
