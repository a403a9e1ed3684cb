//! Session Scheduler
//!
//! Fires the end-of-day clear once per session date at a fixed local time.
//! The last run date is persisted, so a restart later the same day does not
//! clear again. The date is also held in memory, so a failing marker write
//! cannot re-run the clear within one process.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, FixedOffset, NaiveDate, NaiveTime, Utc};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use super::watchlist::{EodSummary, WatchlistService};
use crate::application::ports::RunMarkerStore;
use crate::domain::errors::SubscriptionError;

/// Upper bound on a single sleep, so clock changes are picked up.
const MAX_SLEEP: Duration = Duration::from_secs(60);

/// Daily end-of-day trigger.
pub struct SessionScheduler {
    service: Arc<WatchlistService>,
    marker: Arc<dyn RunMarkerStore>,
    clear_at: NaiveTime,
    offset: FixedOffset,
    cleared: Mutex<Option<NaiveDate>>,
}

impl std::fmt::Debug for SessionScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionScheduler")
            .field("clear_at", &self.clear_at)
            .field("offset", &self.offset)
            .finish_non_exhaustive()
    }
}

impl SessionScheduler {
    /// Create a scheduler clearing at `clear_at` in the given UTC offset.
    #[must_use]
    pub fn new(
        service: Arc<WatchlistService>,
        marker: Arc<dyn RunMarkerStore>,
        clear_at: NaiveTime,
        offset: FixedOffset,
    ) -> Self {
        Self {
            service,
            marker,
            clear_at,
            offset,
            cleared: Mutex::new(None),
        }
    }

    /// Session date for an instant.
    #[must_use]
    pub fn session_date(&self, now: DateTime<Utc>) -> NaiveDate {
        now.with_timezone(&self.offset).date_naive()
    }

    /// Whether the clear time has passed for `now`'s session date.
    #[must_use]
    pub fn is_past_clear_time(&self, now: DateTime<Utc>) -> bool {
        now.with_timezone(&self.offset).time() >= self.clear_at
    }

    /// Run the clear if it is due and has not run for today's session.
    ///
    /// # Errors
    ///
    /// `Persistence` if the run marker cannot be read or written. A failed
    /// write still counts the session as cleared for this process.
    pub async fn run_if_due(&self, now: DateTime<Utc>) -> Result<Option<EodSummary>, SubscriptionError> {
        if !self.is_past_clear_time(now) {
            return Ok(None);
        }

        let today = self.session_date(now);
        if self.cleared.lock().is_some_and(|last| last >= today) {
            return Ok(None);
        }
        if self.marker.last_run().await?.is_some_and(|last| last >= today) {
            return Ok(None);
        }

        let summary = self.service.end_of_day_clear().await;
        *self.cleared.lock() = Some(today);
        self.marker.record_run(today).await.inspect_err(|e| {
            tracing::warn!(session = %today, error = %e, "Clear ran but the run marker was not saved");
        })?;

        tracing::info!(
            session = %today,
            unsubscribed = summary.unsubscribed,
            watchlist_entries_cleared = summary.watchlist_entries_cleared,
            "Session end-of-day clear recorded"
        );
        Ok(Some(summary))
    }

    /// Time until the next clear, from `now`.
    #[must_use]
    pub fn until_next_clear(&self, now: DateTime<Utc>) -> Duration {
        let local = now.with_timezone(&self.offset);
        let mut target = local.date_naive().and_time(self.clear_at);
        if local.naive_local() >= target {
            target += chrono::Duration::days(1);
        }
        (target - local.naive_local()).to_std().unwrap_or_default()
    }

    /// Check on startup, then wake at each clear time until cancelled.
    pub async fn run(self, cancel: CancellationToken) {
        tracing::info!(clear_at = %self.clear_at, offset = %self.offset, "Session scheduler started");

        loop {
            if let Err(e) = self.run_if_due(Utc::now()).await {
                tracing::error!(error = %e, "End-of-day clear failed");
            }

            let sleep = self.until_next_clear(Utc::now()).min(MAX_SLEEP);
            tokio::select! {
                () = cancel.cancelled() => {
                    tracing::info!("Session scheduler stopped");
                    return;
                }
                () = tokio::time::sleep(sleep) => {}
            }
        }
    }
}
