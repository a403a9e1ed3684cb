//! Watchlist Service
//!
//! Per-user use cases on top of the subscription ledger: add and remove
//! watchlist entries, end-of-day reset, always-on preload, restart restore
//! and connection event handling.
//!
//! # Locking
//!
//! Every mutation runs under one async mutex around the ledger. The lock is
//! held across repository writes so an eviction and the watchlist rows it
//! deletes commit as one unit. Upstream commands are handed to the
//! [`FeedTransport`] without waiting on the network, and the tick path never
//! touches this lock.

use std::sync::Arc;

use chrono::{NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use tokio::sync::Mutex;

use crate::application::ports::{FeedTransport, SubscriptionLogRepository, WatchlistRepository};
use crate::domain::errors::SubscriptionError;
use crate::domain::instrument::{InstrumentKind, InstrumentRegistry, SubscriptionKey};
use crate::domain::ledger::{
    GroupId, LedgerStatus, RebalanceReport, SubscribeRequest, Subscription, SubscriptionLedger,
    Tier,
};
use crate::domain::pool::ConnectionEvent;
use crate::domain::strikes::{AtmCacheEntry, AtmEngine, StrikeWindow, StrikeWindowRequest};
use crate::domain::watchlist::{InstrumentType, WatchlistEntry, chain_keys};
use crate::infrastructure::metrics;

// =============================================================================
// Requests & Outcomes
// =============================================================================

/// Input to [`WatchlistService::add_to_watchlist`].
#[derive(Debug, Clone)]
pub struct AddWatchlistRequest {
    /// Owning user.
    pub user_id: String,
    /// Underlying symbol.
    pub underlying: String,
    /// Expiry; ignored for equities.
    pub expiry: Option<NaiveDate>,
    /// How to expand the underlying.
    pub instrument_type: InstrumentType,
    /// Latest underlying price; required for option chains.
    pub last_price: Option<Decimal>,
    /// Recompute the strike window even if the cached one is valid.
    pub force_recompute: bool,
}

/// An instrument that could not be subscribed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedInstrument {
    /// Instrument key.
    pub key: SubscriptionKey,
    /// Why it failed.
    pub error: SubscriptionError,
}

/// Result of a (possibly partial) watchlist add.
#[derive(Debug, Clone)]
pub struct AddOutcome {
    /// Insertion sequence of the new entry.
    pub added_order: u64,
    /// ATM snapshot for option chains.
    pub atm: Option<Arc<AtmCacheEntry>>,
    /// Instruments the entry expanded into.
    pub requested: usize,
    /// Instruments now active for this entry.
    pub subscribed: usize,
    /// Instruments that were rejected.
    pub failed: Vec<FailedInstrument>,
    /// Older watchlist entries removed by eviction.
    pub evicted_entries: usize,
}

/// Result of the end-of-day clear.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct EodSummary {
    /// On-demand instruments released.
    pub unsubscribed: usize,
    /// Watchlist rows deleted.
    pub watchlist_entries_cleared: usize,
}

/// Result of the always-on preload.
#[derive(Debug, Clone, Default)]
pub struct PreloadReport {
    /// Symbols requested.
    pub requested: usize,
    /// Symbols now active.
    pub subscribed: usize,
    /// Symbols that failed, with the reason.
    pub failed: Vec<(String, SubscriptionError)>,
}

/// Result of replaying persisted watchlist entries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RestoreReport {
    /// Entries found in the repository.
    pub entries: usize,
    /// Entries with at least one instrument active again.
    pub restored: usize,
    /// Instruments subscribed.
    pub subscribed: usize,
    /// Entries deleted because none of their instruments fit.
    pub dropped: usize,
}

// =============================================================================
// Service
// =============================================================================

/// Watchlist orchestration over the ledger, ATM engine and repositories.
pub struct WatchlistService {
    registry: Arc<InstrumentRegistry>,
    atm: Arc<AtmEngine>,
    ledger: Mutex<SubscriptionLedger>,
    watchlist: Arc<dyn WatchlistRepository>,
    audit_log: Arc<dyn SubscriptionLogRepository>,
    transport: Arc<dyn FeedTransport>,
}

impl std::fmt::Debug for WatchlistService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WatchlistService")
            .field("registry", &self.registry.len())
            .finish_non_exhaustive()
    }
}

impl WatchlistService {
    /// Create the service.
    #[must_use]
    pub fn new(
        registry: Arc<InstrumentRegistry>,
        atm: Arc<AtmEngine>,
        ledger: SubscriptionLedger,
        watchlist: Arc<dyn WatchlistRepository>,
        audit_log: Arc<dyn SubscriptionLogRepository>,
        transport: Arc<dyn FeedTransport>,
    ) -> Self {
        Self {
            registry,
            atm,
            ledger: Mutex::new(ledger),
            watchlist,
            audit_log,
            transport,
        }
    }

    /// Add an underlying to a user's watchlist and subscribe its instruments.
    ///
    /// Partial success is returned as success with the failed subset. The
    /// entry is persisted only if at least one instrument is active.
    ///
    /// # Errors
    ///
    /// - `InvalidInstrument` for unknown underlyings, unlisted expiries or a
    ///   missing price on an option chain.
    /// - `DuplicateEntry` if the user already watches this underlying/expiry.
    /// - The first instrument's error if none could be subscribed.
    /// - `Persistence` if the repository fails.
    pub async fn add_to_watchlist(&self, request: AddWatchlistRequest) -> Result<AddOutcome, SubscriptionError> {
        let expiry = if request.instrument_type.requires_expiry() {
            request.expiry
        } else {
            None
        };
        self.validate(&request.underlying, expiry, request.instrument_type)?;

        let mut ledger = self.ledger.lock().await;

        if self
            .watchlist
            .find(&request.user_id, &request.underlying, expiry)
            .await?
            .is_some()
        {
            return Err(SubscriptionError::DuplicateEntry {
                user_id: request.user_id,
                underlying: request.underlying,
                expiry,
            });
        }

        let atm = match (request.instrument_type.option_class(), expiry) {
            (Some(class), Some(expiry)) => {
                let last_price = request.last_price.ok_or_else(|| {
                    SubscriptionError::invalid(&request.underlying, "last price required for option chain")
                })?;
                Some(self.atm.strike_window(&StrikeWindowRequest {
                    underlying: &request.underlying,
                    expiry,
                    last_price,
                    class,
                    force: request.force_recompute,
                })?)
            }
            _ => None,
        };
        let window = atm.as_ref().map(|entry| entry.window.clone());

        let (resolved, mut failed) =
            self.resolve_instruments(&request.underlying, expiry, request.instrument_type, window.as_ref());
        let requested = resolved.len() + failed.len();

        let added_order = self.watchlist.next_order().await?;
        let subscribed = subscribe_group(&mut ledger, added_order, resolved, &mut failed);

        for failure in &failed {
            metrics::record_rejection(failure.error.kind());
        }

        if subscribed == 0 {
            self.commit(&mut ledger).await;
            tracing::warn!(
                user_id = %request.user_id,
                underlying = %request.underlying,
                requested,
                "Watchlist add rejected, nothing subscribed"
            );
            return Err(failed.into_iter().next().map_or_else(
                || SubscriptionError::invalid(&request.underlying, "no instruments in catalog"),
                |f| f.error,
            ));
        }

        let entry = WatchlistEntry {
            user_id: request.user_id,
            underlying: request.underlying,
            expiry,
            instrument_type: request.instrument_type,
            added_at: Utc::now(),
            added_order,
            window,
        };

        if let Err(e) = self.watchlist.insert(&entry).await {
            ledger.release_group(added_order);
            self.commit(&mut ledger).await;
            return Err(e.into());
        }

        let evicted_entries = self.commit(&mut ledger).await;
        drop(ledger);

        tracing::info!(
            user_id = %entry.user_id,
            underlying = %entry.underlying,
            expiry = ?entry.expiry,
            added_order,
            requested,
            subscribed,
            failed = failed.len(),
            evicted_entries,
            "Watchlist entry added"
        );

        Ok(AddOutcome {
            added_order,
            atm,
            requested,
            subscribed,
            failed,
            evicted_entries,
        })
    }

    /// Remove a watchlist entry and release the instruments it alone owns.
    ///
    /// Returns the number of instruments unsubscribed.
    ///
    /// # Errors
    ///
    /// `NotFound` if the user does not watch this underlying/expiry;
    /// `Persistence` if the repository fails.
    pub async fn remove_from_watchlist(
        &self,
        user_id: &str,
        underlying: &str,
        expiry: Option<NaiveDate>,
    ) -> Result<usize, SubscriptionError> {
        let mut ledger = self.ledger.lock().await;

        let entry = self
            .watchlist
            .find(user_id, underlying, expiry)
            .await?
            .ok_or_else(|| SubscriptionError::NotFound {
                entity: "watchlist entry",
                id: format!("{user_id}/{underlying}/{expiry:?}"),
            })?;

        let removed = ledger.release_group(entry.added_order);
        self.watchlist.delete(user_id, underlying, expiry).await?;
        self.commit(&mut ledger).await;

        tracing::info!(
            user_id,
            underlying,
            expiry = ?expiry,
            added_order = entry.added_order,
            removed,
            "Watchlist entry removed"
        );
        Ok(removed)
    }

    /// Release every on-demand subscription and delete every watchlist row.
    ///
    /// Always-on subscriptions are untouched. Also drops all cached strike
    /// windows. Repository failures are logged, not returned.
    pub async fn end_of_day_clear(&self) -> EodSummary {
        let mut ledger = self.ledger.lock().await;

        let unsubscribed = ledger.unsubscribe_all_on_demand();
        let watchlist_entries_cleared = match self.watchlist.clear_all().await {
            Ok(count) => count,
            Err(e) => {
                tracing::error!(error = %e, "Failed to clear watchlist rows");
                0
            }
        };
        self.atm.clear();
        self.commit(&mut ledger).await;
        drop(ledger);

        metrics::record_eod_clear();
        tracing::info!(unsubscribed, watchlist_entries_cleared, "End-of-day clear complete");

        EodSummary {
            unsubscribed,
            watchlist_entries_cleared,
        }
    }

    /// Subscribe the always-on set by trading symbol.
    pub async fn preload_always_on(&self, symbols: &[String]) -> PreloadReport {
        let mut ledger = self.ledger.lock().await;
        let mut report = PreloadReport {
            requested: symbols.len(),
            ..PreloadReport::default()
        };

        for symbol in symbols {
            let Some(record) = self.registry.by_tradingsymbol(symbol) else {
                report
                    .failed
                    .push((symbol.clone(), SubscriptionError::invalid(symbol, "not in catalog")));
                continue;
            };
            let result = ledger.subscribe(SubscribeRequest {
                key: record.subscription_key(),
                instrument_token: record.instrument_token,
                tier: Tier::AlwaysOn,
                group: None,
            });
            match result {
                Ok(_) => report.subscribed += 1,
                Err(e) => {
                    metrics::record_rejection(e.kind());
                    report.failed.push((symbol.clone(), e));
                }
            }
        }
        self.commit(&mut ledger).await;
        drop(ledger);

        for (symbol, error) in &report.failed {
            tracing::warn!(%symbol, %error, "Always-on instrument not subscribed");
        }
        tracing::info!(
            requested = report.requested,
            subscribed = report.subscribed,
            "Always-on instruments preloaded"
        );
        report
    }

    /// Rebuild on-demand groups from persisted watchlist rows.
    ///
    /// Entries are replayed in insertion order using their stored strike
    /// window. Entries that no longer subscribe anything are deleted.
    ///
    /// # Errors
    ///
    /// `Persistence` if the entries cannot be listed.
    pub async fn restore(&self) -> Result<RestoreReport, SubscriptionError> {
        let mut ledger = self.ledger.lock().await;
        let entries = self.watchlist.list_all().await?;
        let mut report = RestoreReport {
            entries: entries.len(),
            ..RestoreReport::default()
        };

        for entry in entries {
            let (resolved, mut failed) = self.resolve_instruments(
                &entry.underlying,
                entry.expiry,
                entry.instrument_type,
                entry.window.as_ref(),
            );
            let subscribed = subscribe_group(&mut ledger, entry.added_order, resolved, &mut failed);

            if subscribed == 0 {
                report.dropped += 1;
                if let Err(e) = self.watchlist.delete_by_order(entry.added_order).await {
                    tracing::warn!(added_order = entry.added_order, error = %e, "Failed to drop stale watchlist entry");
                }
                continue;
            }
            report.restored += 1;
            report.subscribed += subscribed;
        }

        self.commit(&mut ledger).await;
        drop(ledger);

        tracing::info!(
            entries = report.entries,
            restored = report.restored,
            subscribed = report.subscribed,
            dropped = report.dropped,
            "Watchlist restored"
        );
        Ok(report)
    }

    /// Apply a connection lifecycle event to the pool.
    pub async fn on_connection_event(&self, event: ConnectionEvent) -> RebalanceReport {
        let mut ledger = self.ledger.lock().await;
        let report = match &event {
            ConnectionEvent::Connected { connection } => ledger.connection_restored(*connection, Utc::now()),
            ConnectionEvent::Lost { connection, error } => ledger.connection_lost(*connection, error),
            ConnectionEvent::ReconnectAttempt { connection, .. } => {
                ledger.record_reconnect_attempt(*connection);
                metrics::record_reconnect(*connection);
                RebalanceReport {
                    moved: 0,
                    queued: ledger.pool().pending_len(),
                }
            }
            ConnectionEvent::Degraded { connection, error } => ledger.connection_degraded(*connection, error),
            ConnectionEvent::Closed { connection } => ledger.connection_closed(*connection),
        };
        self.commit(&mut ledger).await;
        report
    }

    /// Assign queued instruments and level load across connections.
    pub async fn force_rebalance(&self) -> RebalanceReport {
        let mut ledger = self.ledger.lock().await;
        let report = ledger.force_rebalance();
        self.commit(&mut ledger).await;
        report
    }

    /// Safety-net pass: assign queued instruments.
    pub async fn reconcile(&self) -> RebalanceReport {
        let mut ledger = self.ledger.lock().await;
        let report = ledger.reconcile();
        self.commit(&mut ledger).await;
        report
    }

    /// Ledger and per-connection status.
    pub async fn status(&self) -> LedgerStatus {
        self.ledger.lock().await.status()
    }

    /// Active subscriptions, optionally filtered by tier.
    pub async fn list_active_subscriptions(&self, tier: Option<Tier>) -> Vec<Subscription> {
        self.ledger.lock().await.list(tier)
    }

    /// Watchlist rows for one user, in insertion order.
    ///
    /// # Errors
    ///
    /// `Persistence` if the repository fails.
    pub async fn watchlist_for(&self, user_id: &str) -> Result<Vec<WatchlistEntry>, SubscriptionError> {
        let entries = self.watchlist.list_all().await?;
        Ok(entries.into_iter().filter(|e| e.user_id == user_id).collect())
    }

    // ===== Internals =====

    fn validate(
        &self,
        underlying: &str,
        expiry: Option<NaiveDate>,
        instrument_type: InstrumentType,
    ) -> Result<(), SubscriptionError> {
        if underlying.trim().is_empty() {
            return Err(SubscriptionError::invalid(underlying, "empty underlying"));
        }
        if self.registry.lookup(underlying).is_empty() {
            return Err(SubscriptionError::invalid(underlying, "unknown underlying"));
        }
        if !instrument_type.requires_expiry() {
            return Ok(());
        }
        if !self.registry.is_fno_eligible(underlying) {
            return Err(SubscriptionError::invalid(underlying, "no derivatives listed"));
        }
        let Some(expiry) = expiry else {
            return Err(SubscriptionError::invalid(underlying, "expiry required"));
        };
        if !self.registry.expiries(underlying).contains(&expiry) {
            return Err(SubscriptionError::invalid(
                underlying,
                format!("expiry {expiry} not listed"),
            ));
        }
        Ok(())
    }

    /// Expand an entry into `(key, token)` pairs, splitting off keys the
    /// catalog does not list.
    fn resolve_instruments(
        &self,
        underlying: &str,
        expiry: Option<NaiveDate>,
        instrument_type: InstrumentType,
        window: Option<&StrikeWindow>,
    ) -> (Vec<(SubscriptionKey, u64)>, Vec<FailedInstrument>) {
        if instrument_type == InstrumentType::Equity {
            let spot = self
                .registry
                .lookup(underlying)
                .into_iter()
                .find(|r| matches!(r.kind, InstrumentKind::Equity | InstrumentKind::Index));
            return match spot {
                Some(record) => (vec![(record.subscription_key(), record.instrument_token)], Vec::new()),
                None => (
                    Vec::new(),
                    vec![FailedInstrument {
                        key: SubscriptionKey::spot(underlying),
                        error: SubscriptionError::invalid(underlying, "no spot instrument listed"),
                    }],
                ),
            };
        }

        let mut resolved = Vec::new();
        let mut failed = Vec::new();
        for key in chain_keys(underlying, expiry, instrument_type, window) {
            match self.registry.resolve(&key) {
                Some(record) => resolved.push((key, record.instrument_token)),
                None => {
                    let error = SubscriptionError::invalid(key.to_string(), "not in catalog");
                    failed.push(FailedInstrument { key, error });
                }
            }
        }
        (resolved, failed)
    }

    /// Flush buffered ledger effects. Returns the number of evicted
    /// watchlist rows deleted.
    async fn commit(&self, ledger: &mut SubscriptionLedger) -> usize {
        let effects = ledger.take_effects();

        if !effects.feed.is_empty() {
            self.transport.dispatch(&effects.feed);
        }
        if !effects.audit.is_empty()
            && let Err(e) = self.audit_log.append(&effects.audit).await
        {
            tracing::warn!(error = %e, rows = effects.audit.len(), "Failed to write subscription log");
        }

        let mut evicted_entries = 0;
        for group in &effects.evicted_groups {
            match self.watchlist.delete_by_order(*group).await {
                Ok(true) => evicted_entries += 1,
                Ok(false) => {}
                Err(e) => tracing::warn!(group, error = %e, "Failed to delete evicted watchlist entry"),
            }
        }

        metrics::record_effects(&effects);
        metrics::record_ledger_status(&ledger.status());
        evicted_entries
    }
}

/// Subscribe a batch on behalf of one watchlist group, collecting failures.
fn subscribe_group(
    ledger: &mut SubscriptionLedger,
    group: GroupId,
    instruments: Vec<(SubscriptionKey, u64)>,
    failed: &mut Vec<FailedInstrument>,
) -> usize {
    let mut subscribed = 0;
    for (key, instrument_token) in instruments {
        let request = SubscribeRequest {
            key: key.clone(),
            instrument_token,
            tier: Tier::OnDemand,
            group: Some(group),
        };
        match ledger.subscribe(request) {
            Ok(_) => subscribed += 1,
            Err(error) => failed.push(FailedInstrument { key, error }),
        }
    }
    subscribed
}
