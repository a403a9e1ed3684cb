//! Shared fixtures for integration tests.

#![allow(dead_code, clippy::unwrap_used, clippy::expect_used)]

use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Write as _;
use std::io::Cursor;
use std::sync::Arc;

use chrono::NaiveDate;
use feed_subscription_manager::application::services::WatchlistService;
use feed_subscription_manager::domain::ledger::{SubscriptionLedger, Tier};
use feed_subscription_manager::domain::pool::{ConnectionId, ConnectionPool};
use feed_subscription_manager::domain::strikes::{AtmEngine, StrikeWindowConfig};
use feed_subscription_manager::infrastructure::feed::{ChannelFeedTransport, FeedCommand};
use feed_subscription_manager::infrastructure::persistence::{
    InMemorySubscriptionLog, InMemoryWatchlistRepository,
};
use feed_subscription_manager::InstrumentRegistry;
use tokio::sync::mpsc;

pub const NIFTY_SPOT_TOKEN: u64 = 256_265;

pub fn expiry() -> NaiveDate {
    NaiveDate::from_ymd_opt(2026, 10, 29).unwrap()
}

/// Catalog builder emitting JSON Lines rows.
pub struct CatalogBuilder {
    lines: String,
    next_token: u64,
}

impl CatalogBuilder {
    pub fn new() -> Self {
        Self {
            lines: String::new(),
            next_token: 1_000_000,
        }
    }

    fn token(&mut self) -> u64 {
        self.next_token += 1;
        self.next_token
    }

    /// NIFTY index spot, one future and strikes 23000..=26000 step 50.
    pub fn nifty(mut self) -> Self {
        writeln!(
            self.lines,
            r#"{{"instrument_token":{NIFTY_SPOT_TOKEN},"tradingsymbol":"NIFTY 50","name":"NIFTY","exchange":"NSE","segment":"INDICES","instrument_type":"EQ"}}"#
        )
        .unwrap();
        let token = self.token();
        writeln!(
            self.lines,
            r#"{{"instrument_token":{token},"tradingsymbol":"NIFTY26OCTFUT","name":"NIFTY","exchange":"NFO","segment":"NFO-FUT","instrument_type":"FUT","expiry":"{}","lot_size":75}}"#,
            expiry()
        )
        .unwrap();
        for strike in (23_000..=26_000).step_by(50) {
            self = self.option("NIFTY", strike, "CE").option("NIFTY", strike, "PE");
        }
        self
    }

    /// A cash equity without derivatives.
    pub fn equity(mut self, symbol: &str) -> Self {
        let token = self.token();
        writeln!(
            self.lines,
            r#"{{"instrument_token":{token},"tradingsymbol":"{symbol}","exchange":"NSE","segment":"NSE","instrument_type":"EQ"}}"#
        )
        .unwrap();
        self
    }

    /// A stock with strikes `center ± 20 steps` at step 10.
    pub fn optionable_stock(mut self, symbol: &str, center: u32) -> Self {
        self = self.equity(symbol);
        for strike in (center - 200..=center + 200).step_by(10) {
            self = self.option(symbol, strike, "CE").option(symbol, strike, "PE");
        }
        self
    }

    fn option(mut self, underlying: &str, strike: u32, right: &str) -> Self {
        let token = self.token();
        writeln!(
            self.lines,
            r#"{{"instrument_token":{token},"tradingsymbol":"{underlying}26OCT{strike}{right}","name":"{underlying}","exchange":"NFO","segment":"NFO-OPT","instrument_type":"{right}","expiry":"{}","strike":{strike}}}"#,
            expiry()
        )
        .unwrap();
        self
    }

    pub fn build(self) -> Arc<InstrumentRegistry> {
        let (registry, report) = InstrumentRegistry::load(Cursor::new(self.lines)).unwrap();
        assert_eq!(report.skipped, 0);
        Arc::new(registry)
    }
}

/// Service wired to in-memory adapters and a channel transport.
pub struct Harness {
    pub service: Arc<WatchlistService>,
    pub watchlist: Arc<InMemoryWatchlistRepository>,
    pub audit_log: Arc<InMemorySubscriptionLog>,
    pub registry: Arc<InstrumentRegistry>,
    receivers: Vec<mpsc::UnboundedReceiver<FeedCommand>>,
    upstream: BTreeMap<ConnectionId, BTreeSet<u64>>,
}

impl Harness {
    pub fn new(registry: Arc<InstrumentRegistry>, connections: u16, capacity: usize, global: usize) -> Self {
        Self::with_watchlist(registry, connections, capacity, global, Arc::new(InMemoryWatchlistRepository::new()))
    }

    pub fn with_watchlist(
        registry: Arc<InstrumentRegistry>,
        connections: u16,
        capacity: usize,
        global: usize,
        watchlist: Arc<InMemoryWatchlistRepository>,
    ) -> Self {
        let atm = Arc::new(AtmEngine::new(Arc::clone(&registry), StrikeWindowConfig::default()));
        let ledger = SubscriptionLedger::new(ConnectionPool::new(connections, capacity), global);
        let (transport, receivers) = ChannelFeedTransport::new(connections);
        let audit_log = Arc::new(InMemorySubscriptionLog::default());

        let service = Arc::new(WatchlistService::new(
            Arc::clone(&registry),
            atm,
            ledger,
            watchlist.clone(),
            audit_log.clone(),
            Arc::new(transport),
        ));

        Self {
            service,
            watchlist,
            audit_log,
            registry,
            receivers,
            upstream: BTreeMap::new(),
        }
    }

    /// Apply every queued upstream command and return the per-connection
    /// token sets the feed clients would now stream.
    pub fn upstream(&mut self) -> &BTreeMap<ConnectionId, BTreeSet<u64>> {
        for (connection, rx) in (0..).zip(self.receivers.iter_mut()) {
            while let Ok(command) = rx.try_recv() {
                let tokens = self.upstream.entry(connection).or_default();
                match command {
                    FeedCommand::Subscribe(batch) => tokens.extend(batch),
                    FeedCommand::Unsubscribe(batch) => {
                        for token in batch {
                            tokens.remove(&token);
                        }
                    }
                }
            }
        }
        self.upstream.retain(|_, tokens| !tokens.is_empty());
        &self.upstream
    }

    /// Per-connection token sets according to the ledger.
    pub async fn ledger_view(&self, tier: Option<Tier>) -> BTreeMap<ConnectionId, BTreeSet<u64>> {
        let mut view: BTreeMap<ConnectionId, BTreeSet<u64>> = BTreeMap::new();
        for subscription in self.service.list_active_subscriptions(tier).await {
            if let Some(connection) = subscription.connection_id {
                view.entry(connection).or_default().insert(subscription.instrument_token);
            }
        }
        view
    }

    /// Assert that upstream state matches the ledger exactly.
    pub async fn assert_upstream_consistent(&mut self) {
        let expected = self.ledger_view(None).await;
        assert_eq!(self.upstream(), &expected);
    }
}
