use super::model::{AccountView, OrderView, PositionView, TradingSettings};
use crate::{
    error::TelemetryError,
    ring::{PriceHistory, Series},
};
use chrono::{DateTime, Utc};
use derive_more::Display;
use fnv::FnvHashMap;
use rust_decimal::prelude::ToPrimitive;
use smol_str::SmolStr;
use std::collections::BTreeMap;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Independently polled data provider.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Display)]
pub enum SourceId {
    #[display("account")]
    Account,
    #[display("positions")]
    Positions,
    #[display("settings")]
    Settings,
    #[display("orders")]
    Orders,
    #[display("quotes")]
    Quotes,
    #[display("btc_price")]
    BtcPrice,
    #[display("block_height")]
    BlockHeight,
}

impl SourceId {
    pub const ALL: [SourceId; 7] = [
        SourceId::Account,
        SourceId::Positions,
        SourceId::Settings,
        SourceId::Orders,
        SourceId::Quotes,
        SourceId::BtcPrice,
        SourceId::BlockHeight,
    ];

    /// Whether polling this source requires a session credential.
    pub fn is_authenticated(self) -> bool {
        !matches!(self, SourceId::BtcPrice | SourceId::BlockHeight)
    }
}

/// Fresh partial data produced by one successful poll.
#[derive(Debug, Clone, PartialEq)]
pub enum SourceUpdate {
    Account(AccountView),
    Positions(Vec<PositionView>),
    Settings(TradingSettings),
    Orders(Vec<OrderView>),
    /// Only the symbols that answered; others keep their previous price
    Quotes(BTreeMap<SmolStr, f64>),
    BtcPrice(f64),
    BlockHeight(u64),
}

impl SourceUpdate {
    pub fn source(&self) -> SourceId {
        match self {
            SourceUpdate::Account(_) => SourceId::Account,
            SourceUpdate::Positions(_) => SourceId::Positions,
            SourceUpdate::Settings(_) => SourceId::Settings,
            SourceUpdate::Orders(_) => SourceId::Orders,
            SourceUpdate::Quotes(_) => SourceId::Quotes,
            SourceUpdate::BtcPrice(_) => SourceId::BtcPrice,
            SourceUpdate::BlockHeight(_) => SourceId::BlockHeight,
        }
    }
}

/// Completed poll, tagged with its per-source issue sequence.
#[derive(Debug, Clone, PartialEq)]
pub struct PollOutcome {
    pub source: SourceId,
    pub issued: u64,
    pub result: Result<SourceUpdate, TelemetryError>,
}

/// Immutable, fully-populated view of every source. Replaced wholesale.
#[derive(Debug, Clone, PartialEq)]
pub struct TelemetrySnapshot {
    pub account: Option<AccountView>,
    pub positions: Vec<PositionView>,
    pub settings: Option<TradingSettings>,
    pub orders: Vec<OrderView>,
    pub quotes: BTreeMap<SmolStr, f64>,
    pub btc_price: Option<f64>,
    pub block_height: Option<u64>,
    /// Monotonic publication time, never decreases
    pub fetched_at: Instant,
    pub time_fetched: DateTime<Utc>,
    /// Absent until the source has completed its first poll
    pub source_health: FnvHashMap<SourceId, bool>,
}

impl TelemetrySnapshot {
    pub fn empty() -> Self {
        Self {
            account: None,
            positions: Vec::new(),
            settings: None,
            orders: Vec::new(),
            quotes: BTreeMap::new(),
            btc_price: None,
            block_height: None,
            fetched_at: Instant::now(),
            time_fetched: Utc::now(),
            source_health: FnvHashMap::default(),
        }
    }

    pub fn is_healthy(&self, source: SourceId) -> Option<bool> {
        self.source_health.get(&source).copied()
    }
}

impl Default for TelemetrySnapshot {
    fn default() -> Self {
        Self::empty()
    }
}

/// Aggregator-owned fold state. Every applied outcome yields a complete new
/// [`TelemetrySnapshot`].
#[derive(Debug)]
pub struct TelemetryState {
    snapshot: TelemetrySnapshot,
    applied: FnvHashMap<SourceId, u64>,
}

impl TelemetryState {
    pub fn new(snapshot: TelemetrySnapshot) -> Self {
        Self {
            snapshot,
            applied: FnvHashMap::default(),
        }
    }

    pub fn snapshot(&self) -> &TelemetrySnapshot {
        &self.snapshot
    }

    /// Fold one poll outcome into the next snapshot.
    ///
    /// Returns `None` when an outcome issued before the last applied one for the
    /// same source arrives late; stale data never overwrites fresher data.
    /// Failed polls keep every previous value and only flip the health flag.
    pub fn apply(&mut self, outcome: PollOutcome, history: &PriceHistory) -> Option<TelemetrySnapshot> {
        let PollOutcome {
            source,
            issued,
            result,
        } = outcome;

        if self.applied.get(&source).is_some_and(|&applied| issued <= applied) {
            debug!(%source, issued, "discarding stale poll outcome");
            return None;
        }
        self.applied.insert(source, issued);

        let mut next = self.snapshot.clone();
        let healthy = match result {
            Ok(update) if update.source() == source => {
                Self::merge(&mut next, update, history);
                true
            }
            Ok(update) => {
                warn!(%source, actual = %update.source(), "poll produced update for another source");
                false
            }
            Err(TelemetryError::Unauthenticated) => {
                debug!(%source, "source unavailable without a session credential");
                false
            }
            Err(error) => {
                warn!(%source, %error, "poll failed, keeping previous value");
                false
            }
        };

        next.source_health.insert(source, healthy);
        next.fetched_at = Instant::now().max(self.snapshot.fetched_at);
        next.time_fetched = Utc::now();

        self.snapshot = next.clone();
        Some(next)
    }

    fn merge(next: &mut TelemetrySnapshot, update: SourceUpdate, history: &PriceHistory) {
        match update {
            SourceUpdate::Account(account) => {
                if let Some(equity) = account.equity.to_f64() {
                    history.push(Series::Equity, equity);
                }
                next.account = Some(account);
            }
            SourceUpdate::Positions(positions) => next.positions = positions,
            SourceUpdate::Settings(settings) => next.settings = Some(settings),
            SourceUpdate::Orders(orders) => next.orders = orders,
            SourceUpdate::Quotes(quotes) => {
                for (symbol, price) in quotes {
                    history.push(Series::Quote(symbol.clone()), price);
                    next.quotes.insert(symbol, price);
                }
            }
            SourceUpdate::BtcPrice(price) => {
                history.push(Series::Btc, price);
                next.btc_price = Some(price);
            }
            SourceUpdate::BlockHeight(height) => match next.block_height {
                Some(previous) if height < previous => {
                    debug!(previous, height, "ignoring block height regression");
                }
                _ => next.block_height = Some(height),
            },
        }
    }
}
