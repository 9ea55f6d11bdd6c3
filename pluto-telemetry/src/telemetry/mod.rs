//! Multi-source telemetry aggregation
//!
//! Each [`TelemetrySource`] is polled by its own task on its own period. Poll
//! outcomes funnel through one channel into a single apply task, which folds them
//! into the next [`TelemetrySnapshot`] and publishes it wholesale.

mod client;
mod model;
mod snapshot;
mod source;

pub use client::{BackendClient, DEFAULT_BLOCK_HEIGHT_URL, DEFAULT_BTC_SPOT_URL, MarketFeedClient};
pub use model::{AccountView, OrderView, PositionView, TradingMode, TradingSettings, WidgetToggles};
pub use snapshot::{PollOutcome, SourceId, SourceUpdate, TelemetrySnapshot, TelemetryState};
pub use source::{HttpSource, TelemetrySource};

use crate::{ring::PriceHistory, session::SessionStore};
use smol_str::SmolStr;
use std::{sync::Arc, time::Duration};
use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
    time::{Instant, MissedTickBehavior},
};
use tracing::{debug, info};

/// Polling cadence per source and shared HTTP settings.
#[derive(Debug, Clone)]
pub struct AggregatorConfig {
    pub account_period: Duration,
    pub positions_period: Duration,
    pub settings_period: Duration,
    pub orders_period: Duration,
    pub quotes_period: Duration,
    pub btc_price_period: Duration,
    pub block_height_period: Duration,
    pub quote_symbols: Vec<SmolStr>,
    pub request_timeout: Duration,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            account_period: Duration::from_secs(30),
            positions_period: Duration::from_secs(30),
            settings_period: Duration::from_secs(300),
            orders_period: Duration::from_secs(15),
            quotes_period: Duration::from_secs(30),
            btc_price_period: Duration::from_secs(10),
            block_height_period: Duration::from_secs(60),
            quote_symbols: vec![SmolStr::new_static("AAPL"), SmolStr::new_static("SPY")],
            request_timeout: Duration::from_secs(10),
        }
    }
}

impl AggregatorConfig {
    pub fn with_period(mut self, source: SourceId, period: Duration) -> Self {
        *self.period_mut(source) = period;
        self
    }

    pub fn with_quote_symbols<I, S>(mut self, symbols: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<SmolStr>,
    {
        self.quote_symbols = symbols.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn period(&self, source: SourceId) -> Duration {
        match source {
            SourceId::Account => self.account_period,
            SourceId::Positions => self.positions_period,
            SourceId::Settings => self.settings_period,
            SourceId::Orders => self.orders_period,
            SourceId::Quotes => self.quotes_period,
            SourceId::BtcPrice => self.btc_price_period,
            SourceId::BlockHeight => self.block_height_period,
        }
    }

    fn period_mut(&mut self, source: SourceId) -> &mut Duration {
        match source {
            SourceId::Account => &mut self.account_period,
            SourceId::Positions => &mut self.positions_period,
            SourceId::Settings => &mut self.settings_period,
            SourceId::Orders => &mut self.orders_period,
            SourceId::Quotes => &mut self.quotes_period,
            SourceId::BtcPrice => &mut self.btc_price_period,
            SourceId::BlockHeight => &mut self.block_height_period,
        }
    }

    /// One [`HttpSource`] per [`SourceId`]. Sources with an empty quote list are skipped.
    pub fn http_sources(
        &self,
        backend: BackendClient,
        feeds: MarketFeedClient,
    ) -> Vec<Arc<dyn TelemetrySource>> {
        let symbols: Arc<[SmolStr]> = self.quote_symbols.clone().into();

        SourceId::ALL
            .into_iter()
            .filter(|source| *source != SourceId::Quotes || !symbols.is_empty())
            .map(|source| {
                Arc::new(HttpSource::new(
                    source,
                    self.period(source),
                    backend.clone(),
                    feeds.clone(),
                    Arc::clone(&symbols),
                )) as Arc<dyn TelemetrySource>
            })
            .collect()
    }
}

/// Handle to the running poll and apply tasks. Dropping it stops them all.
#[derive(Debug)]
pub struct TelemetryAggregator {
    snapshot: watch::Receiver<Arc<TelemetrySnapshot>>,
    history: Arc<PriceHistory>,
    tasks: Vec<JoinHandle<()>>,
}

impl TelemetryAggregator {
    /// Spawn one poller per source plus the apply task. Every source polls once
    /// immediately.
    pub fn start(
        sources: Vec<Arc<dyn TelemetrySource>>,
        session: SessionStore,
        history: Arc<PriceHistory>,
    ) -> Self {
        let initial = TelemetrySnapshot::empty();
        let (snapshot_tx, snapshot_rx) = watch::channel(Arc::new(initial.clone()));
        let (outcome_tx, outcome_rx) = mpsc::channel(sources.len().max(1) * 4);

        let mut tasks = Vec::with_capacity(sources.len() + 1);
        tasks.push(tokio::spawn(apply_outcomes(
            outcome_rx,
            TelemetryState::new(initial),
            Arc::clone(&history),
            snapshot_tx,
        )));

        for source in sources {
            info!(source = %source.id(), period_secs = source.period().as_secs(), "starting poller");
            tasks.push(tokio::spawn(poll_source(
                source,
                session.clone(),
                snapshot_rx.clone(),
                outcome_tx.clone(),
            )));
        }

        Self {
            snapshot: snapshot_rx,
            history,
            tasks,
        }
    }

    /// Latest published snapshot.
    pub fn snapshot(&self) -> Arc<TelemetrySnapshot> {
        Arc::clone(&self.snapshot.borrow())
    }

    pub fn subscribe(&self) -> watch::Receiver<Arc<TelemetrySnapshot>> {
        self.snapshot.clone()
    }

    pub fn history(&self) -> &Arc<PriceHistory> {
        &self.history
    }
}

impl Drop for TelemetryAggregator {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

/// Poll one source forever. The poll is awaited inline so a source never overlaps
/// itself; ticks that came due while it ran are dropped, not replayed late.
async fn poll_source(
    source: Arc<dyn TelemetrySource>,
    session: SessionStore,
    snapshot: watch::Receiver<Arc<TelemetrySnapshot>>,
    outcomes: mpsc::Sender<PollOutcome>,
) {
    let id = source.id();
    let authenticated = source.authenticated();
    let mut credentials = session.subscribe();
    let mut timer = tokio::time::interval(source.period());
    timer.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut issued = 0u64;
    let mut idle_since: Option<Instant> = None;

    loop {
        tokio::select! {
            scheduled = timer.tick() => {
                if idle_since.is_some_and(|idle| scheduled < idle) {
                    debug!(source = %id, "firing elapsed during previous poll, skipped");
                    continue;
                }
            }
            changed = credentials.changed(), if authenticated => {
                if changed.is_err() {
                    return;
                }
                debug!(source = %id, "session changed, polling early");
                timer.reset();
            }
        }

        issued += 1;
        let credential = session.current();
        let previous = Arc::clone(&snapshot.borrow());
        let result = source.poll(credential.as_deref(), &previous).await;
        idle_since = Some(Instant::now());

        let outcome = PollOutcome {
            source: id,
            issued,
            result,
        };
        if outcomes.send(outcome).await.is_err() {
            debug!(source = %id, "aggregator stopped, poller exiting");
            return;
        }
    }
}

async fn apply_outcomes(
    mut outcomes: mpsc::Receiver<PollOutcome>,
    mut state: TelemetryState,
    history: Arc<PriceHistory>,
    snapshot: watch::Sender<Arc<TelemetrySnapshot>>,
) {
    while let Some(outcome) = outcomes.recv().await {
        if let Some(next) = state.apply(outcome, &history) {
            snapshot.send_replace(Arc::new(next));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        session::Credential,
        test_utils::ScriptedSource,
    };
    use chrono::Utc;
    use rust_decimal_macros::dec;

    fn account(equity: rust_decimal::Decimal) -> SourceUpdate {
        SourceUpdate::Account(AccountView {
            equity,
            cash: dec!(50000),
            buying_power: dec!(100000),
            last_equity: dec!(98000),
        })
    }

    fn position(symbol: &str) -> PositionView {
        PositionView {
            symbol: symbol.into(),
            qty: dec!(1),
            market_value: dec!(500),
            unrealized_pl: dec!(-5),
            unrealized_pl_percent: dec!(-1),
            avg_entry_price: dec!(505),
        }
    }

    #[test]
    fn test_http_sources_use_configured_periods() {
        let config = AggregatorConfig::default().with_period(SourceId::BtcPrice, Duration::from_secs(5));
        let backend = BackendClient::new(
            url::Url::parse("http://127.0.0.1:8000").unwrap(),
            config.request_timeout,
        );
        let feeds = MarketFeedClient::public(config.request_timeout).unwrap();

        let sources = config.http_sources(backend.clone(), feeds.clone());
        let periods: Vec<_> = sources.iter().map(|source| (source.id(), source.period())).collect();
        assert_eq!(periods.len(), 7);
        assert!(periods.contains(&(SourceId::BtcPrice, Duration::from_secs(5))));
        assert!(periods.contains(&(SourceId::Settings, Duration::from_secs(300))));
        assert!(periods.contains(&(SourceId::Orders, Duration::from_secs(15))));

        let without_quotes = config
            .with_quote_symbols(Vec::<SmolStr>::new())
            .http_sources(backend, feeds);
        assert!(without_quotes.iter().all(|source| source.id() != SourceId::Quotes));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failing_positions_keep_previous_value() {
        let session = SessionStore::new();
        session.login(Credential::new("jwt", Utc::now()));

        let account_source = ScriptedSource::new(SourceId::Account, Duration::from_secs(30))
            .with_outcomes(vec![Ok(account(dec!(99000))), Ok(account(dec!(100000)))]);
        let positions_source = ScriptedSource::new(SourceId::Positions, Duration::from_secs(30))
            .with_outcomes(vec![
                Ok(SourceUpdate::Positions(vec![position("SPY")])),
                Err(crate::error::TelemetryError::Network("timed out".to_string())),
            ]);

        let history = Arc::new(PriceHistory::default());
        let aggregator = TelemetryAggregator::start(
            vec![
                Arc::new(account_source) as Arc<dyn TelemetrySource>,
                Arc::new(positions_source),
            ],
            session,
            Arc::clone(&history),
        );

        tokio::time::sleep(Duration::from_secs(31)).await;
        let snapshot = aggregator.snapshot();

        assert_eq!(snapshot.account.as_ref().unwrap().equity, dec!(100000));
        assert_eq!(snapshot.positions, vec![position("SPY")]);
        assert_eq!(snapshot.is_healthy(SourceId::Account), Some(true));
        assert_eq!(snapshot.is_healthy(SourceId::Positions), Some(false));
        assert_eq!(history.snapshot(&crate::ring::Series::Equity), vec![99000.0, 100000.0]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_poll_never_overlaps() {
        let source = Arc::new(
            ScriptedSource::new(SourceId::BtcPrice, Duration::from_secs(10))
                .with_outcomes(vec![Ok(SourceUpdate::BtcPrice(97000.0))])
                .with_latency(Duration::from_secs(25)),
        );

        let _aggregator = TelemetryAggregator::start(
            vec![source.clone() as Arc<dyn TelemetrySource>],
            SessionStore::new(),
            Arc::new(PriceHistory::default()),
        );

        // Firings at t=10 and 20 land mid-poll and are dropped
        tokio::time::sleep(Duration::from_secs(27)).await;
        assert_eq!(source.calls(), 1);

        // Polls start at t=0, 30 and 60
        tokio::time::sleep(Duration::from_secs(62)).await;
        assert_eq!(source.calls(), 3);
        assert_eq!(source.max_in_flight(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_credential_change_polls_authenticated_sources_early() {
        let session = SessionStore::new();
        let account_source = Arc::new(
            ScriptedSource::new(SourceId::Account, Duration::from_secs(30))
                .with_outcomes(vec![Ok(account(dec!(100000)))]),
        );
        let btc_source = Arc::new(
            ScriptedSource::new(SourceId::BtcPrice, Duration::from_secs(30))
                .with_outcomes(vec![Ok(SourceUpdate::BtcPrice(97000.0))]),
        );

        let aggregator = TelemetryAggregator::start(
            vec![
                account_source.clone() as Arc<dyn TelemetrySource>,
                btc_source.clone(),
            ],
            session.clone(),
            Arc::new(PriceHistory::default()),
        );

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(account_source.calls(), 1);
        assert_eq!(account_source.last_token(), None);
        assert_eq!(aggregator.snapshot().is_healthy(SourceId::Account), Some(false));

        session.login(Credential::new("jwt", Utc::now()));
        tokio::time::sleep(Duration::from_secs(1)).await;

        assert_eq!(account_source.calls(), 2);
        assert_eq!(account_source.last_token().as_deref(), Some("jwt"));
        assert_eq!(btc_source.calls(), 1);
        assert_eq!(aggregator.snapshot().is_healthy(SourceId::Account), Some(true));

        // Interval restarted from the credential change at t=5s
        tokio::time::sleep(Duration::from_secs(28)).await;
        assert_eq!(account_source.calls(), 2);
        assert_eq!(btc_source.calls(), 2);
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(account_source.calls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_drop_stops_polling() {
        let source = Arc::new(
            ScriptedSource::new(SourceId::BlockHeight, Duration::from_secs(60))
                .with_outcomes(vec![Ok(SourceUpdate::BlockHeight(875_000))]),
        );
        let aggregator = TelemetryAggregator::start(
            vec![source.clone() as Arc<dyn TelemetrySource>],
            SessionStore::new(),
            Arc::new(PriceHistory::default()),
        );

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(aggregator.snapshot().block_height, Some(875_000));

        drop(aggregator);
        tokio::time::sleep(Duration::from_secs(600)).await;
        assert_eq!(source.calls(), 1);
    }
}
