use super::{
    client::{BackendClient, MarketFeedClient},
    snapshot::{SourceId, SourceUpdate, TelemetrySnapshot},
};
use crate::{error::TelemetryError, session::Credential};
use async_trait::async_trait;
use futures::future::join_all;
use smol_str::SmolStr;
use std::{collections::BTreeMap, sync::Arc, time::Duration};
use tracing::debug;

/// One independently scheduled data provider.
///
/// `poll` is a total function of the current credential and the previous
/// snapshot: it either yields fresh partial data or an error, and never
/// touches the snapshot itself.
#[async_trait]
pub trait TelemetrySource: Send + Sync + 'static {
    fn id(&self) -> SourceId;

    fn period(&self) -> Duration;

    /// Re-poll immediately whenever the session credential changes.
    fn authenticated(&self) -> bool {
        self.id().is_authenticated()
    }

    async fn poll(
        &self,
        credential: Option<&Credential>,
        previous: &TelemetrySnapshot,
    ) -> Result<SourceUpdate, TelemetryError>;
}

/// [`TelemetrySource`] backed by the backend REST API or a public feed.
#[derive(Debug, Clone)]
pub struct HttpSource {
    id: SourceId,
    period: Duration,
    backend: BackendClient,
    feeds: MarketFeedClient,
    quote_symbols: Arc<[SmolStr]>,
}

impl HttpSource {
    pub fn new(
        id: SourceId,
        period: Duration,
        backend: BackendClient,
        feeds: MarketFeedClient,
        quote_symbols: Arc<[SmolStr]>,
    ) -> Self {
        Self {
            id,
            period,
            backend,
            feeds,
            quote_symbols,
        }
    }

    /// Every symbol is requested concurrently. Succeeds if at least one answers.
    async fn poll_quotes(
        &self,
        credential: Option<&Credential>,
    ) -> Result<BTreeMap<SmolStr, f64>, TelemetryError> {
        let credential = credential.ok_or(TelemetryError::Unauthenticated)?;

        let results = join_all(self.quote_symbols.iter().map(|symbol| async move {
            (symbol, self.backend.quote(Some(credential), symbol).await)
        }))
        .await;

        let mut quotes = BTreeMap::new();
        let mut last_error = None;
        for (symbol, result) in results {
            match result {
                Ok(price) => {
                    quotes.insert(symbol.clone(), price);
                }
                Err(error) => {
                    debug!(%symbol, %error, "quote unavailable");
                    last_error = Some(error);
                }
            }
        }

        match last_error {
            Some(error) if quotes.is_empty() => Err(error),
            _ => Ok(quotes),
        }
    }
}

#[async_trait]
impl TelemetrySource for HttpSource {
    fn id(&self) -> SourceId {
        self.id
    }

    fn period(&self) -> Duration {
        self.period
    }

    async fn poll(
        &self,
        credential: Option<&Credential>,
        previous: &TelemetrySnapshot,
    ) -> Result<SourceUpdate, TelemetryError> {
        let update = match self.id {
            SourceId::Account => SourceUpdate::Account(self.backend.account(credential).await?),
            SourceId::Positions => SourceUpdate::Positions(self.backend.positions(credential).await?),
            SourceId::Settings => SourceUpdate::Settings(self.backend.settings(credential).await?),
            SourceId::Orders => SourceUpdate::Orders(self.backend.orders(credential).await?),
            SourceId::Quotes => SourceUpdate::Quotes(self.poll_quotes(credential).await?),
            SourceId::BtcPrice => SourceUpdate::BtcPrice(self.feeds.btc_spot().await?),
            SourceId::BlockHeight => {
                let height = self.feeds.block_height().await?;
                SourceUpdate::BlockHeight(previous.block_height.map_or(height, |floor| floor.max(height)))
            }
        };

        Ok(update)
    }
}
