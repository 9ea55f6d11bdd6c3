use super::model::{AccountView, OrderView, PositionView, TradingSettings};
use crate::{error::TelemetryError, session::Credential};
use serde::{Deserialize, de::DeserializeOwned};
use std::time::Duration;
use tracing::debug;
use url::Url;

/// Coinbase spot price, e.g. `{"data":{"base":"BTC","currency":"USD","amount":"97012.55"}}`.
pub const DEFAULT_BTC_SPOT_URL: &str = "https://api.coinbase.com/v2/prices/BTC-USD/spot";

/// mempool.space chain tip height, returned as a bare integer.
pub const DEFAULT_BLOCK_HEIGHT_URL: &str = "https://mempool.space/api/blocks/tip/height";

/// Authenticated REST client for the trading backend.
#[derive(Debug, Clone)]
pub struct BackendClient {
    http: reqwest::Client,
    base_url: Url,
    timeout: Duration,
}

#[derive(Debug, Deserialize)]
struct QuoteResponse {
    quote: Quote,
}

#[derive(Debug, Deserialize)]
struct Quote {
    /// Ask price
    ap: f64,
}

impl BackendClient {
    pub fn new(base_url: Url, timeout: Duration) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url,
            timeout,
        }
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    async fn get<T>(
        &self,
        credential: Option<&Credential>,
        path: &str,
        query: &[(&str, &str)],
    ) -> Result<T, TelemetryError>
    where
        T: DeserializeOwned,
    {
        let credential = credential.ok_or(TelemetryError::Unauthenticated)?;
        let url = self.base_url.join(path)?;
        debug!(%url, "polling backend");

        let response = self
            .http
            .get(url)
            .query(query)
            .bearer_auth(credential.token())
            .timeout(self.timeout)
            .send()
            .await?
            .error_for_status()?;

        Ok(response.json::<T>().await?)
    }

    pub async fn account(&self, credential: Option<&Credential>) -> Result<AccountView, TelemetryError> {
        self.get(credential, "/api/alpaca/account", &[]).await
    }

    pub async fn positions(
        &self,
        credential: Option<&Credential>,
    ) -> Result<Vec<PositionView>, TelemetryError> {
        self.get(credential, "/api/alpaca/positions", &[]).await
    }

    pub async fn orders(&self, credential: Option<&Credential>) -> Result<Vec<OrderView>, TelemetryError> {
        self.get(
            credential,
            "/api/alpaca/orders",
            &[("status", "all"), ("limit", "50")],
        )
        .await
    }

    pub async fn settings(
        &self,
        credential: Option<&Credential>,
    ) -> Result<TradingSettings, TelemetryError> {
        self.get(credential, "/api/settings", &[]).await
    }

    /// Latest ask price for `symbol`.
    pub async fn quote(&self, credential: Option<&Credential>, symbol: &str) -> Result<f64, TelemetryError> {
        let path = format!("/api/alpaca/quote/{symbol}");
        let response: QuoteResponse = self.get(credential, &path, &[]).await?;
        quote_ask(symbol, &response)
    }
}

/// Unauthenticated client for the public price and chain feeds.
#[derive(Debug, Clone)]
pub struct MarketFeedClient {
    http: reqwest::Client,
    btc_spot_url: Url,
    block_height_url: Url,
    timeout: Duration,
}

#[derive(Debug, Deserialize)]
struct CoinbaseSpot {
    data: CoinbaseSpotData,
}

#[derive(Debug, Deserialize)]
struct CoinbaseSpotData {
    amount: String,
}

impl MarketFeedClient {
    pub fn new(btc_spot_url: Url, block_height_url: Url, timeout: Duration) -> Self {
        Self {
            http: reqwest::Client::new(),
            btc_spot_url,
            block_height_url,
            timeout,
        }
    }

    /// Client for the default Coinbase and mempool.space endpoints.
    pub fn public(timeout: Duration) -> Result<Self, TelemetryError> {
        Ok(Self::new(
            Url::parse(DEFAULT_BTC_SPOT_URL)?,
            Url::parse(DEFAULT_BLOCK_HEIGHT_URL)?,
            timeout,
        ))
    }

    pub async fn btc_spot(&self) -> Result<f64, TelemetryError> {
        let spot = self
            .http
            .get(self.btc_spot_url.clone())
            .timeout(self.timeout)
            .send()
            .await?
            .error_for_status()?
            .json::<CoinbaseSpot>()
            .await?;

        parse_spot_amount(&spot.data.amount)
    }

    pub async fn block_height(&self) -> Result<u64, TelemetryError> {
        let body = self
            .http
            .get(self.block_height_url.clone())
            .timeout(self.timeout)
            .send()
            .await?
            .error_for_status()?
            .text()
            .await?;

        parse_block_height(&body)
    }
}

fn parse_spot_amount(amount: &str) -> Result<f64, TelemetryError> {
    match amount.trim().parse::<f64>() {
        Ok(price) if price.is_finite() && price > 0.0 => Ok(price),
        _ => Err(TelemetryError::Protocol(format!("invalid spot amount: {amount:?}"))),
    }
}

/// Alpaca reports `ap: 0` when no ask is resting, e.g. outside market hours.
fn quote_ask(symbol: &str, response: &QuoteResponse) -> Result<f64, TelemetryError> {
    match response.quote.ap {
        ask if ask.is_finite() && ask > 0.0 => Ok(ask),
        ask => Err(TelemetryError::Protocol(format!("no usable ask for {symbol}: {ask}"))),
    }
}

fn parse_block_height(body: &str) -> Result<u64, TelemetryError> {
    body.trim()
        .parse::<u64>()
        .map_err(|error| TelemetryError::Protocol(format!("invalid block height {body:?}: {error}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_spot_amount() {
        struct TestCase {
            input: &'static str,
            expected: Option<f64>,
        }

        let tests = vec![
            TestCase {
                // TC0: coinbase decimal string
                input: "97012.55",
                expected: Some(97012.55),
            },
            TestCase {
                // TC1: surrounding whitespace
                input: " 64000 ",
                expected: Some(64000.0),
            },
            TestCase {
                // TC2: zero is never a valid spot price
                input: "0",
                expected: None,
            },
            TestCase {
                // TC3: garbage
                input: "n/a",
                expected: None,
            },
        ];

        for (index, test) in tests.into_iter().enumerate() {
            let actual = parse_spot_amount(test.input).ok();
            assert_eq!(actual, test.expected, "TC{} failed", index);
        }
    }

    #[test]
    fn test_parse_block_height() {
        assert_eq!(parse_block_height("875123\n").unwrap(), 875_123);
        assert!(parse_block_height("-1").is_err());
        assert!(parse_block_height("<html>").is_err());
    }

    #[test]
    fn test_de_coinbase_spot() {
        let input = r#"{"data":{"base":"BTC","currency":"USD","amount":"97012.55"}}"#;
        let spot: CoinbaseSpot = serde_json::from_str(input).unwrap();
        assert_eq!(spot.data.amount, "97012.55");
    }

    #[test]
    fn test_de_quote_response() {
        let input = r#"{"symbol":"AAPL","quote":{"t":"2024-11-01T19:59:59Z","ax":"V","ap":222.91,"as":1,"bx":"V","bp":222.88,"bs":2}}"#;
        let quote: QuoteResponse = serde_json::from_str(input).unwrap();
        assert_eq!(quote.quote.ap, 222.91);
    }

    #[test]
    fn test_quote_ask() {
        struct TestCase {
            input: &'static str,
            expected: Option<f64>,
        }

        let tests = vec![
            TestCase {
                // TC0: resting ask
                input: r#"{"quote":{"ap":222.91,"bp":222.88}}"#,
                expected: Some(222.91),
            },
            TestCase {
                // TC1: market closed, no ask
                input: r#"{"quote":{"ap":0,"bp":0}}"#,
                expected: None,
            },
            TestCase {
                // TC2: negative ask
                input: r#"{"quote":{"ap":-1.5}}"#,
                expected: None,
            },
        ];

        for (index, test) in tests.into_iter().enumerate() {
            let response: QuoteResponse = serde_json::from_str(test.input).unwrap();
            let actual = quote_ask("AAPL", &response).ok();
            assert_eq!(actual, test.expected, "TC{} failed", index);
        }
    }

    #[tokio::test]
    async fn test_backend_requires_credential() {
        let client = BackendClient::new(
            Url::parse("http://127.0.0.1:8000").unwrap(),
            Duration::from_secs(1),
        );

        assert_eq!(client.account(None).await, Err(TelemetryError::Unauthenticated));
        assert_eq!(client.quote(None, "SPY").await, Err(TelemetryError::Unauthenticated));
    }
}
