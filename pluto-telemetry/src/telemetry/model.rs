use chrono::{DateTime, Utc};
use derive_more::Display;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;

/// Brokerage account balances from `GET /api/alpaca/account`.
///
/// Amounts arrive as decimal strings and stay [`Decimal`] so P&L never drifts.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct AccountView {
    pub equity: Decimal,
    pub cash: Decimal,
    pub buying_power: Decimal,
    pub last_equity: Decimal,
}

/// Open position from `GET /api/alpaca/positions`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(from = "AlpacaPosition")]
pub struct PositionView {
    pub symbol: SmolStr,
    pub qty: Decimal,
    pub market_value: Decimal,
    pub unrealized_pl: Decimal,
    /// Percent, not the fraction the broker reports (`0.0123` -> `1.23`)
    pub unrealized_pl_percent: Decimal,
    pub avg_entry_price: Decimal,
}

#[derive(Debug, Deserialize)]
struct AlpacaPosition {
    symbol: SmolStr,
    qty: Decimal,
    market_value: Decimal,
    unrealized_pl: Decimal,
    unrealized_plpc: Decimal,
    avg_entry_price: Decimal,
}

impl From<AlpacaPosition> for PositionView {
    fn from(position: AlpacaPosition) -> Self {
        Self {
            symbol: position.symbol,
            qty: position.qty,
            market_value: position.market_value,
            unrealized_pl: position.unrealized_pl,
            unrealized_pl_percent: position.unrealized_plpc * Decimal::ONE_HUNDRED,
            avg_entry_price: position.avg_entry_price,
        }
    }
}

/// Recent order from `GET /api/alpaca/orders?status=all&limit=50`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct OrderView {
    pub id: SmolStr,
    pub symbol: SmolStr,
    pub side: SmolStr,
    /// `None` for notional orders
    #[serde(default)]
    pub qty: Option<Decimal>,
    #[serde(rename = "type")]
    pub order_type: SmolStr,
    pub status: SmolStr,
    #[serde(default)]
    pub filled_avg_price: Option<Decimal>,
    #[serde(default)]
    pub filled_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Display, Deserialize, Serialize)]
pub enum TradingMode {
    #[display("PAPER")]
    Paper,
    #[display("LIVE")]
    Live,
}

/// Public settings from `GET /api/settings`. Secrets arrive masked.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct TradingSettings {
    #[serde(default = "default_paper")]
    pub alpaca_paper: bool,
    #[serde(default)]
    pub alpaca_api_key_masked: Option<String>,
    #[serde(default = "default_theme")]
    pub display_theme: String,
    #[serde(flatten)]
    pub widgets: WidgetToggles,
}

fn default_paper() -> bool {
    true
}

fn default_theme() -> String {
    "dark-gold".to_string()
}

impl TradingSettings {
    pub fn trading_mode(&self) -> TradingMode {
        if self.alpaca_paper {
            TradingMode::Paper
        } else {
            TradingMode::Live
        }
    }

    pub fn has_broker_key(&self) -> bool {
        self.alpaca_api_key_masked.is_some()
    }
}

/// Which panels the unattended display shows.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct WidgetToggles {
    #[serde(rename = "widget_btc_price")]
    pub btc_price: bool,
    #[serde(rename = "widget_portfolio")]
    pub portfolio: bool,
    #[serde(rename = "widget_positions")]
    pub positions: bool,
    #[serde(rename = "widget_pnl")]
    pub pnl: bool,
    #[serde(rename = "widget_clock")]
    pub clock: bool,
    #[serde(rename = "widget_alerts")]
    pub alerts: bool,
}

impl Default for WidgetToggles {
    fn default() -> Self {
        Self {
            btc_price: true,
            portfolio: true,
            positions: true,
            pnl: true,
            clock: false,
            alerts: true,
        }
    }
}
