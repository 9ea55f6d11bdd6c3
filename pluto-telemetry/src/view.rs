//! Display-ready projection of the latest telemetry.
//!
//! Everything here is pure: the same snapshot, history and alerts always project
//! to the same [`DisplayView`]. Stored values are never rounded; rounding happens
//! only when formatting for presentation.

use crate::{
    alert::AlertEntry,
    ring::{PriceHistory, Series},
    stream::ConnectionState,
    telemetry::{AccountView, OrderView, PositionView, SourceId, TelemetrySnapshot, TradingMode, WidgetToggles},
};
use chrono::{DateTime, Utc};
use itertools::{Itertools, MinMaxResult};
use rust_decimal::{Decimal, RoundingStrategy, prelude::ToPrimitive};
use smol_str::SmolStr;

/// Circumference of the r=40 cash gauge circle.
pub const GAUGE_CIRCUMFERENCE: f64 = 251.2;

/// Quarter-turn dash offset so the gauge starts at twelve o'clock.
pub const GAUGE_OFFSET: f64 = 62.8;

pub const SPARKLINE_WIDTH: f64 = 100.0;
pub const SPARKLINE_HEIGHT: f64 = 40.0;

/// Vertical padding kept free at the top of a sparkline.
pub const SPARKLINE_INSET: f64 = 4.0;

const UNKNOWN_PRICE: &str = "---";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountSummary {
    pub equity: Decimal,
    pub cash: Decimal,
    pub buying_power: Decimal,
    pub day_pl: Decimal,
    pub day_pl_percent: Decimal,
    pub cash_percent: Decimal,
}

impl AccountSummary {
    pub fn from_account(account: &AccountView) -> Self {
        let day_pl = account.equity - account.last_equity;
        let day_pl_percent = if account.last_equity > Decimal::ZERO {
            day_pl / account.last_equity * Decimal::ONE_HUNDRED
        } else {
            Decimal::ZERO
        };
        let cash_percent = if account.equity > Decimal::ZERO {
            account.cash / account.equity * Decimal::ONE_HUNDRED
        } else {
            Decimal::ONE_HUNDRED
        };

        Self {
            equity: account.equity,
            cash: account.cash,
            buying_power: account.buying_power,
            day_pl,
            day_pl_percent,
            cash_percent,
        }
    }
}

/// Drawing area a series is normalised into.
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct Extent {
    pub width: f64,
    pub height: f64,
    pub inset: f64,
}

impl Default for Extent {
    fn default() -> Self {
        Self {
            width: SPARKLINE_WIDTH,
            height: SPARKLINE_HEIGHT,
            inset: SPARKLINE_INSET,
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

/// Min-max normalised polyline. SVG coordinates, so y grows downwards.
#[derive(Debug, Clone, PartialEq)]
pub struct Sparkline {
    pub points: Vec<Point>,
    pub min: f64,
    pub max: f64,
}

impl Sparkline {
    /// `None` for fewer than two values. A flat series draws along the bottom.
    pub fn from_values(values: &[f64], extent: Extent) -> Option<Self> {
        if values.len() < 2 {
            return None;
        }
        let (min, max) = min_max(values)?;
        let range = if max > min { max - min } else { 1.0 };
        let last = (values.len() - 1) as f64;

        let points = values
            .iter()
            .enumerate()
            .map(|(index, value)| Point {
                x: index as f64 / last * extent.width,
                y: extent.height - (value - min) / range * (extent.height - extent.inset),
            })
            .collect();

        Some(Self { points, min, max })
    }

    /// `points` attribute of an SVG `<polyline>`.
    pub fn svg_points(&self) -> String {
        self.points
            .iter()
            .map(|point| format!("{},{}", point.x, point.y))
            .join(" ")
    }

    /// `d` attribute of an SVG `<path>`.
    pub fn svg_path(&self) -> String {
        self.points
            .iter()
            .enumerate()
            .map(|(index, point)| {
                let command = if index == 0 { 'M' } else { 'L' };
                format!("{command} {} {}", point.x, point.y)
            })
            .join(" ")
    }
}

fn min_max(values: &[f64]) -> Option<(f64, f64)> {
    match values.iter().copied().filter(|value| value.is_finite()).minmax() {
        MinMaxResult::NoElements => None,
        MinMaxResult::OneElement(value) => Some((value, value)),
        MinMaxResult::MinMax(min, max) => Some((min, max)),
    }
}

/// Circular gauge drawn with a dashed stroke.
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct Gauge {
    /// Filled share, clamped to 0..=100
    pub percent: f64,
    pub dash: f64,
    pub offset: f64,
}

impl Gauge {
    pub fn from_percent(percent: f64) -> Self {
        let percent = if percent.is_finite() { percent.clamp(0.0, 100.0) } else { 0.0 };
        Self {
            percent,
            dash: percent / 100.0 * GAUGE_CIRCUMFERENCE,
            offset: GAUGE_OFFSET,
        }
    }

    /// Position of the latest value within the series' min-max range.
    pub fn from_series(values: &[f64]) -> Option<Self> {
        if values.len() < 2 {
            return None;
        }
        let (min, max) = min_max(values)?;
        let latest = *values.last()?;
        let range = if max > min { max - min } else { 1.0 };

        Some(Self::from_percent((latest - min) / range * 100.0))
    }

    /// Needle angle in degrees clockwise from twelve o'clock.
    pub fn angle(&self) -> f64 {
        self.percent * 3.6
    }

    /// `stroke-dasharray` attribute.
    pub fn dash_array(&self) -> String {
        format!("{} {}", self.dash, GAUGE_CIRCUMFERENCE)
    }
}

/// `$1,234.56`, `-$20.00`.
pub fn format_currency(value: Decimal) -> String {
    let rounded = value.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero);
    let sign = if rounded.is_sign_negative() && !rounded.is_zero() { "-" } else { "" };
    format!("{sign}${}", group_thousands(&format!("{:.2}", rounded.abs())))
}

/// Signed currency change, `+$2,000.00`.
pub fn format_signed_currency(value: Decimal) -> String {
    if value >= Decimal::ZERO {
        format!("+{}", format_currency(value))
    } else {
        format_currency(value)
    }
}

/// `97,012.55` with `decimals` fraction digits, or `---` when unknown.
pub fn format_price(price: Option<f64>, decimals: usize) -> String {
    match price {
        Some(price) if price.is_finite() && price > 0.0 => {
            group_thousands(&format!("{price:.decimals$}"))
        }
        _ => UNKNOWN_PRICE.to_string(),
    }
}

/// One decimal with explicit sign, `+1.2%`.
pub fn format_change(change: f64) -> String {
    let sign = if change >= 0.0 { "+" } else { "" };
    format!("{sign}{change:.1}%")
}

/// Two decimals with explicit sign, `+2.04%`.
pub fn format_percent(percent: Decimal) -> String {
    let rounded = percent.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero);
    let sign = if rounded >= Decimal::ZERO { "+" } else { "" };
    format!("{sign}{rounded:.2}%")
}

pub fn format_block_height(height: Option<u64>) -> String {
    height.map_or_else(|| UNKNOWN_PRICE.to_string(), |height| group_thousands(&height.to_string()))
}

/// Insert `,` separators into the integer part of a plain decimal string.
fn group_thousands(number: &str) -> String {
    let (sign, unsigned) = match number.strip_prefix('-') {
        Some(rest) => ("-", rest),
        None => ("", number),
    };
    let (integer, fraction) = match unsigned.split_once('.') {
        Some((integer, fraction)) => (integer, Some(fraction)),
        None => (unsigned, None),
    };

    let grouped = integer
        .as_bytes()
        .rchunks(3)
        .rev()
        .map(|chunk| String::from_utf8_lossy(chunk).into_owned())
        .join(",");

    match fraction {
        Some(fraction) => format!("{sign}{grouped}.{fraction}"),
        None => format!("{sign}{grouped}"),
    }
}

/// Percent change across a series window, `None` without two usable points.
fn window_change(values: &[f64]) -> Option<f64> {
    let first = *values.first()?;
    let last = *values.last()?;
    (values.len() >= 2 && first > 0.0).then(|| (last - first) / first * 100.0)
}

#[derive(Debug, Clone, PartialEq)]
pub struct QuoteLine {
    pub symbol: SmolStr,
    pub price: String,
    pub sparkline: Option<Sparkline>,
}

/// Everything a display needs for one frame.
#[derive(Debug, Clone, PartialEq)]
pub struct DisplayView {
    pub connection: ConnectionState,
    pub authenticated: bool,
    pub trading_mode: Option<TradingMode>,
    pub widgets: WidgetToggles,
    pub account: Option<AccountSummary>,
    pub cash_gauge: Gauge,
    pub equity_sparkline: Option<Sparkline>,
    pub positions: Vec<PositionView>,
    pub orders: Vec<OrderView>,
    pub btc_price: String,
    pub btc_change: Option<String>,
    pub btc_sparkline: Option<Sparkline>,
    pub quotes: Vec<QuoteLine>,
    pub block_height: String,
    pub alerts: Vec<AlertEntry>,
    /// Sources whose last poll failed
    pub unhealthy: Vec<SourceId>,
    pub fetched_at: DateTime<Utc>,
}

pub fn project(
    snapshot: &TelemetrySnapshot,
    history: &PriceHistory,
    alerts: &[AlertEntry],
    connection: ConnectionState,
    authenticated: bool,
) -> DisplayView {
    let account = snapshot.account.as_ref().map(AccountSummary::from_account);
    let cash_percent = account
        .as_ref()
        .and_then(|account| account.cash_percent.to_f64())
        .unwrap_or(100.0);

    let btc_history = history.snapshot(&Series::Btc);
    let quotes = snapshot
        .quotes
        .iter()
        .map(|(symbol, price)| QuoteLine {
            symbol: symbol.clone(),
            price: format_price(Some(*price), 2),
            sparkline: Sparkline::from_values(
                &history.snapshot(&Series::Quote(symbol.clone())),
                Extent::default(),
            ),
        })
        .collect();

    let unhealthy = snapshot
        .source_health
        .iter()
        .filter(|(_, healthy)| !**healthy)
        .map(|(source, _)| *source)
        .sorted()
        .collect();

    DisplayView {
        connection,
        authenticated,
        trading_mode: snapshot.settings.as_ref().map(|settings| settings.trading_mode()),
        widgets: snapshot
            .settings
            .as_ref()
            .map(|settings| settings.widgets)
            .unwrap_or_default(),
        account,
        cash_gauge: Gauge::from_percent(cash_percent),
        equity_sparkline: Sparkline::from_values(&history.snapshot(&Series::Equity), Extent::default()),
        positions: snapshot.positions.clone(),
        orders: snapshot.orders.clone(),
        btc_price: format_price(snapshot.btc_price, 0),
        btc_change: window_change(&btc_history).map(format_change),
        btc_sparkline: Sparkline::from_values(&btc_history, Extent::default()),
        quotes,
        block_height: format_block_height(snapshot.block_height),
        alerts: alerts.to_vec(),
        unhealthy,
        fetched_at: snapshot.time_fetched,
    }
}
