use pluto_telemetry::{
    BootstrapConfig, ControlCenter, ControlCenterConfig, DisplayView,
    view::{format_currency, format_percent, format_signed_currency},
};
use std::time::Duration;
use tokio::time::{MissedTickBehavior, interval};
use tracing::{error, info, warn};
use url::Url;

const DEFAULT_BASE_URL: &str = "http://127.0.0.1:8000";

#[tokio::main]
async fn main() {
    // Initialize logging
    init_logging();

    info!("Starting pluto-kiosk");

    let config = match load_config() {
        Ok(config) => config,
        Err(error) => {
            error!(%error, "invalid kiosk configuration");
            return;
        }
    };

    // Refresh cadence of the logged view
    // Configurable via PLUTO_VIEW_INTERVAL_SECS env var (default: 10)
    let view_interval = std::env::var("PLUTO_VIEW_INTERVAL_SECS")
        .ok()
        .and_then(|s| s.parse::<u64>().ok())
        .filter(|secs| *secs > 0)
        .unwrap_or(10);

    let center = match ControlCenter::start(config) {
        Ok(center) => center,
        Err(error) => {
            error!(%error, "failed to start control center");
            return;
        }
    };

    let mut refresh = interval(Duration::from_secs(view_interval));
    refresh.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = refresh.tick() => log_view(&center.view()),
            signal = tokio::signal::ctrl_c() => {
                if let Err(error) = signal {
                    warn!(%error, "failed to listen for shutdown signal");
                }
                info!("Shutdown requested");
                break;
            }
        }
    }

    center.shutdown(Duration::from_secs(2)).await;
}

/// Map `PLUTO_*` env vars onto the control center config
fn load_config() -> Result<ControlCenterConfig, Box<dyn std::error::Error>> {
    let base_url = std::env::var("PLUTO_BASE_URL").unwrap_or_else(|_| DEFAULT_BASE_URL.to_string());
    let mut config = ControlCenterConfig::new(Url::parse(&base_url)?)?;

    if let Ok(stream_url) = std::env::var("PLUTO_WS_URL") {
        config = config.with_stream_url(Url::parse(&stream_url)?);
    }

    match std::env::var("PLUTO_KIOSK_USERNAME") {
        Ok(username) => {
            let password = std::env::var("PLUTO_KIOSK_PASSWORD").unwrap_or_default();
            info!(%username, "Unattended login enabled");
            config = config.with_kiosk(BootstrapConfig::new(username, password));
        }
        Err(_) => info!("PLUTO_KIOSK_USERNAME not set, showing public data only"),
    }

    Ok(config)
}

fn log_view(view: &DisplayView) {
    let (equity, day_pl) = match &view.account {
        Some(account) => (
            format_currency(account.equity),
            format!(
                "{} ({})",
                format_signed_currency(account.day_pl),
                format_percent(account.day_pl_percent)
            ),
        ),
        None => ("---".to_string(), "---".to_string()),
    };

    info!(
        connection = %view.connection,
        authenticated = view.authenticated,
        mode = ?view.trading_mode,
        btc = %view.btc_price,
        btc_change = view.btc_change.as_deref().unwrap_or("---"),
        block = %view.block_height,
        %equity,
        %day_pl,
        positions = view.positions.len(),
        alerts = view.alerts.len(),
        unhealthy = ?view.unhealthy,
        "display refreshed"
    );

    for alert in &view.alerts {
        info!(
            id = alert.id,
            kind = %alert.kind,
            symbol = alert.payload.symbol.as_deref().unwrap_or("-"),
            side = alert.payload.side.as_deref().unwrap_or("-"),
            "active alert"
        );
    }
}

/// Initialize logging
fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();
}
