use serde::{Deserialize, Serialize};
use thiserror::Error;

/// All errors generated in `pluto-telemetry`.
///
/// None of these are fatal: every component resolves a failure into a retry, a
/// stale-but-valid snapshot, or an unhealthy source flag.
#[derive(Debug, Clone, Eq, PartialEq, Deserialize, Serialize, Error)]
pub enum TelemetryError {
    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("authenticated source polled without a session credential")]
    Unauthenticated,

    #[error("network failure: {0}")]
    Network(String),

    #[error("unexpected HTTP status {status} from {url}")]
    Status { status: u16, url: String },

    #[error("protocol failure: {0}")]
    Protocol(String),

    #[error("connection lost: {0}")]
    ConnectionLoss(String),
}

/// Coarse failure taxonomy the presentation layer reasons about.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum FailureClass {
    /// Bad credentials or bootstrap exhaustion. Degrade to unauthenticated mode.
    AuthFailure,
    /// Single poll or connection attempt failed. Retried on the owner's schedule.
    TransientNetworkFailure,
    /// Malformed inbound data. Dropped and logged.
    ProtocolFailure,
    /// Streaming channel closed or errored. Triggers a supervised reconnect.
    ConnectionLoss,
}

impl TelemetryError {
    pub fn class(&self) -> FailureClass {
        match self {
            TelemetryError::Auth(_) | TelemetryError::Unauthenticated => FailureClass::AuthFailure,
            TelemetryError::Status { status, .. } if *status == 401 || *status == 403 => {
                FailureClass::AuthFailure
            }
            TelemetryError::Network(_) | TelemetryError::Status { .. } => {
                FailureClass::TransientNetworkFailure
            }
            TelemetryError::Protocol(_) => FailureClass::ProtocolFailure,
            TelemetryError::ConnectionLoss(_) => FailureClass::ConnectionLoss,
        }
    }
}

impl From<reqwest::Error> for TelemetryError {
    fn from(error: reqwest::Error) -> Self {
        match error.status() {
            Some(status) => Self::Status {
                status: status.as_u16(),
                url: error
                    .url()
                    .map(ToString::to_string)
                    .unwrap_or_default(),
            },
            None if error.is_decode() => Self::Protocol(error.to_string()),
            None => Self::Network(error.to_string()),
        }
    }
}

impl From<serde_json::Error> for TelemetryError {
    fn from(error: serde_json::Error) -> Self {
        Self::Protocol(error.to_string())
    }
}

impl From<url::ParseError> for TelemetryError {
    fn from(error: url::ParseError) -> Self {
        Self::Protocol(format!("invalid endpoint url: {error}"))
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for TelemetryError {
    fn from(error: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::ConnectionLoss(error.to_string())
    }
}
