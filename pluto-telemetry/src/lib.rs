//! Pluto Lander Telemetry - connectivity and aggregation core
//!
//! Everything the control-center displays sits on top of this crate:
//! - `auth`: unattended session bootstrap with bounded, fixed-delay retries
//! - `stream`: supervised streaming channel with heartbeat and reconnect
//! - `telemetry`: independently scheduled REST polls folded into one snapshot
//! - `alert`: bounded, self-expiring notifications from the stream
//! - `ring`: fixed-capacity price history feeding sparklines
//! - `view`: pure projection of the latest state into display values
//!
//! [`ControlCenter`] wires them together with an explicit lifecycle. No failure
//! in here is fatal: each one ends as a retry, a stale-but-valid snapshot, or an
//! unhealthy source flag.

pub mod alert;
pub mod auth;
pub mod center;
pub mod error;
pub mod ring;
pub mod session;
pub mod stream;
pub mod telemetry;
pub mod view;

#[cfg(test)]
mod test_utils;

// Re-export commonly used types for convenience
pub use alert::{AlertConfig, AlertEntry, AlertKind, AlertPayload, AlertQueue};
pub use auth::{AuthBootstrapper, AuthService, BootstrapConfig, BootstrapStatus, HttpAuthService};
pub use center::{ControlCenter, ControlCenterConfig};
pub use error::{FailureClass, TelemetryError};
pub use ring::{PriceHistory, RingBuffer, Series};
pub use session::{Credential, SessionStore};
pub use stream::{ConnectionState, ConnectionSupervisor, SupervisorConfig};
pub use telemetry::{AggregatorConfig, SourceId, TelemetryAggregator, TelemetrySnapshot};
pub use view::{DisplayView, project};
