use crate::{
    alert::{AlertConfig, AlertQueue, AlertReaper},
    auth::{AuthBootstrapper, AuthService, BootstrapConfig, BootstrapStatus, HttpAuthService},
    error::TelemetryError,
    ring::{DEFAULT_HISTORY_CAPACITY, PriceHistory},
    session::SessionStore,
    stream::{ConnectionState, ConnectionSupervisor, Connector, SupervisorConfig, WsConnector},
    telemetry::{AggregatorConfig, BackendClient, MarketFeedClient, TelemetryAggregator, TelemetrySource},
    view::{DisplayView, project},
};
use std::{fmt, sync::Arc, time::Duration};
use tracing::{info, warn};
use url::Url;

/// Path of the backend's streaming telemetry channel.
pub const TELEMETRY_STREAM_PATH: &str = "/ws/telemetry";

/// Control center configuration
#[derive(Debug, Clone)]
pub struct ControlCenterConfig {
    /// Backend REST base, e.g. `http://127.0.0.1:8000`
    pub base_url: Url,
    /// Streaming channel, derived from `base_url` unless overridden
    pub stream_url: Url,
    /// Unattended login; `None` leaves authentication to interactive login
    pub kiosk: Option<BootstrapConfig>,
    pub supervisor: SupervisorConfig,
    pub aggregator: AggregatorConfig,
    pub alerts: AlertConfig,
    pub history_capacity: usize,
    /// Applied to login and every REST poll
    pub request_timeout: Duration,
}

impl ControlCenterConfig {
    pub fn new(base_url: Url) -> Result<Self, TelemetryError> {
        let stream_url = stream_url_for(&base_url)?;
        Ok(Self {
            base_url,
            stream_url,
            kiosk: None,
            supervisor: SupervisorConfig::default(),
            aggregator: AggregatorConfig::default(),
            alerts: AlertConfig::default(),
            history_capacity: DEFAULT_HISTORY_CAPACITY,
            request_timeout: Duration::from_secs(10),
        })
    }

    pub fn with_stream_url(mut self, stream_url: Url) -> Self {
        self.stream_url = stream_url;
        self
    }

    pub fn with_kiosk(mut self, kiosk: BootstrapConfig) -> Self {
        self.kiosk = Some(kiosk);
        self
    }

    pub fn with_supervisor(mut self, supervisor: SupervisorConfig) -> Self {
        self.supervisor = supervisor;
        self
    }

    pub fn with_aggregator(mut self, aggregator: AggregatorConfig) -> Self {
        self.aggregator = aggregator;
        self
    }

    pub fn with_alerts(mut self, alerts: AlertConfig) -> Self {
        self.alerts = alerts;
        self
    }

    pub fn with_history_capacity(mut self, capacity: usize) -> Self {
        self.history_capacity = capacity;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }
}

/// `http(s)://host:port/...` -> `ws(s)://host:port/ws/telemetry`.
fn stream_url_for(base_url: &Url) -> Result<Url, TelemetryError> {
    let scheme = match base_url.scheme() {
        "https" | "wss" => "wss",
        "http" | "ws" => "ws",
        other => {
            return Err(TelemetryError::Protocol(format!(
                "unsupported backend scheme: {other}"
            )));
        }
    };

    let mut stream_url = base_url.join(TELEMETRY_STREAM_PATH)?;
    stream_url
        .set_scheme(scheme)
        .map_err(|_| TelemetryError::Protocol(format!("cannot derive stream url from {base_url}")))?;
    Ok(stream_url)
}

/// One running control center: session, unattended login, streaming channel,
/// alert queue, telemetry aggregation and price history, wired together with
/// an explicit lifecycle. Dropping it stops every background task.
pub struct ControlCenter {
    session: SessionStore,
    auth: Arc<dyn AuthService>,
    bootstrapper: Option<AuthBootstrapper>,
    supervisor: ConnectionSupervisor,
    aggregator: TelemetryAggregator,
    alerts: Arc<AlertQueue>,
    history: Arc<PriceHistory>,
    _reaper: AlertReaper,
}

impl fmt::Debug for ControlCenter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ControlCenter")
            .field("session", &self.session)
            .field("bootstrapper", &self.bootstrapper)
            .field("connection", &self.supervisor.state())
            .field("alerts", &self.alerts.len())
            .finish_non_exhaustive()
    }
}

impl ControlCenter {
    /// Start against the real backend and public feeds. Must be called from
    /// within a tokio runtime.
    pub fn start(config: ControlCenterConfig) -> Result<Self, TelemetryError> {
        let auth = Arc::new(HttpAuthService::new(&config.base_url, config.request_timeout)?);
        let connector = Arc::new(WsConnector::new(config.stream_url.as_str()));
        let backend = BackendClient::new(config.base_url.clone(), config.request_timeout);
        let feeds = MarketFeedClient::public(config.request_timeout)?;
        let sources = config.aggregator.http_sources(backend, feeds);

        info!(
            base_url = %config.base_url,
            stream_url = %config.stream_url,
            kiosk = config.kiosk.is_some(),
            "starting control center"
        );
        Ok(Self::from_parts(config, auth, connector, sources))
    }

    /// Wire the components around the given seams, open the streaming channel
    /// and start the unattended login if configured.
    ///
    /// The backend accepts unauthenticated stream clients, so the channel opens
    /// immediately rather than waiting for a credential. A credential published
    /// later does not reopen a live channel; it is attached on the next connect.
    pub fn from_parts(
        config: ControlCenterConfig,
        auth: Arc<dyn AuthService>,
        connector: Arc<dyn Connector>,
        sources: Vec<Arc<dyn TelemetrySource>>,
    ) -> Self {
        let session = SessionStore::new();
        let alerts = Arc::new(AlertQueue::new(config.alerts));
        let reaper = alerts.spawn_reaper();
        let history = Arc::new(PriceHistory::new(config.history_capacity));

        let aggregator = TelemetryAggregator::start(sources, session.clone(), Arc::clone(&history));
        let supervisor = ConnectionSupervisor::new(
            config.supervisor,
            connector,
            session.clone(),
            Arc::clone(&alerts),
        );
        supervisor.open();

        let bootstrapper = config
            .kiosk
            .map(|kiosk| AuthBootstrapper::new(kiosk, Arc::clone(&auth), session.clone()));
        if let Some(bootstrapper) = &bootstrapper {
            bootstrapper.start();
        }

        Self {
            session,
            auth,
            bootstrapper,
            supervisor,
            aggregator,
            alerts,
            history,
            _reaper: reaper,
        }
    }

    /// Interactive login. The credential replaces any current one and
    /// supersedes a pending unattended login.
    pub async fn login(&self, username: &str, password: &str) -> Result<(), TelemetryError> {
        let credential = self.auth.login(username, password).await?;
        info!(%username, "interactive login succeeded");
        self.session.login(credential);
        Ok(())
    }

    /// Clear the session. Authenticated data already fetched stays visible
    /// until its sources report unhealthy.
    pub fn logout(&self) {
        self.session.logout();
    }

    /// (Re)start the unattended login. `false` if not configured, coalesced, or
    /// not applicable.
    pub fn bootstrap(&self) -> bool {
        self.bootstrapper
            .as_ref()
            .is_some_and(|bootstrapper| bootstrapper.start())
    }

    pub fn bootstrap_status(&self) -> Option<BootstrapStatus> {
        self.bootstrapper.as_ref().map(AuthBootstrapper::status)
    }

    /// Project the latest published state for display.
    pub fn view(&self) -> DisplayView {
        project(
            &self.aggregator.snapshot(),
            &self.history,
            &self.alerts.list(),
            self.supervisor.state(),
            self.session.is_authenticated(),
        )
    }

    pub fn session(&self) -> &SessionStore {
        &self.session
    }

    pub fn supervisor(&self) -> &ConnectionSupervisor {
        &self.supervisor
    }

    pub fn aggregator(&self) -> &TelemetryAggregator {
        &self.aggregator
    }

    pub fn alerts(&self) -> &Arc<AlertQueue> {
        &self.alerts
    }

    /// Close the streaming channel cleanly, then stop every task.
    pub async fn shutdown(self, grace: Duration) {
        if let Some(bootstrapper) = &self.bootstrapper {
            bootstrapper.cancel();
        }

        self.supervisor.close();
        let mut state = self.supervisor.subscribe_state();
        let closed = tokio::time::timeout(
            grace,
            state.wait_for(|state| *state == ConnectionState::Disconnected),
        )
        .await
        .is_ok_and(|changed| changed.is_ok());

        if !closed {
            warn!(grace_secs = grace.as_secs(), "streaming channel did not close in time");
        }
        info!("control center stopped");
    }
}
