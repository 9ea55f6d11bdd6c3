//! Unattended session bootstrap.
//!
//! The [`AuthBootstrapper`] acquires a credential for displays with nobody at the
//! keyboard. It retries on a fixed delay up to a bounded number of attempts, runs
//! entirely in the background, and gives way to any credential installed through
//! another path (e.g. an interactive login).

use crate::{
    error::TelemetryError,
    session::{Credential, SessionStore},
};
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use reqwest::StatusCode;
use serde::Deserialize;
use std::{fmt, sync::Arc, time::Duration};
use tokio::{
    sync::watch,
    task::JoinHandle,
};
use tracing::{info, warn};
use url::Url;

/// Login seam. The production implementation is [`HttpAuthService`].
#[async_trait]
pub trait AuthService: Send + Sync + 'static {
    async fn login(&self, username: &str, password: &str) -> Result<Credential, TelemetryError>;
}

/// `POST /api/auth/login` with a form-encoded `username, password, grant_type`.
#[derive(Debug, Clone)]
pub struct HttpAuthService {
    client: reqwest::Client,
    login_url: Url,
    timeout: Duration,
}

#[derive(Debug, Deserialize)]
struct LoginResponse {
    access_token: String,
}

impl HttpAuthService {
    pub fn new(base_url: &Url, timeout: Duration) -> Result<Self, TelemetryError> {
        Ok(Self {
            client: reqwest::Client::new(),
            login_url: base_url.join("/api/auth/login")?,
            timeout,
        })
    }
}

#[async_trait]
impl AuthService for HttpAuthService {
    async fn login(&self, username: &str, password: &str) -> Result<Credential, TelemetryError> {
        let response = self
            .client
            .post(self.login_url.clone())
            .timeout(self.timeout)
            .form(&[
                ("username", username),
                ("password", password),
                ("grant_type", ""),
            ])
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(login_rejection(status, &self.login_url));
        }

        let body = response.json::<LoginResponse>().await?;
        Ok(Credential::new(body.access_token, Utc::now()))
    }
}

/// 401 and 403 are refused credentials, any other status is a transient failure.
fn login_rejection(status: StatusCode, login_url: &Url) -> TelemetryError {
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            TelemetryError::Auth(format!("login rejected with status {status}"))
        }
        _ => TelemetryError::Status {
            status: status.as_u16(),
            url: login_url.to_string(),
        },
    }
}

/// Bootstrap configuration
#[derive(Clone)]
pub struct BootstrapConfig {
    pub username: String,
    pub password: String,
    /// Delay before the first attempt, letting the display render first
    pub initial_delay: Duration,
    /// Fixed delay between failed attempts
    pub retry_delay: Duration,
    /// Attempts made before giving up for good
    pub max_attempts: u32,
}

impl BootstrapConfig {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
            initial_delay: Duration::from_secs(2),
            retry_delay: Duration::from_secs(3),
            max_attempts: 20,
        }
    }

    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }
}

impl fmt::Debug for BootstrapConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BootstrapConfig")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("initial_delay", &self.initial_delay)
            .field("retry_delay", &self.retry_delay)
            .field("max_attempts", &self.max_attempts)
            .finish()
    }
}

/// Observable bootstrap progress.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum BootstrapStatus {
    /// Never started, or finished and ready to be started again.
    Idle,
    /// Attempt `attempt` is scheduled or in flight.
    Pending { attempt: u32 },
    /// The bootstrap credential was published.
    Succeeded,
    /// Another path supplied a credential first; the bootstrap was abandoned.
    Superseded,
    /// Every attempt failed. Terminal: the display stays in public-data mode.
    Failed { attempts: u32 },
    Cancelled,
}

impl BootstrapStatus {
    pub fn is_terminal_failure(&self) -> bool {
        matches!(self, BootstrapStatus::Failed { .. })
    }
}

/// Retry bookkeeping: attempt count against a maximum with a fixed delay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetrySchedule {
    attempts: u32,
    max_attempts: u32,
    delay: Duration,
}

impl RetrySchedule {
    pub fn new(max_attempts: u32, delay: Duration) -> Self {
        Self {
            attempts: 0,
            max_attempts,
            delay,
        }
    }

    /// Number of the attempt about to be made.
    pub fn next_attempt(&self) -> u32 {
        self.attempts + 1
    }

    /// Record a failed attempt, returning the delay before the next one or
    /// `None` once the maximum is reached.
    pub fn record_failure(&mut self) -> Option<Duration> {
        self.attempts += 1;
        (self.attempts < self.max_attempts).then_some(self.delay)
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn is_exhausted(&self) -> bool {
        self.attempts >= self.max_attempts
    }
}

pub struct AuthBootstrapper {
    config: BootstrapConfig,
    service: Arc<dyn AuthService>,
    session: SessionStore,
    status: Arc<watch::Sender<BootstrapStatus>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl AuthBootstrapper {
    pub fn new(config: BootstrapConfig, service: Arc<dyn AuthService>, session: SessionStore) -> Self {
        let (status, _rx) = watch::channel(BootstrapStatus::Idle);
        Self {
            config,
            service,
            session,
            status: Arc::new(status),
            task: Mutex::new(None),
        }
    }

    /// Begin the attempt sequence in the background.
    ///
    /// Returns `false` without side effects when a sequence is already in flight
    /// (calls coalesce), when a credential is already current, or after a
    /// terminal failure.
    pub fn start(&self) -> bool {
        let mut task = self.task.lock();

        if task.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return false;
        }
        if self.status().is_terminal_failure() || self.session.is_authenticated() {
            return false;
        }
        if self.config.max_attempts == 0 {
            self.status.send_replace(BootstrapStatus::Failed { attempts: 0 });
            return false;
        }

        self.status.send_replace(BootstrapStatus::Pending { attempt: 1 });
        *task = Some(tokio::spawn(run_bootstrap(
            self.config.clone(),
            Arc::clone(&self.service),
            self.session.clone(),
            Arc::clone(&self.status),
        )));
        true
    }

    /// Abandon any pending attempt. A credential it may have been fetching is discarded.
    pub fn cancel(&self) {
        if let Some(handle) = self.task.lock().take() {
            if !handle.is_finished() {
                handle.abort();
                self.status.send_replace(BootstrapStatus::Cancelled);
            }
        }
    }

    pub fn status(&self) -> BootstrapStatus {
        *self.status.borrow()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<BootstrapStatus> {
        self.status.subscribe()
    }
}

impl fmt::Debug for AuthBootstrapper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthBootstrapper")
            .field("config", &self.config)
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

impl Drop for AuthBootstrapper {
    fn drop(&mut self) {
        if let Some(handle) = self.task.get_mut().take() {
            handle.abort();
        }
    }
}

async fn run_bootstrap(
    config: BootstrapConfig,
    service: Arc<dyn AuthService>,
    session: SessionStore,
    status: Arc<watch::Sender<BootstrapStatus>>,
) {
    let mut session_rx = session.subscribe();
    let mut schedule = RetrySchedule::new(config.max_attempts, config.retry_delay);
    let mut delay = config.initial_delay;

    loop {
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = credential_installed(&mut session_rx) => {
                info!("credential supplied elsewhere, unattended login abandoned");
                status.send_replace(BootstrapStatus::Superseded);
                return;
            }
        }

        let attempt = schedule.next_attempt();
        status.send_replace(BootstrapStatus::Pending { attempt });
        info!(attempt, max_attempts = config.max_attempts, "attempting unattended login");

        let outcome = tokio::select! {
            outcome = service.login(&config.username, &config.password) => outcome,
            _ = credential_installed(&mut session_rx) => {
                info!(attempt, "credential supplied elsewhere, in-flight login abandoned");
                status.send_replace(BootstrapStatus::Superseded);
                return;
            }
        };

        match outcome {
            Ok(credential) => {
                if session.publish_if_absent(credential) {
                    info!(attempt, "unattended login succeeded");
                    status.send_replace(BootstrapStatus::Succeeded);
                } else {
                    info!(attempt, "unattended login raced a newer credential, result discarded");
                    status.send_replace(BootstrapStatus::Superseded);
                }
                return;
            }
            Err(error) => match schedule.record_failure() {
                Some(retry_delay) => {
                    warn!(
                        attempt,
                        %error,
                        "unattended login failed, retrying in {:?}",
                        retry_delay
                    );
                    status.send_replace(BootstrapStatus::Pending { attempt: attempt + 1 });
                    delay = retry_delay;
                }
                None => {
                    warn!(
                        attempts = schedule.attempts(),
                        %error,
                        "unattended login exhausted, continuing without authentication"
                    );
                    status.send_replace(BootstrapStatus::Failed {
                        attempts: schedule.attempts(),
                    });
                    return;
                }
            },
        }
    }
}

/// Resolves once a credential is current. Never resolves if the session is dropped.
async fn credential_installed(rx: &mut watch::Receiver<Option<Arc<Credential>>>) {
    loop {
        if rx.borrow_and_update().is_some() {
            return;
        }
        if rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}
