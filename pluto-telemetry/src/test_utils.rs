//! In-memory doubles for the auth, streaming and polling seams.

use crate::{
    auth::AuthService,
    error::TelemetryError,
    session::Credential,
    stream::{Channel, Connector, Frame},
    telemetry::{SourceId, SourceUpdate, TelemetrySnapshot, TelemetrySource},
};
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use std::{
    collections::VecDeque,
    sync::{
        Arc,
        atomic::{AtomicU32, AtomicUsize, Ordering},
    },
    time::Duration,
};
use tokio::sync::mpsc;

/// Login double: fails until the configured call number, then succeeds.
#[derive(Debug, Default)]
pub struct MockAuth {
    calls: AtomicU32,
    latency: Duration,
    success_on: Option<(u32, String)>,
}

impl MockAuth {
    pub fn always_failing() -> Self {
        Self::default()
    }

    pub fn accepting(token: &str) -> Self {
        Self::default().with_success_on(1, token)
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Calls numbered `call` and later succeed with `token`.
    pub fn with_success_on(mut self, call: u32, token: &str) -> Self {
        self.success_on = Some((call, token.to_string()));
        self
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AuthService for MockAuth {
    async fn login(&self, username: &str, _: &str) -> Result<Credential, TelemetryError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        match &self.success_on {
            Some((from, token)) if call >= *from => Ok(Credential::new(token.clone(), Utc::now())),
            _ => Err(TelemetryError::Auth(format!("invalid credentials for {username}"))),
        }
    }
}

/// Connector double. Each accepted connection hands its server end to the test.
#[derive(Debug, Clone)]
pub struct MockConnector {
    inner: Arc<MockConnectorInner>,
}

#[derive(Debug)]
struct MockConnectorInner {
    accepted_tx: mpsc::UnboundedSender<MockServerEnd>,
    accepted_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<MockServerEnd>>,
    connects: AtomicUsize,
    fail_next: Mutex<usize>,
    last_token: Mutex<Option<String>>,
}

impl MockConnector {
    pub fn new() -> Self {
        let (accepted_tx, accepted_rx) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(MockConnectorInner {
                accepted_tx,
                accepted_rx: tokio::sync::Mutex::new(accepted_rx),
                connects: AtomicUsize::new(0),
                fail_next: Mutex::new(0),
                last_token: Mutex::new(None),
            }),
        }
    }

    /// Refuse the next `count` handshakes.
    pub fn fail_next(&self, count: usize) {
        *self.inner.fail_next.lock() = count;
    }

    /// Server end of the next successful connection, in connect order.
    pub async fn accepted(&self) -> MockServerEnd {
        self.inner
            .accepted_rx
            .lock()
            .await
            .recv()
            .await
            .expect("connector owns the sender")
    }

    pub fn connect_count(&self) -> usize {
        self.inner.connects.load(Ordering::SeqCst)
    }

    pub fn last_token(&self) -> Option<String> {
        self.inner.last_token.lock().clone()
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self, credential: Option<&Credential>) -> Result<Box<dyn Channel>, TelemetryError> {
        self.inner.connects.fetch_add(1, Ordering::SeqCst);
        *self.inner.last_token.lock() = credential.map(|credential| credential.token().to_string());

        {
            let mut fail_next = self.inner.fail_next.lock();
            if *fail_next > 0 {
                *fail_next -= 1;
                return Err(TelemetryError::ConnectionLoss("handshake refused".to_string()));
            }
        }

        let (to_client, inbound) = mpsc::unbounded_channel();
        let (outbound, from_client) = mpsc::unbounded_channel();
        let _ = self.inner.accepted_tx.send(MockServerEnd {
            to_client,
            from_client,
        });

        Ok(Box::new(MockChannel { inbound, outbound }))
    }
}

#[derive(Debug)]
struct MockChannel {
    inbound: mpsc::UnboundedReceiver<Result<Frame, TelemetryError>>,
    outbound: mpsc::UnboundedSender<Frame>,
}

#[async_trait]
impl Channel for MockChannel {
    async fn send(&mut self, frame: Frame) -> Result<(), TelemetryError> {
        self.outbound
            .send(frame)
            .map_err(|_| TelemetryError::ConnectionLoss("server end dropped".to_string()))
    }

    async fn recv(&mut self) -> Option<Result<Frame, TelemetryError>> {
        self.inbound.recv().await
    }

    async fn close(&mut self) -> Result<(), TelemetryError> {
        let _ = self.outbound.send(Frame::Close);
        Ok(())
    }
}

/// Test-held server side of one mock connection.
#[derive(Debug)]
pub struct MockServerEnd {
    to_client: mpsc::UnboundedSender<Result<Frame, TelemetryError>>,
    from_client: mpsc::UnboundedReceiver<Frame>,
}

impl MockServerEnd {
    pub fn send_text(&self, text: &str) {
        let _ = self.to_client.send(Ok(Frame::Text(text.to_string())));
    }

    /// Surface `error` from the client's next `recv`.
    pub fn send_error(&self, error: TelemetryError) {
        let _ = self.to_client.send(Err(error));
    }

    /// Server-initiated close frame.
    pub fn close(&self) {
        let _ = self.to_client.send(Ok(Frame::Close));
    }

    /// Next frame the client sent, `None` once the client side is gone.
    pub async fn next_sent(&mut self) -> Option<Frame> {
        self.from_client.recv().await
    }
}

/// Poll double replaying scripted outcomes. The last outcome repeats forever.
#[derive(Debug)]
pub struct ScriptedSource {
    id: SourceId,
    period: Duration,
    latency: Duration,
    outcomes: Mutex<VecDeque<Result<SourceUpdate, TelemetryError>>>,
    last: Mutex<Option<Result<SourceUpdate, TelemetryError>>>,
    calls: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    last_token: Mutex<Option<String>>,
}

impl ScriptedSource {
    pub fn new(id: SourceId, period: Duration) -> Self {
        Self {
            id,
            period,
            latency: Duration::ZERO,
            outcomes: Mutex::new(VecDeque::new()),
            last: Mutex::new(None),
            calls: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            last_token: Mutex::new(None),
        }
    }

    pub fn with_outcomes(self, outcomes: Vec<Result<SourceUpdate, TelemetryError>>) -> Self {
        *self.outcomes.lock() = outcomes.into();
        self
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn last_token(&self) -> Option<String> {
        self.last_token.lock().clone()
    }

    fn next_outcome(&self) -> Result<SourceUpdate, TelemetryError> {
        let mut last = self.last.lock();
        if let Some(next) = self.outcomes.lock().pop_front() {
            *last = Some(next);
        }
        last.clone()
            .unwrap_or_else(|| Err(TelemetryError::Network("no scripted outcome".to_string())))
    }
}

#[async_trait]
impl TelemetrySource for ScriptedSource {
    fn id(&self) -> SourceId {
        self.id
    }

    fn period(&self) -> Duration {
        self.period
    }

    async fn poll(
        &self,
        credential: Option<&Credential>,
        _: &TelemetrySnapshot,
    ) -> Result<SourceUpdate, TelemetryError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let in_flight = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(in_flight, Ordering::SeqCst);
        *self.last_token.lock() = credential.map(|credential| credential.token().to_string());

        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        let outcome = if self.authenticated() && credential.is_none() {
            Err(TelemetryError::Unauthenticated)
        } else {
            self.next_outcome()
        };

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        outcome
    }
}
