//! Supervised streaming channel
//!
//! The [`ConnectionSupervisor`] owns one telemetry channel for its whole life:
//! connect, heartbeat, fixed-delay reconnect after failures, and an orderly local
//! close. It runs as a single background task; callers only send commands and
//! read published state, so nothing here ever blocks the display.

mod channel;
mod message;

pub use channel::{Channel, Connector, Frame, WsConnector};
pub use message::{Inbound, parse_inbound};

use crate::{alert::AlertQueue, error::FailureClass, session::SessionStore};
use derive_more::Display;
use parking_lot::Mutex;
use std::{sync::Arc, time::Duration};
use tokio::{
    sync::{broadcast, mpsc, watch},
    task::JoinHandle,
    time::{Instant, MissedTickBehavior},
};
use tracing::{debug, error, info, warn};

/// Streaming channel configuration
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Interval between liveness probes while connected
    pub heartbeat_interval: Duration,
    /// Silence after a probe that counts as a dead connection
    pub heartbeat_timeout: Duration,
    /// Fixed delay before reconnecting after a non-local disconnect
    pub reconnect_delay: Duration,
    /// Text frame sent as the liveness probe
    pub probe: String,
    /// Capacity of the state transition broadcast
    pub transition_buffer_size: usize,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(30),
            heartbeat_timeout: Duration::from_secs(10),
            reconnect_delay: Duration::from_secs(5),
            probe: "ping".to_string(),
            transition_buffer_size: 32,
        }
    }
}

impl SupervisorConfig {
    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn with_heartbeat_timeout(mut self, timeout: Duration) -> Self {
        self.heartbeat_timeout = timeout;
        self
    }

    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }

    pub fn with_probe(mut self, probe: impl Into<String>) -> Self {
        self.probe = probe.into();
        self
    }
}

/// Lifecycle of the supervised channel.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Display)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Closing,
}

impl ConnectionState {
    /// Whether `self -> next` is an edge of the connection state machine.
    pub fn can_transition_to(self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        matches!(
            (self, next),
            (Disconnected, Connecting)
                | (Connecting, Connected)
                | (Connecting, Disconnected)
                | (Connected, Disconnected)
                | (Connected, Closing)
                | (Closing, Disconnected)
        )
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum Command {
    Open,
    Close,
}

/// How a connected session ended.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum Exit {
    /// Error, server close or silent heartbeat failure: reconnect after the delay
    Remote,
    /// Explicit local close: stay disconnected
    Local,
    /// Supervisor handle dropped
    Shutdown,
}

pub struct ConnectionSupervisor {
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<ConnectionState>,
    transitions: broadcast::Sender<ConnectionState>,
    last_connected_at: Arc<Mutex<Option<Instant>>>,
    task: JoinHandle<()>,
}

impl ConnectionSupervisor {
    /// Spawn the supervisor task in the `Disconnected` state. Must be called
    /// from within a tokio runtime.
    pub fn new(
        config: SupervisorConfig,
        connector: Arc<dyn Connector>,
        session: SessionStore,
        alerts: Arc<AlertQueue>,
    ) -> Self {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let (transitions, _) = broadcast::channel(config.transition_buffer_size.max(1));
        let last_connected_at = Arc::new(Mutex::new(None));

        let actor = Supervisor {
            config,
            connector,
            session,
            alerts,
            commands: command_rx,
            state: state_tx,
            transitions: transitions.clone(),
            last_connected_at: Arc::clone(&last_connected_at),
        };

        Self {
            commands: command_tx,
            state: state_rx,
            transitions,
            last_connected_at,
            task: tokio::spawn(actor.run()),
        }
    }

    /// Request a connection. No-op while already connecting or connected.
    pub fn open(&self) {
        let _ = self.commands.send(Command::Open);
    }

    /// Close the channel locally. A local close never triggers a reconnect.
    pub fn close(&self) {
        let _ = self.commands.send(Command::Close);
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    /// Every state entered from now on, in order.
    pub fn subscribe_transitions(&self) -> broadcast::Receiver<ConnectionState> {
        self.transitions.subscribe()
    }

    /// Monotonic time the channel last entered `Connected`.
    pub fn last_connected_at(&self) -> Option<Instant> {
        *self.last_connected_at.lock()
    }
}

impl Drop for ConnectionSupervisor {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Task-side state owned exclusively by the supervisor loop.
struct Supervisor {
    config: SupervisorConfig,
    connector: Arc<dyn Connector>,
    session: SessionStore,
    alerts: Arc<AlertQueue>,
    commands: mpsc::UnboundedReceiver<Command>,
    state: watch::Sender<ConnectionState>,
    transitions: broadcast::Sender<ConnectionState>,
    last_connected_at: Arc<Mutex<Option<Instant>>>,
}

impl Supervisor {
    async fn run(mut self) {
        let mut reconnect_at: Option<Instant> = None;

        loop {
            let open = tokio::select! {
                command = self.commands.recv() => match command {
                    Some(Command::Open) => true,
                    Some(Command::Close) => {
                        if reconnect_at.take().is_some() {
                            debug!("pending reconnect cancelled by local close");
                        }
                        false
                    }
                    None => return,
                },
                _ = wait_until(reconnect_at) => true,
            };

            if !open {
                continue;
            }
            reconnect_at = None;

            let exit = match self.connect().await {
                Ok(Some(channel)) => self.connected(channel).await,
                Ok(None) => Exit::Local,
                Err(Exit::Shutdown) => return,
                Err(exit) => exit,
            };

            match exit {
                Exit::Remote => {
                    debug!("reconnecting in {:?}", self.config.reconnect_delay);
                    reconnect_at = Some(Instant::now() + self.config.reconnect_delay);
                }
                Exit::Local => {}
                Exit::Shutdown => return,
            }
        }
    }

    /// `Connecting` phase. `Ok(None)` means a local close abandoned the handshake.
    async fn connect(&mut self) -> Result<Option<Box<dyn Channel>>, Exit> {
        self.transition(ConnectionState::Connecting);

        let connector = Arc::clone(&self.connector);
        let credential = self.session.current();
        let handshake = connector.connect(credential.as_deref());
        tokio::pin!(handshake);

        loop {
            tokio::select! {
                result = &mut handshake => {
                    return match result {
                        Ok(channel) => Ok(Some(channel)),
                        Err(error) => {
                            error!(%error, "failed to open telemetry channel");
                            self.transition(ConnectionState::Disconnected);
                            Err(Exit::Remote)
                        }
                    };
                }
                command = self.commands.recv() => match command {
                    Some(Command::Open) => debug!("open ignored, already connecting"),
                    Some(Command::Close) => {
                        info!("handshake abandoned by local close");
                        self.transition(ConnectionState::Disconnected);
                        return Ok(None);
                    }
                    None => return Err(Exit::Shutdown),
                },
            }
        }
    }

    /// `Connected` phase: pump inbound frames, heartbeat, watch for silence.
    async fn connected(&mut self, mut channel: Box<dyn Channel>) -> Exit {
        self.transition(ConnectionState::Connected);
        *self.last_connected_at.lock() = Some(Instant::now());
        info!("telemetry channel connected");

        let mut heartbeat = tokio::time::interval_at(
            Instant::now() + self.config.heartbeat_interval,
            self.config.heartbeat_interval,
        );
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut reply_deadline: Option<Instant> = None;

        loop {
            tokio::select! {
                frame = channel.recv() => match frame {
                    Some(Ok(Frame::Close)) => {
                        info!("server closed telemetry channel");
                        self.transition(ConnectionState::Disconnected);
                        return Exit::Remote;
                    }
                    Some(Ok(frame)) => {
                        reply_deadline = None;
                        self.on_frame(frame);
                    }
                    Some(Err(error)) if error.class() == FailureClass::ProtocolFailure => {
                        reply_deadline = None;
                        warn!(%error, "dropping malformed telemetry frame");
                    }
                    Some(Err(error)) => {
                        error!(%error, "telemetry channel error");
                        self.transition(ConnectionState::Disconnected);
                        return Exit::Remote;
                    }
                    None => {
                        warn!("telemetry channel ended without close frame");
                        self.transition(ConnectionState::Disconnected);
                        return Exit::Remote;
                    }
                },
                _ = heartbeat.tick() => {
                    if let Err(error) = channel.send(Frame::Text(self.config.probe.clone())).await {
                        debug!(%error, "failed to send liveness probe, connection likely dead");
                        self.transition(ConnectionState::Disconnected);
                        return Exit::Remote;
                    }
                    reply_deadline.get_or_insert(Instant::now() + self.config.heartbeat_timeout);
                }
                _ = wait_until(reply_deadline) => {
                    warn!(
                        timeout_secs = self.config.heartbeat_timeout.as_secs(),
                        "no reply to liveness probe, treating connection as dead"
                    );
                    self.transition(ConnectionState::Disconnected);
                    return Exit::Remote;
                }
                command = self.commands.recv() => match command {
                    Some(Command::Open) => debug!("open ignored, already connected"),
                    Some(Command::Close) => {
                        self.transition(ConnectionState::Closing);
                        if let Err(error) = channel.close().await {
                            debug!(%error, "error while closing telemetry channel");
                        }
                        self.transition(ConnectionState::Disconnected);
                        info!("telemetry channel closed locally");
                        return Exit::Local;
                    }
                    None => {
                        let _ = channel.close().await;
                        return Exit::Shutdown;
                    }
                },
            }
        }
    }

    fn on_frame(&self, frame: Frame) {
        let text = match frame {
            Frame::Text(text) => text,
            // tungstenite answers pings itself
            Frame::Ping | Frame::Pong | Frame::Close => return,
        };

        match parse_inbound(&text) {
            Ok(Inbound::Alert(kind, payload)) => {
                let entry = self.alerts.entry(kind, payload);
                debug!(id = entry.id, %kind, "alert received");
                self.alerts.push(entry);
            }
            Ok(Inbound::Pong) | Ok(Inbound::Telemetry) => {}
            Ok(Inbound::Unrecognised(kind)) => {
                debug!(%kind, "ignoring unrecognised telemetry record");
            }
            Err(error) => {
                warn!(%error, "dropping malformed telemetry record");
                debug!("Raw message: {}", text.chars().take(200).collect::<String>());
            }
        }
    }

    fn transition(&self, next: ConnectionState) {
        let current = *self.state.borrow();
        if !current.can_transition_to(next) {
            warn!(%current, %next, "rejected invalid connection state transition");
            return;
        }

        debug!(%current, %next, "connection state transition");
        self.state.send_replace(next);
        let _ = self.transitions.send(next);
    }
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
