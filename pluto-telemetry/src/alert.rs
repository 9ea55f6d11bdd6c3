//! Bounded, self-expiring queue of event notifications pushed by the streaming channel.

use chrono::{DateTime, Utc};
use derive_more::Display;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;
use std::{
    collections::VecDeque,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};
use tokio::{
    task::JoinHandle,
    time::{Instant, MissedTickBehavior},
};
use tracing::debug;

/// Alert queue configuration
#[derive(Debug, Clone)]
pub struct AlertConfig {
    /// Maximum number of alerts retained, oldest evicted first
    pub capacity: usize,
    /// Time-to-live measured from receipt
    pub ttl: Duration,
    /// How often the background reaper sweeps expired alerts
    pub sweep_interval: Duration,
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self {
            capacity: 5,
            ttl: Duration::from_secs(10),
            sweep_interval: Duration::from_secs(1),
        }
    }
}

impl AlertConfig {
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }
}

/// Recognised event kinds that become alerts.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Display, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    #[display("trade_signal")]
    TradeSignal,
    #[display("order_submitted")]
    OrderSubmitted,
}

/// Body of a `trade_signal` / `order_submitted` record.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct AlertPayload {
    #[serde(default)]
    pub symbol: Option<SmolStr>,
    #[serde(default)]
    pub side: Option<SmolStr>,
    #[serde(default)]
    pub confidence: Option<f64>,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub price: Option<f64>,
    #[serde(default)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// Immutable notification. Expiry is removal from the queue, never a flag.
#[derive(Debug, Clone, PartialEq)]
pub struct AlertEntry {
    pub id: u64,
    pub kind: AlertKind,
    pub payload: AlertPayload,
    pub time_received: DateTime<Utc>,
    pub received_at: Instant,
    pub expires_at: Instant,
}

impl AlertEntry {
    pub fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}

#[derive(Debug)]
pub struct AlertQueue {
    config: AlertConfig,
    next_id: AtomicU64,
    entries: Mutex<VecDeque<AlertEntry>>,
}

impl AlertQueue {
    pub fn new(config: AlertConfig) -> Self {
        Self {
            entries: Mutex::new(VecDeque::with_capacity(config.capacity)),
            next_id: AtomicU64::new(1),
            config,
        }
    }

    /// Build an entry stamped now, expiring after the configured TTL.
    pub fn entry(&self, kind: AlertKind, payload: AlertPayload) -> AlertEntry {
        let received_at = Instant::now();
        AlertEntry {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            kind,
            payload,
            time_received: Utc::now(),
            received_at,
            expires_at: received_at + self.config.ttl,
        }
    }

    pub fn push(&self, entry: AlertEntry) {
        let mut entries = self.entries.lock();
        entries.push_back(entry);
        while entries.len() > self.config.capacity {
            if let Some(evicted) = entries.pop_front() {
                debug!(id = evicted.id, kind = %evicted.kind, "alert evicted at capacity");
            }
        }
    }

    /// Live alerts, oldest first. Entries past their expiry are never returned,
    /// even if the reaper has not swept them yet.
    pub fn list(&self) -> Vec<AlertEntry> {
        let now = Instant::now();
        self.entries
            .lock()
            .iter()
            .filter(|entry| !entry.is_expired(now))
            .cloned()
            .collect()
    }

    /// Remove every alert expired at `now`, returning how many were dropped.
    pub fn reap_expired(&self, now: Instant) -> usize {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|entry| !entry.is_expired(now));
        before - entries.len()
    }

    /// Number of stored alerts, including expired ones not yet reaped.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    pub fn config(&self) -> &AlertConfig {
        &self.config
    }

    /// Spawn the background sweep. The task stops when the returned guard or
    /// the queue itself is dropped.
    pub fn spawn_reaper(self: &Arc<Self>) -> AlertReaper {
        let queue = Arc::downgrade(self);
        let mut sweep = tokio::time::interval(self.config.sweep_interval);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Skip);

        AlertReaper(tokio::spawn(async move {
            loop {
                sweep.tick().await;
                let Some(queue) = queue.upgrade() else {
                    break;
                };
                let reaped = queue.reap_expired(Instant::now());
                if reaped > 0 {
                    debug!(reaped, "expired alerts removed");
                }
            }
        }))
    }
}

impl Default for AlertQueue {
    fn default() -> Self {
        Self::new(AlertConfig::default())
    }
}

/// Owns the reaper task and cancels it on drop.
#[derive(Debug)]
pub struct AlertReaper(JoinHandle<()>);

impl Drop for AlertReaper {
    fn drop(&mut self) {
        self.0.abort();
    }
}
