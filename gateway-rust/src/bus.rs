//! bus.rs — the downstream publish boundary.
//!
//! The core never talks to a broker directly: it hands events to a
//! [`BusSink`] and moves on. The shipped implementation is a bounded
//! channel with an atomic connected bit; the broker transport (TCP/TLS,
//! credentials, reconnects) attaches to the receiving end and is outside
//! the core. Publishing never blocks and never queues across a disconnect —
//! a publish that cannot be delivered is logged and dropped.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum BusError {
    #[error("bus is not connected")]
    Disconnected,

    #[error("bus queue is full")]
    QueueFull,
}

/// A publish-capable handle: one method and a connected bit.
pub trait BusSink: Send + Sync {
    fn publish(&self, topic: &str, payload: Value, qos: u8) -> Result<(), BusError>;
    fn is_connected(&self) -> bool;
}

#[derive(Debug)]
pub struct BusMessage {
    pub topic: String,
    pub payload: Value,
    pub qos: u8,
}

/// Bounded-channel sink shared by every session task.
pub struct ChannelBus {
    tx: mpsc::Sender<BusMessage>,
    connected: Arc<AtomicBool>,
}

impl ChannelBus {
    /// Returns the sink, the transport end of the channel, and the connected
    /// bit the transport should maintain. The bit starts raised: the channel
    /// itself is always up.
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<BusMessage>, Arc<AtomicBool>) {
        let (tx, rx) = mpsc::channel(capacity);
        let connected = Arc::new(AtomicBool::new(true));
        (
            Self {
                tx,
                connected: connected.clone(),
            },
            rx,
            connected,
        )
    }
}

impl BusSink for ChannelBus {
    fn publish(&self, topic: &str, payload: Value, qos: u8) -> Result<(), BusError> {
        if !self.is_connected() {
            return Err(BusError::Disconnected);
        }
        self.tx
            .try_send(BusMessage {
                topic: topic.to_string(),
                payload,
                qos,
            })
            .map_err(|_| BusError::QueueFull)
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }
}

/// Default drain when no broker transport is attached: log and discard.
/// A real deployment replaces this task with the broker client.
pub async fn run_log_drain(mut rx: mpsc::Receiver<BusMessage>) {
    while let Some(msg) = rx.recv().await {
        debug!(topic = %msg.topic, qos = msg.qos, payload = %msg.payload, "bus publish (no transport attached)");
    }
    warn!("bus drain stopped: all senders dropped");
}

// ── Test support ──────────────────────────────────────────────────────────────

/// Records everything published to it; used by the handler and gate tests.
#[cfg(test)]
#[derive(Default)]
pub struct RecordingBus {
    pub connected: AtomicBool,
    pub published: std::sync::Mutex<Vec<BusMessage>>,
}

#[cfg(test)]
impl RecordingBus {
    pub fn new() -> Self {
        Self {
            connected: AtomicBool::new(true),
            published: std::sync::Mutex::new(Vec::new()),
        }
    }

    pub fn topics(&self) -> Vec<String> {
        self.published
            .lock()
            .unwrap()
            .iter()
            .map(|m| m.topic.clone())
            .collect()
    }
}

#[cfg(test)]
impl BusSink for RecordingBus {
    fn publish(&self, topic: &str, payload: Value, qos: u8) -> Result<(), BusError> {
        if !self.is_connected() {
            return Err(BusError::Disconnected);
        }
        self.published.lock().unwrap().push(BusMessage {
            topic: topic.to_string(),
            payload,
            qos,
        });
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }
}
