//! Events published by a running node, and the bus that fans them out.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::peer::Peer;
use crate::router::ResolvedObject;

/// Severity of a [`LogRecord`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
}

/// A diagnostic surfaced to subscribers alongside the `tracing` output.
#[derive(Debug, Clone)]
pub struct LogRecord {
    pub level: LogLevel,
    pub message: String,
    pub at: DateTime<Utc>,
}

/// A typed object received from a peer.
#[derive(Debug, Clone)]
pub struct ReceivedObject {
    /// The peer that sent it.
    pub peer: Peer,
    /// Type tag from the envelope.
    pub type_name: String,
    /// The raw envelope data.
    pub data: serde_json::Value,
    /// The decoded value, or `None` when the tag is unknown or the data did
    /// not fit the registered shape.
    pub resolved: Option<ResolvedObject>,
}

/// Something that happened on the node.
#[derive(Debug, Clone)]
pub enum NodeEvent {
    /// A `HERE` announcement was accepted from a peer.
    PeerDiscovered(Peer),
    /// A peer was evicted after going unseen for too long.
    PeerLost(Peer),
    /// A TCP session with a peer was registered.
    PeerConnected(Peer),
    /// A TCP session with a peer ended.
    PeerDisconnected { peer: Peer, reason: String },
    /// A text frame arrived.
    TextReceived { peer: Peer, text: String },
    /// An object frame arrived.
    ObjectReceived(ReceivedObject),
    /// An internal diagnostic.
    Log(LogRecord),
}

/// Fans events out to every subscriber, each through its own channel.
///
/// Delivery to a subscriber preserves emit order. Subscribers whose receiver
/// was dropped are pruned on the next emit.
#[derive(Debug, Clone, Default)]
pub struct EventBus {
    subscribers: Arc<Mutex<Vec<mpsc::UnboundedSender<NodeEvent>>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a new subscription.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<NodeEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.lock().push(tx);
        rx
    }

    /// Deliver an event to every live subscriber.
    pub fn emit(&self, event: NodeEvent) {
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }

    /// Log through `tracing` and publish a [`NodeEvent::Log`].
    pub fn log(&self, level: LogLevel, message: impl Into<String>) {
        let message = message.into();
        match level {
            LogLevel::Debug => tracing::debug!("{message}"),
            LogLevel::Info => tracing::info!("{message}"),
            LogLevel::Warning => tracing::warn!("{message}"),
            LogLevel::Error => tracing::error!("{message}"),
        }
        self.emit(NodeEvent::Log(LogRecord {
            level,
            message,
            at: Utc::now(),
        }));
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
