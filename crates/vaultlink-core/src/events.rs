//! Link event system.
//!
//! This module provides an event-based system for observing connection
//! state changes, discoveries, authentication results and reconnect
//! activity. It complements the `watch` channels on
//! [`ConnectionHandle`](crate::lifecycle::ConnectionHandle), which only
//! carry the latest value.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use vaultlink_types::{ConnectionState, PeripheralIdentity};

/// Events emitted by the link.
///
/// All events are serializable for logging, persistence, and IPC.
///
/// This enum is marked `#[non_exhaustive]` to allow adding new event types
/// in future versions without breaking downstream code.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
#[non_exhaustive]
pub enum LinkEvent {
    /// The connection state changed.
    StateChanged {
        from: ConnectionState,
        to: ConnectionState,
    },
    /// A peripheral was seen for the first time during a manual scan.
    Discovered { device: PeripheralIdentity },
    /// The transport reported a live link.
    Connected { device: PeripheralIdentity },
    /// The transport reported the link went down.
    Disconnected { device: PeripheralIdentity },
    /// A connect attempt failed.
    ConnectFailed {
        device: PeripheralIdentity,
        error: String,
    },
    /// The post-connect handshake succeeded.
    Authenticated { device: PeripheralIdentity },
    /// The post-connect handshake was rejected; the link is being torn down.
    AuthenticationFailed {
        device: PeripheralIdentity,
        error: String,
    },
    /// The reconnect timer started a scan for the last known device.
    ReconnectAttempt { device_id: String, attempt: u32 },
    /// A scan started.
    ScanStarted { manual: bool },
    /// A scan finished or was stopped.
    ScanFinished { manual: bool, found: usize },
}

impl LinkEvent {
    /// Short name of the event kind, for log fields.
    pub fn kind(&self) -> &'static str {
        match self {
            LinkEvent::StateChanged { .. } => "state_changed",
            LinkEvent::Discovered { .. } => "discovered",
            LinkEvent::Connected { .. } => "connected",
            LinkEvent::Disconnected { .. } => "disconnected",
            LinkEvent::ConnectFailed { .. } => "connect_failed",
            LinkEvent::Authenticated { .. } => "authenticated",
            LinkEvent::AuthenticationFailed { .. } => "authentication_failed",
            LinkEvent::ReconnectAttempt { .. } => "reconnect_attempt",
            LinkEvent::ScanStarted { .. } => "scan_started",
            LinkEvent::ScanFinished { .. } => "scan_finished",
        }
    }
}

/// Sender for link events.
pub type EventSender = broadcast::Sender<LinkEvent>;

/// Receiver for link events.
pub type EventReceiver = broadcast::Receiver<LinkEvent>;

/// Event dispatcher for sending events to multiple receivers.
#[derive(Debug, Clone)]
pub struct EventDispatcher {
    sender: EventSender,
}

impl EventDispatcher {
    /// Create a new event dispatcher.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Subscribe to events.
    pub fn subscribe(&self) -> EventReceiver {
        self.sender.subscribe()
    }

    /// Send an event.
    pub fn send(&self, event: LinkEvent) {
        // Ignore error if no receivers
        let _ = self.sender.send(event);
    }

    /// Get the number of active receivers.
    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventDispatcher {
    fn default() -> Self {
        Self::new(100)
    }
}
