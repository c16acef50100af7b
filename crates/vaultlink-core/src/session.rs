//! Transport session: the connected peripheral and outbound framing.

use std::sync::{Arc, RwLock};

use tracing::{debug, trace};

use vaultlink_types::{Command, PeripheralIdentity};

use crate::config::TransportConfig;
use crate::error::{Error, Result};
use crate::transport::{NotificationStream, Transport};

/// Owns the transport handle and the identity of the connected peripheral.
///
/// The queue sends through the session and the lifecycle state machine
/// attaches and detaches the peripheral as transport events arrive. A
/// session with no attached peripheral refuses to send.
pub struct Session {
    transport: Arc<dyn Transport>,
    peripheral: RwLock<Option<PeripheralIdentity>>,
    config: TransportConfig,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("peripheral", &self.peripheral())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Session {
    /// Create a session over `transport`.
    pub fn new(transport: Arc<dyn Transport>, config: TransportConfig) -> Self {
        Self {
            transport,
            peripheral: RwLock::new(None),
            config,
        }
    }

    /// The underlying transport.
    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    /// The connected peripheral, if any.
    pub fn peripheral(&self) -> Option<PeripheralIdentity> {
        self.peripheral
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Whether a peripheral is attached.
    pub fn is_connected(&self) -> bool {
        self.peripheral
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .is_some()
    }

    /// Record `peripheral` as the live link.
    pub fn attach(&self, peripheral: PeripheralIdentity) {
        debug!(device = %peripheral.id, mtu = ?peripheral.mtu, "Session attached");
        *self.peripheral.write().unwrap_or_else(|e| e.into_inner()) = Some(peripheral);
    }

    /// Clear the live link, returning the peripheral that was attached.
    pub fn detach(&self) -> Option<PeripheralIdentity> {
        let previous = self
            .peripheral
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(p) = &previous {
            debug!(device = %p.id, "Session detached");
        }
        previous
    }

    /// Register for notifications from the connected peripheral.
    pub async fn subscribe(&self) -> Result<NotificationStream> {
        if !self.is_connected() {
            return Err(Error::NotConnected);
        }
        self.transport
            .start_notifying()
            .await
            .map_err(|e| match e {
                Error::NotConnected => Error::NotConnected,
                other => Error::write_failed(format!("notification registration: {other}")),
            })
    }

    /// Serialize and send a command.
    pub async fn send(&self, command: &Command) -> Result<()> {
        let payload = command.to_bytes();
        self.send_bytes(&payload).await
    }

    /// Send raw bytes, split into writes of at most one transfer unit.
    pub async fn send_bytes(&self, payload: &[u8]) -> Result<()> {
        let peripheral = self.peripheral().ok_or(Error::NotConnected)?;

        let max_len = if self.config.chunk_writes {
            peripheral.max_write_len(self.config.fallback_mtu)
        } else {
            payload.len().max(1)
        };

        let pieces: Vec<&[u8]> = if payload.is_empty() {
            vec![payload]
        } else {
            payload.chunks(max_len).collect()
        };
        trace!(bytes = payload.len(), writes = pieces.len(), max_len, "Sending payload");

        for (i, piece) in pieces.iter().enumerate() {
            if i > 0 && !self.config.write_pacing().is_zero() {
                tokio::time::sleep(self.config.write_pacing()).await;
            }
            self.transport.write(piece).await.map_err(|e| match e {
                Error::NotConnected => Error::NotConnected,
                Error::WriteFailed { .. } => e,
                other => Error::write_failed(other),
            })?;
        }
        Ok(())
    }

    /// Ask the transport to connect.
    pub async fn connect(&self, peripheral: &PeripheralIdentity) -> Result<()> {
        self.transport.connect(peripheral).await
    }

    /// Ask the transport to disconnect.
    ///
    /// The peripheral stays attached until the transport reports the
    /// disconnect.
    pub async fn disconnect(&self) -> Result<()> {
        self.transport.disconnect().await
    }
}
