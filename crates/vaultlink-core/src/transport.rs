//! Transport abstraction over the platform radio.
//!
//! This module provides the [`Transport`] trait that abstracts over the
//! btleplug-backed [`BleTransport`](crate::ble::BleTransport) and the
//! in-process [`MockTransport`](crate::mock::MockTransport) used in tests.

use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::Stream;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc};

use vaultlink_types::PeripheralIdentity;

use crate::error::Result;

/// Stream of raw notification payloads from the device.
pub type NotificationStream = Pin<Box<dyn Stream<Item = Bytes> + Send>>;

/// Connection events raised by a transport.
///
/// A transport emits `Connected` once a [`Transport::connect`] call has
/// produced a usable link, and `Disconnected` whenever that link goes away,
/// whether the local side or the device closed it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TransportEvent {
    /// The link is up. Carries the negotiated transfer unit when known.
    Connected(PeripheralIdentity),
    /// The link went down.
    Disconnected(PeripheralIdentity),
}

impl TransportEvent {
    /// The peripheral the event refers to.
    pub fn peripheral(&self) -> &PeripheralIdentity {
        match self {
            TransportEvent::Connected(p) | TransportEvent::Disconnected(p) => p,
        }
    }
}

/// Trait abstracting the radio primitives the link needs.
///
/// # Example
///
/// ```ignore
/// use vaultlink_core::{Transport, Result};
///
/// async fn ping<T: Transport>(transport: &T) -> Result<()> {
///     let mut notifications = transport.start_notifying().await?;
///     transport.write(br#"{"cmd":"list"}"#).await?;
///     Ok(())
/// }
/// ```
#[async_trait]
pub trait Transport: Send + Sync {
    /// Connect to a peripheral.
    ///
    /// Success is also announced through [`TransportEvent::Connected`].
    async fn connect(&self, peripheral: &PeripheralIdentity) -> Result<()>;

    /// Disconnect the current peripheral.
    ///
    /// The resulting [`TransportEvent::Disconnected`] drives state changes;
    /// callers should not assume the link is down when this returns.
    async fn disconnect(&self) -> Result<()>;

    /// Write one buffer to the device's write characteristic.
    async fn write(&self, data: &[u8]) -> Result<()>;

    /// Subscribe to the device's notify characteristic.
    ///
    /// Every call returns a fresh stream that only sees notifications
    /// arriving after the call.
    async fn start_notifying(&self) -> Result<NotificationStream>;

    /// Scan for peripherals, reporting each one through `found`.
    ///
    /// Returns once `duration` has elapsed or [`Transport::stop_scan`] was
    /// called.
    async fn scan(&self, duration: Duration, found: mpsc::Sender<PeripheralIdentity>)
        -> Result<()>;

    /// Stop an in-progress scan.
    async fn stop_scan(&self) -> Result<()>;

    /// Subscribe to connection events.
    fn events(&self) -> broadcast::Receiver<TransportEvent>;

    /// Whether the platform currently grants radio access.
    fn is_available(&self) -> bool {
        true
    }
}
