//! btleplug-backed transport.
//!
//! [`BleTransport`] talks to the vault over the Nordic UART Service: commands
//! are written to [`NUS_TX`] and responses arrive as notifications on
//! [`NUS_RX`]. Link loss is detected by watching the adapter's central
//! events.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use btleplug::api::{
    Central, CentralEvent, CharPropFlags, Characteristic, Manager as _, Peripheral as _,
    ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral, PeripheralId};
use bytes::Bytes;
use futures::StreamExt;
use tokio::sync::{Notify, broadcast, mpsc};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use vaultlink_types::PeripheralIdentity;
use vaultlink_types::uuid::{NUS_RX, NUS_SERVICE, NUS_TX};

use crate::config::TransportConfig;
use crate::error::{ConnectionFailureReason, DeviceNotFoundReason, Error, Result};
use crate::transport::{NotificationStream, Transport, TransportEvent};
use crate::util::{advertises_vault_service, peripheral_identity};

/// Get the first available Bluetooth adapter.
pub async fn get_adapter() -> Result<Adapter> {
    let manager = Manager::new().await?;
    let adapters = manager.adapters().await?;
    adapters
        .into_iter()
        .next()
        .ok_or(Error::DeviceNotFound(DeviceNotFoundReason::NoAdapter))
}

/// A connected peripheral and its UART characteristics.
#[derive(Clone)]
struct ActiveLink {
    peripheral: Peripheral,
    identity: PeripheralIdentity,
    tx: Characteristic,
    rx: Characteristic,
    watcher: CancellationToken,
}

/// [`Transport`] over a btleplug adapter.
pub struct BleTransport {
    adapter: Adapter,
    config: TransportConfig,
    link: Arc<Mutex<Option<ActiveLink>>>,
    events: broadcast::Sender<TransportEvent>,
    scan_stop: Notify,
}

impl BleTransport {
    /// Open the first Bluetooth adapter.
    pub async fn new(config: TransportConfig) -> Result<Self> {
        Ok(Self::with_adapter(get_adapter().await?, config))
    }

    /// Use a specific adapter.
    pub fn with_adapter(adapter: Adapter, config: TransportConfig) -> Self {
        let (events, _) = broadcast::channel(16);
        Self {
            adapter,
            config,
            link: Arc::new(Mutex::new(None)),
            events,
            scan_stop: Notify::new(),
        }
    }

    fn active(&self) -> Result<ActiveLink> {
        lock(&self.link).clone().ok_or(Error::NotConnected)
    }

    /// Find a peripheral the adapter already knows about by identifier.
    async fn find_peripheral(&self, identifier: &str) -> Result<Peripheral> {
        for peripheral in self.adapter.peripherals().await? {
            let properties = peripheral.properties().await?;
            let identity = peripheral_identity(&peripheral.id(), properties.as_ref());
            if identity.matches_id(identifier) {
                return Ok(peripheral);
            }
        }
        Err(Error::device_not_found(identifier))
    }

    async fn identity_of(&self, id: &PeripheralId) -> Option<(PeripheralIdentity, bool)> {
        let peripheral = self.adapter.peripheral(id).await.ok()?;
        let properties = peripheral.properties().await.ok().flatten()?;
        Some((
            peripheral_identity(id, Some(&properties)),
            advertises_vault_service(&properties),
        ))
    }

    /// Emit `Disconnected` when the adapter reports the peripheral gone.
    async fn spawn_disconnect_watcher(
        &self,
        peripheral_id: PeripheralId,
        cancel: CancellationToken,
    ) -> Result<()> {
        let mut central_events = self.adapter.events().await?;
        let link = Arc::clone(&self.link);
        let events = self.events.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    event = central_events.next() => match event {
                        Some(CentralEvent::DeviceDisconnected(id)) if id == peripheral_id => {
                            let taken = {
                                let mut guard = lock(&link);
                                match guard.as_ref() {
                                    Some(active) if active.peripheral.id() == id => guard.take(),
                                    _ => None,
                                }
                            };
                            if let Some(active) = taken {
                                info!(device = %active.identity, "Peripheral disconnected");
                                let _ = events.send(TransportEvent::Disconnected(active.identity));
                            }
                            break;
                        }
                        Some(_) => {}
                        None => break,
                    },
                }
            }
        });
        Ok(())
    }

    /// Everything after the radio link is up. The caller disconnects on error.
    async fn finish_connect(
        &self,
        peripheral: &Peripheral,
        target: &PeripheralIdentity,
    ) -> Result<ActiveLink> {
        let connect_timeout = self.config.connect_timeout();

        debug!("Discovering services");
        timeout(connect_timeout, peripheral.discover_services())
            .await
            .map_err(|_| Error::timeout("discover_services", connect_timeout))??;

        let characteristics = peripheral.characteristics();
        let find = |uuid: Uuid| characteristics.iter().find(|c| c.uuid == uuid).cloned();
        let (Some(tx), Some(rx)) = (find(NUS_TX), find(NUS_RX)) else {
            return Err(Error::connection_failed(
                Some(target.id.clone()),
                ConnectionFailureReason::MissingService,
            ));
        };

        peripheral.subscribe(&rx).await.map_err(Error::write_failed)?;

        let properties = peripheral.properties().await?;
        let mut identity = peripheral_identity(&peripheral.id(), properties.as_ref());
        if identity.name.is_none() {
            identity.name = target.name.clone();
        }

        let watcher = CancellationToken::new();
        self.spawn_disconnect_watcher(peripheral.id(), watcher.clone())
            .await?;
        Ok(ActiveLink {
            peripheral: peripheral.clone(),
            identity,
            tx,
            rx,
            watcher,
        })
    }
}

#[async_trait]
impl Transport for BleTransport {
    #[tracing::instrument(level = "info", skip_all, fields(device = %target.id))]
    async fn connect(&self, target: &PeripheralIdentity) -> Result<()> {
        let device_id = Some(target.id.clone());
        let peripheral = self.find_peripheral(&target.id).await?;
        let connect_timeout = self.config.connect_timeout();

        info!("Connecting");
        match timeout(connect_timeout, peripheral.connect()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                return Err(Error::connection_failed(
                    device_id,
                    ConnectionFailureReason::BleError(e.to_string()),
                ));
            }
            Err(_) => {
                // The platform may still complete the abandoned attempt.
                let _ = peripheral.disconnect().await;
                return Err(Error::connection_failed(
                    device_id,
                    ConnectionFailureReason::Timeout,
                ));
            }
        }

        let active = or_teardown(self.finish_connect(&peripheral, target), || {
            peripheral.disconnect()
        })
        .await?;

        let identity = active.identity.clone();
        *lock(&self.link) = Some(active);
        info!(device = %identity, "Connected");
        let _ = self.events.send(TransportEvent::Connected(identity));
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        let Some(active) = lock(&self.link).take() else {
            return Ok(());
        };
        active.watcher.cancel();
        let result = active.peripheral.disconnect().await;
        info!(device = %active.identity, "Disconnected");
        let _ = self.events.send(TransportEvent::Disconnected(active.identity));
        result.map_err(Error::from)
    }

    async fn write(&self, data: &[u8]) -> Result<()> {
        let active = self.active()?;
        let write_type = if active.tx.properties.contains(CharPropFlags::WRITE_WITHOUT_RESPONSE) {
            WriteType::WithoutResponse
        } else {
            WriteType::WithResponse
        };
        active
            .peripheral
            .write(&active.tx, data, write_type)
            .await
            .map_err(Error::write_failed)
    }

    async fn start_notifying(&self) -> Result<NotificationStream> {
        let active = self.active()?;
        let rx_uuid = active.rx.uuid;
        let notifications = active
            .peripheral
            .notifications()
            .await
            .map_err(Error::write_failed)?;
        Ok(Box::pin(notifications.filter_map(move |n| {
            futures::future::ready((n.uuid == rx_uuid).then(|| Bytes::from(n.value)))
        })))
    }

    #[tracing::instrument(level = "debug", skip_all, fields(duration = ?duration))]
    async fn scan(
        &self,
        duration: Duration,
        found: mpsc::Sender<PeripheralIdentity>,
    ) -> Result<()> {
        let mut central_events = self.adapter.events().await?;
        self.adapter
            .start_scan(ScanFilter {
                services: vec![NUS_SERVICE],
            })
            .await?;

        let deadline = tokio::time::sleep(duration);
        tokio::pin!(deadline);
        let stopped = self.scan_stop.notified();
        tokio::pin!(stopped);
        let mut reported = HashSet::new();

        loop {
            tokio::select! {
                _ = &mut deadline => break,
                _ = &mut stopped => {
                    debug!("Scan stopped early");
                    break;
                }
                event = central_events.next() => match event {
                    Some(CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id)) => {
                        let Some((identity, is_vault)) = self.identity_of(&id).await else {
                            continue;
                        };
                        if !is_vault || !reported.insert(identity.id.clone()) {
                            continue;
                        }
                        debug!(device = %identity, "Found vault");
                        if found.send(identity).await.is_err() {
                            break;
                        }
                    }
                    Some(_) => {}
                    None => break,
                },
            }
        }

        self.adapter.stop_scan().await?;
        Ok(())
    }

    async fn stop_scan(&self) -> Result<()> {
        self.scan_stop.notify_waiters();
        Ok(())
    }

    fn events(&self) -> broadcast::Receiver<TransportEvent> {
        self.events.subscribe()
    }
}

/// Await `setup`; if it fails, await `teardown` before returning the error.
async fn or_teardown<T, S, D, F, E>(setup: S, teardown: F) -> Result<T>
where
    S: Future<Output = Result<T>>,
    F: FnOnce() -> D,
    D: Future<Output = std::result::Result<(), E>>,
    E: std::fmt::Display,
{
    match setup.await {
        Ok(value) => Ok(value),
        Err(e) => {
            warn!("Connection setup failed, disconnecting: {}", e);
            if let Err(teardown_err) = teardown().await {
                debug!("Disconnect after failed setup: {}", teardown_err);
            }
            Err(e)
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
