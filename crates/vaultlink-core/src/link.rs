//! One-stop assembly of the link components.
//!
//! [`DeviceLink`] wires a [`Transport`] into a [`Session`], spawns the
//! [`CommandQueue`] worker and the [`ConnectionManager`] actor, and hands
//! out the pieces the application talks to.

use std::sync::Arc;

use tracing::info;

use crate::ble::BleTransport;
use crate::client::VaultClient;
use crate::config::LinkConfig;
use crate::error::{Error, Result};
use crate::events::{EventDispatcher, EventReceiver};
use crate::lifecycle::{ConnectionHandle, ConnectionManager};
use crate::queue::CommandQueue;
use crate::session::Session;
use crate::store::{KeyValueStore, LAST_DEVICE_KEY};
use crate::transport::Transport;

/// A fully wired link to one vault.
///
/// # Example
///
/// ```no_run
/// use std::sync::Arc;
/// use vaultlink_core::{DeviceLink, FileStore, LinkConfig};
///
/// # async fn example() -> vaultlink_core::Result<()> {
/// let store = Arc::new(FileStore::open_default()?);
/// let link = DeviceLink::ble(LinkConfig::default(), store).await?;
/// link.handle().start_scan().await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct DeviceLink {
    session: Arc<Session>,
    queue: CommandQueue,
    handle: ConnectionHandle,
    client: VaultClient,
    store: Arc<dyn KeyValueStore>,
    config: LinkConfig,
}

impl std::fmt::Debug for DeviceLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceLink")
            .field("session", &self.session)
            .field("state", &self.handle.state())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl DeviceLink {
    /// Wire up a link over `transport`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(
        transport: Arc<dyn Transport>,
        store: Arc<dyn KeyValueStore>,
        config: LinkConfig,
    ) -> Result<Self> {
        config
            .validate()
            .map_err(|e| Error::invalid_config(e.to_string()))?;

        let session = Arc::new(Session::new(transport, config.transport.clone()));
        let queue = CommandQueue::spawn(Arc::clone(&session), &config.commands, &config.reassembly);
        let client = VaultClient::new(queue.clone(), Arc::clone(&store), config.commands.clone());
        let handle = ConnectionManager::spawn(
            Arc::clone(&session),
            client.clone(),
            Arc::clone(&store),
            config.clone(),
            EventDispatcher::default(),
        );

        info!(
            last_device = store.get(LAST_DEVICE_KEY).as_deref().unwrap_or("none"),
            "Device link started"
        );
        Ok(Self {
            session,
            queue,
            handle,
            client,
            store,
            config,
        })
    }

    /// Wire up a link over the first Bluetooth adapter.
    pub async fn ble(config: LinkConfig, store: Arc<dyn KeyValueStore>) -> Result<Self> {
        let transport = BleTransport::new(config.transport.clone()).await?;
        Self::new(Arc::new(transport), store, config)
    }

    /// Lifecycle control: connect, scan, state.
    pub fn handle(&self) -> &ConnectionHandle {
        &self.handle
    }

    /// Typed command API.
    pub fn client(&self) -> &VaultClient {
        &self.client
    }

    pub fn queue(&self) -> &CommandQueue {
        &self.queue
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    pub fn config(&self) -> &LinkConfig {
        &self.config
    }

    /// Subscribe to link events.
    pub fn events(&self) -> EventReceiver {
        self.handle.events()
    }

    /// Id of the last successfully connected device, if any.
    pub fn last_device(&self) -> Option<String> {
        self.store.get(LAST_DEVICE_KEY)
    }

    /// Stop the lifecycle actor and the command worker.
    ///
    /// Commands still queued fail with [`Error::Cancelled`].
    pub fn shutdown(&self) {
        self.handle.shutdown();
        self.queue.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TransportConfig;
    use crate::mock::MockTransport;
    use crate::store::MemoryStore;
    use vaultlink_types::{Command, ConnectionState};

    #[tokio::test(start_paused = true)]
    async fn test_rejects_invalid_config() {
        let config = LinkConfig::default().with_transport(TransportConfig {
            fallback_mtu: 2,
            ..TransportConfig::default()
        });
        let err = DeviceLink::new(
            Arc::new(MockTransport::new()),
            Arc::new(MemoryStore::new()),
            config,
        )
        .unwrap_err();
        assert!(matches!(err, Error::InvalidConfig(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_then_list() {
        let mock = Arc::new(MockTransport::builder().address("AA:BB").build());
        mock.respond_with(|_| Some(vec![b"[]".to_vec()]));
        let link = DeviceLink::new(
            mock.clone(),
            Arc::new(MemoryStore::new()),
            LinkConfig::default(),
        )
        .unwrap();

        link.handle().connect(mock.peripheral()).await.unwrap();
        link.handle()
            .wait_for_state(ConnectionState::Connected)
            .await
            .unwrap();
        assert_eq!(link.last_device().as_deref(), Some("AA:BB"));

        let entries = link.client().list().await.unwrap();
        assert_eq!(entries.into_json(), serde_json::json!([]));
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_cancels_commands() {
        let link = DeviceLink::new(
            Arc::new(MockTransport::new()),
            Arc::new(MemoryStore::new()),
            LinkConfig::default(),
        )
        .unwrap();
        link.shutdown();

        let err = link.queue().request(Command::new("list")).await.unwrap_err();
        assert!(matches!(err, Error::Cancelled));
    }
}
