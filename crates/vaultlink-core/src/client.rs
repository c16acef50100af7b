//! Typed client for the vault command vocabulary.
//!
//! [`VaultClient`] wraps a [`CommandQueue`] and exposes one method per
//! firmware command. Every call goes through the queue, so calls from any
//! number of tasks are serialized and paced like raw submissions.
//!
//! # Example
//!
//! ```no_run
//! # async fn example(client: vaultlink_core::VaultClient) -> vaultlink_core::Result<()> {
//! client.authenticate().await?;
//! let entries = client.list().await?;
//! println!("{}", entries.into_json());
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use vaultlink_types::{Command, ResponseKind};

use crate::commands;
use crate::config::CommandConfig;
use crate::error::{Error, Result};
use crate::queue::{CommandQueue, PendingResponse, SuppressionGuard};
use crate::response::Response;
use crate::store::{KeyValueStore, PASSPHRASE_KEY};

/// Message used when no passphrase has been stored.
pub const MISSING_PASSPHRASE: &str = "Passphrase not found.";

/// High-level command API.
#[derive(Clone)]
pub struct VaultClient {
    queue: CommandQueue,
    store: Arc<dyn KeyValueStore>,
    config: CommandConfig,
}

impl std::fmt::Debug for VaultClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VaultClient")
            .field("queue", &self.queue)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl VaultClient {
    pub fn new(queue: CommandQueue, store: Arc<dyn KeyValueStore>, config: CommandConfig) -> Self {
        Self {
            queue,
            store,
            config,
        }
    }

    /// The underlying queue.
    pub fn queue(&self) -> &CommandQueue {
        &self.queue
    }

    /// Submit an arbitrary command.
    pub fn submit(&self, command: Command, timeout: Duration, kind: ResponseKind) -> PendingResponse {
        self.queue.submit(command, timeout, kind)
    }

    /// Authenticate with the stored passphrase.
    ///
    /// Fails with [`Error::AuthenticationFailed`] when no passphrase is
    /// stored or the device rejects it.
    pub async fn authenticate(&self) -> Result<()> {
        let Some(secret) = self.store.get(PASSPHRASE_KEY) else {
            warn!("{}", MISSING_PASSPHRASE);
            return Err(Error::authentication_failed(MISSING_PASSPHRASE));
        };
        self.send_passphrase(&secret).await.map(|_| ())
    }

    /// Send a passphrase without touching the store.
    pub async fn send_passphrase(&self, secret: &str) -> Result<Response> {
        self.submit_passphrase(secret).await
    }

    /// Queue the passphrase immediately and check the device's answer when
    /// the returned future is awaited.
    ///
    /// The command is enqueued before this returns, so it runs ahead of
    /// anything submitted afterwards.
    pub(crate) fn submit_passphrase(
        &self,
        secret: &str,
    ) -> impl Future<Output = Result<Response>> + Send + 'static {
        let pending = self.queue.submit(
            commands::passphrase(secret),
            self.config.auth_timeout(),
            ResponseKind::Structured,
        );
        async move {
            let response = pending.await.map_err(|e| match e {
                Error::Timeout { .. } | Error::MalformedResponse { .. } => {
                    Error::authentication_failed(e.to_string())
                }
                other => other,
            })?;
            if response.is_device_error() {
                return Err(Error::authentication_failed(response.into_text()));
            }
            debug!("Passphrase accepted");
            Ok(response)
        }
    }

    /// Persist the passphrase used by [`VaultClient::authenticate`].
    pub fn store_passphrase(&self, secret: &str) -> Result<()> {
        self.store.set(PASSPHRASE_KEY, secret)
    }

    /// Remove the stored passphrase.
    pub fn clear_passphrase(&self) -> Result<()> {
        self.store.remove(PASSPHRASE_KEY)
    }

    /// Type arbitrary text on the host the vault is plugged into.
    pub async fn type_raw(&self, text: &str, layout: Option<u32>, ret: bool) -> Result<Response> {
        self.queue.request(commands::type_raw(text, layout, ret)).await
    }

    /// Type the password of a stored entry.
    pub async fn type_entry(&self, id: u32, layout: Option<u32>, ret: bool) -> Result<Response> {
        self.queue.request(commands::type_pass(id, layout, ret)).await
    }

    pub async fn fetch_entry(&self, id: u32) -> Result<Response> {
        self.queue.request(commands::fetch_pass(id)).await
    }

    /// Update a stored entry. Fields left as `None` are unchanged.
    pub async fn edit_entry(
        &self,
        id: u32,
        name: Option<&str>,
        password: Option<&str>,
        layout: Option<u32>,
    ) -> Result<Response> {
        self.queue
            .request(commands::edit_pass(id, name, password, layout))
            .await
    }

    pub async fn list(&self) -> Result<Response> {
        self.queue.request(commands::list()).await
    }

    /// Factory reset the device.
    pub async fn reset(&self) -> Result<Response> {
        self.queue.request(commands::reset()).await
    }

    pub async fn update_wifi_password(&self, new_pass: &str) -> Result<Response> {
        self.queue.request(commands::update_wifi_pass(new_pass)).await
    }

    /// Dump one entry as the device's raw text form.
    pub async fn dump_entry(&self, uid: u32) -> Result<String> {
        let response = self
            .queue
            .submit(
                commands::dump_one(uid),
                self.config.dump_timeout(),
                ResponseKind::RawText,
            )
            .await?;
        Ok(response.into_text())
    }

    /// Restore one entry from its dumped form.
    pub async fn restore_entry(&self, uid: u32, data: &str) -> Result<Response> {
        self.queue.request(commands::restore_one(uid, data)).await
    }

    /// Drop incoming notifications until the guard is released.
    pub fn suppress_notifications(&self) -> SuppressionGuard {
        self.queue.suppress_notifications()
    }
}
