//! Device communication core for a BLE-attached hardware password vault.
//!
//! The vault speaks a request/response protocol over the Nordic UART
//! Service: the app writes one JSON object per command, and the device
//! answers with one or more notifications, optionally prefixed by a
//! `<totalBytes>,<chunkCount>,<chunkSize>\n` header line.
//!
//! # Components
//!
//! - [`reassembly`]: turns notification chunks into complete response strings
//! - [`response`]: classifies an assembled string as JSON or raw text
//! - [`queue`]: runs commands one at a time, with pacing and timeouts
//! - [`session`]: owns the connected peripheral and the send/subscribe primitives
//! - [`lifecycle`]: connection state machine, scanning and reconnect
//! - [`client`]: typed methods for every firmware command
//! - [`ble`] / [`mock`]: the btleplug transport and an in-process stand-in
//!
//! # Platform Differences
//!
//! Device identification varies by platform:
//!
//! - **macOS**: devices are identified by a UUID assigned by CoreBluetooth.
//!   It is stable for a given device on a given Mac, but differs between Macs.
//! - **Linux/Windows**: devices are identified by their Bluetooth MAC address
//!   (e.g., `AA:BB:CC:DD:EE:FF`).
//!
//! The persisted last-device id is whichever of the two the platform uses.
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use vaultlink_core::{ConnectionState, DeviceLink, FileStore, LinkConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let store = Arc::new(FileStore::open_default()?);
//!     let link = DeviceLink::ble(LinkConfig::default(), store).await?;
//!
//!     // Scan, then connect to the first vault found
//!     let handle = link.handle();
//!     handle.start_scan().await?;
//!     let mut discovered = handle.subscribe_discovered();
//!     let vault = discovered.wait_for(|list| !list.is_empty()).await?[0].clone();
//!     handle.stop_scan().await?;
//!     handle.connect(vault).await?;
//!     handle.wait_for_state(ConnectionState::Connected).await?;
//!
//!     let entries = link.client().list().await?;
//!     println!("{}", entries.into_json());
//!     Ok(())
//! }
//! ```

pub mod ble;
pub mod client;
pub mod commands;
pub mod config;
pub mod error;
pub mod events;
pub mod lifecycle;
pub mod link;
pub mod mock;
pub mod queue;
pub mod reassembly;
pub mod response;
pub mod session;
pub mod store;
pub mod transport;
pub mod util;

pub use vaultlink_types::types;
pub use vaultlink_types::uuid as uuids;
pub use vaultlink_types::{
    ChunkHeader, Command, ConnectionState, PeripheralIdentity, ResponseKind,
};

pub use ble::BleTransport;
pub use client::VaultClient;
pub use config::{
    CommandConfig, ConfigError, LinkConfig, ReassemblyConfig, ReconnectConfig, TransportConfig,
};
pub use error::{ConnectionFailureReason, DeviceNotFoundReason, Error, Result};
pub use events::{EventDispatcher, EventReceiver, EventSender, LinkEvent};
pub use lifecycle::{ConnectDisposition, ConnectionHandle, ConnectionManager, ScanDisposition};
pub use link::DeviceLink;
pub use mock::{MockTransport, MockTransportBuilder};
pub use queue::{CommandQueue, PendingResponse, SuppressionGuard};
pub use reassembly::{ChunkOutcome, InactivityOutcome, Reassembler, ReassemblySnapshot};
pub use response::Response;
pub use session::Session;
pub use store::{FileStore, KeyValueStore, MemoryStore};
pub use transport::{NotificationStream, Transport, TransportEvent};
pub use util::{create_identifier, format_peripheral_id};
