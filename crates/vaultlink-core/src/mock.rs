//! Mock transport implementation for testing.
//!
//! This module provides a mock radio that can be used for unit testing
//! without requiring actual BLE hardware.
//!
//! The [`MockTransport`] implements the [`Transport`] trait, allowing it to be
//! used interchangeably with [`BleTransport`](crate::ble::BleTransport).
//!
//! # Features
//!
//! - **Scripted responses**: A responder closure maps each complete command
//!   written by the link to the notifications the device would send back
//! - **Chunk pacing**: Replies are delivered one notification at a time with
//!   a configurable delay
//! - **Failure injection**: Fail upcoming connects or writes, simulate a
//!   remote disconnect, or report the radio as unavailable
//! - **Inspection**: Write log, decoded command log, connect and scan counters,
//!   and detection of overlapping commands

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream;
use tokio::sync::{Notify, broadcast, mpsc};
use tracing::{debug, warn};

use vaultlink_types::{ChunkHeader, Command, PeripheralIdentity};

use crate::error::{ConnectionFailureReason, Error, Result};
use crate::transport::{NotificationStream, Transport, TransportEvent};

type Responder = Arc<dyn Fn(&Command) -> Option<Vec<Vec<u8>>> + Send + Sync>;

/// A mock vault radio for testing.
///
/// Implements [`Transport`] for use in generic code and testing. Notify
/// registration and writes are accepted whether or not a peripheral is
/// connected; the [`Session`](crate::session::Session) enforces that.
///
/// # Example
///
/// ```
/// use std::sync::Arc;
/// use vaultlink_core::{MockTransport, Transport};
/// use vaultlink_types::PeripheralIdentity;
///
/// #[tokio::main]
/// async fn main() {
///     let mock = Arc::new(MockTransport::new());
///     mock.respond_with(|_| Some(vec![b"{\"status\":\"success\"}".to_vec()]));
///     mock.connect(&PeripheralIdentity::new("AA:BB")).await.unwrap();
///     assert!(mock.is_connected());
/// }
/// ```
pub struct MockTransport {
    address: String,
    mtu: Option<u16>,
    connected: Mutex<Option<PeripheralIdentity>>,
    available: AtomicBool,
    notifications: broadcast::Sender<Bytes>,
    events: broadcast::Sender<TransportEvent>,
    responder: Mutex<Option<Responder>>,
    chunk_delay_ms: AtomicU64,
    connect_latency_ms: AtomicU64,
    remaining_connect_failures: AtomicU32,
    write_failure: Mutex<Option<String>>,
    inbound: Mutex<Vec<u8>>,
    writes: Mutex<Vec<Vec<u8>>>,
    commands: Mutex<Vec<Command>>,
    awaiting_reply: Arc<AtomicBool>,
    overlap_detected: AtomicBool,
    scan_results: Mutex<Vec<PeripheralIdentity>>,
    scan_stop: Notify,
    active_scans: AtomicU32,
    max_concurrent_scans: AtomicU32,
    scan_count: AtomicU32,
    connect_count: AtomicU32,
}

impl std::fmt::Debug for MockTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockTransport")
            .field("address", &self.address)
            .field("connected", &self.is_connected())
            .field("writes", &self.write_count())
            .finish_non_exhaustive()
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MockTransport {
    /// Create a new mock transport with default values.
    pub fn new() -> Self {
        MockTransportBuilder::new().build()
    }

    /// Create a builder.
    pub fn builder() -> MockTransportBuilder {
        MockTransportBuilder::new()
    }

    /// Address of the simulated vault.
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Identity of the simulated vault, as a scan would report it.
    pub fn peripheral(&self) -> PeripheralIdentity {
        PeripheralIdentity::with_name(&self.address, "Vault")
    }

    /// Whether a peripheral is connected.
    pub fn is_connected(&self) -> bool {
        lock(&self.connected).is_some()
    }

    /// Set the reply script.
    ///
    /// The closure receives each complete command and returns the
    /// notifications to send back, or `None` to stay silent.
    pub fn respond_with<F>(&self, responder: F)
    where
        F: Fn(&Command) -> Option<Vec<Vec<u8>>> + Send + Sync + 'static,
    {
        *lock(&self.responder) = Some(Arc::new(responder));
    }

    /// Set the delay before each reply notification.
    pub fn set_chunk_delay(&self, delay: Duration) {
        self.chunk_delay_ms
            .store(delay.as_millis() as u64, Ordering::Relaxed);
    }

    /// Set the simulated connect latency.
    pub fn set_connect_latency(&self, latency: Duration) {
        self.connect_latency_ms
            .store(latency.as_millis() as u64, Ordering::Relaxed);
    }

    /// Make the next `count` connect attempts fail.
    pub fn fail_connects(&self, count: u32) {
        self.remaining_connect_failures
            .store(count, Ordering::Relaxed);
    }

    /// Make the next write fail with `reason`.
    pub fn fail_next_write(&self, reason: &str) {
        *lock(&self.write_failure) = Some(reason.to_string());
    }

    /// Report the radio as available or not.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::Relaxed);
    }

    /// Set the peripherals every scan reports.
    pub fn set_scan_results(&self, results: Vec<PeripheralIdentity>) {
        *lock(&self.scan_results) = results;
    }

    /// Deliver a notification as if the device sent it.
    pub fn push_notification(&self, data: impl Into<Bytes>) {
        let _ = self.notifications.send(data.into());
    }

    /// Simulate the device dropping the link.
    pub fn simulate_disconnect(&self) {
        if let Some(peripheral) = lock(&self.connected).take() {
            debug!(device = %peripheral.id, "Mock remote disconnect");
            let _ = self.events.send(TransportEvent::Disconnected(peripheral));
        }
    }

    /// Broadcast a transport event without touching the mock's own link.
    pub fn emit_event(&self, event: TransportEvent) {
        let _ = self.events.send(event);
    }

    /// All raw writes received, in order.
    pub fn writes(&self) -> Vec<Vec<u8>> {
        lock(&self.writes).clone()
    }

    /// Number of raw writes received.
    pub fn write_count(&self) -> usize {
        lock(&self.writes).len()
    }

    /// All complete commands decoded from the writes, in order.
    pub fn commands(&self) -> Vec<Command> {
        lock(&self.commands).clone()
    }

    /// Names of the decoded commands, in order.
    pub fn command_names(&self) -> Vec<String> {
        lock(&self.commands)
            .iter()
            .map(|c| c.name().to_string())
            .collect()
    }

    /// Whether a command was written while a reply was still being sent.
    pub fn overlap_detected(&self) -> bool {
        self.overlap_detected.load(Ordering::Relaxed)
    }

    /// Number of connect calls.
    pub fn connect_count(&self) -> u32 {
        self.connect_count.load(Ordering::Relaxed)
    }

    /// Number of scans started.
    pub fn scan_count(&self) -> u32 {
        self.scan_count.load(Ordering::Relaxed)
    }

    /// Number of scans currently running.
    pub fn active_scans(&self) -> u32 {
        self.active_scans.load(Ordering::Relaxed)
    }

    /// Highest number of scans that ever ran at once.
    pub fn max_concurrent_scans(&self) -> u32 {
        self.max_concurrent_scans.load(Ordering::Relaxed)
    }

    fn handle_write(&self, data: &[u8]) {
        let mut inbound = lock(&self.inbound);
        inbound.extend_from_slice(data);

        let value = match serde_json::from_slice::<serde_json::Value>(&inbound) {
            Ok(value) => value,
            Err(e) if e.is_eof() => return,
            Err(e) => {
                warn!(error = %e, "Mock discarding unparseable write");
                inbound.clear();
                return;
            }
        };
        inbound.clear();
        drop(inbound);

        let Some(command) = Command::from_envelope(&value) else {
            warn!("Mock received JSON without a command name");
            return;
        };

        if self.awaiting_reply.swap(true, Ordering::AcqRel) {
            warn!(command = %command, "Command written while a reply was in progress");
            self.overlap_detected.store(true, Ordering::Relaxed);
        }
        lock(&self.commands).push(command.clone());

        let responder = lock(&self.responder).clone();
        let reply = responder.and_then(|r| r(&command));
        let Some(chunks) = reply else {
            self.awaiting_reply.store(false, Ordering::Release);
            return;
        };

        let sender = self.notifications.clone();
        let awaiting_reply = Arc::clone(&self.awaiting_reply);
        let delay = Duration::from_millis(self.chunk_delay_ms.load(Ordering::Relaxed));
        tokio::spawn(async move {
            for chunk in chunks {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                let _ = sender.send(Bytes::from(chunk));
            }
            awaiting_reply.store(false, Ordering::Release);
        });
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn connect(&self, peripheral: &PeripheralIdentity) -> Result<()> {
        self.connect_count.fetch_add(1, Ordering::Relaxed);

        if !self.available.load(Ordering::Relaxed) {
            return Err(Error::connection_failed(
                Some(peripheral.id.clone()),
                ConnectionFailureReason::AdapterUnavailable,
            ));
        }

        let latency = self.connect_latency_ms.load(Ordering::Relaxed);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }

        if self.remaining_connect_failures.load(Ordering::Relaxed) > 0 {
            self.remaining_connect_failures
                .fetch_sub(1, Ordering::Relaxed);
            return Err(Error::connection_failed(
                Some(peripheral.id.clone()),
                ConnectionFailureReason::OutOfRange,
            ));
        }

        let mut connected = peripheral.clone();
        if let Some(mtu) = self.mtu {
            connected = connected.mtu(mtu);
        }
        *lock(&self.connected) = Some(connected.clone());
        lock(&self.inbound).clear();
        let _ = self.events.send(TransportEvent::Connected(connected));
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.simulate_disconnect();
        Ok(())
    }

    async fn write(&self, data: &[u8]) -> Result<()> {
        if let Some(reason) = lock(&self.write_failure).take() {
            return Err(Error::write_failed(reason));
        }
        lock(&self.writes).push(data.to_vec());
        self.handle_write(data);
        Ok(())
    }

    async fn start_notifying(&self) -> Result<NotificationStream> {
        let receiver = self.notifications.subscribe();
        let stream = stream::unfold(receiver, |mut receiver| async move {
            loop {
                match receiver.recv().await {
                    Ok(data) => return Some((data, receiver)),
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(skipped = n, "Mock notification receiver lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        });
        Ok(Box::pin(stream))
    }

    async fn scan(
        &self,
        duration: Duration,
        found: mpsc::Sender<PeripheralIdentity>,
    ) -> Result<()> {
        if !self.available.load(Ordering::Relaxed) {
            return Err(Error::DeviceNotFound(
                crate::error::DeviceNotFoundReason::NoAdapter,
            ));
        }

        self.scan_count.fetch_add(1, Ordering::Relaxed);
        let active = self.active_scans.fetch_add(1, Ordering::AcqRel) + 1;
        self.max_concurrent_scans
            .fetch_max(active, Ordering::AcqRel);

        let stop = self.scan_stop.notified();
        tokio::pin!(stop);
        stop.as_mut().enable();

        let results = lock(&self.scan_results).clone();
        for peripheral in results {
            if found.send(peripheral).await.is_err() {
                break;
            }
        }

        tokio::select! {
            _ = tokio::time::sleep(duration) => {}
            _ = &mut stop => debug!("Mock scan stopped early"),
        }
        self.active_scans.fetch_sub(1, Ordering::AcqRel);
        Ok(())
    }

    async fn stop_scan(&self) -> Result<()> {
        self.scan_stop.notify_waiters();
        Ok(())
    }

    fn events(&self) -> broadcast::Receiver<TransportEvent> {
        self.events.subscribe()
    }

    fn is_available(&self) -> bool {
        self.available.load(Ordering::Relaxed)
    }
}

/// Builder for [`MockTransport`].
#[derive(Debug, Default)]
pub struct MockTransportBuilder {
    address: Option<String>,
    mtu: Option<u16>,
    chunk_delay: Duration,
    scan_results: Vec<PeripheralIdentity>,
}

impl MockTransportBuilder {
    /// Create a new builder with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the device address.
    #[must_use]
    pub fn address(mut self, address: &str) -> Self {
        self.address = Some(address.to_string());
        self
    }

    /// Report this MTU on connect.
    #[must_use]
    pub fn mtu(mut self, mtu: u16) -> Self {
        self.mtu = Some(mtu);
        self
    }

    /// Set the delay before each reply notification.
    #[must_use]
    pub fn chunk_delay(mut self, delay: Duration) -> Self {
        self.chunk_delay = delay;
        self
    }

    /// Add a peripheral to every scan's results.
    #[must_use]
    pub fn scan_result(mut self, peripheral: PeripheralIdentity) -> Self {
        self.scan_results.push(peripheral);
        self
    }

    /// Build the mock transport.
    #[must_use]
    pub fn build(self) -> MockTransport {
        let (notifications, _) = broadcast::channel(256);
        let (events, _) = broadcast::channel(64);
        MockTransport {
            address: self
                .address
                .unwrap_or_else(|| format!("MOCK-{:06X}", rand::random::<u32>() % 0xFFFFFF)),
            mtu: self.mtu,
            connected: Mutex::new(None),
            available: AtomicBool::new(true),
            notifications,
            events,
            responder: Mutex::new(None),
            chunk_delay_ms: AtomicU64::new(self.chunk_delay.as_millis() as u64),
            connect_latency_ms: AtomicU64::new(0),
            remaining_connect_failures: AtomicU32::new(0),
            write_failure: Mutex::new(None),
            inbound: Mutex::new(Vec::new()),
            writes: Mutex::new(Vec::new()),
            commands: Mutex::new(Vec::new()),
            awaiting_reply: Arc::new(AtomicBool::new(false)),
            overlap_detected: AtomicBool::new(false),
            scan_results: Mutex::new(self.scan_results),
            scan_stop: Notify::new(),
            active_scans: AtomicU32::new(0),
            max_concurrent_scans: AtomicU32::new(0),
            scan_count: AtomicU32::new(0),
            connect_count: AtomicU32::new(0),
        }
    }
}

/// Split `payload` into notifications the way the vault does.
///
/// The first notification carries the header line followed by the first
/// `chunk_size` bytes of the payload.
pub fn chunked_reply(payload: &str, chunk_size: usize) -> Vec<Vec<u8>> {
    let bytes = payload.as_bytes();
    let chunk_size = chunk_size.max(1);
    let pieces: Vec<&[u8]> = if bytes.is_empty() {
        vec![bytes]
    } else {
        bytes.chunks(chunk_size).collect()
    };
    let header = ChunkHeader::new(bytes.len(), pieces.len() as u32, chunk_size);

    pieces
        .iter()
        .enumerate()
        .map(|(i, piece)| {
            if i == 0 {
                let mut first = header.encode().into_bytes();
                first.extend_from_slice(piece);
                first
            } else {
                piece.to_vec()
            }
        })
        .collect()
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[tokio::test]
    async fn test_mock_connect_disconnect() {
        let mock = MockTransport::builder().address("AA:BB").mtu(185).build();
        let mut events = mock.events();
        assert!(!mock.is_connected());

        mock.connect(&mock.peripheral()).await.unwrap();
        assert!(mock.is_connected());
        match events.recv().await.unwrap() {
            TransportEvent::Connected(p) => {
                assert_eq!(p.id, "AA:BB");
                assert_eq!(p.mtu, Some(185));
            }
            other => panic!("unexpected event: {other:?}"),
        }

        mock.disconnect().await.unwrap();
        assert!(!mock.is_connected());
        assert!(matches!(
            events.recv().await.unwrap(),
            TransportEvent::Disconnected(_)
        ));
    }

    #[tokio::test]
    async fn test_mock_connect_failures() {
        let mock = MockTransport::new();
        mock.fail_connects(1);
        assert!(mock.connect(&mock.peripheral()).await.is_err());
        assert!(mock.connect(&mock.peripheral()).await.is_ok());
        assert_eq!(mock.connect_count(), 2);

        mock.set_available(false);
        assert!(!mock.is_available());
        let err = mock.connect(&mock.peripheral()).await.unwrap_err();
        assert!(matches!(
            err,
            Error::ConnectionFailed {
                reason: ConnectionFailureReason::AdapterUnavailable,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_mock_reassembles_split_writes() {
        let mock = MockTransport::new();
        mock.write(br#"{"cmd":"fetch"#).await.unwrap();
        assert!(mock.commands().is_empty());
        mock.write(br#"Pass","id":3}"#).await.unwrap();

        let commands = mock.commands();
        assert_eq!(commands.len(), 1);
        assert_eq!(commands[0].name(), "fetchPass");
        assert_eq!(commands[0].param("id"), Some(&serde_json::json!(3)));
        assert_eq!(mock.write_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_mock_replies_to_subscribers() {
        let mock = MockTransport::builder()
            .chunk_delay(Duration::from_millis(10))
            .build();
        mock.respond_with(|_| Some(chunked_reply(r#"{"ok":true}"#, 4)));

        let mut notifications = mock.start_notifying().await.unwrap();
        mock.write(br#"{"cmd":"list"}"#).await.unwrap();

        let first = notifications.next().await.unwrap();
        assert_eq!(&first[..], b"11,3,4\n{\"ok");
        assert_eq!(&notifications.next().await.unwrap()[..], b"\":tr");
        assert_eq!(&notifications.next().await.unwrap()[..], b"ue}");
        assert!(!mock.overlap_detected());
    }

    #[tokio::test]
    async fn test_mock_write_failure_is_one_shot() {
        let mock = MockTransport::new();
        mock.fail_next_write("boom");
        assert!(matches!(
            mock.write(b"{}").await,
            Err(Error::WriteFailed { .. })
        ));
        assert!(mock.write(br#"{"cmd":"list"}"#).await.is_ok());
        assert_eq!(mock.command_names(), vec!["list".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_mock_scan_reports_results_and_stops() {
        let mock = Arc::new(
            MockTransport::builder()
                .scan_result(PeripheralIdentity::new("11:22"))
                .build(),
        );
        let (tx, mut rx) = mpsc::channel(8);

        let scanner = Arc::clone(&mock);
        let task = tokio::spawn(async move { scanner.scan(Duration::from_secs(4), tx).await });

        assert_eq!(rx.recv().await.unwrap().id, "11:22");
        assert_eq!(mock.active_scans(), 1);
        mock.stop_scan().await.unwrap();
        task.await.unwrap().unwrap();
        assert_eq!(mock.active_scans(), 0);
        assert_eq!(mock.scan_count(), 1);
        assert_eq!(mock.max_concurrent_scans(), 1);
    }

    #[test]
    fn test_chunked_reply_layout() {
        let chunks = chunked_reply("abcdefg", 3);
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0], b"7,3,3\nabc".to_vec());
        assert_eq!(chunks[1], b"def".to_vec());
        assert_eq!(chunks[2], b"g".to_vec());
    }
}
