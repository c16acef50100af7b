//! Connection lifecycle state machine.
//!
//! A single actor task owns the [`ConnectionState`], the reconnect timer and
//! the scan bookkeeping. Everything that changes them arrives as a message:
//! requests from [`ConnectionHandle`], [`TransportEvent`]s from the radio,
//! and results posted back by the short-lived tasks the actor spawns for
//! connect, scan, disconnect and authentication. Handlers never await, so
//! the actor observes events strictly in arrival order.
//!
//! # Reconnect
//!
//! While the link is down and a last known device is stored, a periodic
//! tick starts a bounded scan for that device and connects when it shows
//! up. The timer is stopped while a manual scan runs or a connection
//! attempt is in flight, so automatic and manual activity never overlap.
//! A manual scan requested during a reconnect scan stops that scan and
//! starts once the radio is idle. Each reconnect scan is followed by a
//! full interval of quiet before the next one.
//!
//! # Authentication
//!
//! After the transport reports a live link, the stored passphrase (if any)
//! is sent through [`VaultClient`]. A rejected handshake tears the link
//! down again.

use std::sync::Arc;

use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::{Instant, sleep_until};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use vaultlink_types::{ConnectionState, PeripheralIdentity};

use crate::client::VaultClient;
use crate::config::LinkConfig;
use crate::error::{Error, Result};
use crate::events::{EventDispatcher, EventReceiver, LinkEvent};
use crate::session::Session;
use crate::store::{KeyValueStore, LAST_DEVICE_KEY, PASSPHRASE_KEY};
use crate::transport::TransportEvent;

/// Outcome of a [`ConnectionHandle::connect`] request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectDisposition {
    /// A connection attempt was started.
    Started,
    /// Already connected to this device; nothing to do.
    AlreadyConnected,
    /// Another connection attempt is in flight.
    AlreadyConnecting,
    /// A manual scan is running; stop it first.
    ScanActive,
    /// Connected to a different device; disconnect first.
    ConnectedElsewhere,
}

/// Outcome of a [`ConnectionHandle::start_scan`] request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanDisposition {
    /// The scan started. A running reconnect scan is stopped first.
    Started,
    /// A manual scan is already running or waiting to start.
    AlreadyScanning,
    /// Manual scans are only allowed while disconnected.
    NotDisconnected,
}

enum Message {
    Connect {
        peripheral: PeripheralIdentity,
        reply: oneshot::Sender<ConnectDisposition>,
    },
    Disconnect {
        reply: oneshot::Sender<Result<()>>,
    },
    StartScan {
        reply: oneshot::Sender<ScanDisposition>,
    },
    StopScan {
        reply: oneshot::Sender<()>,
    },
    ForgetLastDevice {
        reply: oneshot::Sender<Result<()>>,
    },
    ConnectFailed {
        peripheral: PeripheralIdentity,
        error: Error,
    },
    AuthFinished {
        peripheral: PeripheralIdentity,
        result: Result<()>,
    },
    ScanFound {
        scan_id: u64,
        peripheral: PeripheralIdentity,
    },
    ScanFinished {
        scan_id: u64,
        result: Result<()>,
    },
}

/// Handle to the connection manager actor.
///
/// Cloning the handle is cheap. The actor stops when every handle has been
/// dropped or [`ConnectionHandle::shutdown`] is called.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    sender: mpsc::UnboundedSender<Message>,
    state: watch::Receiver<ConnectionState>,
    discovered: watch::Receiver<Vec<PeripheralIdentity>>,
    events: EventDispatcher,
    cancel: CancellationToken,
}

impl ConnectionHandle {
    /// Connect to `peripheral`.
    ///
    /// Resolves once the request has been accepted or refused; the
    /// connection itself completes asynchronously and is observable
    /// through [`ConnectionHandle::subscribe_state`].
    pub async fn connect(&self, peripheral: PeripheralIdentity) -> Result<ConnectDisposition> {
        self.request(|reply| Message::Connect { peripheral, reply })
            .await
    }

    /// Disconnect the current peripheral.
    ///
    /// A no-op unless connected. The state changes when the transport
    /// reports the disconnect.
    pub async fn disconnect(&self) -> Result<()> {
        self.request(|reply| Message::Disconnect { reply }).await?
    }

    /// Start a manual scan. Discoveries accumulate in
    /// [`ConnectionHandle::discovered`].
    ///
    /// If a reconnect scan is running it is stopped and this resolves once
    /// the manual scan has actually started. A [`ConnectionHandle::stop_scan`]
    /// issued in between abandons the request with [`Error::Cancelled`].
    pub async fn start_scan(&self) -> Result<ScanDisposition> {
        self.request(|reply| Message::StartScan { reply }).await
    }

    /// Stop the running scan, waiting until the radio has stopped.
    pub async fn stop_scan(&self) -> Result<()> {
        self.request(|reply| Message::StopScan { reply }).await
    }

    /// Forget the last known device, which stops automatic reconnects.
    pub async fn forget_last_device(&self) -> Result<()> {
        self.request(|reply| Message::ForgetLastDevice { reply })
            .await?
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Watch the connection state.
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    /// Peripherals found by the most recent manual scan, in discovery order.
    pub fn discovered(&self) -> Vec<PeripheralIdentity> {
        self.discovered.borrow().clone()
    }

    /// Watch manual scan results.
    pub fn subscribe_discovered(&self) -> watch::Receiver<Vec<PeripheralIdentity>> {
        self.discovered.clone()
    }

    /// Subscribe to link events.
    pub fn events(&self) -> EventReceiver {
        self.events.subscribe()
    }

    /// Wait until the state equals `target`.
    pub async fn wait_for_state(&self, target: ConnectionState) -> Result<()> {
        let mut state = self.state.clone();
        state
            .wait_for(|s| *s == target)
            .await
            .map(|_| ())
            .map_err(|_| Error::Cancelled)
    }

    /// Stop the actor.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    async fn request<T>(&self, message: impl FnOnce(oneshot::Sender<T>) -> Message) -> Result<T> {
        let (reply, receiver) = oneshot::channel();
        self.sender
            .send(message(reply))
            .map_err(|_| Error::Cancelled)?;
        receiver.await.map_err(|_| Error::Cancelled)
    }
}

struct ActiveScan {
    id: u64,
    manual: bool,
    cancel: CancellationToken,
    found: usize,
    stop_waiters: Vec<oneshot::Sender<()>>,
}

/// The connection manager actor.
pub struct ConnectionManager {
    session: Arc<Session>,
    client: VaultClient,
    store: Arc<dyn KeyValueStore>,
    config: LinkConfig,
    events: EventDispatcher,
    state: watch::Sender<ConnectionState>,
    discovered: watch::Sender<Vec<PeripheralIdentity>>,
    receiver: mpsc::UnboundedReceiver<Message>,
    sender: mpsc::WeakUnboundedSender<Message>,
    transport_events: broadcast::Receiver<TransportEvent>,
    cancel: CancellationToken,
    target: Option<PeripheralIdentity>,
    scan: Option<ActiveScan>,
    pending_manual_scan: Option<oneshot::Sender<ScanDisposition>>,
    next_scan_id: u64,
    reconnect_at: Option<Instant>,
    reconnect_attempts: u32,
}

impl ConnectionManager {
    /// Spawn the actor and return its handle.
    ///
    /// Must be called from within a tokio runtime. If a last known device
    /// is stored, the reconnect timer starts immediately.
    pub fn spawn(
        session: Arc<Session>,
        client: VaultClient,
        store: Arc<dyn KeyValueStore>,
        config: LinkConfig,
        events: EventDispatcher,
    ) -> ConnectionHandle {
        let (sender, receiver) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let (discovered_tx, discovered_rx) = watch::channel(Vec::new());
        let transport_events = session.transport().events();
        let cancel = CancellationToken::new();

        let mut manager = ConnectionManager {
            session,
            client,
            store,
            config,
            events: events.clone(),
            state: state_tx,
            discovered: discovered_tx,
            receiver,
            sender: sender.downgrade(),
            transport_events,
            cancel: cancel.clone(),
            target: None,
            scan: None,
            pending_manual_scan: None,
            next_scan_id: 0,
            reconnect_at: None,
            reconnect_attempts: 0,
        };
        manager.arm_reconnect();
        tokio::spawn(manager.run());

        ConnectionHandle {
            sender,
            state: state_rx,
            discovered: discovered_rx,
            events,
            cancel,
        }
    }

    async fn run(mut self) {
        debug!("Connection manager started");
        let cancel = self.cancel.clone();
        let mut transport_open = true;

        loop {
            let reconnect_at = self.reconnect_at;
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    info!("Connection manager cancelled, shutting down");
                    break;
                }
                message = self.receiver.recv() => match message {
                    Some(message) => self.handle_message(message),
                    None => break,
                },
                event = self.transport_events.recv(), if transport_open => match event {
                    Ok(event) => self.handle_transport_event(event),
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("Missed {} transport events", n);
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        warn!("Transport event channel closed");
                        transport_open = false;
                    }
                },
                _ = sleep_until(reconnect_at.unwrap_or_else(Instant::now)), if reconnect_at.is_some() => {
                    self.on_reconnect_tick();
                }
            }
        }

        if let Some(scan) = self.scan.take() {
            scan.cancel.cancel();
        }
        debug!("Connection manager stopped");
    }

    fn handle_message(&mut self, message: Message) {
        match message {
            Message::Connect { peripheral, reply } => {
                let disposition = self.handle_connect(peripheral);
                let _ = reply.send(disposition);
            }
            Message::Disconnect { reply } => self.handle_disconnect(reply),
            Message::StartScan { reply } => self.handle_start_scan(reply),
            Message::StopScan { reply } => {
                if self.pending_manual_scan.take().is_some() {
                    debug!("Pending manual scan abandoned");
                }
                match &mut self.scan {
                    Some(scan) => {
                        scan.cancel.cancel();
                        scan.stop_waiters.push(reply);
                    }
                    None => {
                        let _ = reply.send(());
                    }
                }
            }
            Message::ForgetLastDevice { reply } => {
                let result = self.store.remove(LAST_DEVICE_KEY);
                info!("Forgot last known device");
                self.stop_reconnect();
                if let Some(scan) = self.scan.as_ref().filter(|s| !s.manual) {
                    scan.cancel.cancel();
                }
                let _ = reply.send(result);
            }
            Message::ConnectFailed { peripheral, error } => {
                self.handle_connect_failed(peripheral, error)
            }
            Message::AuthFinished { peripheral, result } => {
                self.handle_auth_finished(peripheral, result)
            }
            Message::ScanFound {
                scan_id,
                peripheral,
            } => self.handle_scan_found(scan_id, peripheral),
            Message::ScanFinished { scan_id, result } => self.handle_scan_finished(scan_id, result),
        }
    }

    fn handle_connect(&mut self, peripheral: PeripheralIdentity) -> ConnectDisposition {
        match self.current_state() {
            ConnectionState::Connected => {
                let same = self
                    .target
                    .as_ref()
                    .is_some_and(|t| t.same_device(&peripheral));
                return if same {
                    ConnectDisposition::AlreadyConnected
                } else {
                    ConnectDisposition::ConnectedElsewhere
                };
            }
            ConnectionState::Connecting => return ConnectDisposition::AlreadyConnecting,
            _ => {}
        }
        if self.scan.as_ref().is_some_and(|s| s.manual) {
            debug!("Ignoring connect to {} while a manual scan is active", peripheral.id);
            return ConnectDisposition::ScanActive;
        }
        self.begin_connect(peripheral);
        ConnectDisposition::Started
    }

    fn begin_connect(&mut self, peripheral: PeripheralIdentity) {
        self.stop_reconnect();
        if let Some(scan) = self.scan.as_ref().filter(|s| !s.manual) {
            scan.cancel.cancel();
        }

        info!("Connecting to {}", peripheral);
        self.target = Some(peripheral.clone());
        self.set_state(ConnectionState::Connecting);

        let Some(sender) = self.sender.upgrade() else {
            return;
        };
        let session = Arc::clone(&self.session);
        tokio::spawn(async move {
            if let Err(error) = session.connect(&peripheral).await {
                let _ = sender.send(Message::ConnectFailed { peripheral, error });
            }
        });
    }

    fn handle_disconnect(&mut self, reply: oneshot::Sender<Result<()>>) {
        if !self.current_state().is_connected() {
            debug!("Disconnect requested while {}, ignoring", self.current_state());
            let _ = reply.send(Ok(()));
            return;
        }
        self.stop_reconnect();
        let session = Arc::clone(&self.session);
        tokio::spawn(async move {
            let _ = reply.send(session.disconnect().await);
        });
    }

    fn handle_start_scan(&mut self, reply: oneshot::Sender<ScanDisposition>) {
        match &self.scan {
            Some(scan) if scan.manual || self.pending_manual_scan.is_some() => {
                let _ = reply.send(ScanDisposition::AlreadyScanning);
            }
            Some(scan) => {
                debug!("Manual scan requested, stopping reconnect scan {}", scan.id);
                scan.cancel.cancel();
                self.stop_reconnect();
                self.pending_manual_scan = Some(reply);
            }
            None => {
                let _ = reply.send(self.begin_manual_scan());
            }
        }
    }

    fn begin_manual_scan(&mut self) -> ScanDisposition {
        if self.current_state() != ConnectionState::Disconnected {
            return ScanDisposition::NotDisconnected;
        }

        self.stop_reconnect();
        self.discovered.send_replace(Vec::new());
        self.start_scan(true);
        ScanDisposition::Started
    }

    fn start_scan(&mut self, manual: bool) {
        let Some(sender) = self.sender.upgrade() else {
            return;
        };
        self.next_scan_id += 1;
        let scan_id = self.next_scan_id;
        let cancel = self.cancel.child_token();
        let duration = self.config.reconnect.scan_duration();

        self.scan = Some(ActiveScan {
            id: scan_id,
            manual,
            cancel: cancel.clone(),
            found: 0,
            stop_waiters: Vec::new(),
        });
        info!("Starting {} scan for {:?}", if manual { "manual" } else { "reconnect" }, duration);
        self.events.send(LinkEvent::ScanStarted { manual });

        let transport = Arc::clone(self.session.transport());
        tokio::spawn(async move {
            let (found_tx, mut found_rx) = mpsc::channel(32);
            let scan = transport.scan(duration, found_tx);
            tokio::pin!(scan);
            let mut stopping = false;

            let result = loop {
                tokio::select! {
                    result = &mut scan => break result,
                    Some(peripheral) = found_rx.recv() => {
                        let _ = sender.send(Message::ScanFound { scan_id, peripheral });
                    }
                    _ = cancel.cancelled(), if !stopping => {
                        stopping = true;
                        if let Err(e) = transport.stop_scan().await {
                            warn!("Failed to stop scan: {}", e);
                        }
                    }
                }
            };
            while let Ok(peripheral) = found_rx.try_recv() {
                let _ = sender.send(Message::ScanFound { scan_id, peripheral });
            }
            let _ = sender.send(Message::ScanFinished { scan_id, result });
        });
    }

    fn handle_scan_found(&mut self, scan_id: u64, peripheral: PeripheralIdentity) {
        let Some(manual) = self
            .scan
            .as_ref()
            .filter(|s| s.id == scan_id)
            .map(|s| s.manual)
        else {
            trace!("Discarding result from stale scan {}", scan_id);
            return;
        };

        if manual {
            let mut added = false;
            self.discovered.send_if_modified(|list| {
                match list.iter_mut().find(|p| p.same_device(&peripheral)) {
                    Some(existing) => {
                        if existing.name.is_none() && peripheral.name.is_some() {
                            existing.name = peripheral.name.clone();
                            return true;
                        }
                        false
                    }
                    None => {
                        list.push(peripheral.clone());
                        added = true;
                        true
                    }
                }
            });
            if added {
                self.count_found();
                debug!("Discovered {}", peripheral);
                self.events.send(LinkEvent::Discovered { device: peripheral });
            }
            return;
        }

        if self.pending_manual_scan.is_some() {
            return;
        }
        let Some(last) = self.store.get(LAST_DEVICE_KEY) else {
            return;
        };
        if peripheral.matches_id(&last) && self.current_state() == ConnectionState::Disconnected {
            self.count_found();
            info!("Reconnect scan found last device {}", peripheral);
            self.begin_connect(peripheral);
        }
    }

    fn count_found(&mut self) {
        if let Some(scan) = self.scan.as_mut() {
            scan.found += 1;
        }
    }

    fn handle_scan_finished(&mut self, scan_id: u64, result: Result<()>) {
        if let Err(e) = &result {
            warn!("Scan failed: {}", e);
        }
        if self.scan.as_ref().is_none_or(|s| s.id != scan_id) {
            return;
        }
        let Some(scan) = self.scan.take() else {
            return;
        };
        debug!("Scan {} finished with {} result(s)", scan.id, scan.found);
        for waiter in scan.stop_waiters {
            let _ = waiter.send(());
        }
        self.events.send(LinkEvent::ScanFinished {
            manual: scan.manual,
            found: scan.found,
        });
        if let Some(reply) = self.pending_manual_scan.take() {
            let _ = reply.send(self.begin_manual_scan());
        }
        if scan.manual {
            if self.current_state() == ConnectionState::Disconnected {
                self.arm_reconnect();
            }
        } else if self.reconnect_at.is_some() {
            self.reconnect_at = Some(Instant::now() + self.config.reconnect.interval());
        }
    }

    fn handle_connect_failed(&mut self, peripheral: PeripheralIdentity, error: Error) {
        let is_target = self
            .target
            .as_ref()
            .is_some_and(|t| t.same_device(&peripheral));
        if !is_target || self.current_state() != ConnectionState::Connecting {
            debug!("Ignoring stale connect failure for {}", peripheral.id);
            return;
        }

        warn!("Connection to {} failed: {}", peripheral, error);
        self.target = None;
        self.set_state(ConnectionState::Disconnected);
        self.events.send(LinkEvent::ConnectFailed {
            device: peripheral,
            error: error.to_string(),
        });
        self.arm_reconnect();
    }

    fn handle_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Connected(peripheral) => self.on_connected(peripheral),
            TransportEvent::Disconnected(peripheral) => self.on_disconnected(peripheral),
        }
    }

    fn on_connected(&mut self, peripheral: PeripheralIdentity) {
        if self.current_state().is_connected() {
            debug!("Duplicate connected event for {}", peripheral.id);
            return;
        }

        self.session.attach(peripheral.clone());
        self.target = Some(peripheral.clone());
        self.reconnect_attempts = 0;
        self.stop_reconnect();
        self.set_state(ConnectionState::Connected);
        info!("Connected to {}", peripheral);

        if let Err(e) = self.store.set(LAST_DEVICE_KEY, &peripheral.id) {
            warn!("Failed to persist last device: {}", e);
        }
        self.events.send(LinkEvent::Connected {
            device: peripheral.clone(),
        });

        self.authenticate(peripheral);
    }

    fn authenticate(&mut self, peripheral: PeripheralIdentity) {
        let Some(secret) = self.store.get(PASSPHRASE_KEY) else {
            debug!("No passphrase stored, skipping authentication");
            return;
        };
        let Some(sender) = self.sender.upgrade() else {
            return;
        };

        let response = self.client.submit_passphrase(&secret);
        tokio::spawn(async move {
            let result = response.await.map(|_| ());
            let _ = sender.send(Message::AuthFinished { peripheral, result });
        });
    }

    fn handle_auth_finished(&mut self, peripheral: PeripheralIdentity, result: Result<()>) {
        let current = self.session.peripheral();
        if !current.as_ref().is_some_and(|p| p.same_device(&peripheral)) {
            debug!("Ignoring authentication result for stale link {}", peripheral.id);
            return;
        }

        match result {
            Ok(()) => {
                info!("Authenticated with {}", peripheral);
                self.events.send(LinkEvent::Authenticated { device: peripheral });
            }
            Err(e) => {
                warn!("Authentication with {} failed, disconnecting: {}", peripheral, e);
                self.session.detach();
                self.target = None;
                self.set_state(ConnectionState::Disconnected);
                self.events.send(LinkEvent::AuthenticationFailed {
                    device: peripheral,
                    error: e.to_string(),
                });
                self.arm_reconnect();

                let session = Arc::clone(&self.session);
                tokio::spawn(async move {
                    if let Err(e) = session.disconnect().await {
                        warn!("Failed to disconnect after authentication failure: {}", e);
                    }
                });
            }
        }
    }

    fn on_disconnected(&mut self, peripheral: PeripheralIdentity) {
        let was_up = self.current_state() != ConnectionState::Disconnected;
        let is_target = self
            .target
            .as_ref()
            .is_none_or(|t| t.same_device(&peripheral));
        if !is_target {
            debug!("Ignoring disconnect of non-target {}", peripheral.id);
            return;
        }

        self.session.detach();
        self.target = None;
        self.set_state(ConnectionState::Disconnected);
        if was_up {
            info!("Disconnected from {}", peripheral);
        }
        self.events.send(LinkEvent::Disconnected { device: peripheral });
        self.arm_reconnect();
    }

    fn on_reconnect_tick(&mut self) {
        self.reconnect_at = Some(Instant::now() + self.config.reconnect.interval());

        if self.current_state() != ConnectionState::Disconnected || self.scan.is_some() {
            trace!("Reconnect tick skipped, link busy");
            return;
        }
        let Some(last) = self.store.get(LAST_DEVICE_KEY) else {
            self.stop_reconnect();
            return;
        };
        if !self.session.transport().is_available() {
            debug!("Reconnect tick skipped, radio unavailable");
            return;
        }

        self.reconnect_attempts += 1;
        debug!("Reconnect attempt {} for {}", self.reconnect_attempts, last);
        self.events.send(LinkEvent::ReconnectAttempt {
            device_id: last,
            attempt: self.reconnect_attempts,
        });
        self.start_scan(false);
    }

    fn arm_reconnect(&mut self) {
        if !self.config.reconnect.enabled || self.reconnect_at.is_some() {
            return;
        }
        if self.store.get(LAST_DEVICE_KEY).is_none() {
            return;
        }
        if self.scan.as_ref().is_some_and(|s| s.manual) {
            return;
        }
        trace!("Reconnect timer armed");
        self.reconnect_at = Some(Instant::now() + self.config.reconnect.interval());
    }

    fn stop_reconnect(&mut self) {
        if self.reconnect_at.take().is_some() {
            trace!("Reconnect timer stopped");
        }
    }

    fn current_state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    fn set_state(&mut self, state: ConnectionState) {
        let from = self.state.send_replace(state);
        if from != state {
            debug!("Connection state {} -> {}", from, state);
            self.events.send(LinkEvent::StateChanged { from, to: state });
        }
    }
}
