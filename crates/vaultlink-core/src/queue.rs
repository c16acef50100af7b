//! Serialized command execution.
//!
//! Commands submitted from any task are appended to a FIFO channel and
//! executed one at a time by a single worker task. For each command the
//! worker waits the pacing delay, registers for notifications, writes the
//! serialized command and then feeds notifications into a [`Reassembler`]
//! until the response completes or the command's timeout fires. The
//! reassembler is reset after every command, whatever its outcome, so a
//! late chunk from a timed-out command cannot leak into the next one.
//!
//! The worker supports graceful shutdown via [`CommandQueue::shutdown`],
//! which uses a cancellation token to stop it; queued commands then fail
//! with [`Error::Cancelled`].

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::task::{Context, Poll};
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, sleep, sleep_until, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use vaultlink_types::{Command, ResponseKind};

use crate::config::{CommandConfig, ReassemblyConfig};
use crate::error::{Error, Result};
use crate::reassembly::{ChunkOutcome, InactivityOutcome, Reassembler};
use crate::response::Response;
use crate::session::Session;

/// One submitted command awaiting execution.
#[derive(Debug)]
struct PendingOperation {
    command: Command,
    kind: ResponseKind,
    timeout: Duration,
    reply: oneshot::Sender<Result<Response>>,
    submitted_at: Instant,
}

/// Future resolving to the response of a submitted command.
#[derive(Debug)]
#[must_use = "a command whose response is dropped before it starts is skipped"]
pub struct PendingResponse {
    receiver: oneshot::Receiver<Result<Response>>,
}

impl Future for PendingResponse {
    type Output = Result<Response>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.receiver).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            Poll::Ready(Err(_)) => Poll::Ready(Err(Error::Cancelled)),
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Handle to the command worker.
///
/// Cloning the handle is cheap; all clones feed the same queue.
#[derive(Debug, Clone)]
pub struct CommandQueue {
    sender: mpsc::UnboundedSender<PendingOperation>,
    suppressed: Arc<AtomicUsize>,
    cancel: CancellationToken,
    default_timeout: Duration,
}

impl CommandQueue {
    /// Spawn the worker for `session`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn(
        session: Arc<Session>,
        commands: &CommandConfig,
        reassembly: &ReassemblyConfig,
    ) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        let suppressed = Arc::new(AtomicUsize::new(0));
        let cancel = CancellationToken::new();

        let worker = Worker {
            session,
            receiver,
            reassembler: Reassembler::new(reassembly.inactivity()),
            suppressed: Arc::clone(&suppressed),
            cancel: cancel.clone(),
            pacing: commands.pacing(),
        };
        tokio::spawn(worker.run());

        Self {
            sender,
            suppressed,
            cancel,
            default_timeout: commands.default_timeout(),
        }
    }

    /// Enqueue a command.
    ///
    /// Returns immediately; the command runs after every command submitted
    /// before it has finished.
    pub fn submit(&self, command: Command, timeout: Duration, kind: ResponseKind) -> PendingResponse {
        let (reply, receiver) = oneshot::channel();
        trace!(command = %command, ?kind, ?timeout, "Command submitted");
        let op = PendingOperation {
            command,
            kind,
            timeout,
            reply,
            submitted_at: Instant::now(),
        };
        if let Err(mpsc::error::SendError(op)) = self.sender.send(op) {
            debug!(command = %op.command, "Queue closed, rejecting command");
            let _ = op.reply.send(Err(Error::Cancelled));
        }
        PendingResponse { receiver }
    }

    /// Enqueue a command expecting a structured response, with the default timeout.
    pub fn request(&self, command: Command) -> PendingResponse {
        self.submit(command, self.default_timeout, ResponseKind::Structured)
    }

    /// The timeout used by [`CommandQueue::request`].
    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    /// Drop incoming notifications until the returned guard is dropped.
    ///
    /// Suppressed chunks never reach the reassembler. Guards nest.
    pub fn suppress_notifications(&self) -> SuppressionGuard {
        self.suppressed.fetch_add(1, Ordering::AcqRel);
        debug!("Notification processing suppressed");
        SuppressionGuard {
            suppressed: Arc::clone(&self.suppressed),
        }
    }

    /// Whether notifications are currently being dropped.
    pub fn is_suppressed(&self) -> bool {
        self.suppressed.load(Ordering::Acquire) > 0
    }

    /// Stop the worker. Queued and future commands fail with [`Error::Cancelled`].
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    /// Whether the worker has been asked to stop.
    pub fn is_shut_down(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// Guard that keeps notification processing suppressed while alive.
#[derive(Debug)]
#[must_use = "suppression ends as soon as the guard is dropped"]
pub struct SuppressionGuard {
    suppressed: Arc<AtomicUsize>,
}

impl Drop for SuppressionGuard {
    fn drop(&mut self) {
        if self.suppressed.fetch_sub(1, Ordering::AcqRel) == 1 {
            debug!("Notification processing resumed");
        }
    }
}

struct Worker {
    session: Arc<Session>,
    receiver: mpsc::UnboundedReceiver<PendingOperation>,
    reassembler: Reassembler,
    suppressed: Arc<AtomicUsize>,
    cancel: CancellationToken,
    pacing: Duration,
}

impl Worker {
    async fn run(mut self) {
        debug!("Command worker started");
        let cancel = self.cancel.clone();
        loop {
            let op = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                op = self.receiver.recv() => match op {
                    Some(op) => op,
                    None => break,
                },
            };

            if op.reply.is_closed() {
                debug!(command = %op.command, "Caller went away, skipping command");
                continue;
            }

            if !self.pacing.is_zero() {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        let _ = op.reply.send(Err(Error::Cancelled));
                        break;
                    }
                    _ = sleep(self.pacing) => {}
                }
            }

            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(Error::Cancelled),
                result = self.execute_with_timeout(&op) => result,
            };
            self.reassembler.reset();

            match &result {
                Ok(_) => debug!(
                    command = %op.command,
                    elapsed = ?op.submitted_at.elapsed(),
                    "Command completed"
                ),
                Err(e) => warn!(command = %op.command, error = %e, "Command failed"),
            }
            let _ = op.reply.send(result);
        }

        self.receiver.close();
        while let Ok(op) = self.receiver.try_recv() {
            let _ = op.reply.send(Err(Error::Cancelled));
        }
        debug!("Command worker stopped");
    }

    async fn execute_with_timeout(&mut self, op: &PendingOperation) -> Result<Response> {
        match timeout(op.timeout, self.execute(&op.command, op.kind)).await {
            Ok(result) => result,
            Err(_) => Err(Error::timeout(op.command.name(), op.timeout)),
        }
    }

    async fn execute(&mut self, command: &Command, kind: ResponseKind) -> Result<Response> {
        if !self.session.is_connected() {
            return Err(Error::NotConnected);
        }

        let mut notifications = self.session.subscribe().await?;
        debug!(command = %command, ?kind, "Writing command");
        self.session.send(command).await?;

        let mut stream_open = true;
        loop {
            let deadline = self.reassembler.deadline();
            tokio::select! {
                chunk = notifications.next(), if stream_open => match chunk {
                    Some(chunk) => {
                        if self.suppressed.load(Ordering::Acquire) > 0 {
                            trace!(len = chunk.len(), "Dropping suppressed notification");
                            continue;
                        }
                        if let ChunkOutcome::Complete(text) = self.reassembler.push(&chunk) {
                            return Response::parse(&text, kind);
                        }
                    }
                    None => {
                        // The link went away; the command's own timeout ends the wait.
                        debug!(command = %command, "Notification stream ended");
                        stream_open = false;
                    }
                },
                _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    if let InactivityOutcome::Finalized(text) = self.reassembler.on_inactivity() {
                        return Response::parse(&text, kind);
                    }
                }
                else => std::future::pending::<()>().await,
            }
        }
    }
}
