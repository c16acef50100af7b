//! Error types for vaultlink-core.
//!
//! This module defines all error types that can occur when talking to the
//! vault over Bluetooth Low Energy.
//!
//! # Error Recovery
//!
//! Every command error rejects only the future of the command that caused
//! it. The queue always advances to the next command, so none of these
//! errors leave the link in a corrupted state.
//!
//! | Error Type | Raised when | Recovery |
//! |------------|-------------|----------|
//! | [`Error::NotConnected`] | A command runs with no live session | Wait for the link to reconnect |
//! | [`Error::Timeout`] | No complete response before the command deadline | Resubmit if the command is idempotent |
//! | [`Error::MalformedResponse`] | A structured response is not valid JSON | Do not retry; the raw text is preserved |
//! | [`Error::WriteFailed`] | The radio rejected a write or notify registration | Retry once, then reconnect |
//! | [`Error::AuthenticationFailed`] | The handshake was rejected or no secret is stored | Fix the stored secret |
//! | [`Error::ConnectionFailed`] | The platform connect call failed | Handled by the reconnect timer |
//!
//! `ConnectionFailed` and disconnects never reach command callers: the
//! lifecycle state machine resets its state and schedules a reconnect.

use std::time::Duration;

use thiserror::Error;

/// Errors that can occur when communicating with the vault.
///
/// This enum is marked `#[non_exhaustive]` to allow adding new error variants
/// in future versions without breaking downstream code.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Bluetooth Low Energy error.
    #[error("Bluetooth error: {0}")]
    Bluetooth(#[from] btleplug::Error),

    /// Device not found during scan or connection.
    #[error("Device not found: {0}")]
    DeviceNotFound(DeviceNotFoundReason),

    /// Command issued while no transport session is connected.
    #[error("Not connected to device")]
    NotConnected,

    /// No completed response arrived within the command deadline.
    #[error("Operation '{operation}' timed out after {duration:?}")]
    Timeout {
        /// The operation that timed out.
        operation: String,
        /// The timeout duration.
        duration: Duration,
    },

    /// A response expected to be structured failed to parse.
    #[error("Malformed response: {source} (raw: {raw:?})")]
    MalformedResponse {
        /// The trimmed response text as received.
        raw: String,
        /// The underlying JSON error.
        #[source]
        source: serde_json::Error,
    },

    /// The transport rejected a write or notification registration.
    #[error("Write failed: {reason}")]
    WriteFailed {
        /// The reason for the failure.
        reason: String,
    },

    /// Post-connect authentication was rejected, or no secret is configured.
    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    /// Connection failed with specific reason.
    #[error("Connection failed: {reason}")]
    ConnectionFailed {
        /// The device identifier that failed to connect.
        device_id: Option<String>,
        /// The structured reason for the failure.
        reason: ConnectionFailureReason,
    },

    /// Operation was cancelled because the queue or manager shut down.
    #[error("Operation cancelled")]
    Cancelled,

    /// I/O error.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// Persisted settings could not be read or written.
    #[error("Settings store error: {0}")]
    Store(String),

    /// A value could not be serialized.
    #[error("Serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    /// Invalid configuration provided.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Structured reasons for connection failures.
///
/// This enum is marked `#[non_exhaustive]` to allow adding new reasons
/// in future versions without breaking downstream code.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ConnectionFailureReason {
    /// Bluetooth adapter not available or powered off.
    AdapterUnavailable,
    /// Device is out of range.
    OutOfRange,
    /// Connection attempt timed out.
    Timeout,
    /// The device does not expose the vault service.
    MissingService,
    /// Generic BLE error.
    BleError(String),
}

impl std::fmt::Display for ConnectionFailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::AdapterUnavailable => write!(f, "Bluetooth adapter unavailable"),
            Self::OutOfRange => write!(f, "device out of range"),
            Self::Timeout => write!(f, "connection timed out"),
            Self::MissingService => write!(f, "vault service not found on device"),
            Self::BleError(msg) => write!(f, "BLE error: {}", msg),
        }
    }
}

/// Reason why a device was not found.
///
/// This enum is marked `#[non_exhaustive]` to allow adding new reasons
/// in future versions without breaking downstream code.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub enum DeviceNotFoundReason {
    /// Device with specified address not found.
    NotFound { identifier: String },
    /// No Bluetooth adapter available.
    NoAdapter,
}

impl std::fmt::Display for DeviceNotFoundReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotFound { identifier } => write!(f, "device '{}' not found", identifier),
            Self::NoAdapter => write!(f, "no Bluetooth adapter available"),
        }
    }
}

impl Error {
    /// Create a device not found error for a specific identifier.
    pub fn device_not_found(identifier: impl Into<String>) -> Self {
        Self::DeviceNotFound(DeviceNotFoundReason::NotFound {
            identifier: identifier.into(),
        })
    }

    /// Create a timeout error with operation context.
    pub fn timeout(operation: impl Into<String>, duration: Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            duration,
        }
    }

    /// Create a write failure.
    pub fn write_failed(reason: impl std::fmt::Display) -> Self {
        Self::WriteFailed {
            reason: reason.to_string(),
        }
    }

    /// Create an authentication failure.
    pub fn authentication_failed(reason: impl Into<String>) -> Self {
        Self::AuthenticationFailed(reason.into())
    }

    /// Create a configuration error.
    pub fn invalid_config(message: impl Into<String>) -> Self {
        Self::InvalidConfig(message.into())
    }

    /// Create a connection failure with structured reason.
    pub fn connection_failed(device_id: Option<String>, reason: ConnectionFailureReason) -> Self {
        Self::ConnectionFailed { device_id, reason }
    }

    /// Whether resubmitting the same command could succeed.
    ///
    /// Timeouts, lost links and rejected writes are transient. Parse and
    /// authentication failures are not.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Timeout { .. }
                | Error::NotConnected
                | Error::WriteFailed { .. }
                | Error::Bluetooth(_)
                | Error::Io(_)
        ) || matches!(
            self,
            Error::ConnectionFailed {
                reason: ConnectionFailureReason::OutOfRange
                    | ConnectionFailureReason::Timeout
                    | ConnectionFailureReason::BleError(_),
                ..
            }
        )
    }
}

/// Result type alias using vaultlink-core's Error type.
pub type Result<T> = std::result::Result<T, Error>;
