//! Error types for data parsing in vaultlink-types.

use thiserror::Error;

/// Errors that can occur when parsing protocol values.
///
/// This error type is platform-agnostic and does not include
/// BLE-specific errors (those belong in vaultlink-core).
///
/// This enum is marked `#[non_exhaustive]` to allow adding new error variants
/// in future versions without breaking downstream code.
#[derive(Debug, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum ParseError {
    /// A chunk header line did not have the `<total>,<count>,<size>` shape.
    #[error("Invalid chunk header: {0}")]
    InvalidHeader(String),

    /// A value was out of its accepted range.
    #[error("Invalid value: {0}")]
    InvalidValue(String),
}

/// Result type alias using vaultlink-types' ParseError type.
pub type ParseResult<T> = std::result::Result<T, ParseError>;
