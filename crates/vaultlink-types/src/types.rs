//! Core types for the vault device protocol.

use core::fmt;
use core::str::FromStr;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::ParseError;
use crate::uuid::{ATT_OVERHEAD, DEFAULT_ATT_MTU};

/// Key under which the command name travels in the request envelope.
pub const COMMAND_KEY: &str = "cmd";

/// A request for the device: a command name plus arbitrary scalar parameters.
///
/// On the wire a command is a single JSON object `{"cmd": "<name>", ...params}`.
///
/// # Examples
///
/// ```
/// use vaultlink_types::Command;
///
/// let cmd = Command::new("fetchPass").with_param("id", 3);
/// assert_eq!(cmd.name(), "fetchPass");
/// assert_eq!(cmd.to_json(), r#"{"cmd":"fetchPass","id":3}"#);
/// ```
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Command {
    name: String,
    params: Map<String, Value>,
}

impl Command {
    /// Create a command with no parameters.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            params: Map::new(),
        }
    }

    /// Add a parameter.
    ///
    /// A parameter named `cmd` would shadow the command name and is ignored.
    #[must_use]
    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        let key = key.into();
        if key != COMMAND_KEY {
            self.params.insert(key, value.into());
        }
        self
    }

    /// Add a parameter only when a value is present.
    #[must_use]
    pub fn with_optional<V: Into<Value>>(self, key: impl Into<String>, value: Option<V>) -> Self {
        match value {
            Some(value) => self.with_param(key, value),
            None => self,
        }
    }

    /// The command name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The command parameters.
    pub fn params(&self) -> &Map<String, Value> {
        &self.params
    }

    /// Look up a single parameter.
    pub fn param(&self, key: &str) -> Option<&Value> {
        self.params.get(key)
    }

    /// Build the request envelope `{"cmd": name, ...params}`.
    pub fn to_envelope(&self) -> Value {
        let mut envelope = Map::with_capacity(self.params.len() + 1);
        envelope.insert(COMMAND_KEY.to_string(), Value::String(self.name.clone()));
        for (key, value) in &self.params {
            envelope.insert(key.clone(), value.clone());
        }
        Value::Object(envelope)
    }

    /// Serialize the envelope to a JSON string.
    pub fn to_json(&self) -> String {
        self.to_envelope().to_string()
    }

    /// Serialize the envelope to UTF-8 bytes, ready for transmission.
    pub fn to_bytes(&self) -> Vec<u8> {
        self.to_json().into_bytes()
    }

    /// Rebuild a command from a request envelope.
    ///
    /// Returns `None` if the value is not an object with a string `cmd` field.
    pub fn from_envelope(value: &Value) -> Option<Self> {
        let object = value.as_object()?;
        let name = object.get(COMMAND_KEY)?.as_str()?;
        let params = object
            .iter()
            .filter(|(key, _)| key.as_str() != COMMAND_KEY)
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();
        Some(Self {
            name: name.to_string(),
            params,
        })
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)
    }
}

/// How the final response payload for a command is interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum ResponseKind {
    /// The payload must parse as a JSON document.
    #[default]
    Structured,
    /// The trimmed payload is returned verbatim.
    RawText,
}

impl fmt::Display for ResponseKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResponseKind::Structured => write!(f, "structured"),
            ResponseKind::RawText => write!(f, "raw-text"),
        }
    }
}

/// Connection state of the link to the vault.
///
/// This enum is marked `#[non_exhaustive]` to allow adding new states
/// in future versions without breaking downstream code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
#[non_exhaustive]
pub enum ConnectionState {
    /// No link and no connection attempt in progress.
    #[default]
    Disconnected,
    /// A connection attempt is in progress.
    Connecting,
    /// A live transport session exists.
    Connected,
}

impl ConnectionState {
    /// Whether the state is [`ConnectionState::Connected`].
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Connected => write!(f, "connected"),
        }
    }
}

/// Identity of a peripheral as seen by the platform radio.
///
/// `id` is the platform identifier (MAC address on Linux/Windows/Android, a
/// CoreBluetooth UUID on Apple platforms). Two identities refer to the same
/// device when their ids match, regardless of name or MTU.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct PeripheralIdentity {
    /// Platform device address or UUID.
    pub id: String,
    /// Advertised display name, if known.
    pub name: Option<String>,
    /// Negotiated ATT MTU, if known.
    pub mtu: Option<u16>,
}

impl PeripheralIdentity {
    /// Create an identity with only an id.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: None,
            mtu: None,
        }
    }

    /// Create an identity with a display name.
    pub fn with_name(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: Some(name.into()),
            mtu: None,
        }
    }

    /// Set the negotiated MTU.
    #[must_use]
    pub fn mtu(mut self, mtu: u16) -> Self {
        self.mtu = Some(mtu);
        self
    }

    /// Whether `other` refers to the same physical device.
    pub fn same_device(&self, other: &PeripheralIdentity) -> bool {
        self.id.eq_ignore_ascii_case(&other.id)
    }

    /// Whether this identity matches a persisted device id.
    pub fn matches_id(&self, id: &str) -> bool {
        self.id.eq_ignore_ascii_case(id)
    }

    /// Maximum payload bytes per outbound write.
    ///
    /// Uses the negotiated MTU when known, otherwise `fallback_mtu`.
    pub fn max_write_len(&self, fallback_mtu: usize) -> usize {
        let mtu = self.mtu.map(usize::from).unwrap_or(fallback_mtu);
        mtu.max(DEFAULT_ATT_MTU).saturating_sub(ATT_OVERHEAD)
    }

    /// Name for display, falling back to the id.
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }
}

impl fmt::Display for PeripheralIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.name {
            Some(name) => write!(f, "{} ({})", name, self.id),
            None => write!(f, "{}", self.id),
        }
    }
}

/// Leading metadata line of a multi-chunk response: `<total>,<count>,<size>\n`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ChunkHeader {
    /// Total payload size in bytes as declared by the device.
    pub total_bytes: usize,
    /// Number of notifications the payload spans. Zero means unknown.
    pub chunk_count: u32,
    /// Per-chunk payload size as declared by the device.
    pub chunk_size: usize,
}

impl ChunkHeader {
    /// Create a header.
    pub fn new(total_bytes: usize, chunk_count: u32, chunk_size: usize) -> Self {
        Self {
            total_bytes,
            chunk_count,
            chunk_size,
        }
    }

    /// Match a header at the very start of `data`.
    ///
    /// On success returns the header and the number of bytes it occupies,
    /// including the terminating newline. Anything that is not exactly three
    /// comma-separated decimal numbers followed by `\n` yields `None`.
    ///
    /// # Examples
    ///
    /// ```
    /// use vaultlink_types::ChunkHeader;
    ///
    /// let (header, len) = ChunkHeader::parse_prefix(b"28,3,10\n{\"a\"").unwrap();
    /// assert_eq!(header.chunk_count, 3);
    /// assert_eq!(len, 8);
    /// assert!(ChunkHeader::parse_prefix(b"this is not a header").is_none());
    /// ```
    pub fn parse_prefix(data: &[u8]) -> Option<(Self, usize)> {
        let newline = data.iter().position(|&b| b == b'\n')?;
        let line = core::str::from_utf8(&data[..newline]).ok()?;
        let header = line.parse().ok()?;
        Some((header, newline + 1))
    }

    /// Render the header line, including the trailing newline.
    pub fn encode(&self) -> String {
        format!("{}\n", self)
    }
}

impl fmt::Display for ChunkHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{},{},{}",
            self.total_bytes, self.chunk_count, self.chunk_size
        )
    }
}

impl FromStr for ChunkHeader {
    type Err = ParseError;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        fn field<T: FromStr>(part: Option<&str>, line: &str) -> Result<T, ParseError> {
            let part = part.ok_or_else(|| ParseError::InvalidHeader(line.to_string()))?;
            if part.is_empty() || !part.bytes().all(|b| b.is_ascii_digit()) {
                return Err(ParseError::InvalidHeader(line.to_string()));
            }
            part.parse()
                .map_err(|_| ParseError::InvalidValue(format!("'{}' out of range", part)))
        }

        let mut parts = line.split(',');
        let total_bytes = field(parts.next(), line)?;
        let chunk_count = field(parts.next(), line)?;
        let chunk_size = field(parts.next(), line)?;
        if parts.next().is_some() {
            return Err(ParseError::InvalidHeader(line.to_string()));
        }
        Ok(Self::new(total_bytes, chunk_count, chunk_size))
    }
}
