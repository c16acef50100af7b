//! Link configuration.
//!
//! Timeouts, pacing delays and reconnect cadence for the device link. All
//! durations are stored in the file as integer milliseconds (or seconds for
//! scan duration) and exposed as [`Duration`] through accessor methods.
//!
//! ```toml
//! [commands]
//! default_timeout_ms = 10000
//! pacing_ms = 50
//!
//! [reassembly]
//! inactivity_ms = 200
//!
//! [reconnect]
//! enabled = true
//! interval_ms = 2000
//! scan_duration_secs = 4
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Complete link configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    /// Command queue settings.
    pub commands: CommandConfig,
    /// Response reassembly settings.
    pub reassembly: ReassemblyConfig,
    /// Automatic reconnect settings.
    pub reconnect: ReconnectConfig,
    /// Transport settings.
    pub transport: TransportConfig,
}

impl LinkConfig {
    /// Load configuration from the default path, or defaults if absent.
    pub fn load_default() -> Result<Self, ConfigError> {
        Self::load_or_default(default_config_path())
    }

    /// Load configuration from a file, or defaults if the file does not exist.
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        if path.as_ref().exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load configuration from a file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| ConfigError::Read {
            path: path.as_ref().to_path_buf(),
            source: e,
        })?;
        toml::from_str(&content).map_err(|e| ConfigError::Parse {
            path: path.as_ref().to_path_buf(),
            source: e,
        })
    }

    /// Save configuration to a file.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self).map_err(ConfigError::Serialize)?;

        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent).map_err(|e| ConfigError::Write {
                path: parent.to_path_buf(),
                source: e,
            })?;
        }

        std::fs::write(path.as_ref(), content).map_err(|e| ConfigError::Write {
            path: path.as_ref().to_path_buf(),
            source: e,
        })
    }

    /// Validate the configuration and return all problems found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut errors = Vec::new();
        errors.extend(self.commands.validate());
        errors.extend(self.reassembly.validate());
        errors.extend(self.reconnect.validate());
        errors.extend(self.transport.validate());

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Validation(errors))
        }
    }

    /// Load and validate configuration from a file.
    pub fn load_validated<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let config = Self::load(path)?;
        config.validate()?;
        Ok(config)
    }

    /// Replace the command settings.
    #[must_use]
    pub fn with_commands(mut self, commands: CommandConfig) -> Self {
        self.commands = commands;
        self
    }

    /// Replace the reassembly settings.
    #[must_use]
    pub fn with_reassembly(mut self, reassembly: ReassemblyConfig) -> Self {
        self.reassembly = reassembly;
        self
    }

    /// Replace the reconnect settings.
    #[must_use]
    pub fn with_reconnect(mut self, reconnect: ReconnectConfig) -> Self {
        self.reconnect = reconnect;
        self
    }

    /// Replace the transport settings.
    #[must_use]
    pub fn with_transport(mut self, transport: TransportConfig) -> Self {
        self.transport = transport;
        self
    }
}

/// Command queue settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CommandConfig {
    /// Timeout for commands that do not specify one.
    pub default_timeout_ms: u64,
    /// Delay before each queued command is transmitted.
    pub pacing_ms: u64,
    /// Timeout for the post-connect authentication command.
    pub auth_timeout_ms: u64,
    /// Timeout for raw-text dump commands.
    pub dump_timeout_ms: u64,
}

impl Default for CommandConfig {
    fn default() -> Self {
        Self {
            default_timeout_ms: 10_000,
            pacing_ms: 50,
            auth_timeout_ms: 10_000,
            dump_timeout_ms: 10_000,
        }
    }
}

impl CommandConfig {
    /// Default command timeout.
    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }

    /// Inter-command pacing delay.
    pub fn pacing(&self) -> Duration {
        Duration::from_millis(self.pacing_ms)
    }

    /// Authentication timeout.
    pub fn auth_timeout(&self) -> Duration {
        Duration::from_millis(self.auth_timeout_ms)
    }

    /// Dump timeout.
    pub fn dump_timeout(&self) -> Duration {
        Duration::from_millis(self.dump_timeout_ms)
    }

    /// Validate command settings.
    pub fn validate(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();
        for (field, value) in [
            ("commands.default_timeout_ms", self.default_timeout_ms),
            ("commands.auth_timeout_ms", self.auth_timeout_ms),
            ("commands.dump_timeout_ms", self.dump_timeout_ms),
        ] {
            if value == 0 {
                errors.push(ValidationError::new(field, "timeout must be > 0"));
            }
        }
        errors
    }
}

/// Response reassembly settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReassemblyConfig {
    /// Quiet period after the last chunk before an open-ended response is finalized.
    pub inactivity_ms: u64,
}

impl Default for ReassemblyConfig {
    fn default() -> Self {
        Self { inactivity_ms: 200 }
    }
}

impl ReassemblyConfig {
    /// Inactivity delay.
    pub fn inactivity(&self) -> Duration {
        Duration::from_millis(self.inactivity_ms)
    }

    /// Validate reassembly settings.
    pub fn validate(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();
        if self.inactivity_ms == 0 {
            errors.push(ValidationError::new(
                "reassembly.inactivity_ms",
                "inactivity delay must be > 0",
            ));
        }
        errors
    }
}

/// Automatic reconnect settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    /// Whether the reconnect timer runs at all.
    pub enabled: bool,
    /// Period of the reconnect tick.
    pub interval_ms: u64,
    /// Duration of each scan, manual or automatic.
    pub scan_duration_secs: u64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_ms: 2_000,
            scan_duration_secs: 4,
        }
    }
}

/// A scan may last at most this many reconnect intervals.
pub const MAX_SCAN_INTERVALS: u64 = 10;

impl ReconnectConfig {
    /// Reconnect tick period.
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    /// Scan duration.
    pub fn scan_duration(&self) -> Duration {
        Duration::from_secs(self.scan_duration_secs)
    }

    /// Validate reconnect settings.
    pub fn validate(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();
        if self.interval_ms == 0 {
            errors.push(ValidationError::new(
                "reconnect.interval_ms",
                "reconnect interval must be > 0",
            ));
        }
        if self.scan_duration_secs == 0 {
            errors.push(ValidationError::new(
                "reconnect.scan_duration_secs",
                "scan duration must be > 0",
            ));
        } else if self.scan_duration() > self.interval().saturating_mul(MAX_SCAN_INTERVALS as u32) {
            errors.push(ValidationError::new(
                "reconnect.scan_duration_secs",
                format!(
                    "scan duration {}s is too long (maximum {} reconnect intervals of {}ms)",
                    self.scan_duration_secs, MAX_SCAN_INTERVALS, self.interval_ms
                ),
            ));
        }
        errors
    }
}

/// Transport settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Timeout for establishing a BLE connection.
    pub connect_timeout_ms: u64,
    /// Split outbound payloads larger than one transfer unit.
    pub chunk_writes: bool,
    /// ATT MTU assumed when the platform did not report one.
    pub fallback_mtu: usize,
    /// Delay between successive outbound writes of one payload.
    pub write_pacing_ms: u64,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 15_000,
            chunk_writes: true,
            fallback_mtu: vaultlink_types::uuid::DEFAULT_ATT_MTU,
            write_pacing_ms: 20,
        }
    }
}

impl TransportConfig {
    /// Connect timeout.
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Inter-write pacing delay.
    pub fn write_pacing(&self) -> Duration {
        Duration::from_millis(self.write_pacing_ms)
    }

    /// Validate transport settings.
    pub fn validate(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();
        if self.connect_timeout_ms == 0 {
            errors.push(ValidationError::new(
                "transport.connect_timeout_ms",
                "connect timeout must be > 0",
            ));
        }
        if self.fallback_mtu <= vaultlink_types::uuid::ATT_OVERHEAD {
            errors.push(ValidationError::new(
                "transport.fallback_mtu",
                format!(
                    "fallback MTU {} leaves no room for payload",
                    self.fallback_mtu
                ),
            ));
        }
        errors
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("Failed to serialize config: {0}")]
    Serialize(toml::ser::Error),
    #[error("Failed to write config file {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Configuration validation failed:\n{}", format_validation_errors(.0))]
    Validation(Vec<ValidationError>),
}

/// A single validation error with context.
#[derive(Debug, Clone)]
pub struct ValidationError {
    /// The field path (e.g., `commands.pacing_ms`).
    pub field: String,
    /// Description of the validation failure.
    pub message: String,
}

impl ValidationError {
    fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

fn format_validation_errors(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(|e| format!("  - {}", e))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Default configuration directory.
pub fn default_config_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("vaultlink")
}

/// Default configuration file path.
pub fn default_config_path() -> PathBuf {
    default_config_dir().join("link.toml")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_default() {
        let config = LinkConfig::default();
        assert_eq!(config.commands.default_timeout(), Duration::from_secs(10));
        assert_eq!(config.commands.pacing(), Duration::from_millis(50));
        assert_eq!(config.reassembly.inactivity(), Duration::from_millis(200));
        assert_eq!(config.reconnect.interval(), Duration::from_secs(2));
        assert_eq!(config.reconnect.scan_duration(), Duration::from_secs(4));
        assert!(config.reconnect.enabled);
        assert_eq!(config.transport.fallback_mtu, 23);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_partial_toml_uses_defaults() {
        let config: LinkConfig = toml::from_str(
            r#"
            [commands]
            pacing_ms = 100

            [reconnect]
            enabled = false
            "#,
        )
        .unwrap();

        assert_eq!(config.commands.pacing_ms, 100);
        assert_eq!(config.commands.default_timeout_ms, 10_000);
        assert!(!config.reconnect.enabled);
        assert_eq!(config.reconnect.interval_ms, 2_000);
        assert_eq!(config.reassembly, ReassemblyConfig::default());
    }

    #[test]
    fn test_config_validation_collects_all_errors() {
        let config = LinkConfig {
            commands: CommandConfig {
                default_timeout_ms: 0,
                ..Default::default()
            },
            reassembly: ReassemblyConfig { inactivity_ms: 0 },
            reconnect: ReconnectConfig {
                scan_duration_secs: 600,
                ..Default::default()
            },
            transport: TransportConfig {
                fallback_mtu: 3,
                ..Default::default()
            },
        };

        let err = config.validate().unwrap_err();
        match &err {
            ConfigError::Validation(errors) => {
                let fields: Vec<_> = errors.iter().map(|e| e.field.as_str()).collect();
                assert_eq!(
                    fields,
                    vec![
                        "commands.default_timeout_ms",
                        "reassembly.inactivity_ms",
                        "reconnect.scan_duration_secs",
                        "transport.fallback_mtu",
                    ]
                );
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(err.to_string().contains("too long"));
    }

    #[test]
    fn test_scan_duration_bound_follows_interval() {
        let mut reconnect = ReconnectConfig {
            interval_ms: 2_000,
            scan_duration_secs: 20,
            ..Default::default()
        };
        assert!(reconnect.validate().is_empty());

        reconnect.scan_duration_secs = 21;
        let errors = reconnect.validate();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].field, "reconnect.scan_duration_secs");

        reconnect.interval_ms = 10_000;
        reconnect.scan_duration_secs = 90;
        assert!(reconnect.validate().is_empty());
    }

    #[test]
    fn test_config_save_and_load() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("nested").join("link.toml");

        let config = LinkConfig::default().with_reassembly(ReassemblyConfig { inactivity_ms: 350 });
        config.save(&path).unwrap();

        let loaded = LinkConfig::load_validated(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_config_load_missing_file() {
        let result = LinkConfig::load("/nonexistent/vaultlink/link.toml");
        assert!(matches!(result, Err(ConfigError::Read { .. })));

        let config = LinkConfig::load_or_default("/nonexistent/vaultlink/link.toml").unwrap();
        assert_eq!(config, LinkConfig::default());
    }

    #[test]
    fn test_config_load_invalid_toml() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("invalid.toml");
        std::fs::write(&path, "this is not valid { toml").unwrap();

        let result = LinkConfig::load(&path);
        assert!(matches!(result, Err(ConfigError::Parse { .. })));
    }

    #[test]
    fn test_default_config_path() {
        let path = default_config_path();
        assert!(path.ends_with("vaultlink/link.toml"));
    }
}
