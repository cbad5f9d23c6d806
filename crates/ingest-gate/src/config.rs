//! File and environment configuration.
//!
//! An [`AgentConfig`] is read from JSON:
//!
//! ```json
//! {
//!     "uri": "127.0.0.1:16301",
//!     "shared_secret_key": { "env": "INGEST_SECRET" },
//!     "memory_quota": "20mb",
//!     "max_receive_message_size": "4mb",
//!     "transport_error_log_level": "warn",
//!     "set_receipt_timestamp": true
//! }
//! ```
//!
//! Only `uri` is required. Two process-wide switches come from the
//! environment and are read once into [`EnvOverrides`].

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use ingest_gate_router::InflightAction;
use ingest_gate_server::{ReuseConfig, ServerConfig, TcpTransportConfig, DEFAULT_MEMORY_QUOTA};
use serde::Deserialize;
use tracing::Level;

use crate::error::ConfigError;

/// Set to any non-empty value to disable session reuse.
pub const ENV_DISABLE_REUSE_SESSIONS: &str = "INGEST_GATE_DISABLE_REUSE_SESSIONS";

/// Set to any non-empty value to take receipt timestamps from message meta.
pub const ENV_PARSE_RECEIPT_TIMESTAMP_FROM_META: &str =
    "INGEST_GATE_PARSE_RECEIPT_TIMESTAMP_FROM_META";

const TCP_SCHEME: &str = "tcp://";

// ─────────────────────────────────────────────────────────────────────────────
// Value types
// ─────────────────────────────────────────────────────────────────────────────

/// A byte count, written as an integer or as a string with a unit suffix
/// (`b`, `kb`, `mb`, `gb`; binary multiples).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(try_from = "RawDataSize")]
pub struct DataSize(pub u64);

impl DataSize {
    pub const fn bytes(self) -> u64 {
        self.0
    }

    /// The size as `usize`, saturating on narrow targets.
    pub fn as_usize(self) -> usize {
        usize::try_from(self.0).unwrap_or(usize::MAX)
    }
}

impl FromStr for DataSize {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.trim().to_ascii_lowercase();
        let split = lower
            .find(|c: char| !c.is_ascii_digit())
            .unwrap_or(lower.len());
        let (digits, unit) = lower.split_at(split);
        let value: u64 = digits
            .parse()
            .map_err(|_| format!("invalid data size [{}]", s))?;
        let multiplier: u64 = match unit.trim() {
            "" | "b" => 1,
            "k" | "kb" => 1 << 10,
            "m" | "mb" => 1 << 20,
            "g" | "gb" => 1 << 30,
            _ => return Err(format!("invalid data size unit in [{}]", s)),
        };
        value
            .checked_mul(multiplier)
            .map(DataSize)
            .ok_or_else(|| format!("data size [{}] overflows", s))
    }
}

impl fmt::Display for DataSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}b", self.0)
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawDataSize {
    Bytes(u64),
    Text(String),
}

impl TryFrom<RawDataSize> for DataSize {
    type Error = String;

    fn try_from(raw: RawDataSize) -> Result<Self, Self::Error> {
        match raw {
            RawDataSize::Bytes(n) => Ok(DataSize(n)),
            RawDataSize::Text(s) => s.parse(),
        }
    }
}

/// Severity for transport error logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    #[default]
    #[serde(alias = "err")]
    Error,
    #[serde(alias = "warning")]
    Warn,
    #[serde(alias = "notice")]
    Info,
    Debug,
    Trace,
}

impl From<LogLevel> for Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Error => Level::ERROR,
            LogLevel::Warn => Level::WARN,
            LogLevel::Info => Level::INFO,
            LogLevel::Debug => Level::DEBUG,
            LogLevel::Trace => Level::TRACE,
        }
    }
}

/// Where the shared secret comes from.
#[derive(Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum SecretSource {
    /// The secret itself.
    Inline(String),
    /// Name of an environment variable holding the secret.
    Env { env: String },
    /// File holding the secret; surrounding whitespace is trimmed.
    File { file: PathBuf },
}

impl SecretSource {
    /// Load the secret.
    pub fn resolve(&self) -> Result<String, ConfigError> {
        self.resolve_with(|name| std::env::var(name).ok())
    }

    /// Load the secret, looking environment variables up with `lookup`.
    pub fn resolve_with<F>(&self, lookup: F) -> Result<String, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let secret_error = |reason: String| ConfigError::Secret {
            what: "shared secret key",
            reason,
        };
        match self {
            SecretSource::Inline(value) => Ok(value.clone()),
            SecretSource::Env { env } => lookup(env)
                .ok_or_else(|| secret_error(format!("environment variable [{}] is not set", env))),
            SecretSource::File { file } => fs::read_to_string(file)
                .map(|s| s.trim().to_string())
                .map_err(|err| secret_error(format!("[{}]: {}", file.display(), err))),
        }
    }
}

impl fmt::Debug for SecretSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SecretSource::Inline(_) => f.write_str("Inline(..)"),
            SecretSource::Env { env } => f.debug_struct("Env").field("env", env).finish(),
            SecretSource::File { file } => f.debug_struct("File").field("file", file).finish(),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Agent config
// ─────────────────────────────────────────────────────────────────────────────

fn default_memory_quota() -> DataSize {
    DataSize(DEFAULT_MEMORY_QUOTA as u64)
}

fn default_true() -> bool {
    true
}

/// Gateway configuration as written in a config file.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AgentConfig {
    /// Listen address, `host:port` or `tcp://host:port`.
    pub uri: String,

    #[serde(default)]
    pub shared_secret_key: Option<SecretSource>,

    /// Transport memory quota.
    #[serde(default = "default_memory_quota")]
    pub memory_quota: DataSize,

    #[serde(default)]
    pub max_receive_message_size: Option<DataSize>,

    #[serde(default)]
    pub transport_error_log_level: LogLevel,

    #[serde(default = "default_true", alias = "_set_receipt_timestamp")]
    pub set_receipt_timestamp: bool,

    /// Downstream inflight limit action; only `drop` is supported.
    #[serde(default)]
    pub inflight_action: Option<String>,

    /// Seconds `stop` waits for sessions to wind down.
    #[serde(default)]
    pub shutdown_grace_secs: Option<u64>,
}

impl AgentConfig {
    /// Config listening on `uri` with everything else defaulted.
    pub fn new(uri: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            shared_secret_key: None,
            memory_quota: default_memory_quota(),
            max_receive_message_size: None,
            transport_error_log_level: LogLevel::default(),
            set_receipt_timestamp: true,
            inflight_action: None,
            shutdown_grace_secs: None,
        }
    }

    /// Parse and validate a JSON config.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: AgentConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse, and validate a JSON config file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let json = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&json)
    }

    /// Check constraints serde cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.listen_addr()?;
        if let Some(action) = &self.inflight_action {
            let action: InflightAction = action.parse().map_err(ConfigError::Invalid)?;
            if action != InflightAction::Drop {
                return Err(ConfigError::Invalid(format!(
                    "inflight action [{}] is not supported, use [drop]",
                    action
                )));
            }
        }
        if let Some(max) = self.max_receive_message_size {
            if max.bytes() == 0 || max.bytes() > u32::MAX as u64 {
                return Err(ConfigError::Invalid(format!(
                    "max_receive_message_size [{}] out of range",
                    max
                )));
            }
        }
        Ok(())
    }

    /// Socket address to bind, with any `tcp://` prefix removed.
    pub fn listen_addr(&self) -> Result<&str, ConfigError> {
        let uri = self.uri.trim();
        if uri.is_empty() {
            return Err(ConfigError::Invalid("uri must not be empty".into()));
        }
        if let Some(addr) = uri.strip_prefix(TCP_SCHEME) {
            return Ok(addr);
        }
        if uri.contains("://") {
            return Err(ConfigError::Invalid(format!(
                "unsupported uri scheme in [{}]",
                uri
            )));
        }
        Ok(uri)
    }

    /// Resolve the shared secret, if configured.
    pub fn resolve_secret(&self) -> Result<Option<String>, ConfigError> {
        self.shared_secret_key
            .as_ref()
            .map(SecretSource::resolve)
            .transpose()
    }

    /// Runtime server settings.
    pub fn server_config(&self, secret: Option<String>, env: &EnvOverrides) -> ServerConfig {
        let defaults = ServerConfig::default();
        ServerConfig {
            shared_secret_key: secret.filter(|s| !s.is_empty()),
            max_receive_message_size: self
                .max_receive_message_size
                .map(DataSize::as_usize)
                .unwrap_or(defaults.max_receive_message_size),
            transport_error_log_level: self.transport_error_log_level.into(),
            set_receipt_timestamp: self.set_receipt_timestamp,
            parse_receipt_timestamp_from_meta: env.parse_receipt_timestamp_from_meta,
            reuse: ReuseConfig {
                enabled: !env.disable_reuse_sessions,
                ..ReuseConfig::default()
            },
            shutdown_grace: self
                .shutdown_grace_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.shutdown_grace),
        }
    }

    /// TCP transport settings.
    pub fn transport_config(&self) -> TcpTransportConfig {
        let defaults = TcpTransportConfig::default();
        TcpTransportConfig {
            max_receive_message_size: self
                .max_receive_message_size
                .map(DataSize::as_usize)
                .unwrap_or(defaults.max_receive_message_size),
            memory_quota: self.memory_quota.as_usize(),
        }
    }
}

/// Switches read from the environment at startup.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EnvOverrides {
    pub disable_reuse_sessions: bool,
    pub parse_receipt_timestamp_from_meta: bool,
}

impl EnvOverrides {
    /// Read the process environment.
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Read through `lookup`; a variable counts as set when non-empty.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let set = |name: &str| lookup(name).is_some_and(|v| !v.is_empty());
        Self {
            disable_reuse_sessions: set(ENV_DISABLE_REUSE_SESSIONS),
            parse_receipt_timestamp_from_meta: set(ENV_PARSE_RECEIPT_TIMESTAMP_FROM_META),
        }
    }
}
