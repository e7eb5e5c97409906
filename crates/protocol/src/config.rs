//! Protocol configuration.
//!
//! Settings are read from TOML. Every section and field is optional and
//! falls back to its default:
//!
//! ```toml
//! [protocol]
//! version = "3.3"
//! device_type = "default"
//! retcode = "detect"
//!
//! [session]
//! idle_timeout_secs = 60
//! max_payload_len = 1000
//! ```

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::cipher::LocalKey;
use crate::framing::{FrameCodec, RetcodeMode, MAX_PAYLOAD_LEN};
use crate::payload::DeviceType;
use crate::session::{DeviceIdentity, DeviceSession, IdlePolicy, DEFAULT_IDLE_TIMEOUT};
use crate::version::Version;

/// Environment variable overriding `protocol.version`.
pub const ENV_PROTOCOL_VERSION: &str = "TUYAWIRE_PROTOCOL_VERSION";

/// Environment variable overriding `session.idle_timeout_secs`.
pub const ENV_IDLE_TIMEOUT: &str = "TUYAWIRE_IDLE_TIMEOUT";

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("idle_timeout_secs must be between 1 and 3600, got {0}")]
    InvalidIdleTimeout(u64),

    #[error("max_payload_len must be between 16 and 65535, got {0}")]
    InvalidMaxPayloadLen(usize),

    #[error("invalid TOML configuration: {0}")]
    Parse(String),

    #[error("failed to serialize configuration: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("failed to access config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Top level configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct ProtocolConfig {
    pub protocol: ProtocolSection,
    pub session: SessionSection,
}

/// Wire level settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ProtocolSection {
    /// Protocol version for new device identities.
    pub version: Version,

    pub device_type: DeviceType,

    /// How return codes in received packets are recognized.
    pub retcode: RetcodeMode,
}

/// Session settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SessionSection {
    /// Seconds without traffic before the transport should reconnect.
    pub idle_timeout_secs: u64,

    /// Largest payload length accepted in a packet header.
    pub max_payload_len: usize,
}

impl Default for ProtocolSection {
    fn default() -> Self {
        Self {
            version: Version::V33,
            device_type: DeviceType::Default,
            retcode: RetcodeMode::Detect,
        }
    }
}

impl Default for SessionSection {
    fn default() -> Self {
        Self {
            idle_timeout_secs: DEFAULT_IDLE_TIMEOUT.as_secs(),
            max_payload_len: MAX_PAYLOAD_LEN,
        }
    }
}

impl ProtocolConfig {
    /// Parses configuration from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self, ConfigError> {
        toml::from_str(toml_str).map_err(|e| ConfigError::Parse(format_toml_error(&e)))
    }

    /// Serializes configuration to a TOML string.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Loads configuration from a file. A missing file yields the defaults.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if !path.exists() {
            tracing::debug!("Config file not found at {:?}, using defaults", path);
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&contents)
    }

    /// Writes configuration to a file, creating parent directories.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let io_error = |source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        };

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(io_error)?;
        }
        fs::write(path, self.to_toml()?).map_err(io_error)?;

        tracing::debug!("Configuration saved to {:?}", path);
        Ok(())
    }

    /// Applies environment variable overrides.
    ///
    /// Supported variables:
    /// - `TUYAWIRE_PROTOCOL_VERSION`: protocol version, e.g. `3.4`
    /// - `TUYAWIRE_IDLE_TIMEOUT`: idle timeout in seconds
    ///
    /// Empty or unparsable values are ignored.
    pub fn apply_env_overrides(&mut self) {
        if let Some(value) = env_value(ENV_PROTOCOL_VERSION) {
            match value.parse::<Version>() {
                Ok(version) => {
                    tracing::info!("Overriding protocol version from environment: {}", version);
                    self.protocol.version = version;
                }
                Err(e) => tracing::warn!("Ignoring {}: {}", ENV_PROTOCOL_VERSION, e),
            }
        }

        if let Some(value) = env_value(ENV_IDLE_TIMEOUT) {
            match value.parse::<u64>() {
                Ok(secs) => {
                    tracing::info!("Overriding idle timeout from environment: {}s", secs);
                    self.session.idle_timeout_secs = secs;
                }
                Err(e) => tracing::warn!("Ignoring {}: {}", ENV_IDLE_TIMEOUT, e),
            }
        }
    }

    /// Checks that every value is within its accepted range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(1..=3600).contains(&self.session.idle_timeout_secs) {
            return Err(ConfigError::InvalidIdleTimeout(self.session.idle_timeout_secs));
        }
        if !(16..=65535).contains(&self.session.max_payload_len) {
            return Err(ConfigError::InvalidMaxPayloadLen(self.session.max_payload_len));
        }
        Ok(())
    }

    /// Identity for a device speaking the configured version.
    pub fn identity(&self, device_id: impl Into<String>, local_key: LocalKey) -> DeviceIdentity {
        DeviceIdentity::new(device_id, local_key, self.protocol.version)
    }

    /// A session for `identity` using these settings.
    pub fn session_for(&self, identity: DeviceIdentity) -> DeviceSession {
        let frames = FrameCodec::new()
            .with_retcode(self.protocol.retcode)
            .with_max_payload_len(self.session.max_payload_len);
        let idle = IdlePolicy::new(Duration::from_secs(self.session.idle_timeout_secs));

        DeviceSession::new(identity)
            .with_device_type(self.protocol.device_type)
            .with_frame_codec(frames)
            .with_idle_policy(idle)
    }
}

fn env_value(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|value| !value.is_empty())
}

fn format_toml_error(error: &toml::de::Error) -> String {
    let mut msg = error.message().to_string();
    if let Some(span) = error.span() {
        msg.push_str(&format!(" (at position {}..{})", span.start, span.end));
    }
    msg
}
