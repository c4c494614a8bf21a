//! Configuration for driftbd.
//!
//! Every timing and wire constant that governs observable behavior lives
//! here and is threaded through constructors, so tests can shrink the
//! timeouts per-instance instead of mutating process state.

use std::path::PathBuf;
use std::time::Duration;

use nbd::OffsetFormat;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub device: DeviceConfig,
    #[serde(default)]
    pub serve: ServeConfig,
    #[serde(default = "default_socket_path")]
    pub socket: PathBuf,
    #[serde(default)]
    pub wire: WireConfig,
    #[serde(default)]
    pub timeouts: TimeoutConfig,
}

impl Config {
    pub fn load(path: &std::path::Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(ConfigError::ReadError)?;
        let config: Config =
            toml::from_str(&content).map_err(|e| ConfigError::ParseError(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.device.path.as_os_str().is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "device.path",
                reason: "must not be empty",
            });
        }
        self.wire.validate()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Backing file for the exported device.
    pub path: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServeConfig {
    /// Address clients connect to.
    pub address: String,
    /// Refuse connections from addresses not on the allow-list.
    pub default_deny: bool,
    /// Initial allow-list entries.
    pub acl: Vec<String>,
}

impl Default for ServeConfig {
    fn default() -> Self {
        Self {
            address: default_serve_address(),
            default_deny: false,
            acl: Vec::new(),
        }
    }
}

/// Wire-level knobs shared by every connection of an instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WireConfig {
    /// Offset packing on the wire. Both ends of a link must agree;
    /// never auto-detected.
    pub offset_format: OffsetFormatChoice,
    /// Largest single WRITE the migration copy stream will issue.
    pub max_chunk_bytes: u64,
    /// Read size the proxy's prefetch cache speculates with.
    pub prefetch_bytes: u32,
}

impl Default for WireConfig {
    fn default() -> Self {
        Self {
            offset_format: OffsetFormatChoice::BigEndian,
            // 8 MiB chunks bound sender memory and give interleaved live
            // writes a fair shot at the socket.
            max_chunk_bytes: 8 << 20,
            prefetch_bytes: 4096,
        }
    }
}

impl WireConfig {
    pub fn format(&self) -> OffsetFormat {
        self.offset_format.into()
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.max_chunk_bytes == 0 {
            return Err(ConfigError::InvalidValue {
                field: "wire.max_chunk_bytes",
                reason: "must be > 0",
            });
        }
        if self.max_chunk_bytes > nbd::NBD_MAX_SIZE as u64 {
            return Err(ConfigError::InvalidValue {
                field: "wire.max_chunk_bytes",
                reason: "must not exceed the 32 MiB transfer cap",
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum OffsetFormatChoice {
    #[default]
    BigEndian,
    Reversed,
}

impl From<OffsetFormatChoice> for OffsetFormat {
    fn from(choice: OffsetFormatChoice) -> Self {
        match choice {
            OffsetFormatChoice::BigEndian => OffsetFormat::BigEndian,
            OffsetFormatChoice::Reversed => OffsetFormat::Reversed,
        }
    }
}

/// Wall-clock deadlines, in milliseconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// TCP connect to a migration destination or proxy upstream.
    pub connect_ms: u64,
    /// Waiting for a peer's hello after connecting.
    pub hello_ms: u64,
    /// Waiting for the reply to a migration copy-stream request.
    pub request_ms: u64,
    /// Pause between migration (and proxy reconnect) attempts.
    pub retry_delay_ms: u64,
    /// Pause between attempts to bind a squatted rebind address.
    pub rebind_retry_ms: u64,
    /// Proxy upstream per-phase deadline (request send, reply read).
    pub upstream_ms: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            connect_ms: 15_000,
            hello_ms: 5_000,
            request_ms: 60_000,
            retry_delay_ms: 1_000,
            rebind_retry_ms: 1_000,
            upstream_ms: 15_000,
        }
    }
}

impl TimeoutConfig {
    pub fn connect(&self) -> Duration {
        Duration::from_millis(self.connect_ms)
    }

    pub fn hello(&self) -> Duration {
        Duration::from_millis(self.hello_ms)
    }

    pub fn request(&self) -> Duration {
        Duration::from_millis(self.request_ms)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn rebind_retry(&self) -> Duration {
        Duration::from_millis(self.rebind_retry_ms)
    }

    pub fn upstream(&self) -> Duration {
        Duration::from_millis(self.upstream_ms)
    }
}

fn default_serve_address() -> String {
    "127.0.0.1:10809".to_string()
}

fn default_socket_path() -> PathBuf {
    PathBuf::from("/run/driftbd/driftbd.sock")
}
