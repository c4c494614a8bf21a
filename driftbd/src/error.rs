//! Error types for driftbd.

use std::io;
use thiserror::Error;

// Re-export the wire error from the nbd crate
pub use nbd::NbdError;

pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error type.
#[derive(Debug, Error)]
pub enum Error {
    #[error("device error: {0}")]
    Store(#[from] StoreError),

    #[error("nbd protocol error: {0}")]
    Nbd(#[from] NbdError),

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("migration error: {0}")]
    Mirror(#[from] MirrorError),

    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

/// Backing device errors.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("request {offset}+{len} is out of range for a {size} byte device")]
    OutOfBounds { offset: u64, len: u64, size: u64 },

    #[error("device no longer accepts writes: authority was handed off")]
    WritesClosed,

    #[error("backing file error: {0}")]
    Io(#[from] io::Error),
}

/// Migration failures.
///
/// The fatal variants must never be retried: they are configuration
/// errors or states in which a retry could leave two servers believing
/// they own the device.
#[derive(Debug, Clone, Error)]
pub enum MirrorError {
    #[error("remote size ({remote}) does not match local size ({local})")]
    SizeMismatch { local: u64, remote: u64 },

    #[error("mirror was rejected")]
    Rejected,

    #[error("mirror already running")]
    AlreadyRunning,

    #[error("shutting down")]
    ShuttingDown,

    #[error("destination lost after it acknowledged the entrust")]
    LostAfterEntrust,

    #[error("mirroring abandoned")]
    Abandoned,
}

impl MirrorError {
    /// Whether retrying could ever help.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::SizeMismatch { .. } | Self::Rejected | Self::LostAfterEntrust
        )
    }
}

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    ReadError(io::Error),

    #[error("failed to parse config: {0}")]
    ParseError(String),

    #[error("invalid configuration: {field}: {reason}")]
    InvalidValue {
        field: &'static str,
        reason: &'static str,
    },
}
