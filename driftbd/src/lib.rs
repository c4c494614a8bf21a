//! driftbd: a network block device server that can migrate live.
//!
//! One instance serves one backing file over the oldstyle NBD protocol.
//! The `mirror` control command moves the device to another host while
//! clients keep reading and writing: bulk copy, live write interleaving,
//! then an entrust handshake that transfers authority. A separate proxy
//! role gives a single client transparent reconnection across upstream
//! failures.
//!
//! # Library Usage
//!
//! ```ignore
//! use driftbd::{Config, Daemon};
//! use tokio::net::TcpListener;
//!
//! let daemon = Daemon::open(config)?;
//! let listener = TcpListener::bind(&daemon.config().serve.address).await?;
//! let exit_code = daemon.run(listener).await;
//! ```

pub mod acl;
pub mod config;
pub mod control;
pub mod daemon;
pub mod device;
pub mod error;
pub mod listen;
pub mod mirror;
pub mod nbd;
pub mod proxy;

pub use acl::AclList;
pub use config::{Config, DeviceConfig, OffsetFormatChoice, ServeConfig, TimeoutConfig, WireConfig};
pub use daemon::{BreakOutcome, Daemon, EXIT_FATAL, EXIT_OK, EXIT_POST_MIGRATION};
pub use device::Device;
pub use error::{ConfigError, Error, MirrorError, NbdError, Result, StoreError};
pub use listen::ListenServer;
pub use mirror::{FinishAction, MirrorPhase, MirrorSpec};
pub use nbd::{DeviceHandler, IoHandler, Listener, NbdServer, SessionEnd, StreamListener};
pub use proxy::{ProxyOptions, ProxyServer};
