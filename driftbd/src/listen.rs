//! The destination role.
//!
//! A listener waits on a private init address for the sender's mirror
//! stream, applies it with the ordinary transmission engine (entrust
//! enabled), and takes control of the device once the sender has
//! entrusted it and gone away. It then rebinds to the public address,
//! which the exiting sender may still be squatting, and serves real
//! clients from there.

use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::acl::AclList;
use crate::config::Config;
use crate::daemon::{EXIT_FATAL, EXIT_POST_MIGRATION};
use crate::device::Device;
use crate::error::{ConfigError, Error, Result};
use crate::nbd::{DeviceHandler, Listener, NbdServer, SessionEnd};

/// A destination instance.
pub struct ListenServer {
    handler: Arc<DeviceHandler>,
    server: NbdServer,
    config: Arc<Config>,
    acl: std::sync::RwLock<AclList>,
    /// Public address to serve from after takeover; defaults to the init
    /// address when the deployment does not move.
    rebind_addr: Option<String>,
}

impl ListenServer {
    pub fn open(config: Config, rebind_addr: Option<String>) -> Result<Arc<Self>> {
        config.validate()?;
        let device = Arc::new(Device::open(&config.device.path)?);
        let handler = Arc::new(DeviceHandler::new(device.clone()));
        let server = NbdServer::new(handler.clone(), device.size(), config.wire.format());
        let acl = AclList::parse(
            config.serve.acl.iter().map(String::as_str),
            config.serve.default_deny,
        )
        .map_err(|bad| {
            Error::Config(ConfigError::ParseError(format!("bad acl entry: {bad}")))
        })?;

        Ok(Arc::new(Self {
            handler,
            server,
            config: Arc::new(config),
            acl: std::sync::RwLock::new(acl),
            rebind_addr,
        }))
    }

    pub fn size(&self) -> u64 {
        self.server.size()
    }

    /// Run the whole lifecycle. Returns the process exit code.
    pub async fn run(self: &Arc<Self>) -> i32 {
        let init_addr = self.config.serve.address.clone();
        let init = match TcpListener::bind(&init_addr).await {
            Ok(listener) => listener,
            Err(e) => {
                error!(error = %e, addr = %init_addr, "could not bind init address");
                return EXIT_POST_MIGRATION;
            }
        };
        self.run_on(init).await
    }

    /// Run the lifecycle on an already-bound init listener.
    pub async fn run_on(self: &Arc<Self>, mut init: TcpListener) -> i32 {
        let init_addr = init
            .local_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| self.config.serve.address.clone());
        info!(addr = %init_addr, size = self.size(), "listening for incoming migration");

        // Phase one: one mirror sender at a time, until one entrusts us.
        // A sender that drops out mid-copy will reconnect and start over.
        loop {
            let (stream, peer) = match Listener::accept(&mut init).await {
                Ok(accepted) => accepted,
                Err(e) => {
                    error!(error = %e, "accept failed while awaiting migration");
                    return EXIT_POST_MIGRATION;
                }
            };
            if let Some(ip) = peer {
                if !self.acl.read().unwrap().allows(ip) {
                    warn!(%ip, "migration source refused by acl");
                    continue;
                }
            }

            match self.server.serve(stream, true).await {
                Ok(SessionEnd::Entrusted) => {
                    info!("device entrusted to us; taking control");
                    break;
                }
                Ok(SessionEnd::Disconnected) => {
                    info!("sender went away before entrusting; still listening");
                }
                Err(e) => {
                    warn!(error = %e, "migration connection error; still listening");
                }
            }
        }
        drop(init);

        // Phase two: move to the public address. The sender usually still
        // holds it while it finishes exiting, so in-use is no failure.
        let addr = self
            .rebind_addr
            .clone()
            .unwrap_or_else(|| init_addr.clone());
        let mut listener = loop {
            match TcpListener::bind(&addr).await {
                Ok(listener) => break listener,
                Err(e) if e.kind() == std::io::ErrorKind::AddrInUse => {
                    debug!(addr = %addr, "rebind address still squatted");
                    sleep(self.config.timeouts.rebind_retry()).await;
                }
                Err(e) => {
                    error!(error = %e, addr = %addr, "rebind failed");
                    return EXIT_FATAL;
                }
            }
        };
        info!(addr = %addr, "rebound; serving clients");

        // Phase three: an ordinary server, authority included.
        loop {
            let (stream, peer) = match Listener::accept(&mut listener).await {
                Ok(accepted) => accepted,
                Err(e) => {
                    error!(error = %e, "accept failed");
                    return EXIT_POST_MIGRATION;
                }
            };
            if let Some(ip) = peer {
                if !self.acl.read().unwrap().allows(ip) {
                    warn!(%ip, "connection refused by acl");
                    continue;
                }
            }
            let server = self.server.clone();
            tokio::spawn(async move {
                if let Err(e) = server.serve(stream, false).await {
                    if !matches!(e, crate::error::NbdError::Io(_)) {
                        warn!(error = %e, "client connection error");
                    }
                }
            });
        }
    }

    /// The handler, for inspecting device state in tests.
    pub fn handler(&self) -> &Arc<DeviceHandler> {
        &self.handler
    }
}
