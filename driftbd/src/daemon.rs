//! Daemon API for the serve role.
//!
//! A [`Daemon`] owns the device, the I/O handler, the allow-list, and at
//! most one mirror session. It accepts client connections from any
//! [`Listener`] and answers control commands through the functions the
//! control channel calls into.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::{oneshot, watch, Mutex};
use tracing::{error, info, warn};

use crate::acl::AclList;
use crate::config::Config;
use crate::device::Device;
use crate::error::{ConfigError, Error, MirrorError, NbdError, Result};
use crate::mirror::{
    FinishAction, MirrorOutcome, MirrorRelay, MirrorRunner, MirrorSpec, MirrorStatus,
};
use crate::nbd::{DeviceHandler, Listener, NbdServer};

/// Clean exit, including after a successful exit/unlink migration.
pub const EXIT_OK: i32 = 0;
/// Something went wrong after the point of no return.
pub const EXIT_POST_MIGRATION: i32 = 1;
/// Configuration-level failure needing operator attention.
pub const EXIT_FATAL: i32 = 6;

/// Result of the `break` control command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakOutcome {
    Stopped,
    Completed,
    NotMirroring,
}

struct MirrorSession {
    status: Arc<MirrorStatus>,
    abandon: watch::Sender<bool>,
    task: tokio::task::JoinHandle<()>,
}

/// A running driftbd serve instance.
pub struct Daemon {
    device: Arc<Device>,
    handler: Arc<DeviceHandler>,
    server: NbdServer,
    config: Arc<Config>,
    acl: std::sync::RwLock<AclList>,
    mirror: Mutex<Option<MirrorSession>>,
    clients: AtomicUsize,
    exit: watch::Sender<Option<i32>>,
}

impl Daemon {
    /// Open the backing device and build a daemon from configuration.
    pub fn open(config: Config) -> Result<Arc<Self>> {
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
        let (exit, _) = watch::channel(None);

        Ok(Arc::new(Self {
            device,
            handler,
            server,
            config: Arc::new(config),
            acl: std::sync::RwLock::new(acl),
            mirror: Mutex::new(None),
            clients: AtomicUsize::new(0),
            exit,
        }))
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn size(&self) -> u64 {
        self.device.size()
    }

    /// Accept client connections until the listener closes.
    pub async fn listen<L>(self: &Arc<Self>, mut listener: L) -> std::io::Result<()>
    where
        L: Listener,
    {
        info!(size = self.device.size(), "accepting client connections");

        loop {
            let (stream, peer) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) if e.kind() == std::io::ErrorKind::BrokenPipe => {
                    // Channel-fed listener exhausted; a normal end in tests.
                    return Ok(());
                }
                Err(e) => return Err(e),
            };

            if let Some(ip) = peer {
                if !self.acl.read().unwrap().allows(ip) {
                    warn!(%ip, "connection refused by acl");
                    continue;
                }
            }

            self.clients.fetch_add(1, Ordering::Relaxed);
            let server = self.server.clone();
            let daemon = self.clone();
            tokio::spawn(async move {
                if let Err(e) = server.serve(stream, false).await {
                    if !matches!(e, NbdError::Io(_)) {
                        warn!(error = %e, "client connection error");
                    }
                }
                daemon.clients.fetch_sub(1, Ordering::Relaxed);
            });
        }
    }

    /// Serve until the listener fails or a migration outcome ends the
    /// process. Returns the exit code the process should report.
    pub async fn run<L>(self: &Arc<Self>, listener: L) -> i32
    where
        L: Listener,
    {
        let mut exit_rx = self.exit.subscribe();
        tokio::select! {
            res = self.listen(listener) => match res {
                Ok(()) => EXIT_OK,
                Err(e) => {
                    error!(error = %e, "listener failed");
                    EXIT_POST_MIGRATION
                }
            },
            code = wait_exit(&mut exit_rx) => code,
        }
    }

    /// Begin migrating the device to `spec.target`.
    ///
    /// Returns once the first connection attempt has resolved: a fatal
    /// first attempt surfaces here (and the session is over); anything
    /// else reports success while the session retries in the background.
    pub async fn start_mirror(
        self: &Arc<Self>,
        spec: MirrorSpec,
    ) -> std::result::Result<(), MirrorError> {
        let mut slot = self.mirror.lock().await;
        if let Some(session) = slot.as_ref() {
            if !session.task.is_finished() {
                return Err(MirrorError::AlreadyRunning);
            }
        }
        if self.handler.writes_closed() {
            return Err(MirrorError::ShuttingDown);
        }

        let (relay, queue) = MirrorRelay::channel();
        self.handler.attach_relay(relay.clone());

        let (abandon_tx, abandon_rx) = watch::channel(false);
        let (commit_tx, commit_rx) = oneshot::channel();
        let status = Arc::new(MirrorStatus::new(self.device.size()));

        let runner = MirrorRunner::new(
            self.handler.clone(),
            relay,
            spec,
            self.config.timeouts.clone(),
            self.config.wire.format(),
            self.config.wire.max_chunk_bytes,
            status.clone(),
            abandon_rx,
        );

        let daemon = self.clone();
        let task = tokio::spawn(async move {
            let outcome = runner.run(queue, commit_tx).await;
            daemon.finish_mirror(outcome).await;
        });

        *slot = Some(MirrorSession {
            status,
            abandon: abandon_tx,
            task,
        });
        drop(slot);

        commit_rx.await.unwrap_or(Err(MirrorError::Abandoned))
    }

    async fn finish_mirror(&self, outcome: MirrorOutcome) {
        self.handler.detach_relay();

        match outcome {
            MirrorOutcome::Completed { action } => match action {
                FinishAction::Nothing => {
                    info!("copy-only mirror finished; still serving");
                }
                FinishAction::Exit => {
                    info!("migration complete, exiting");
                    let _ = self.exit.send(Some(EXIT_OK));
                }
                FinishAction::Unlink => {
                    if let Err(e) = self.device.unlink() {
                        error!(error = %e, "failed to unlink backing file after handoff");
                        let _ = self.exit.send(Some(EXIT_POST_MIGRATION));
                    } else {
                        info!("migration complete, backing file unlinked, exiting");
                        let _ = self.exit.send(Some(EXIT_OK));
                    }
                }
            },
            MirrorOutcome::Failed {
                error,
                after_commit,
            } => {
                if !after_commit {
                    // The control reply already carried this error; the
                    // server keeps serving.
                    warn!(%error, "mirror failed before it could start");
                    return;
                }
                error!(%error, "migration failed");
                let code = match error {
                    MirrorError::LostAfterEntrust => EXIT_POST_MIGRATION,
                    _ => EXIT_FATAL,
                };
                let _ = self.exit.send(Some(code));
            }
            MirrorOutcome::Abandoned => {
                info!("mirror abandoned");
            }
        }
    }

    /// Abandon a running mirror session.
    pub async fn break_mirror(&self) -> BreakOutcome {
        let slot = self.mirror.lock().await;
        match slot.as_ref() {
            Some(session) if !session.task.is_finished() => {
                info!("signalling mirror to abandon");
                let _ = session.abandon.send(true);
                BreakOutcome::Stopped
            }
            _ if self.handler.writes_closed() => BreakOutcome::Completed,
            _ => BreakOutcome::NotMirroring,
        }
    }

    /// Replace the allow-list.
    pub fn set_acl(&self, acl: AclList) {
        *self.acl.write().unwrap() = acl;
    }

    pub fn default_deny(&self) -> bool {
        self.config.serve.default_deny
    }

    /// One-line status summary for the control channel.
    pub async fn status_line(&self) -> String {
        let slot = self.mirror.lock().await;
        let mirroring = slot
            .as_ref()
            .map(|s| !s.task.is_finished())
            .unwrap_or(false);
        let has_control = !self.handler.writes_closed();

        let mut line = format!(
            "pid={} size={} is_mirroring={} clients_allowed={} num_clients={} has_control={}",
            std::process::id(),
            self.device.size(),
            mirroring,
            has_control,
            self.clients.load(Ordering::Relaxed),
            has_control,
        );
        if mirroring {
            if let Some(session) = slot.as_ref() {
                line.push_str(&format!(
                    " migration_phase={} migration_duration={} migration_bytes_left={}",
                    session.status.phase(),
                    session.status.duration_secs(),
                    session.status.bytes_remaining(),
                ));
            }
        }
        line
    }
}

async fn wait_exit(rx: &mut watch::Receiver<Option<i32>>) -> i32 {
    loop {
        if let Some(code) = *rx.borrow() {
            return code;
        }
        if rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DeviceConfig;
    use crate::nbd::StreamListener;
    use nbd::NbdClient;
    use std::io::Write;
    use tokio::io::duplex;

    fn test_config(dir: &tempfile::TempDir, len: usize) -> Config {
        let path = dir.path().join("disk.img");
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(&vec![0u8; len]).unwrap();
        Config {
            device: DeviceConfig { path },
            serve: Default::default(),
            socket: dir.path().join("ctl.sock"),
            wire: Default::default(),
            timeouts: Default::default(),
        }
    }

    #[tokio::test]
    async fn serves_clients_through_a_stream_listener() {
        let dir = tempfile::tempdir().unwrap();
        let daemon = Daemon::open(test_config(&dir, 8192)).unwrap();

        let (tx, listener) = StreamListener::new(4);
        let serving = {
            let daemon = daemon.clone();
            tokio::spawn(async move { daemon.listen(listener).await })
        };

        let (client_stream, server_stream) = duplex(64 * 1024);
        tx.send(server_stream).await.unwrap();

        let mut client = NbdClient::connect(client_stream, nbd::OffsetFormat::BigEndian)
            .await
            .unwrap();
        assert_eq!(client.size, 8192);
        client.write(0, &[0x42; 1024]).await.unwrap();
        assert_eq!(&client.read(0, 1024).await.unwrap()[..], &[0x42; 1024][..]);
        client.disconnect().await.unwrap();

        drop(tx);
        serving.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn break_without_mirror_reports_not_mirroring() {
        let dir = tempfile::tempdir().unwrap();
        let daemon = Daemon::open(test_config(&dir, 4096)).unwrap();
        assert_eq!(daemon.break_mirror().await, BreakOutcome::NotMirroring);
    }

    #[tokio::test]
    async fn status_line_reports_the_basics() {
        let dir = tempfile::tempdir().unwrap();
        let daemon = Daemon::open(test_config(&dir, 4096)).unwrap();
        let line = daemon.status_line().await;
        assert!(line.contains("size=4096"));
        assert!(line.contains("is_mirroring=false"));
        assert!(line.contains("has_control=true"));
        assert!(line.contains("num_clients=0"));
    }
}
