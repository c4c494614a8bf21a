//! Live migration of the device to another server.
//!
//! A mirror session bulk-copies the device to the destination, replays
//! the writes that landed while the copy ran, interleaves subsequent
//! writes synchronously, and finally offers the destination authority
//! with an entrust exchange. The destination's image after handoff is
//! byte-identical to the source's for every byte ever written during the
//! migration window.
//!
//! Failure policy:
//! - configuration failures (size mismatch, rejected hello) are fatal and
//!   never retried;
//! - transient failures (unreachable destination, timeout, disconnect,
//!   entrust veto) restart the whole attempt from the connect, repeating
//!   forever until the operator breaks the session, since a destination
//!   that is down now is expected to come back;
//! - any failure after the destination has acknowledged the entrust is
//!   fatal with no retry: authority may already have moved, and a blind
//!   re-copy could leave two servers claiming the same device.

mod relay;

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use tokio::net::TcpStream;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::sync::{oneshot, watch};
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

use nbd::{NbdClient, NbdError, OffsetFormat};

pub use relay::{MirrorRelay, RelayedWrite};

use crate::config::TimeoutConfig;
use crate::error::{Error, MirrorError};
use crate::nbd::DeviceHandler;

/// What the source does once the destination holds the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishAction {
    /// Hand off authority, then exit.
    Exit,
    /// Hand off authority, remove the backing file, then exit.
    Unlink,
    /// Copy only: drain the stream and stop mirroring, keeping authority.
    Nothing,
}

impl std::str::FromStr for FinishAction {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "exit" => Ok(Self::Exit),
            "unlink" => Ok(Self::Unlink),
            "nothing" => Ok(Self::Nothing),
            _ => Err(()),
        }
    }
}

/// Where a session currently stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MirrorPhase {
    Connecting,
    BulkCopy,
    LiveMirror,
    AwaitEntrustAck,
    HandedOff,
    Failed,
}

impl fmt::Display for MirrorPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Connecting => "connecting",
            Self::BulkCopy => "bulk_copy",
            Self::LiveMirror => "live_mirror",
            Self::AwaitEntrustAck => "await_entrust_ack",
            Self::HandedOff => "handed_off",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Parameters of a session, as given by the `mirror` control command.
#[derive(Debug, Clone, Copy)]
pub struct MirrorSpec {
    pub target: SocketAddr,
    pub action: FinishAction,
}

/// Shared progress snapshot for the status command.
pub struct MirrorStatus {
    phase: std::sync::Mutex<MirrorPhase>,
    bytes_remaining: AtomicU64,
    started: Instant,
}

impl MirrorStatus {
    pub fn new(device_size: u64) -> Self {
        Self {
            phase: std::sync::Mutex::new(MirrorPhase::Connecting),
            bytes_remaining: AtomicU64::new(device_size),
            started: Instant::now(),
        }
    }

    pub fn phase(&self) -> MirrorPhase {
        *self.phase.lock().unwrap()
    }

    fn set_phase(&self, phase: MirrorPhase) {
        debug!(%phase, "mirror phase");
        *self.phase.lock().unwrap() = phase;
    }

    pub fn bytes_remaining(&self) -> u64 {
        self.bytes_remaining.load(Ordering::Relaxed)
    }

    fn set_bytes_remaining(&self, remaining: u64) {
        self.bytes_remaining.store(remaining, Ordering::Relaxed);
    }

    pub fn duration_secs(&self) -> u64 {
        self.started.elapsed().as_secs()
    }
}

/// How a session ended.
#[derive(Debug)]
pub enum MirrorOutcome {
    /// The finish action ran to completion.
    Completed { action: FinishAction },
    /// Terminal failure. `after_commit` is false only when the very first
    /// connection attempt failed, in which case the error has already
    /// been reported on the control channel and the server carries on.
    Failed {
        error: MirrorError,
        after_commit: bool,
    },
    /// The operator broke the session.
    Abandoned,
}

/// Result delivered to the control channel once the first connection
/// attempt has resolved.
pub type CommitSender = oneshot::Sender<Result<(), MirrorError>>;

enum Attempt {
    Fatal(MirrorError),
    Transient(Error),
}

/// Drives one migration to completion, including retries.
pub struct MirrorRunner {
    handler: Arc<DeviceHandler>,
    relay: Arc<MirrorRelay>,
    spec: MirrorSpec,
    timeouts: TimeoutConfig,
    format: OffsetFormat,
    max_chunk: u64,
    status: Arc<MirrorStatus>,
    abandon: watch::Receiver<bool>,
}

impl MirrorRunner {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        handler: Arc<DeviceHandler>,
        relay: Arc<MirrorRelay>,
        spec: MirrorSpec,
        timeouts: TimeoutConfig,
        format: OffsetFormat,
        max_chunk: u64,
        status: Arc<MirrorStatus>,
        abandon: watch::Receiver<bool>,
    ) -> Self {
        Self {
            handler,
            relay,
            spec,
            timeouts,
            format,
            max_chunk,
            status,
            abandon,
        }
    }

    /// Run the session until a terminal outcome.
    pub async fn run(
        self,
        mut queue: UnboundedReceiver<RelayedWrite>,
        commit: CommitSender,
    ) -> MirrorOutcome {
        let mut commit = Some(commit);
        // Set once the control channel has been told "mirror started";
        // a fatal error before that is the command's reply, after it the
        // process's problem.
        let mut committed_ok = false;
        let mut abandon = self.abandon.clone();
        info!(target = %self.spec.target, action = ?self.spec.action, "starting mirror");

        let outcome = loop {
            let attempt = tokio::select! {
                _ = abandoned(&mut abandon) => break MirrorOutcome::Abandoned,
                r = self.attempt(&mut queue, &mut commit, &mut committed_ok) => r,
            };

            match attempt {
                Ok(()) => {
                    break MirrorOutcome::Completed {
                        action: self.spec.action,
                    }
                }
                Err(Attempt::Fatal(error)) => {
                    self.status.set_phase(MirrorPhase::Failed);
                    break MirrorOutcome::Failed {
                        error,
                        after_commit: committed_ok,
                    };
                }
                Err(Attempt::Transient(reason)) => {
                    warn!(%reason, "mirror attempt failed, retrying");
                    tokio::select! {
                        _ = abandoned(&mut abandon) => break MirrorOutcome::Abandoned,
                        _ = sleep(self.timeouts.retry_delay()) => {}
                    }
                }
            }
        };

        // Whatever happened, stop withholding client replies.
        self.relay.set_live(false);

        if let Some(commit) = commit.take() {
            let result = match &outcome {
                MirrorOutcome::Failed { error, .. } => Err(error.clone()),
                MirrorOutcome::Abandoned => Err(MirrorError::Abandoned),
                MirrorOutcome::Completed { .. } => Ok(()),
            };
            let _ = commit.send(result);
        }

        outcome
    }

    /// One full pass: connect, copy, catch up, hand off.
    async fn attempt(
        &self,
        queue: &mut UnboundedReceiver<RelayedWrite>,
        commit: &mut Option<CommitSender>,
        committed_ok: &mut bool,
    ) -> Result<(), Attempt> {
        self.relay.set_live(false);
        self.status.set_phase(MirrorPhase::Connecting);

        let device = self.handler.device().clone();
        let size = device.size();

        let mut client = match self.connect(size).await {
            Ok(client) => {
                // The destination answered and the sizes line up; tell the
                // administrator the mirror is under way. Retries from here
                // on are our problem, not theirs.
                if let Some(commit) = commit.take() {
                    let _ = commit.send(Ok(()));
                    *committed_ok = true;
                }
                client
            }
            Err(Attempt::Fatal(error)) => {
                if let Some(commit) = commit.take() {
                    let _ = commit.send(Err(error.clone()));
                }
                return Err(Attempt::Fatal(error));
            }
            Err(transient) => {
                // Destination unreachable: report the mirror as started
                // and keep knocking until it comes up.
                if let Some(commit) = commit.take() {
                    let _ = commit.send(Ok(()));
                    *committed_ok = true;
                }
                return Err(transient);
            }
        };

        // Bulk copy, front to back. Writes racing us are queued by the
        // relay and replayed below, so a chunk read here can never be
        // staler than what the queue will overwrite it with.
        self.status.set_phase(MirrorPhase::BulkCopy);
        let mut offset = 0u64;
        while offset < size {
            let chunk = (size - offset).min(self.max_chunk) as usize;
            self.status.set_bytes_remaining(size - offset);
            let data = device
                .read_at(offset, chunk)
                .map_err(|e| Attempt::Transient(e.into()))?;
            self.forward_write(&mut client, offset, &data).await?;
            offset += chunk as u64;
        }
        self.status.set_bytes_remaining(0);

        // Replay everything that landed during the copy, then flip to the
        // synchronous regime and clear the race window.
        self.flush_queue(&mut client, queue).await?;
        self.relay.set_live(true);
        self.flush_queue(&mut client, queue).await?;
        self.status.set_phase(MirrorPhase::LiveMirror);
        info!("mirror caught up with the write frontier");

        // Close the write gate: nothing new can land, so after one last
        // drain the destination is exactly our image.
        let gate = self.handler.lock_writes().await;
        let result = self.handoff(&mut client, queue).await;
        match result {
            Ok(()) => {
                if self.spec.action != FinishAction::Nothing {
                    self.handler.close_writes();
                }
                drop(gate);
                Ok(())
            }
            Err(e) => {
                self.relay.set_live(false);
                drop(gate);
                Err(e)
            }
        }
    }

    async fn connect(&self, local_size: u64) -> Result<NbdClient<TcpStream>, Attempt> {
        let stream = match timeout(self.timeouts.connect(), TcpStream::connect(self.spec.target))
            .await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => return Err(Attempt::Transient(e.into())),
            Err(_) => {
                return Err(Attempt::Transient(Error::Io(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    "connect to destination timed out",
                ))))
            }
        };
        stream
            .set_nodelay(true)
            .map_err(|e| Attempt::Transient(e.into()))?;

        let client = match timeout(self.timeouts.hello(), NbdClient::connect(stream, self.format))
            .await
        {
            Ok(Ok(client)) => client,
            // A peer that speaks, but wrongly, is refusing the mirror;
            // a peer that hangs up early might just be restarting.
            Ok(Err(NbdError::BadHello { .. })) => return Err(Attempt::Fatal(MirrorError::Rejected)),
            Ok(Err(e)) => return Err(Attempt::Transient(e.into())),
            Err(_) => {
                return Err(Attempt::Transient(Error::Io(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    "no hello from destination",
                ))))
            }
        };

        if client.size != local_size {
            return Err(Attempt::Fatal(MirrorError::SizeMismatch {
                local: local_size,
                remote: client.size,
            }));
        }

        debug!(target = %self.spec.target, size = client.size, "destination accepted hello");
        Ok(client)
    }

    /// Send one write and require its ack within the request deadline.
    async fn forward_write(
        &self,
        client: &mut NbdClient<TcpStream>,
        offset: u64,
        data: &[u8],
    ) -> Result<(), Attempt> {
        match timeout(self.timeouts.request(), client.write(offset, data)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(Attempt::Transient(e.into())),
            Err(_) => Err(Attempt::Transient(Error::Io(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "destination did not acknowledge a write in time",
            )))),
        }
    }

    /// Drain the relay queue, acking clients as the destination confirms.
    ///
    /// On failure the in-flight entry is dropped, releasing its waiting
    /// client; entries still queued survive into the next attempt, whose
    /// bulk copy re-covers their ranges anyway.
    async fn flush_queue(
        &self,
        client: &mut NbdClient<TcpStream>,
        queue: &mut UnboundedReceiver<RelayedWrite>,
    ) -> Result<(), Attempt> {
        loop {
            match queue.try_recv() {
                Ok(write) => {
                    self.forward_write(client, write.offset, &write.data).await?;
                    if let Some(ack) = write.ack {
                        let _ = ack.send(());
                    }
                }
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => return Ok(()),
            }
        }
    }

    /// With the write gate held: final drain, then transfer authority.
    async fn handoff(
        &self,
        client: &mut NbdClient<TcpStream>,
        queue: &mut UnboundedReceiver<RelayedWrite>,
    ) -> Result<(), Attempt> {
        self.flush_queue(client, queue).await?;

        if self.spec.action == FinishAction::Nothing {
            // Copy-only run: the destination gets the bytes but never the
            // authority. No entrust, just a clean goodbye.
            info!("copy-only mirror complete");
            let _ = client.disconnect().await;
            return Ok(());
        }

        self.status.set_phase(MirrorPhase::AwaitEntrustAck);
        match timeout(self.timeouts.request(), client.entrust()).await {
            Ok(Ok(())) => {}
            Ok(Err(NbdError::PeerError { code })) => {
                // The destination vetoed the handoff; it kept none of our
                // authority, so the whole migration retries.
                warn!(code, "entrust refused by destination");
                return Err(Attempt::Transient(Error::Nbd(NbdError::PeerError { code })));
            }
            Ok(Err(e)) => return Err(Attempt::Transient(e.into())),
            Err(_) => {
                return Err(Attempt::Transient(Error::Io(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    "no entrust reply from destination",
                ))))
            }
        }

        // The ack has been read: authority is moving. From here on there
        // is no safe retry.
        self.status.set_phase(MirrorPhase::HandedOff);
        if let Err(e) = client.disconnect().await {
            warn!(error = %e, "destination lost between entrust ack and disconnect");
            return Err(Attempt::Fatal(MirrorError::LostAfterEntrust));
        }
        info!("mirror sent; destination is authoritative");
        Ok(())
    }
}

/// Resolves once the operator has asked for the session to stop.
async fn abandoned(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow() {
            return;
        }
        if rx.changed().await.is_err() {
            // Sender gone: nobody can abandon us any more.
            std::future::pending::<()>().await;
        }
    }
}
