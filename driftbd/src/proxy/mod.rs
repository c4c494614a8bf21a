//! Transparent reconnecting proxy.
//!
//! Sits between a single downstream client and an upstream server,
//! speaking the same wire protocol on both sides. Its one job is to make
//! upstream failures invisible: every request is recorded verbatim
//! before it goes upstream and replayed, after a reconnect, for as long
//! as it takes. The client sees added latency, never an error it didn't
//! earn.
//!
//! Single tenancy is structural: the session loop holds the one
//! in-flight request, and a helper task refuses (accepts, then closes)
//! any additional downstream connection while a session runs.

mod prefetch;

use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

use nbd::{read_hello, Hello, NbdCommand, NbdReply, NbdRequest, OffsetFormat, NBD_MAX_SIZE};

pub use prefetch::Prefetch;

use crate::config::{TimeoutConfig, WireConfig};
use crate::error::{Error, Result};

/// Deployment parameters of a proxy instance.
#[derive(Debug, Clone)]
pub struct ProxyOptions {
    /// Address the downstream client connects to.
    pub listen: String,
    /// Upstream server address.
    pub upstream: String,
    /// Enable the speculative read cache.
    pub prefetch: bool,
}

struct Upstream {
    stream: TcpStream,
    size: u64,
}

pub struct ProxyServer {
    opts: ProxyOptions,
    format: OffsetFormat,
    prefetch_bytes: u32,
    timeouts: TimeoutConfig,
    upstream_size: u64,
}

impl ProxyServer {
    pub fn new(opts: ProxyOptions, wire: &WireConfig, timeouts: TimeoutConfig) -> Self {
        Self {
            opts,
            format: wire.format(),
            prefetch_bytes: wire.prefetch_bytes,
            timeouts,
            upstream_size: 0,
        }
    }

    /// Run forever. Startup fails hard if the upstream is not there: a
    /// proxy with nothing behind it is a misconfiguration, not a thing
    /// to retry.
    pub async fn run(&mut self) -> Result<()> {
        let upstream = self.try_connect().await?;
        let listener = TcpListener::bind(&self.opts.listen).await?;
        self.serve_sessions(upstream, listener).await
    }

    /// Like [`run`](Self::run), but on an already-bound listener.
    pub async fn run_on(&mut self, listener: TcpListener) -> Result<()> {
        let upstream = self.try_connect().await?;
        self.serve_sessions(upstream, listener).await
    }

    async fn serve_sessions(&mut self, upstream: Upstream, listener: TcpListener) -> Result<()> {
        self.upstream_size = upstream.size;
        info!(
            upstream = %self.opts.upstream,
            size = upstream.size,
            "connected to upstream"
        );

        let listener = Arc::new(listener);
        info!(addr = %self.opts.listen, "proxy accepting a downstream client");

        let mut upstream = upstream;
        loop {
            let (downstream, peer) = listener.accept().await?;
            downstream.set_nodelay(true)?;
            info!(peer = %peer, "downstream client connected");

            // While this session runs, surplus clients get a door in the
            // face rather than a hung connect.
            let rejector = tokio::spawn({
                let listener = Arc::clone(&listener);
                async move {
                    loop {
                        match listener.accept().await {
                            Ok((extra, addr)) => {
                                info!(peer = %addr, "refusing second downstream client");
                                drop(extra);
                            }
                            Err(_) => break,
                        }
                    }
                }
            });

            upstream = self.session(downstream, upstream).await;
            rejector.abort();
            info!("downstream session over");
        }
    }

    /// Serve one downstream client until it goes away. Returns the
    /// upstream connection for the next session to reuse.
    async fn session(&self, mut down: TcpStream, mut upstream: Upstream) -> Upstream {
        let hello = Hello::for_device(self.upstream_size);
        if let Err(e) = down.write_all(&hello.to_bytes()).await {
            warn!(error = %e, "failed to send hello downstream");
            return upstream;
        }

        let mut prefetch = self
            .opts
            .prefetch
            .then(|| Prefetch::new(self.prefetch_bytes));
        let mut served = 0u64;

        loop {
            let Some((req, payload)) = self.read_downstream(&mut down).await else {
                break;
            };

            if req.command() == Some(NbdCommand::Disconnect) {
                debug!("downstream requested disconnect");
                break;
            }

            // Writes make cached reads stale.
            if req.command() != Some(NbdCommand::Read) {
                if let Some(p) = prefetch.as_mut() {
                    p.invalidate();
                }
            }

            // A read the cache can answer never touches the upstream.
            if req.command() == Some(NbdCommand::Read) {
                if let Some(data) = prefetch
                    .as_ref()
                    .and_then(|p| p.lookup(req.offset, req.len))
                {
                    debug!(offset = req.offset, len = req.len, "prefetch hit");
                    if self
                        .reply_downstream(&mut down, NbdReply::ok(req.handle), Some(&data[..]))
                        .await
                        .is_err()
                    {
                        break;
                    }
                    served += 1;
                    continue;
                }
            }

            // Maybe ask upstream for double the range, keeping the rest.
            let mut effective = req;
            if req.command() == Some(NbdCommand::Read) {
                if let Some(p) = prefetch.as_ref() {
                    if p.should_extend(&req, self.upstream_size) {
                        effective.len = req.len * 2;
                    }
                }
            }

            // The recorded frame is what we send and what we replay.
            let mut record = BytesMut::with_capacity(
                NbdRequest::SIZE_BYTES + payload.as_ref().map_or(0, Bytes::len),
            );
            record.extend_from_slice(&effective.to_bytes(self.format));
            if let Some(ref payload) = payload {
                record.extend_from_slice(payload);
            }
            let record = record.freeze();

            let (reply, reply_payload) = loop {
                match self.roundtrip(&mut upstream, &record, &effective).await {
                    Ok(done) => break done,
                    Err(e) => {
                        warn!(error = %e, "upstream failed mid-request; reconnecting");
                        if let Some(p) = prefetch.as_mut() {
                            p.invalidate();
                        }
                        upstream = self.reconnect().await;
                    }
                }
            };

            // Split off the speculative half before replying.
            let mut body = reply_payload;
            if effective.len != req.len && reply.is_ok() {
                if let Some(full) = body.take() {
                    let keep = full.slice(..req.len as usize);
                    if let Some(p) = prefetch.as_mut() {
                        p.fill(req.offset + req.len as u64, full.slice(req.len as usize..));
                    }
                    body = Some(keep);
                }
            }

            if self
                .reply_downstream(&mut down, reply, body.as_deref())
                .await
                .is_err()
            {
                break;
            }
            served += 1;
        }

        info!(requests = served, "closing downstream");
        upstream
    }

    /// Read one full request (header plus any write payload) from the
    /// downstream client. `None` ends the session.
    async fn read_downstream(&self, down: &mut TcpStream) -> Option<(NbdRequest, Option<Bytes>)> {
        let mut header = [0u8; NbdRequest::SIZE_BYTES];
        match down.read_exact(&mut header).await {
            Ok(_) => {}
            Err(e) => {
                if e.kind() != std::io::ErrorKind::UnexpectedEof {
                    warn!(error = %e, "error reading downstream request");
                }
                return None;
            }
        }

        let req = match NbdRequest::from_bytes(&header, self.format) {
            Ok(req) => req,
            Err(e) => {
                warn!(error = %e, "unparseable downstream request");
                return None;
            }
        };

        match req.command() {
            Some(NbdCommand::Read) if req.len > NBD_MAX_SIZE => {
                warn!(len = req.len, "downstream read too large");
                return None;
            }
            Some(NbdCommand::Write) => {
                if req.len > NBD_MAX_SIZE {
                    warn!(len = req.len, "downstream write too large");
                    return None;
                }
                let mut payload = BytesMut::zeroed(req.len as usize);
                if let Err(e) = down.read_exact(&mut payload).await {
                    warn!(error = %e, "error reading downstream write payload");
                    return None;
                }
                return Some((req, Some(payload.freeze())));
            }
            _ => {}
        }
        Some((req, None))
    }

    /// One request/reply exchange with the upstream, each phase under its
    /// own deadline. Any error here means "reconnect and replay".
    async fn roundtrip(
        &self,
        upstream: &mut Upstream,
        record: &Bytes,
        req: &NbdRequest,
    ) -> Result<(NbdReply, Option<Bytes>)> {
        timeout(self.timeouts.upstream(), upstream.stream.write_all(record))
            .await
            .map_err(|_| timed_out("sending request upstream"))??;

        let mut reply_buf = [0u8; NbdReply::SIZE_BYTES];
        timeout(
            self.timeouts.upstream(),
            upstream.stream.read_exact(&mut reply_buf),
        )
        .await
        .map_err(|_| timed_out("waiting for upstream reply"))??;
        let reply = NbdReply::from_bytes(&reply_buf)?;

        // An error reply carries no payload and passes through untouched:
        // the upstream completed the request, just not happily. Only a
        // transport failure triggers the replay path.
        let payload = if reply.is_ok() && req.command() == Some(NbdCommand::Read) {
            let mut data = BytesMut::zeroed(req.len as usize);
            timeout(self.timeouts.upstream(), upstream.stream.read_exact(&mut data))
                .await
                .map_err(|_| timed_out("reading upstream read payload"))??;
            Some(data.freeze())
        } else {
            None
        };

        Ok((reply, payload))
    }

    async fn reply_downstream(
        &self,
        down: &mut TcpStream,
        reply: NbdReply,
        payload: Option<&[u8]>,
    ) -> std::io::Result<()> {
        down.write_all(&reply.to_bytes()).await?;
        if let Some(payload) = payload {
            down.write_all(payload).await?;
        }
        Ok(())
    }

    /// Re-establish the upstream, forever. The downstream client is
    /// waiting on a recorded request; giving up is not on the menu.
    async fn reconnect(&self) -> Upstream {
        loop {
            match self.try_connect().await {
                Ok(upstream) => {
                    if upstream.size != self.upstream_size {
                        warn!(
                            old = self.upstream_size,
                            new = upstream.size,
                            "upstream size changed across reconnect"
                        );
                    }
                    info!("reconnected to upstream");
                    return upstream;
                }
                Err(e) => {
                    debug!(error = %e, "upstream still unreachable");
                    sleep(self.timeouts.retry_delay()).await;
                }
            }
        }
    }

    async fn try_connect(&self) -> Result<Upstream> {
        let mut stream = timeout(
            self.timeouts.connect(),
            TcpStream::connect(&self.opts.upstream),
        )
        .await
        .map_err(|_| timed_out("connecting to upstream"))??;

        // Socket options die with the socket; set them again on every
        // fresh connection.
        stream.set_nodelay(true)?;

        let hello = timeout(self.timeouts.hello(), read_hello(&mut stream))
            .await
            .map_err(|_| timed_out("waiting for upstream hello"))??;

        Ok(Upstream {
            stream,
            size: hello.size,
        })
    }
}

fn timed_out(what: &str) -> Error {
    Error::Io(std::io::Error::new(
        std::io::ErrorKind::TimedOut,
        what.to_string(),
    ))
}
