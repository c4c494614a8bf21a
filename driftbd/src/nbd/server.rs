//! The per-connection transmission engine.
//!
//! One hello out, then requests in and replies out until the peer
//! disconnects. The same engine backs the plain serve role, the
//! destination while it receives a mirror (with entrust enabled), and
//! the destination after takeover.
//!
//! Validation policy, in decreasing order of severity:
//! - a bad request magic gets an error reply and then a teardown, because
//!   framing can no longer be trusted;
//! - an out-of-range read or write gets an in-band error and the
//!   connection lives on, but a write's payload is drained off the
//!   socket first, or the stream would desynchronize;
//! - an unknown type gets an in-band error and the connection lives on.

use std::sync::Arc;

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, warn};

use nbd::{
    Hello, NbdCommand, NbdError, NbdReply, NbdRequest, OffsetFormat, NBD_EINVAL, NBD_EPERM,
    NBD_ENOSPC,
};

use super::handler::IoHandler;
use crate::error::StoreError;

/// How a transmission session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    /// Ordinary disconnect or EOF.
    Disconnected,
    /// The peer entrusted the device to us before the connection ended.
    Entrusted,
}

/// NBD server for a single connection.
#[derive(Clone)]
pub struct NbdServer {
    handler: Arc<dyn IoHandler>,
    size: u64,
    format: OffsetFormat,
}

impl NbdServer {
    pub fn new(handler: Arc<dyn IoHandler>, size: u64, format: OffsetFormat) -> Self {
        Self {
            handler,
            size,
            format,
        }
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    /// Serve one connection over any async stream until it ends.
    ///
    /// `allow_entrust` is set only by the listen role while it waits for
    /// a migration to arrive; everywhere else entrust is an unknown
    /// request.
    pub async fn serve<S>(&self, mut stream: S, allow_entrust: bool) -> Result<SessionEnd, NbdError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        stream
            .write_all(&Hello::for_device(self.size).to_bytes())
            .await?;

        let mut entrusted = false;
        let mut req_buf = [0u8; NbdRequest::SIZE_BYTES];

        loop {
            match stream.read_exact(&mut req_buf).await {
                Ok(_) => {}
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                    return Ok(end_state(entrusted));
                }
                Err(e) => return Err(e.into()),
            }

            let req = match NbdRequest::from_bytes(&req_buf, self.format) {
                Ok(req) => req,
                Err(NbdError::InvalidMagic { actual, .. }) => {
                    // The reply carries whatever sits in the handle slot so
                    // the peer can at least correlate, then the connection
                    // goes away: nothing after a bad magic can be framed.
                    warn!(magic = format_args!("0x{actual:08x}"), "bad request magic");
                    let reply = NbdReply::error(NbdRequest::handle_of(&req_buf), NBD_EPERM);
                    stream.write_all(&reply.to_bytes()).await?;
                    stream.flush().await?;
                    return Ok(end_state(entrusted));
                }
                Err(e) => return Err(e),
            };

            let Some(command) = req.command() else {
                warn!(word = req.word(), "unknown request type");
                stream
                    .write_all(&NbdReply::error(req.handle, NBD_EINVAL).to_bytes())
                    .await?;
                continue;
            };

            match command {
                NbdCommand::Disconnect => {
                    debug!("disconnect requested");
                    return Ok(end_state(entrusted));
                }
                NbdCommand::Entrust => {
                    if allow_entrust {
                        debug!("entrust accepted");
                        stream
                            .write_all(&NbdReply::ok(req.handle).to_bytes())
                            .await?;
                        entrusted = true;
                    } else {
                        warn!("entrust refused: not listening for a migration");
                        stream
                            .write_all(&NbdReply::error(req.handle, NBD_EINVAL).to_bytes())
                            .await?;
                    }
                }
                NbdCommand::Read => {
                    if self.out_of_range(req.offset, req.len) {
                        warn!(offset = req.offset, len = req.len, "read out of range");
                        stream
                            .write_all(&NbdReply::error(req.handle, NBD_ENOSPC).to_bytes())
                            .await?;
                        continue;
                    }
                    match self.handler.read(req.offset, req.len as usize).await {
                        Ok(data) => {
                            stream
                                .write_all(&NbdReply::ok(req.handle).to_bytes())
                                .await?;
                            stream.write_all(&data).await?;
                        }
                        Err(e) => {
                            warn!(error = %e, "read failed");
                            stream
                                .write_all(&NbdReply::error(req.handle, NBD_EPERM).to_bytes())
                                .await?;
                        }
                    }
                }
                NbdCommand::Write => {
                    if self.out_of_range(req.offset, req.len) {
                        warn!(offset = req.offset, len = req.len, "write out of range");
                        drain(&mut stream, req.len as u64).await?;
                        stream
                            .write_all(&NbdReply::error(req.handle, NBD_ENOSPC).to_bytes())
                            .await?;
                        continue;
                    }

                    let mut data = BytesMut::zeroed(req.len as usize);
                    stream.read_exact(&mut data).await?;

                    let error = match self
                        .handler
                        .write(req.offset, data.freeze(), req.has_fua())
                        .await
                    {
                        Ok(()) => None,
                        Err(StoreError::WritesClosed) => {
                            debug!("write refused: handed off");
                            Some(NBD_EPERM)
                        }
                        Err(e) => {
                            warn!(error = %e, "write failed");
                            Some(NBD_EPERM)
                        }
                    };
                    let reply = match error {
                        None => NbdReply::ok(req.handle),
                        Some(code) => NbdReply::error(req.handle, code),
                    };
                    stream.write_all(&reply.to_bytes()).await?;
                }
                NbdCommand::Flush => {
                    let reply = match self.handler.flush().await {
                        Ok(()) => NbdReply::ok(req.handle),
                        Err(e) => {
                            warn!(error = %e, "flush failed");
                            NbdReply::error(req.handle, NBD_EPERM)
                        }
                    };
                    stream.write_all(&reply.to_bytes()).await?;
                }
            }
        }
    }

    fn out_of_range(&self, offset: u64, len: u32) -> bool {
        match offset.checked_add(len as u64) {
            Some(end) => end > self.size,
            None => true,
        }
    }
}

fn end_state(entrusted: bool) -> SessionEnd {
    if entrusted {
        SessionEnd::Entrusted
    } else {
        SessionEnd::Disconnected
    }
}

/// Read and discard `len` bytes of payload we cannot honour.
async fn drain<S>(stream: &mut S, len: u64) -> Result<(), NbdError>
where
    S: AsyncRead + Unpin,
{
    const CHUNK: usize = 8 * 1024;
    let mut junk = [0u8; CHUNK];
    let mut remaining = len;
    while remaining > 0 {
        let take = remaining.min(CHUNK as u64) as usize;
        stream.read_exact(&mut junk[..take]).await?;
        remaining -= take as u64;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::Device;
    use crate::nbd::DeviceHandler;
    use nbd::NbdClient;
    use std::io::Write;
    use tokio::io::duplex;

    const FORMAT: OffsetFormat = OffsetFormat::BigEndian;

    fn make_server(len: usize) -> (tempfile::TempDir, NbdServer, u64) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("disk.img");
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(&vec![0u8; len]).unwrap();
        let device = Arc::new(Device::open(&path).unwrap());
        let size = device.size();
        let handler = Arc::new(DeviceHandler::new(device));
        (dir, NbdServer::new(handler, size, FORMAT), size)
    }

    #[tokio::test]
    async fn write_then_read_roundtrips_over_the_wire() {
        let (_dir, server, _) = make_server(8192);
        let (client_stream, server_stream) = duplex(64 * 1024);
        tokio::spawn(async move { server.serve(server_stream, false).await });

        let mut client = NbdClient::connect(client_stream, FORMAT).await.unwrap();
        assert_eq!(client.size, 8192);

        client.write(1024, &[0x5A; 2048]).await.unwrap();
        let data = client.read(1024, 2048).await.unwrap();
        assert_eq!(&data[..], &[0x5A; 2048][..]);

        client.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn out_of_range_write_is_drained_and_survivable() {
        let (_dir, server, size) = make_server(4096);
        let (client_stream, server_stream) = duplex(64 * 1024);
        tokio::spawn(async move { server.serve(server_stream, false).await });

        let mut client = NbdClient::connect(client_stream, FORMAT).await.unwrap();

        let err = client.write(size, &[0xFF; 4096]).await.unwrap_err();
        assert!(matches!(err, NbdError::PeerError { code: NBD_ENOSPC }));

        // The payload was drained, so the connection still frames properly.
        client.write(0, &[0x11; 512]).await.unwrap();
        assert_eq!(&client.read(0, 512).await.unwrap()[..], &[0x11; 512][..]);
    }

    #[tokio::test]
    async fn out_of_range_read_is_survivable() {
        let (_dir, server, size) = make_server(4096);
        let (client_stream, server_stream) = duplex(64 * 1024);
        tokio::spawn(async move { server.serve(server_stream, false).await });

        let mut client = NbdClient::connect(client_stream, FORMAT).await.unwrap();
        let err = client.read(size - 256, 512).await.unwrap_err();
        assert!(matches!(err, NbdError::PeerError { code: NBD_ENOSPC }));
        assert!(client.read(0, 512).await.is_ok());
    }

    #[tokio::test]
    async fn unknown_type_gets_einval_and_connection_survives() {
        let (_dir, server, _) = make_server(4096);
        let (mut client_stream, server_stream) = duplex(64 * 1024);
        tokio::spawn(async move { server.serve(server_stream, false).await });

        // swallow the hello
        let mut hello = [0u8; Hello::SIZE_BYTES];
        client_stream.read_exact(&mut hello).await.unwrap();

        let bogus = NbdRequest {
            flags: 0,
            kind: 99,
            handle: 7,
            offset: 0,
            len: 0,
        };
        client_stream
            .write_all(&bogus.to_bytes(FORMAT))
            .await
            .unwrap();

        let mut reply_buf = [0u8; NbdReply::SIZE_BYTES];
        client_stream.read_exact(&mut reply_buf).await.unwrap();
        let reply = NbdReply::from_bytes(&reply_buf).unwrap();
        assert_eq!(reply.error, NBD_EINVAL);
        assert_eq!(reply.handle, 7);

        // still alive
        client_stream
            .write_all(&NbdRequest::read(8, 0, 512).to_bytes(FORMAT))
            .await
            .unwrap();
        client_stream.read_exact(&mut reply_buf).await.unwrap();
        assert!(NbdReply::from_bytes(&reply_buf).unwrap().is_ok());
    }

    #[tokio::test]
    async fn bad_magic_replies_then_disconnects() {
        let (_dir, server, _) = make_server(4096);
        let (mut client_stream, server_stream) = duplex(64 * 1024);
        let served = tokio::spawn(async move { server.serve(server_stream, false).await });

        let mut hello = [0u8; Hello::SIZE_BYTES];
        client_stream.read_exact(&mut hello).await.unwrap();

        let mut frame = NbdRequest::read(42, 0, 512).to_bytes(FORMAT);
        frame[0..4].copy_from_slice(&[0, 0, 0, 0]);
        client_stream.write_all(&frame).await.unwrap();

        let mut reply_buf = [0u8; NbdReply::SIZE_BYTES];
        client_stream.read_exact(&mut reply_buf).await.unwrap();
        let reply = NbdReply::from_bytes(&reply_buf).unwrap();
        assert_ne!(reply.error, 0);
        assert_eq!(reply.handle, 42);

        // server tears the connection down
        assert_eq!(client_stream.read(&mut [0u8; 1]).await.unwrap(), 0);
        assert_eq!(served.await.unwrap().unwrap(), SessionEnd::Disconnected);
    }

    #[tokio::test]
    async fn entrust_refused_unless_listening() {
        let (_dir, server, _) = make_server(4096);
        let (client_stream, server_stream) = duplex(64 * 1024);
        tokio::spawn(async move { server.serve(server_stream, false).await });

        let mut client = NbdClient::connect(client_stream, FORMAT).await.unwrap();
        let err = client.entrust().await.unwrap_err();
        assert!(matches!(err, NbdError::PeerError { code: NBD_EINVAL }));
    }

    #[tokio::test]
    async fn entrust_then_disconnect_reports_entrusted() {
        let (_dir, server, _) = make_server(4096);
        let (client_stream, server_stream) = duplex(64 * 1024);
        let served = tokio::spawn(async move { server.serve(server_stream, true).await });

        let mut client = NbdClient::connect(client_stream, FORMAT).await.unwrap();
        client.write(0, &[0xCC; 512]).await.unwrap();
        client.entrust().await.unwrap();
        client.disconnect().await.unwrap();

        assert_eq!(served.await.unwrap().unwrap(), SessionEnd::Entrusted);
    }

    #[tokio::test]
    async fn entrust_then_eof_reports_entrusted() {
        let (_dir, server, _) = make_server(4096);
        let (client_stream, server_stream) = duplex(64 * 1024);
        let served = tokio::spawn(async move { server.serve(server_stream, true).await });

        let mut client = NbdClient::connect(client_stream, FORMAT).await.unwrap();
        client.entrust().await.unwrap();
        drop(client);

        assert_eq!(served.await.unwrap().unwrap(), SessionEnd::Entrusted);
    }

    #[tokio::test]
    async fn fua_write_is_applied() {
        let (_dir, server, _) = make_server(4096);
        let (client_stream, server_stream) = duplex(64 * 1024);
        tokio::spawn(async move { server.serve(server_stream, false).await });

        let mut client = NbdClient::connect(client_stream, FORMAT).await.unwrap();
        client.write_flags(0, &[0xEE; 512], true).await.unwrap();
        assert_eq!(&client.read(0, 512).await.unwrap()[..], &[0xEE; 512][..]);
    }
}
