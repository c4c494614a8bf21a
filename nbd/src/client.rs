//! Async NBD client.
//!
//! Connects to an oldstyle server, reads its hello, and issues
//! transmission requests. Used by the migration sender for the copy
//! stream and by tests as an ordinary client.

use std::sync::atomic::{AtomicU64, Ordering};

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::protocol::*;

/// Read a full hello frame, mapping a short read to [`NbdError::Truncated`].
pub async fn read_hello<S>(stream: &mut S) -> Result<Hello, NbdError>
where
    S: AsyncRead + Unpin,
{
    let mut buf = [0u8; Hello::SIZE_BYTES];
    let mut got = 0;
    while got < buf.len() {
        let n = stream.read(&mut buf[got..]).await?;
        if n == 0 {
            return Err(NbdError::Truncated {
                wanted: Hello::SIZE_BYTES,
                got,
            });
        }
        got += n;
    }
    Hello::from_bytes(&buf)
}

/// NBD client over any async stream.
#[derive(Debug)]
pub struct NbdClient<S> {
    stream: S,
    format: OffsetFormat,
    handle_counter: AtomicU64,
    /// Size of the device in bytes, as advertised by the server.
    pub size: u64,
    /// Capability flags from the hello.
    pub flags: u32,
}

impl<S> NbdClient<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Perform the hello exchange and return a ready client.
    pub async fn connect(mut stream: S, format: OffsetFormat) -> Result<Self, NbdError> {
        let hello = read_hello(&mut stream).await?;
        Ok(Self {
            stream,
            format,
            handle_counter: AtomicU64::new(1),
            size: hello.size,
            flags: hello.flags,
        })
    }

    fn next_handle(&self) -> u64 {
        self.handle_counter.fetch_add(1, Ordering::SeqCst)
    }

    async fn send_request(&mut self, req: NbdRequest) -> Result<(), NbdError> {
        self.stream.write_all(&req.to_bytes(self.format)).await?;
        Ok(())
    }

    async fn read_reply(&mut self, handle: u64) -> Result<NbdReply, NbdError> {
        let mut buf = [0u8; NbdReply::SIZE_BYTES];
        self.stream.read_exact(&mut buf).await?;
        let reply = NbdReply::from_bytes(&buf)?;
        if reply.handle != handle {
            return Err(NbdError::HandleMismatch {
                expected: handle,
                actual: reply.handle,
            });
        }
        Ok(reply)
    }

    async fn expect_ok(&mut self, handle: u64) -> Result<(), NbdError> {
        let reply = self.read_reply(handle).await?;
        if !reply.is_ok() {
            return Err(NbdError::PeerError { code: reply.error });
        }
        Ok(())
    }

    /// Read `len` bytes starting at `offset`.
    pub async fn read(&mut self, offset: u64, len: u32) -> Result<Bytes, NbdError> {
        let handle = self.next_handle();
        self.send_request(NbdRequest::read(handle, offset, len)).await?;
        self.expect_ok(handle).await?;

        let mut data = BytesMut::zeroed(len as usize);
        self.stream.read_exact(&mut data).await?;
        Ok(data.freeze())
    }

    /// Write `data` at `offset`.
    pub async fn write(&mut self, offset: u64, data: &[u8]) -> Result<(), NbdError> {
        self.write_flags(offset, data, false).await
    }

    /// Write `data` at `offset`, optionally demanding it reach stable
    /// storage before the reply.
    pub async fn write_flags(
        &mut self,
        offset: u64,
        data: &[u8],
        fua: bool,
    ) -> Result<(), NbdError> {
        let handle = self.next_handle();
        self.send_request(NbdRequest::write(handle, offset, data.len() as u32, fua))
            .await?;
        self.stream.write_all(data).await?;
        self.expect_ok(handle).await
    }

    /// Flush the whole device.
    pub async fn flush(&mut self) -> Result<(), NbdError> {
        let handle = self.next_handle();
        self.send_request(NbdRequest::flush(handle)).await?;
        self.expect_ok(handle).await
    }

    /// Offer the peer authority over the device.
    ///
    /// A success reply means the peer has accepted; an error reply is the
    /// peer exercising its veto.
    pub async fn entrust(&mut self) -> Result<(), NbdError> {
        let handle = self.next_handle();
        self.send_request(NbdRequest::entrust(handle)).await?;
        self.expect_ok(handle).await
    }

    /// Send a disconnect request. No reply is defined for it.
    pub async fn disconnect(&mut self) -> Result<(), NbdError> {
        self.send_request(NbdRequest::disconnect()).await?;
        self.stream.flush().await?;
        Ok(())
    }

    pub fn supports_flush(&self) -> bool {
        self.flags & FLAG_SEND_FLUSH != 0
    }

    pub fn supports_fua(&self) -> bool {
        self.flags & FLAG_SEND_FUA != 0
    }
}
