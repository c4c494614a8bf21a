//! Listener trait and implementations for accepting NBD connections.
//!
//! Accepting is abstracted so the daemon can serve TCP sockets in
//! production, Unix sockets locally, and channel-fed in-memory streams in
//! tests. Each accept also surfaces the peer's IP when the transport has
//! one, so the allow-list can be checked before any protocol bytes flow;
//! transports without addresses (Unix, in-memory) bypass the list.

use std::net::IpAddr;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

#[cfg(unix)]
use tokio::net::{UnixListener, UnixStream};

/// Trait for accepting incoming connections.
#[async_trait]
pub trait Listener: Send {
    type Stream: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    /// Accept the next incoming connection and its peer address, when
    /// the transport knows one.
    async fn accept(&mut self) -> std::io::Result<(Self::Stream, Option<IpAddr>)>;
}

#[async_trait]
impl Listener for TcpListener {
    type Stream = TcpStream;

    async fn accept(&mut self) -> std::io::Result<(Self::Stream, Option<IpAddr>)> {
        let (stream, addr) = TcpListener::accept(self).await?;
        // Replies are tiny and latency-bound; never coalesce them.
        stream.set_nodelay(true)?;
        Ok((stream, Some(addr.ip())))
    }
}

#[cfg(unix)]
#[async_trait]
impl Listener for UnixListener {
    type Stream = UnixStream;

    async fn accept(&mut self) -> std::io::Result<(Self::Stream, Option<IpAddr>)> {
        UnixListener::accept(self)
            .await
            .map(|(stream, _addr)| (stream, None))
    }
}

/// A listener that accepts streams from a channel.
///
/// Tests push `tokio::io::duplex` halves through the sender and the
/// daemon serves them as if they were sockets.
pub struct StreamListener<S> {
    rx: mpsc::Receiver<S>,
}

impl<S> StreamListener<S> {
    /// Create a new stream listener with the given buffer capacity.
    ///
    /// Returns the sender half for pushing streams and the listener.
    pub fn new(buffer: usize) -> (mpsc::Sender<S>, Self) {
        let (tx, rx) = mpsc::channel(buffer);
        (tx, Self { rx })
    }
}

#[async_trait]
impl<S> Listener for StreamListener<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    type Stream = S;

    async fn accept(&mut self) -> std::io::Result<(Self::Stream, Option<IpAddr>)> {
        self.rx
            .recv()
            .await
            .map(|stream| (stream, None))
            .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::BrokenPipe, "channel closed"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[tokio::test]
    async fn stream_listener_accepts_in_order_without_addresses() {
        let (tx, mut listener) = StreamListener::new(2);

        let (_c1, server1) = duplex(1024);
        let (_c2, server2) = duplex(1024);
        tx.send(server1).await.unwrap();
        tx.send(server2).await.unwrap();

        let (_stream, addr) = listener.accept().await.unwrap();
        assert!(addr.is_none());
        listener.accept().await.unwrap();
    }

    #[tokio::test]
    async fn stream_listener_errors_when_closed() {
        let (tx, mut listener) = StreamListener::<tokio::io::DuplexStream>::new(1);
        drop(tx);

        let result = listener.accept().await;
        assert_eq!(
            result.unwrap_err().kind(),
            std::io::ErrorKind::BrokenPipe
        );
    }

    #[tokio::test]
    async fn tcp_listener_reports_peer_ip() {
        let mut listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let _client = TcpStream::connect(addr).await.unwrap();
        let (_stream, peer) = Listener::accept(&mut listener).await.unwrap();
        assert_eq!(peer, Some("127.0.0.1".parse().unwrap()));
    }
}
