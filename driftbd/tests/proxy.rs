//! Proxy-role behavior: transparent replay, single tenancy, prefetch.

mod common;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::sleep;

use driftbd::{Daemon, ProxyOptions, ProxyServer, WireConfig};
use nbd::{
    Hello, NbdClient, NbdError, NbdReply, NbdRequest, OffsetFormat, NBD_ENOSPC,
};

use common::{fast_timeouts, make_backing_file, test_config};

const FORMAT: OffsetFormat = OffsetFormat::BigEndian;

async fn start_upstream_daemon(
    contents: &[u8],
) -> (tempfile::TempDir, Arc<Daemon>, SocketAddr) {
    let dir = tempfile::tempdir().unwrap();
    let path = make_backing_file(&dir, "upstream.img", contents);
    let daemon = Daemon::open(test_config(path)).unwrap();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn({
        let daemon = daemon.clone();
        async move { daemon.run(listener).await }
    });
    (dir, daemon, addr)
}

async fn start_proxy(upstream: SocketAddr, prefetch: bool) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let opts = ProxyOptions {
        listen: addr.to_string(),
        upstream: upstream.to_string(),
        prefetch,
    };
    let mut proxy = ProxyServer::new(opts, &WireConfig::default(), fast_timeouts());
    tokio::spawn(async move { proxy.run_on(listener).await });
    addr
}

#[tokio::test]
async fn requests_are_proxied_with_error_codes_intact() {
    let (_dir, _daemon, upstream) = start_upstream_daemon(&vec![0u8; 64 * 1024]).await;
    let proxy = start_proxy(upstream, false).await;

    let stream = TcpStream::connect(proxy).await.unwrap();
    let mut client = NbdClient::connect(stream, FORMAT).await.unwrap();
    assert_eq!(client.size, 64 * 1024);

    client.write(4096, &[0xCD; 4096]).await.unwrap();
    let data = client.read(4096, 4096).await.unwrap();
    assert_eq!(&data[..], &[0xCD; 4096][..]);
    client.flush().await.unwrap();

    // Out-of-range goes upstream and its error comes back untouched:
    // an upstream error is a completed request, not a proxy failure.
    let err = client.write(client.size, &[1u8; 4096]).await.unwrap_err();
    assert!(matches!(err, NbdError::PeerError { code: NBD_ENOSPC }));

    // And the session survives it.
    client.write(0, &[2u8; 512]).await.unwrap();
}

#[tokio::test]
async fn upstream_death_mid_read_is_invisible_downstream() {
    const SIZE: u64 = 16 * 1024;
    let upstream_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let upstream_addr = upstream_listener.local_addr().unwrap();

    let fake_upstream = tokio::spawn(async move {
        // Startup connection: hello only.
        let (mut startup, _) = upstream_listener.accept().await.unwrap();
        startup
            .write_all(&Hello::for_device(SIZE).to_bytes())
            .await
            .unwrap();

        // The request arrives... and we die without replying.
        let mut first = [0u8; NbdRequest::SIZE_BYTES];
        startup.read_exact(&mut first).await.unwrap();
        drop(startup);

        // Reconnection: the proxy must replay the identical frame.
        let (mut second, _) = upstream_listener.accept().await.unwrap();
        second
            .write_all(&Hello::for_device(SIZE).to_bytes())
            .await
            .unwrap();
        let mut replayed = [0u8; NbdRequest::SIZE_BYTES];
        second.read_exact(&mut replayed).await.unwrap();
        assert_eq!(first, replayed, "replayed request differs from original");

        let req = NbdRequest::from_bytes(&replayed, FORMAT).unwrap();
        second
            .write_all(&NbdReply::ok(req.handle).to_bytes())
            .await
            .unwrap();
        second.write_all(&vec![0xEE; req.len as usize]).await.unwrap();
        second
    });

    let proxy = start_proxy(upstream_addr, false).await;
    let stream = TcpStream::connect(proxy).await.unwrap();
    let mut client = NbdClient::connect(stream, FORMAT).await.unwrap();

    // One read; the upstream dies and recovers underneath it.
    let data = client.read(0, 4096).await.unwrap();
    assert_eq!(&data[..], &[0xEE; 4096][..]);

    fake_upstream.await.unwrap();
}

#[tokio::test]
async fn upstream_death_mid_write_is_invisible_downstream() {
    const SIZE: u64 = 16 * 1024;
    let upstream_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let upstream_addr = upstream_listener.local_addr().unwrap();

    let fake_upstream = tokio::spawn(async move {
        let (mut startup, _) = upstream_listener.accept().await.unwrap();
        startup
            .write_all(&Hello::for_device(SIZE).to_bytes())
            .await
            .unwrap();

        // Take the header and the whole payload, then die before the
        // reply: the cruellest spot, since the data looked accepted.
        let mut first = vec![0u8; NbdRequest::SIZE_BYTES + 4096];
        startup.read_exact(&mut first).await.unwrap();
        drop(startup);

        let (mut second, _) = upstream_listener.accept().await.unwrap();
        second
            .write_all(&Hello::for_device(SIZE).to_bytes())
            .await
            .unwrap();
        let mut replayed = vec![0u8; NbdRequest::SIZE_BYTES + 4096];
        second.read_exact(&mut replayed).await.unwrap();
        assert_eq!(first, replayed, "replayed write differs from original");

        let header: [u8; NbdRequest::SIZE_BYTES] =
            replayed[..NbdRequest::SIZE_BYTES].try_into().unwrap();
        let req = NbdRequest::from_bytes(&header, FORMAT).unwrap();
        second
            .write_all(&NbdReply::ok(req.handle).to_bytes())
            .await
            .unwrap();
        second
    });

    let proxy = start_proxy(upstream_addr, false).await;
    let stream = TcpStream::connect(proxy).await.unwrap();
    let mut client = NbdClient::connect(stream, FORMAT).await.unwrap();

    client.write(512, &[0xAD; 4096]).await.unwrap();

    fake_upstream.await.unwrap();
}

#[tokio::test]
async fn a_second_downstream_client_is_refused() {
    let (_dir, _daemon, upstream) = start_upstream_daemon(&vec![0u8; 16 * 1024]).await;
    let proxy = start_proxy(upstream, false).await;

    let stream = TcpStream::connect(proxy).await.unwrap();
    let mut first = NbdClient::connect(stream, FORMAT).await.unwrap();
    first.write(0, &[1u8; 512]).await.unwrap();

    // The interloper is accepted and promptly dropped, without a hello.
    let mut second = TcpStream::connect(proxy).await.unwrap();
    let mut buf = [0u8; 1];
    assert_eq!(second.read(&mut buf).await.unwrap_or(0), 0);

    // The tenant is unharmed.
    assert_eq!(&first.read(0, 512).await.unwrap()[..], &[1u8; 512][..]);

    // Once the tenant leaves, the next client is admitted.
    first.disconnect().await.unwrap();
    drop(first);
    sleep(Duration::from_millis(50)).await;

    let stream = TcpStream::connect(proxy).await.unwrap();
    let mut third = NbdClient::connect(stream, FORMAT).await.unwrap();
    third.write(0, &[3u8; 512]).await.unwrap();
}

#[tokio::test]
async fn startup_fails_hard_when_upstream_is_down() {
    // Find a port with nothing behind it.
    let probe = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let dead_addr = probe.local_addr().unwrap();
    drop(probe);

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let opts = ProxyOptions {
        listen: listener.local_addr().unwrap().to_string(),
        upstream: dead_addr.to_string(),
        prefetch: false,
    };
    let mut proxy = ProxyServer::new(opts, &WireConfig::default(), fast_timeouts());
    assert!(proxy.run_on(listener).await.is_err());
}

#[tokio::test]
async fn prefetch_changes_latency_not_semantics() {
    const SIZE: usize = 64 * 1024;
    let pattern: Vec<u8> = (0..SIZE).map(|i| (i % 251) as u8).collect();
    let (_dir, _daemon, upstream) = start_upstream_daemon(&pattern).await;
    let proxy = start_proxy(upstream, true).await;

    let stream = TcpStream::connect(proxy).await.unwrap();
    let mut client = NbdClient::connect(stream, FORMAT).await.unwrap();

    // Sequential reads: the second one is the speculative half.
    let a = client.read(0, 4096).await.unwrap();
    assert_eq!(&a[..], &pattern[0..4096]);
    let b = client.read(4096, 4096).await.unwrap();
    assert_eq!(&b[..], &pattern[4096..8192]);

    // A write must not leave stale cached bytes observable.
    client.write(4096, &[0xAB; 4096]).await.unwrap();
    let c = client.read(4096, 4096).await.unwrap();
    assert_eq!(&c[..], &[0xAB; 4096][..]);

    // Unaligned read crossing the old cache range still works.
    let d = client.read(4000, 1000).await.unwrap();
    assert_eq!(&d[..96], &pattern[4000..4096]);
    assert_eq!(&d[96..], &[0xAB; 904][..]);
}
