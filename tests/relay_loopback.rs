//! A real relay between a live client and a fake upstream server over loopback TCP.

mod common;

use anyhow::{Context, Result, ensure};
use parking_lot::Mutex;
use relaytap::connection::live::{DialOptions, LiveConnection, ServeOptions};
use relaytap::relay::Relay;
use relaytap::{
    CaptureArchive, CaptureWriter, Connection, PackCache, Packet, PacketFunc, PacketHeader,
    RelayConfig, RelayError, Relaytap, ResourcePack,
};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

const SPAWN_TIMEOUT: Duration = Duration::from_secs(10);

fn loopback_config(root: &Path) -> Result<RelayConfig> {
    Ok(RelayConfig {
        listen_address: "127.0.0.1:0".parse()?,
        pack_cache_dir: Some(root.join("packs")),
        spawn_timeout_secs: 10,
        queue_capacity: 16,
        chunk_size: 512,
        ..RelayConfig::default()
    })
}

/// Serves one client, answers its ping and hangs up with a disconnect.
async fn fake_upstream(
    listener: TcpListener,
    game_id: u64,
    packs: Vec<ResourcePack>,
) -> relaytap::Result<Vec<Packet>> {
    let (stream, _) = listener.accept().await?;
    let pending = LiveConnection::accept(stream, None).await?;
    assert_eq!(pending.identity(), &common::identity());
    let server = pending.start(ServeOptions {
        game_data: common::game_data(game_id),
        packs,
        chunk_size: 1000,
        queue_capacity: 16,
    })?;
    server.do_spawn_timeout(SPAWN_TIMEOUT).await?;

    let mut received = vec![server.read_packet().await?];
    server.write_packet(common::opaque(0xa1, b"pong")).await?;
    server.write_packet(Packet::Disconnect { message: "server closing".to_string() }).await?;

    loop {
        match server.read_packet().await {
            Ok(packet) => received.push(packet),
            Err(RelayError::ConnectionClosed) => break,
            Err(e) => return Err(e),
        }
    }
    server.close().await?;
    Ok(received)
}

/// Serves one client, reports its first packet and then only listens until closed.
async fn quiet_upstream(
    listener: TcpListener,
    first_packet: oneshot::Sender<Packet>,
) -> relaytap::Result<()> {
    let (stream, _) = listener.accept().await?;
    let server = LiveConnection::accept(stream, None).await?.start(ServeOptions {
        game_data: common::game_data(12),
        ..ServeOptions::default()
    })?;
    server.do_spawn_timeout(SPAWN_TIMEOUT).await?;
    let _ = first_packet.send(server.read_packet().await?);

    loop {
        match server.read_packet().await {
            Ok(_) => {}
            Err(RelayError::ConnectionClosed) => return Ok(()),
            Err(e) => return Err(e),
        }
    }
}

fn client_options() -> DialOptions {
    DialOptions {
        identity: common::identity(),
        cache: Arc::new(PackCache::new()),
        hook: None,
        queue_capacity: 16,
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn relayed_session_is_forwarded_and_captured() -> Result<()> {
    let _ = tracing_subscriber::fmt::try_init();
    let dir = tempfile::tempdir()?;
    let packs = vec![common::pack("alpha", 2500)];

    let upstream_listener = TcpListener::bind("127.0.0.1:0").await?;
    let upstream_addr = upstream_listener.local_addr()?;
    let upstream = tokio::spawn(fake_upstream(upstream_listener, 55, packs.clone()));

    let seen: Arc<Mutex<Vec<(u16, SocketAddr)>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let hook: PacketFunc =
        Arc::new(move |header: &PacketHeader, _: &[u8], _: SocketAddr, dst: SocketAddr| {
            sink.lock().push((header.packet_id, dst));
        });

    let capture_path = dir.path().join("captures").join("session.pcap2");
    let capture = Arc::new(CaptureWriter::create(&capture_path)?);
    let bound = Relay::new(loopback_config(dir.path())?)
        .with_packet_func(hook)
        .with_capture(Arc::clone(&capture))
        .bind()
        .await?;
    let relay_addr = bound.local_addr();
    let cancel = CancellationToken::new();
    let relay = {
        let cancel = cancel.clone();
        let target = upstream_addr.to_string();
        tokio::spawn(async move { bound.serve(cancel, &target).await })
    };

    let client = LiveConnection::dial(relay_addr, client_options()).await?;
    client.do_spawn_timeout(SPAWN_TIMEOUT).await.context("client did not spawn")?;
    assert_eq!(client.game_data(), common::game_data(55));
    assert_eq!(client.resource_packs(), packs);

    client.write_packet(common::opaque(0xa0, b"ping")).await?;
    assert_eq!(client.read_packet().await?, common::opaque(0xa1, b"pong"));
    assert!(matches!(client.read_packet().await?, Packet::Disconnect { .. }));
    assert!(matches!(client.read_packet().await, Err(RelayError::ConnectionClosed)));

    tokio::time::timeout(SPAWN_TIMEOUT, relay).await?.context("relay panicked")??;
    let upstream_received = upstream.await.context("upstream panicked")??;
    assert_eq!(upstream_received, vec![common::opaque(0xa0, b"ping")]);

    // The hook saw the upstream leg only: the ping went to the server.
    ensure!(seen.lock().contains(&(0xa0, upstream_addr)), "ping not observed");
    ensure!(seen.lock().iter().all(|(id, dst)| *id != 0xa1 || *dst != upstream_addr));

    // Downloaded packs land in the configured on-disk cache.
    ensure!(dir.path().join("packs").join("alpha_1.0.0.pack").exists());

    ensure!(capture.is_finished());
    let archive = CaptureArchive::open(&capture_path).await?;
    let bundled: Vec<&str> = archive.pack_entries().iter().map(|e| e.uuid.as_str()).collect();
    assert_eq!(bundled, vec!["alpha"]);

    let replay = Relaytap::replay(&capture_path).await?;
    replay.do_spawn_timeout(SPAWN_TIMEOUT).await.context("capture did not replay")?;
    assert_eq!(replay.game_data(), common::game_data(55));
    assert_eq!(replay.identity_data(), common::identity());
    assert_eq!(replay.resource_packs(), packs);

    let mut after_spawn = Vec::new();
    while let Ok(packet) = replay.read_packet().await {
        after_spawn.push(packet);
    }
    assert_eq!(after_spawn.len(), 3, "{:?}", after_spawn);
    assert_eq!(after_spawn[0], common::opaque(0xa0, b"ping"));
    assert_eq!(after_spawn[1], common::opaque(0xa1, b"pong"));
    assert!(matches!(after_spawn[2], Packet::Disconnect { .. }));
    Ok(())
}

#[tokio::test]
async fn cancelling_before_a_client_connects_finishes_the_capture() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let capture_path = dir.path().join("idle.pcap2");
    let capture = Arc::new(CaptureWriter::create(&capture_path)?);

    let bound = Relay::new(loopback_config(dir.path())?)
        .with_capture(Arc::clone(&capture))
        .bind()
        .await?;
    let cancel = CancellationToken::new();
    let serving = {
        let cancel = cancel.clone();
        tokio::spawn(async move { bound.serve(cancel, "127.0.0.1:9").await })
    };

    cancel.cancel();
    tokio::time::timeout(SPAWN_TIMEOUT, serving).await?.context("relay panicked")??;

    ensure!(capture.is_finished());
    let (frames, error) = CaptureArchive::open(&capture_path).await?.read_all().await?;
    ensure!(frames.is_empty() && error.is_none());
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cancelling_mid_session_closes_both_legs() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let upstream_listener = TcpListener::bind("127.0.0.1:0").await?;
    let upstream_addr = upstream_listener.local_addr()?;
    let (relaying_tx, relaying_rx) = oneshot::channel();

    let upstream = tokio::spawn(quiet_upstream(upstream_listener, relaying_tx));

    let capture_path = dir.path().join("cancelled.pcap2");
    let capture = Arc::new(CaptureWriter::create(&capture_path)?);
    let bound = Relay::new(loopback_config(dir.path())?)
        .with_capture(Arc::clone(&capture))
        .bind()
        .await?;
    let relay_addr = bound.local_addr();
    let cancel = CancellationToken::new();
    let relay = {
        let cancel = cancel.clone();
        let target = upstream_addr.to_string();
        tokio::spawn(async move { bound.serve(cancel, &target).await })
    };

    let client = LiveConnection::dial(relay_addr, client_options()).await?;
    client.do_spawn_timeout(SPAWN_TIMEOUT).await.context("client did not spawn")?;
    client.write_packet(common::opaque(0xa0, b"ping")).await?;
    let first = tokio::time::timeout(SPAWN_TIMEOUT, relaying_rx).await?.context("upstream ended")?;
    assert_eq!(first, common::opaque(0xa0, b"ping"));

    cancel.cancel();

    let read = tokio::time::timeout(SPAWN_TIMEOUT, client.read_packet()).await?;
    assert!(matches!(read, Err(RelayError::ConnectionClosed)), "{:?}", read);
    tokio::time::timeout(SPAWN_TIMEOUT, relay).await?.context("relay panicked")??;
    tokio::time::timeout(SPAWN_TIMEOUT, upstream).await?.context("upstream panicked")??;

    ensure!(capture.is_finished());
    let (frames, error) = CaptureArchive::open(&capture_path).await?.read_all().await?;
    ensure!(error.is_none(), "capture damaged: {:?}", error);
    ensure!(frames.iter().any(|frame| frame.payload.ends_with(b"ping")), "ping not captured");
    Ok(())
}

#[tokio::test]
async fn unreachable_upstream_fails_the_session() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let closed = TcpListener::bind("127.0.0.1:0").await?;
    let closed_addr = closed.local_addr()?;
    drop(closed);

    let bound = Relay::new(loopback_config(dir.path())?).bind().await?;
    let relay_addr = bound.local_addr();
    let serving = {
        let target = closed_addr.to_string();
        tokio::spawn(async move { bound.serve(CancellationToken::new(), &target).await })
    };

    let client = LiveConnection::dial(relay_addr, client_options()).await?;
    let outcome = tokio::time::timeout(SPAWN_TIMEOUT, serving).await?.context("relay panicked")?;
    match outcome {
        Err(e @ RelayError::Connection { .. }) => ensure!(e.is_retryable()),
        other => panic!("expected a connection error, got {:?}", other),
    }

    let spawn = client.do_spawn_timeout(SPAWN_TIMEOUT).await;
    assert!(matches!(spawn, Err(RelayError::ConnectionClosed)), "{:?}", spawn);
    Ok(())
}

#[test]
fn invalid_configuration_is_rejected_before_binding() {
    let config = RelayConfig { queue_capacity: 0, ..RelayConfig::default() };
    let runtime = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
    let result = runtime.block_on(Relay::new(config).bind());
    assert!(matches!(result, Err(RelayError::Config { .. })));
}
