//! Relay core
//!
//! Accepts one local client, logs in to the upstream server on its behalf, serves the
//! upstream's game data and packs back to the client, then pumps packets both ways
//! until either side leaves or the caller cancels.
//!
//! ```text
//! client ──TCP──▶ [LiveConnection: server role] ◀─pumps─▶ [LiveConnection: client role] ──TCP──▶ server
//!                                                                 │
//!                                                     hook + CaptureWriter
//! ```

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::capture::{CaptureWriter, Direction};
use crate::config::RelayConfig;
use crate::connection::live::{DialOptions, LiveConnection, ServeOptions};
use crate::connection::{Connection, PacketFunc};
use crate::packs::PackCache;
use crate::protocol::codec::HEADER_SIZE;
use crate::protocol::{Packet, PacketHeader};
use crate::{RelayError, Result};

/// A relay waiting to be bound.
pub struct Relay {
    config: RelayConfig,
    hook: Option<PacketFunc>,
    capture: Option<Arc<CaptureWriter>>,
}

impl Relay {
    pub fn new(config: RelayConfig) -> Self {
        Self { config, hook: None, capture: None }
    }

    /// Observe every frame exchanged with the upstream server.
    pub fn with_packet_func(mut self, hook: PacketFunc) -> Self {
        self.hook = Some(hook);
        self
    }

    /// Record the upstream session into `capture`.
    pub fn with_capture(mut self, capture: Arc<CaptureWriter>) -> Self {
        self.capture = Some(capture);
        self
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    /// Bind the listen address without accepting yet.
    pub async fn bind(self) -> Result<BoundRelay> {
        self.config.validate()?;
        let address = self.config.listen_address;
        let listener = TcpListener::bind(address)
            .await
            .map_err(|e| RelayError::connection_failed(address.to_string(), e))?;
        let local_addr =
            listener.local_addr().map_err(|e| RelayError::io_error("listener address", e))?;
        info!("Listening on {}", local_addr);
        Ok(BoundRelay { relay: self, listener, local_addr })
    }

    /// Bind, then relay one client session to `server_address`.
    pub async fn run(self, cancel: CancellationToken, server_address: &str) -> Result<()> {
        self.bind().await?.serve(cancel, server_address).await
    }
}

/// A relay with a bound listener.
pub struct BoundRelay {
    relay: Relay,
    listener: TcpListener,
    local_addr: SocketAddr,
}

impl BoundRelay {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Accept one client and relay it to `server_address`.
    ///
    /// Setup failures (unreachable server, failed login) are returned. Failures after
    /// both sides spawned end the session and are only logged.
    pub async fn serve(self, cancel: CancellationToken, server_address: &str) -> Result<()> {
        let result = self.serve_session(&cancel, server_address).await;
        if let Some(capture) = &self.relay.capture {
            if let Err(e) = capture.finish() {
                warn!("Failed to finish capture: {}", e);
            }
        }
        result
    }

    async fn serve_session(&self, cancel: &CancellationToken, server_address: &str) -> Result<()> {
        let config = &self.relay.config;

        let (stream, peer) = tokio::select! {
            _ = cancel.cancelled() => {
                info!("Relay cancelled before a client connected");
                return Ok(());
            }
            accepted = self.listener.accept() => {
                accepted.map_err(|e| RelayError::io_error("accepting client", e))?
            }
        };
        info!("Client connected from {}", peer);

        let pending = LiveConnection::accept(stream, None).await?;
        let server_addr = resolve(server_address).await?;

        let cache = match &config.pack_cache_dir {
            Some(dir) => PackCache::open(dir)?,
            None => PackCache::new(),
        };
        let upstream = Arc::new(
            LiveConnection::dial(
                server_addr,
                DialOptions {
                    identity: pending.identity().clone(),
                    cache: Arc::new(cache),
                    hook: self.upstream_hook(server_addr),
                    queue_capacity: config.queue_capacity,
                },
            )
            .await?,
        );

        if let Err(e) = wait_spawned(upstream.as_ref(), cancel, config).await {
            let _ = upstream.close().await;
            return Err(e);
        }
        let packs = upstream.resource_packs();
        info!(
            world = %upstream.game_data().world_name,
            packs = packs.len(),
            "Upstream session spawned"
        );
        if let Some(capture) = &self.relay.capture {
            for pack in &packs {
                capture.add_pack(pack.clone());
            }
        }

        let client = match pending.start(ServeOptions {
            game_data: upstream.game_data(),
            packs,
            chunk_size: config.chunk_size,
            queue_capacity: config.queue_capacity,
        }) {
            Ok(client) => Arc::new(client),
            Err(e) => {
                let _ = upstream.close().await;
                return Err(e);
            }
        };
        if let Err(e) = wait_spawned(client.as_ref(), cancel, config).await {
            let _ = client.close().await;
            let _ = upstream.close().await;
            return Err(e);
        }
        info!("Client spawned, relaying");

        let client: Arc<dyn Connection> = client;
        let upstream: Arc<dyn Connection> = upstream;
        run_pumps(client, upstream, cancel).await;
        Ok(())
    }

    /// Hook for the upstream connection: the user hook, then the capture.
    fn upstream_hook(&self, server_addr: SocketAddr) -> Option<PacketFunc> {
        let user = self.relay.hook.clone();
        let capture = self.relay.capture.clone();
        if user.is_none() && capture.is_none() {
            return None;
        }

        let hook = move |header: &PacketHeader, body: &[u8], src: SocketAddr, dst: SocketAddr| {
            if let Some(user) = &user {
                user(header, body, src, dst);
            }
            if let Some(capture) = &capture {
                let direction =
                    if dst == server_addr { Direction::ToServer } else { Direction::ToClient };
                let mut frame = Vec::with_capacity(HEADER_SIZE + body.len());
                frame.extend_from_slice(&header.to_bytes());
                frame.extend_from_slice(body);
                capture.record(direction, &frame);
            }
        };
        Some(Arc::new(hook))
    }
}

async fn resolve(server_address: &str) -> Result<SocketAddr> {
    let mut addresses = tokio::net::lookup_host(server_address)
        .await
        .map_err(|e| RelayError::connection_failed(server_address, e))?;
    addresses.next().ok_or_else(|| RelayError::Connection {
        address: server_address.to_string(),
        reason: "no addresses resolved".to_string(),
        source: None,
    })
}

async fn wait_spawned(
    conn: &dyn Connection,
    cancel: &CancellationToken,
    config: &RelayConfig,
) -> Result<()> {
    tokio::select! {
        _ = cancel.cancelled() => Err(RelayError::ConnectionClosed),
        result = conn.do_spawn_timeout(config.spawn_timeout()) => result,
    }
}

/// Closes both sides of a session exactly once.
struct CloseGuard {
    closed: AtomicBool,
    client: Arc<dyn Connection>,
    upstream: Arc<dyn Connection>,
}

impl CloseGuard {
    async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!("Closing relay session");
        if let Err(e) = self.client.close().await {
            debug!("Closing client: {}", e);
        }
        if let Err(e) = self.upstream.close().await {
            debug!("Closing upstream: {}", e);
        }
    }
}

async fn run_pumps(
    client: Arc<dyn Connection>,
    upstream: Arc<dyn Connection>,
    cancel: &CancellationToken,
) {
    let session = cancel.child_token();
    let guard = Arc::new(CloseGuard {
        closed: AtomicBool::new(false),
        client: Arc::clone(&client),
        upstream: Arc::clone(&upstream),
    });

    let to_server = tokio::spawn(pump(
        Arc::clone(&client),
        Arc::clone(&upstream),
        "client→server",
        session.clone(),
        Arc::clone(&guard),
    ));
    let to_client = tokio::spawn(pump(
        Arc::clone(&upstream),
        Arc::clone(&client),
        "server→client",
        session.clone(),
        Arc::clone(&guard),
    ));

    for handle in [to_server, to_client] {
        if let Err(e) = handle.await {
            error!("Relay pump panicked: {}", e);
        }
    }
    guard.close().await;
    info!("Relay session ended");
}

/// Forward packets from `from` to `to` until either side or the session ends.
async fn pump(
    from: Arc<dyn Connection>,
    to: Arc<dyn Connection>,
    label: &'static str,
    session: CancellationToken,
    guard: Arc<CloseGuard>,
) {
    let mut forwarded = 0u64;
    let outcome = loop {
        let packet = tokio::select! {
            _ = session.cancelled() => break Ok(()),
            packet = from.read_packet() => packet,
        };
        let packet = match packet {
            Ok(packet) => packet,
            Err(RelayError::ConnectionClosed) => break Ok(()),
            Err(e) => break Err(e),
        };

        let disconnect = matches!(packet, Packet::Disconnect { .. });
        if let Err(e) = to.write_packet(packet).await {
            break match e {
                RelayError::ConnectionClosed => Ok(()),
                other => Err(other),
            };
        }
        forwarded += 1;
        if disconnect {
            info!("{}: disconnect forwarded", label);
            break Ok(());
        }
    };

    match outcome {
        Ok(()) => debug!("{} pump stopped after {} packets", label, forwarded),
        Err(e) => error!("{} pump failed after {} packets: {}", label, forwarded, e),
    }
    session.cancel();
    guard.close().await;
}
