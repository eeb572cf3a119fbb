//! Connection contract shared by live and replayed sessions.
//!
//! Two implementations exist: [`LiveConnection`](live::LiveConnection) speaks to a
//! real peer over TCP, [`ReplayConnection`](replay::ReplayConnection) reconstructs a
//! session from a capture container. Relay and consumer code only ever sees
//! [`Connection`].

use async_trait::async_trait;
use futures::Stream;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::Result;
use crate::packs::ResourcePack;
use crate::protocol::{GameData, IdentityData, Packet, PacketHeader, Protocol};

pub mod live;
pub mod login;
pub mod replay;
pub mod spawn;


pub use login::{ClientLogin, Handshake, LoginEvent, LoginStep, ServerLogin};
pub use spawn::SpawnSignal;

/// Per-frame interception hook: `(header, payload, source, destination)`.
///
/// Called for every frame before it is decoded or sent, in both directions.
pub type PacketFunc = Arc<dyn Fn(&PacketHeader, &[u8], SocketAddr, SocketAddr) + Send + Sync>;

/// Capabilities of a protocol session, live or replayed.
#[async_trait]
pub trait Connection: Send + Sync + 'static {
    /// Next post-login packet, in arrival order.
    ///
    /// Fails with [`RelayError::ConnectionClosed`](crate::RelayError::ConnectionClosed)
    /// once the connection is closed or exhausted.
    async fn read_packet(&self) -> Result<Packet>;

    /// Send a packet to the peer. Replay accepts and discards it.
    async fn write_packet(&self, packet: Packet) -> Result<()>;

    fn spawn_signal(&self) -> &SpawnSignal;

    /// Wait for the login sequence to complete.
    async fn do_spawn(&self) -> Result<()> {
        self.spawn_signal().wait().await
    }

    /// [`Connection::do_spawn`], abandoned when `cancel` fires.
    async fn do_spawn_until(&self, cancel: &CancellationToken) -> Result<()> {
        self.spawn_signal().wait_until(cancel).await
    }

    /// [`Connection::do_spawn`], abandoned after `timeout`.
    async fn do_spawn_timeout(&self, timeout: Duration) -> Result<()> {
        self.spawn_signal().wait_timeout(timeout).await
    }

    /// World settings from the start-of-game message (default until received).
    fn game_data(&self) -> GameData;

    fn identity_data(&self) -> IdentityData;

    /// Resolved resource packs in stack order.
    fn resource_packs(&self) -> Vec<ResourcePack>;

    fn protocol(&self) -> Protocol {
        Protocol::CURRENT
    }

    fn local_addr(&self) -> SocketAddr;

    fn remote_addr(&self) -> SocketAddr;

    fn authenticated(&self) -> bool;

    fn packet_func(&self) -> Option<&PacketFunc>;

    /// Close the connection. Idempotent; unblocks pending reads and spawn waits.
    async fn close(&self) -> Result<()>;

    fn is_closed(&self) -> bool;
}

/// Adapt a connection into a stream of packets ending when the connection does.
pub fn packet_stream(conn: Arc<dyn Connection>) -> impl Stream<Item = Packet> + Send + 'static {
    futures::stream::unfold(conn, |conn| async move {
        match conn.read_packet().await {
            Ok(packet) => Some((packet, conn)),
            Err(e) => {
                debug!("Packet stream ended: {}", e);
                None
            }
        }
    })
}

/// Session facts accumulated from login events.
#[derive(Debug, Default)]
pub(crate) struct SessionData {
    pub(crate) game_data: GameData,
    pub(crate) identity: IdentityData,
    pub(crate) packs: Vec<ResourcePack>,
}

impl SessionData {
    /// Record events, returning whether one of them was the spawn.
    pub(crate) fn apply(&mut self, events: Vec<LoginEvent>) -> bool {
        let mut spawned = false;
        for event in events {
            match event {
                LoginEvent::Identified(identity) => self.identity = identity,
                LoginEvent::PacksResolved(packs) => self.packs = packs,
                LoginEvent::GameStarted(game_data) => self.game_data = game_data,
                LoginEvent::Spawned => spawned = true,
            }
        }
        spawned
    }
}
