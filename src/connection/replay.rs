//! Replay connection reconstructed from a capture container

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncRead;
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use super::{ClientLogin, Connection, Handshake, PacketFunc, SessionData, SpawnSignal};
use crate::capture::{CaptureArchive, Direction, FrameReader};
use crate::packs::{PackCache, ResourcePack};
use crate::protocol::{GameData, IdentityData, Packet, codec};
use crate::{RelayError, Result};

/// Synthetic address of the captured client.
pub const REPLAY_LOCAL_ADDR: SocketAddr = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(1, 1, 1, 1)), 0);
/// Synthetic address of the captured server.
pub const REPLAY_REMOTE_ADDR: SocketAddr = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(2, 2, 2, 2)), 0);

/// Options for [`ReplayConnection::open_with`].
#[derive(Clone)]
pub struct ReplayOptions {
    /// Invoked for every captured frame, login included.
    pub hook: Option<PacketFunc>,
    /// Bound of the post-login hand-off queue.
    pub queue_capacity: usize,
}

impl Default for ReplayOptions {
    fn default() -> Self {
        Self { hook: None, queue_capacity: 256 }
    }
}

impl std::fmt::Debug for ReplayOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplayOptions")
            .field("hook", &self.hook.is_some())
            .field("queue_capacity", &self.queue_capacity)
            .finish()
    }
}

/// Read-only connection replaying a capture
pub struct ReplayConnection {
    path: PathBuf,
    session: Arc<RwLock<SessionData>>,
    spawn: Arc<SpawnSignal>,
    packets: Mutex<mpsc::Receiver<Packet>>,
    cache: Arc<PackCache>,
    hook: Option<PacketFunc>,
    cancel: CancellationToken,
}

impl ReplayConnection {
    /// Open a capture for replay with default options.
    pub async fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::open_with(path, ReplayOptions::default()).await
    }

    /// Open a capture for replay.
    ///
    /// Fails immediately when the container header is foreign or of another version.
    /// The login sequence is then re-run in the background; use
    /// [`Connection::do_spawn`] to wait for it.
    pub async fn open_with<P: AsRef<Path>>(path: P, options: ReplayOptions) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        info!("Opening capture for replay: {}", path.display());

        let archive = CaptureArchive::open(&path).await?;
        let cache = Arc::new(PackCache::new());
        let bundled = cache.load_directory(&archive);
        let frames = archive.frames().await?;

        let (tx, rx) = mpsc::channel(options.queue_capacity.max(1));
        let session = Arc::new(RwLock::new(SessionData::default()));
        let spawn = Arc::new(SpawnSignal::new());
        let cancel = CancellationToken::new();

        let decoder = Decoder {
            login: ClientLogin::new(None, Arc::clone(&cache)),
            session: Arc::clone(&session),
            spawn: Arc::clone(&spawn),
            packets: tx,
            hook: options.hook.clone(),
            cancel: cancel.clone(),
        };
        tokio::spawn(decoder.run(frames));

        info!("Replay connection opened ({} bundled packs)", bundled);
        Ok(Self { path, session, spawn, packets: Mutex::new(rx), cache, hook: options.hook, cancel })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Pack cache populated from the container's pack directory.
    pub fn pack_cache(&self) -> &Arc<PackCache> {
        &self.cache
    }
}

#[async_trait]
impl Connection for ReplayConnection {
    async fn read_packet(&self) -> Result<Packet> {
        let mut packets = self.packets.lock().await;
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(RelayError::ConnectionClosed),
            packet = packets.recv() => packet.ok_or(RelayError::ConnectionClosed),
        }
    }

    async fn write_packet(&self, packet: Packet) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(RelayError::ConnectionClosed);
        }
        trace!("Discarding {} written to replay", packet.name());
        Ok(())
    }

    fn spawn_signal(&self) -> &SpawnSignal {
        &self.spawn
    }

    fn game_data(&self) -> GameData {
        self.session.read().game_data.clone()
    }

    fn identity_data(&self) -> IdentityData {
        self.session.read().identity.clone()
    }

    fn resource_packs(&self) -> Vec<ResourcePack> {
        self.session.read().packs.clone()
    }

    fn local_addr(&self) -> SocketAddr {
        REPLAY_LOCAL_ADDR
    }

    fn remote_addr(&self) -> SocketAddr {
        REPLAY_REMOTE_ADDR
    }

    fn authenticated(&self) -> bool {
        true
    }

    fn packet_func(&self) -> Option<&PacketFunc> {
        self.hook.as_ref()
    }

    async fn close(&self) -> Result<()> {
        if !self.cancel.is_cancelled() {
            debug!("Closing replay of {}", self.path.display());
        }
        self.cancel.cancel();
        self.spawn.close();
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

impl Drop for ReplayConnection {
    fn drop(&mut self) {
        debug!("Dropping replay connection");
        self.cancel.cancel();
    }
}

/// Single reader of the frame log.
struct Decoder {
    login: ClientLogin,
    session: Arc<RwLock<SessionData>>,
    spawn: Arc<SpawnSignal>,
    packets: mpsc::Sender<Packet>,
    hook: Option<PacketFunc>,
    cancel: CancellationToken,
}

impl Decoder {
    async fn run<R: AsyncRead + Unpin>(mut self, mut frames: FrameReader<R>) {
        info!("Replay decode loop started");
        let mut delivered = 0u64;

        loop {
            let next = tokio::select! {
                _ = self.cancel.cancelled() => {
                    debug!("Replay decode loop cancelled");
                    break;
                }
                next = frames.next_frame() => next,
            };

            let frame = match next {
                Ok(Some(frame)) => frame,
                Ok(None) => {
                    info!("Capture exhausted after {} frames", frames.frames_read());
                    break;
                }
                Err(e) => {
                    warn!("Stopping replay at damaged frame: {}", e);
                    break;
                }
            };

            let (header, body) = match codec::split_frame(&frame.payload) {
                Ok(parts) => parts,
                Err(e) => {
                    error!("Undecodable frame header, ending replay: {}", e);
                    break;
                }
            };

            let (source, destination) = match frame.direction {
                Direction::ToServer => (REPLAY_LOCAL_ADDR, REPLAY_REMOTE_ADDR),
                Direction::ToClient => (REPLAY_REMOTE_ADDR, REPLAY_LOCAL_ADDR),
            };
            if let Some(hook) = &self.hook {
                hook(&header, body, source, destination);
            }

            let packet = match codec::decode(&header, body) {
                Ok(packet) => packet,
                Err(e) => {
                    warn!("Undecodable packet {:#x}, delivering it opaque: {}", header.packet_id, e);
                    Packet::Unknown { header, body: Bytes::copy_from_slice(body) }
                }
            };

            if !self.spawn.is_spawned() {
                if let Err(e) = self.login(&packet) {
                    error!("Replay login failed: {}", e);
                    self.spawn.fail(e);
                    self.cancel.cancel();
                    break;
                }
                continue;
            }

            tokio::select! {
                _ = self.cancel.cancelled() => break,
                sent = self.packets.send(packet) => {
                    if sent.is_err() {
                        debug!("Replay consumer dropped");
                        break;
                    }
                    delivered += 1;
                }
            }
        }

        // Resolves waiters of a session that never spawned; a no-op otherwise.
        self.spawn.close();
        info!("Replay decode loop ended ({} packets delivered)", delivered);
    }

    fn login(&mut self, packet: &Packet) -> Result<()> {
        let step = self.login.handle(packet)?;
        trace!(packet = packet.name(), discarded = step.outgoing.len(), "Replayed login packet");
        if self.session.write().apply(step.events) {
            self.spawn.fire();
        }
        Ok(())
    }
}
