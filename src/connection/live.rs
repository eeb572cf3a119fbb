//! Live connection over TCP
//!
//! Each packet travels as one length-delimited frame. A connection owns two tasks:
//! a writer draining the outbound queue into the socket, and a single reader that
//! runs the login handshake and, once spawned, hands packets to
//! [`Connection::read_packet`] through a bounded queue.

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::SplitStream;
use futures::{Sink, SinkExt, StreamExt};
use parking_lot::RwLock;
use std::collections::VecDeque;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{Mutex, mpsc};
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use super::{
    ClientLogin, Connection, Handshake, LoginStep, PacketFunc, ServerLogin, SessionData,
    SpawnSignal,
};
use crate::packs::{PackCache, ResourcePack};
use crate::protocol::{GameData, IdentityData, Packet, codec};
use crate::{RelayError, Result};

/// Largest frame accepted from a peer.
pub const MAX_FRAME_LENGTH: usize = 64 * 1024 * 1024;

/// Bound on flushing queued frames once a connection is closing.
pub const FLUSH_TIMEOUT: Duration = Duration::from_secs(2);

type Transport = Framed<TcpStream, LengthDelimitedCodec>;

fn transport(stream: TcpStream) -> Transport {
    LengthDelimitedCodec::builder().max_frame_length(MAX_FRAME_LENGTH).new_framed(stream)
}

/// Options for [`LiveConnection::dial`].
#[derive(Clone)]
pub struct DialOptions {
    /// Identity presented in the login message.
    pub identity: IdentityData,
    /// Cache consulted before downloading packs and filled by downloads.
    pub cache: Arc<PackCache>,
    pub hook: Option<PacketFunc>,
    pub queue_capacity: usize,
}

impl Default for DialOptions {
    fn default() -> Self {
        Self {
            identity: IdentityData::default(),
            cache: Arc::new(PackCache::new()),
            hook: None,
            queue_capacity: 256,
        }
    }
}

/// What the server role serves to an accepted client.
#[derive(Debug, Clone)]
pub struct ServeOptions {
    pub game_data: GameData,
    pub packs: Vec<ResourcePack>,
    pub chunk_size: usize,
    pub queue_capacity: usize,
}

impl Default for ServeOptions {
    fn default() -> Self {
        Self {
            game_data: GameData::default(),
            packs: Vec::new(),
            chunk_size: 1024 * 1024,
            queue_capacity: 256,
        }
    }
}

/// Encodes packets, reports them to the hook and queues them for the writer task.
#[derive(Clone)]
struct Outbound {
    frames: mpsc::Sender<Bytes>,
    hook: Option<PacketFunc>,
    local: SocketAddr,
    remote: SocketAddr,
}

impl Outbound {
    async fn send(&self, packet: &Packet) -> Result<()> {
        let (header, body) = codec::encode(packet);
        if let Some(hook) = &self.hook {
            hook(&header, &body, self.local, self.remote);
        }
        trace!(packet = packet.name(), len = body.len(), "Sending");
        self.frames
            .send(codec::join(&header, &body))
            .await
            .map_err(|_| RelayError::ConnectionClosed)
    }
}

/// A client that connected and logged in, waiting to be served.
pub struct PendingClient {
    transport: Transport,
    login: Packet,
    identity: IdentityData,
    hook: Option<PacketFunc>,
    local: SocketAddr,
    remote: SocketAddr,
}

impl PendingClient {
    pub fn identity(&self) -> &IdentityData {
        &self.identity
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote
    }

    /// Run the server side of the login sequence with what `options` provides.
    pub fn start(self, options: ServeOptions) -> Result<LiveConnection> {
        let mut handshake = ServerLogin::new(options.game_data, options.packs, options.chunk_size);
        let step = handshake.handle(&self.login)?;

        let authenticated = !self.identity.xuid.is_empty();
        Ok(LiveConnection::establish(
            self.transport,
            Box::new(handshake),
            step,
            Endpoints { local: self.local, remote: self.remote, hook: self.hook },
            options.queue_capacity,
            authenticated,
        ))
    }
}

struct Endpoints {
    local: SocketAddr,
    remote: SocketAddr,
    hook: Option<PacketFunc>,
}

/// Live connection to a peer
pub struct LiveConnection {
    local: SocketAddr,
    remote: SocketAddr,
    session: Arc<RwLock<SessionData>>,
    spawn: Arc<SpawnSignal>,
    inbound: Mutex<mpsc::Receiver<Packet>>,
    outbound: Outbound,
    authenticated: bool,
    closed: AtomicBool,
    cancel: CancellationToken,
}

impl LiveConnection {
    /// Connect to a server and start logging in as a client.
    pub async fn dial(address: SocketAddr, options: DialOptions) -> Result<Self> {
        info!("Connecting to {}", address);
        let stream = TcpStream::connect(address)
            .await
            .map_err(|e| RelayError::connection_failed(address.to_string(), e))?;
        let local = stream.local_addr().map_err(|e| RelayError::io_error("local address", e))?;
        stream.set_nodelay(true).map_err(|e| RelayError::io_error("socket options", e))?;

        let authenticated = !options.identity.xuid.is_empty();
        let handshake = ClientLogin::new(Some(options.identity), options.cache);
        Ok(Self::establish(
            transport(stream),
            Box::new(handshake),
            LoginStep::default(),
            Endpoints { local, remote: address, hook: options.hook },
            options.queue_capacity,
            authenticated,
        ))
    }

    /// Take an accepted socket and read the client's login message.
    pub async fn accept(stream: TcpStream, hook: Option<PacketFunc>) -> Result<PendingClient> {
        let local = stream.local_addr().map_err(|e| RelayError::io_error("local address", e))?;
        let remote = stream.peer_addr().map_err(|e| RelayError::io_error("peer address", e))?;
        stream.set_nodelay(true).map_err(|e| RelayError::io_error("socket options", e))?;
        let mut transport = transport(stream);

        let frame = match transport.next().await {
            Some(Ok(frame)) => frame,
            Some(Err(e)) => return Err(RelayError::io_error("reading login", e)),
            None => return Err(RelayError::ConnectionClosed),
        };
        let (header, body) = codec::split_frame(&frame)?;
        if let Some(hook) = &hook {
            hook(&header, body, remote, local);
        }

        let login = codec::decode(&header, body)?;
        let Packet::Login { protocol, identity } = &login else {
            return Err(RelayError::invariant(format!(
                "expected login from {}, got {}",
                remote,
                login.name()
            )));
        };
        info!(
            client = %remote,
            protocol,
            name = %identity.display_name,
            "Client logged in"
        );

        let identity = identity.clone();
        Ok(PendingClient { transport, login, identity, hook, local, remote })
    }

    fn establish(
        transport: Transport,
        handshake: Box<dyn Handshake>,
        initial: LoginStep,
        endpoints: Endpoints,
        queue_capacity: usize,
        authenticated: bool,
    ) -> Self {
        let (sink, stream) = transport.split();
        let (frames_tx, frames_rx) = mpsc::channel(queue_capacity.max(1));
        let (inbound_tx, inbound_rx) = mpsc::channel(queue_capacity.max(1));

        let cancel = CancellationToken::new();
        let session = Arc::new(RwLock::new(SessionData::default()));
        let spawn = Arc::new(SpawnSignal::new());
        let outbound = Outbound {
            frames: frames_tx,
            hook: endpoints.hook.clone(),
            local: endpoints.local,
            remote: endpoints.remote,
        };

        tokio::spawn(write_loop(sink, frames_rx, cancel.clone()));

        let reader = Reader {
            handshake,
            session: Arc::clone(&session),
            spawn: Arc::clone(&spawn),
            outbound: outbound.clone(),
            inbound: inbound_tx,
            hook: endpoints.hook,
            local: endpoints.local,
            remote: endpoints.remote,
            cancel: cancel.clone(),
        };
        tokio::spawn(reader.run(stream, initial));

        debug!(local = %endpoints.local, remote = %endpoints.remote, "Live connection established");
        Self {
            local: endpoints.local,
            remote: endpoints.remote,
            session,
            spawn,
            inbound: Mutex::new(inbound_rx),
            outbound,
            authenticated,
            closed: AtomicBool::new(false),
            cancel,
        }
    }
}

#[async_trait]
impl Connection for LiveConnection {
    async fn read_packet(&self) -> Result<Packet> {
        if self.closed.load(Ordering::Acquire) {
            return Err(RelayError::ConnectionClosed);
        }
        let mut inbound = self.inbound.lock().await;
        // Packets already queued are drained before a peer hang-up is reported.
        tokio::select! {
            biased;
            packet = inbound.recv() => packet.ok_or(RelayError::ConnectionClosed),
            _ = self.cancel.cancelled() => Err(RelayError::ConnectionClosed),
        }
    }

    async fn write_packet(&self, packet: Packet) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(RelayError::ConnectionClosed);
        }
        tokio::select! {
            _ = self.cancel.cancelled() => Err(RelayError::ConnectionClosed),
            result = self.outbound.send(&packet) => result,
        }
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
        self.local
    }

    fn remote_addr(&self) -> SocketAddr {
        self.remote
    }

    fn authenticated(&self) -> bool {
        self.authenticated
    }

    fn packet_func(&self) -> Option<&PacketFunc> {
        self.outbound.hook.as_ref()
    }

    async fn close(&self) -> Result<()> {
        if !self.closed.swap(true, Ordering::AcqRel) {
            debug!("Closing connection to {}", self.remote);
        }
        self.cancel.cancel();
        self.spawn.close();
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire) || self.cancel.is_cancelled()
    }
}

impl Drop for LiveConnection {
    fn drop(&mut self) {
        debug!("Dropping live connection to {}", self.remote);
        self.cancel.cancel();
    }
}

/// Drains queued frames into the socket. On cancellation, frames already queued are
/// still flushed so a final disconnect reaches the peer, for at most [`FLUSH_TIMEOUT`].
async fn write_loop<S>(mut sink: S, mut frames: mpsc::Receiver<Bytes>, cancel: CancellationToken)
where
    S: Sink<Bytes, Error = io::Error> + Unpin,
{
    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => break,
            frame = frames.recv() => frame,
        };
        let Some(frame) = frame else {
            break;
        };
        tokio::select! {
            biased;
            sent = sink.send(frame) => {
                if let Err(e) = sent {
                    warn!("Write failed: {}", e);
                    cancel.cancel();
                    return;
                }
            }
            _ = cancel.cancelled() => {
                debug!("Write interrupted by close");
                break;
            }
        }
    }

    let flush = async {
        while let Ok(frame) = frames.try_recv() {
            sink.feed(frame).await?;
        }
        sink.close().await
    };
    match tokio::time::timeout(FLUSH_TIMEOUT, flush).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => trace!("Closing socket: {}", e),
        Err(_) => debug!("Peer did not take the final frames within {:?}", FLUSH_TIMEOUT),
    }
}

/// Single reader of one connection's socket.
struct Reader {
    handshake: Box<dyn Handshake>,
    session: Arc<RwLock<SessionData>>,
    spawn: Arc<SpawnSignal>,
    outbound: Outbound,
    inbound: mpsc::Sender<Packet>,
    hook: Option<PacketFunc>,
    local: SocketAddr,
    remote: SocketAddr,
    cancel: CancellationToken,
}

impl Reader {
    async fn run(mut self, mut stream: SplitStream<Transport>, initial: LoginStep) {
        let mut opening = initial;
        opening.outgoing.extend(self.handshake.start());
        if let Err(e) = self.apply(opening).await {
            self.abort(e);
            return;
        }

        let mut received = 0u64;
        loop {
            let next = tokio::select! {
                _ = self.cancel.cancelled() => break,
                next = stream.next() => next,
            };

            let frame = match next {
                Some(Ok(frame)) => frame,
                Some(Err(e)) => {
                    warn!("Read from {} failed: {}", self.remote, e);
                    break;
                }
                None => {
                    info!("{} closed the connection", self.remote);
                    break;
                }
            };

            let (header, body) = match codec::split_frame(&frame) {
                Ok(parts) => parts,
                Err(e) => {
                    self.abort(e);
                    return;
                }
            };
            if let Some(hook) = &self.hook {
                hook(&header, body, self.remote, self.local);
            }
            received += 1;

            // Bytes that fail to decode still reach the consumer, opaque.
            let packet = match codec::decode(&header, body) {
                Ok(packet) => packet,
                Err(e) => {
                    warn!("Undecodable packet {:#x} from {}: {}", header.packet_id, self.remote, e);
                    Packet::Unknown { header, body: Bytes::copy_from_slice(body) }
                }
            };

            if !self.spawn.is_spawned() {
                let step = match self.handshake.handle(&packet) {
                    Ok(step) => step,
                    Err(e) => {
                        self.abort(e);
                        return;
                    }
                };
                if let Err(e) = self.apply(step).await {
                    self.abort(e);
                    return;
                }
                continue;
            }

            tokio::select! {
                _ = self.cancel.cancelled() => break,
                sent = self.inbound.send(packet) => {
                    if sent.is_err() {
                        break;
                    }
                }
            }
        }

        debug!("Reader for {} ended after {} frames", self.remote, received);
        self.spawn.close();
        self.cancel.cancel();
    }

    /// Send a step's packets, feeding each back through the handshake.
    async fn apply(&mut self, step: LoginStep) -> Result<()> {
        let mut pending = VecDeque::from(step.outgoing);
        let mut events = step.events;

        loop {
            if self.session.write().apply(std::mem::take(&mut events)) && self.spawn.fire() {
                info!(remote = %self.remote, "Spawned");
            }
            let Some(packet) = pending.pop_front() else {
                return Ok(());
            };
            tokio::select! {
                _ = self.cancel.cancelled() => return Err(RelayError::ConnectionClosed),
                sent = self.outbound.send(&packet) => sent?,
            }
            let echo = self.handshake.handle(&packet)?;
            pending.extend(echo.outgoing);
            events = echo.events;
        }
    }

    fn abort(&self, error: RelayError) {
        if self.cancel.is_cancelled() && matches!(error, RelayError::ConnectionClosed) {
            debug!("Login with {} interrupted by close", self.remote);
            self.spawn.close();
            return;
        }
        error!("Session with {} failed: {}", self.remote, error);
        self.spawn.fail(error);
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::pin::Pin;
    use std::task::{Context, Poll};

    /// A socket whose peer never reads: nothing is ever accepted.
    struct StalledSink;

    impl Sink<Bytes> for StalledSink {
        type Error = io::Error;

        fn poll_ready(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Pending
        }

        fn start_send(self: Pin<&mut Self>, _: Bytes) -> io::Result<()> {
            Ok(())
        }

        fn poll_flush(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Pending
        }

        fn poll_close(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Pending
        }
    }

    #[derive(Clone, Default)]
    struct RecordingSink {
        frames: Arc<parking_lot::Mutex<Vec<Bytes>>>,
        closed: Arc<AtomicBool>,
    }

    impl Sink<Bytes> for RecordingSink {
        type Error = io::Error;

        fn poll_ready(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn start_send(self: Pin<&mut Self>, item: Bytes) -> io::Result<()> {
            self.frames.lock().push(item);
            Ok(())
        }

        fn poll_flush(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_close(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<io::Result<()>> {
            self.closed.store(true, Ordering::Release);
            Poll::Ready(Ok(()))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn writer_gives_up_on_a_peer_that_stops_reading() {
        let (frames, queue) = mpsc::channel(4);
        let cancel = CancellationToken::new();
        let writer = tokio::spawn(write_loop(StalledSink, queue, cancel.clone()));

        frames.send(Bytes::from_static(b"in flight")).await.unwrap();
        frames.send(Bytes::from_static(b"queued")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!writer.is_finished());

        cancel.cancel();
        tokio::time::timeout(FLUSH_TIMEOUT * 2, writer)
            .await
            .expect("writer should stop once the flush deadline passes")
            .unwrap();
    }

    #[tokio::test]
    async fn frames_queued_before_close_are_flushed() {
        let sink = RecordingSink::default();
        let (frames, queue) = mpsc::channel(4);
        let cancel = CancellationToken::new();

        frames.send(Bytes::from_static(b"last words")).await.unwrap();
        frames.send(Bytes::from_static(b"goodbye")).await.unwrap();
        cancel.cancel();
        write_loop(sink.clone(), queue, cancel).await;

        let written = sink.frames.lock().clone();
        assert_eq!(written, vec![Bytes::from_static(b"last words"), Bytes::from_static(b"goodbye")]);
        assert!(sink.closed.load(Ordering::Acquire));
    }
}
