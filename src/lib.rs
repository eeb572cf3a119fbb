//! Man-in-the-middle relay, capture and replay for a binary game-network protocol.
//!
//! relaytap sits between a game client and its server, forwards every message
//! transparently and lets observers inspect or record the session.
//!
//! # Features
//!
//! - **Live relay**: two independently negotiated connections pumped in both directions
//! - **Capture**: append-only container with a bundled resource pack directory
//! - **Replay**: a recorded session re-runs its login and behaves like a live connection
//! - **Resource packs**: chunked negotiation backed by a shared content cache
//!
//! ## Example (replay)
//!
//! ```rust,no_run
//! use relaytap::{Connection, Relaytap};
//!
//! #[tokio::main]
//! async fn main() -> relaytap::Result<()> {
//!     let connection = Relaytap::replay("captures/play.example.net-1700000000000.pcap2").await?;
//!     connection.do_spawn().await?;
//!     println!("World: {}", connection.game_data().world_name);
//!
//!     while let Ok(packet) = connection.read_packet().await {
//!         println!("{}", packet.name());
//!     }
//!     Ok(())
//! }
//! ```

// Core types and error handling
pub mod config;
mod error;
pub mod logging;
pub mod protocol;
#[cfg(any(test, feature = "benchmark"))]
pub mod test_utils;

// Sessions
pub mod capture;
pub mod connection;
pub mod packs;
pub mod relay;

// Core exports
pub use error::*;

pub use capture::{CaptureArchive, CaptureWriter, Direction, Frame};
pub use config::RelayConfig;
pub use connection::live::LiveConnection;
pub use connection::replay::ReplayConnection;
pub use connection::{Connection, PacketFunc, packet_stream};
pub use packs::{PackCache, ResourcePack};
pub use protocol::{GameData, IdentityData, Packet, PacketHeader, Protocol};
pub use relay::Relay;

use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Entry points for the two consumer-facing operations: replaying a capture and
/// capturing a relayed session.
///
/// # Examples
///
/// ## Capture (relay to a server and record it)
/// ```rust,no_run
/// use relaytap::{RelayConfig, Relaytap};
/// use tokio_util::sync::CancellationToken;
///
/// #[tokio::main]
/// async fn main() -> relaytap::Result<()> {
///     let config = RelayConfig::load("relay.yaml")?;
///     Relaytap::capture(config, CancellationToken::new(), "play.example.net:19132").await
/// }
/// ```
pub struct Relaytap;

impl Relaytap {
    /// Open a capture container as a read-only connection.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The file does not exist or is not readable
    /// - The header magic is not a capture container's
    /// - The container was written with another format version
    pub async fn replay<P: AsRef<Path>>(path: P) -> Result<ReplayConnection> {
        ReplayConnection::open(path).await
    }

    /// Relay one client session to `server_address`, recording it under
    /// [`RelayConfig::capture_path`].
    ///
    /// Fails immediately if the capture file cannot be created.
    pub async fn capture(
        config: RelayConfig,
        cancel: CancellationToken,
        server_address: &str,
    ) -> Result<()> {
        let host = server_address.rsplit_once(':').map_or(server_address, |(host, _)| host);
        let writer = Arc::new(CaptureWriter::create(config.capture_path(host))?);
        Relay::new(config).with_capture(writer).run(cancel, server_address).await
    }
}
