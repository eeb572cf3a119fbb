//! Decoded protocol messages.
//!
//! The bit-level layout of game messages belongs to the wire-format library; the
//! relay only needs the handful of messages that drive login and resource pack
//! negotiation. Everything else travels as [`Packet::Unknown`] and is forwarded
//! byte-for-byte.
//!
//! [`codec`] is the reference encoding used by the live transport, the capture
//! container and the test suite.

pub mod codec;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

pub use codec::PacketHeader;

/// Packet identifiers of the messages this crate interprets.
pub mod ids {
    pub const LOGIN: u16 = 0x01;
    pub const PLAY_STATUS: u16 = 0x02;
    pub const DISCONNECT: u16 = 0x05;
    pub const RESOURCE_PACKS_INFO: u16 = 0x06;
    pub const RESOURCE_PACK_STACK: u16 = 0x07;
    pub const RESOURCE_PACK_CLIENT_RESPONSE: u16 = 0x08;
    pub const START_GAME: u16 = 0x0b;
    pub const RESOURCE_PACK_CHUNK_DATA: u16 = 0x53;
    pub const RESOURCE_PACK_CHUNK_REQUEST: u16 = 0x54;
    pub const SET_LOCAL_PLAYER_AS_INITIALISED: u16 = 0x71;
}

/// Active protocol description exposed by every connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Protocol {
    pub id: i32,
    pub version: &'static str,
}

impl Protocol {
    /// Protocol spoken by both live roles and assumed by replay.
    pub const CURRENT: Protocol = Protocol { id: 649, version: "1.20.60" };
}

/// Identity of the player behind a connection.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityData {
    pub xuid: String,
    pub identity: String,
    pub display_name: String,
    pub title_id: String,
}

/// Snapshot of the world settings announced by the start-of-game message.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GameData {
    pub world_name: String,
    pub world_seed: i64,
    pub difficulty: i32,
    pub entity_unique_id: i64,
    pub entity_runtime_id: u64,
    pub player_game_mode: i32,
    pub player_position: [f32; 3],
    pub pitch: f32,
    pub yaw: f32,
    pub dimension: i32,
    pub world_spawn: [i32; 3],
    pub world_game_mode: i32,
    pub time: i64,
    pub base_game_version: String,
}

/// Status reported by [`Packet::PlayStatus`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlayStatus {
    LoginSuccess,
    LoginFailedClient,
    LoginFailedServer,
    PlayerSpawn,
    Other(u32),
}

impl PlayStatus {
    pub fn to_u32(self) -> u32 {
        match self {
            PlayStatus::LoginSuccess => 0,
            PlayStatus::LoginFailedClient => 1,
            PlayStatus::LoginFailedServer => 2,
            PlayStatus::PlayerSpawn => 3,
            PlayStatus::Other(value) => value,
        }
    }

    pub fn from_u32(value: u32) -> Self {
        match value {
            0 => PlayStatus::LoginSuccess,
            1 => PlayStatus::LoginFailedClient,
            2 => PlayStatus::LoginFailedServer,
            3 => PlayStatus::PlayerSpawn,
            other => PlayStatus::Other(other),
        }
    }
}

/// Client answer during resource pack negotiation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseStatus {
    Refused,
    SendPacks,
    HaveAllPacks,
    Completed,
}

impl ResponseStatus {
    pub fn to_u8(self) -> u8 {
        match self {
            ResponseStatus::Refused => 1,
            ResponseStatus::SendPacks => 2,
            ResponseStatus::HaveAllPacks => 3,
            ResponseStatus::Completed => 4,
        }
    }

    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(ResponseStatus::Refused),
            2 => Some(ResponseStatus::SendPacks),
            3 => Some(ResponseStatus::HaveAllPacks),
            4 => Some(ResponseStatus::Completed),
            _ => None,
        }
    }
}

/// One pack announced by [`ResourcePacksInfo`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackInfoEntry {
    pub uuid: String,
    pub version: String,
    pub size: u64,
    /// Empty when the pack is not encrypted.
    pub content_key: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourcePacksInfo {
    pub texture_pack_required: bool,
    pub packs: Vec<PackInfoEntry>,
}

/// One pack referenced by [`ResourcePackStack`], in application order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StackEntry {
    pub uuid: String,
    pub version: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourcePackStack {
    pub texture_pack_required: bool,
    pub packs: Vec<StackEntry>,
    pub base_game_version: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourcePackClientResponse {
    pub status: ResponseStatus,
    pub pack_ids: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourcePackChunkRequest {
    pub uuid: String,
    pub chunk_index: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourcePackChunkData {
    pub uuid: String,
    pub chunk_index: u32,
    pub data_offset: u64,
    pub data: Bytes,
}

/// A decoded protocol message.
#[derive(Debug, Clone, PartialEq)]
pub enum Packet {
    Login { protocol: i32, identity: IdentityData },
    PlayStatus(PlayStatus),
    Disconnect { message: String },
    ResourcePacksInfo(ResourcePacksInfo),
    ResourcePackStack(ResourcePackStack),
    ResourcePackClientResponse(ResourcePackClientResponse),
    StartGame(GameData),
    ResourcePackChunkData(ResourcePackChunkData),
    ResourcePackChunkRequest(ResourcePackChunkRequest),
    SetLocalPlayerAsInitialised { entity_runtime_id: u64 },
    /// Any message the relay does not interpret, kept verbatim.
    Unknown { header: PacketHeader, body: Bytes },
}

impl Packet {
    /// Packet identifier written into the header.
    pub fn id(&self) -> u16 {
        match self {
            Packet::Login { .. } => ids::LOGIN,
            Packet::PlayStatus(_) => ids::PLAY_STATUS,
            Packet::Disconnect { .. } => ids::DISCONNECT,
            Packet::ResourcePacksInfo(_) => ids::RESOURCE_PACKS_INFO,
            Packet::ResourcePackStack(_) => ids::RESOURCE_PACK_STACK,
            Packet::ResourcePackClientResponse(_) => ids::RESOURCE_PACK_CLIENT_RESPONSE,
            Packet::StartGame(_) => ids::START_GAME,
            Packet::ResourcePackChunkData(_) => ids::RESOURCE_PACK_CHUNK_DATA,
            Packet::ResourcePackChunkRequest(_) => ids::RESOURCE_PACK_CHUNK_REQUEST,
            Packet::SetLocalPlayerAsInitialised { .. } => ids::SET_LOCAL_PLAYER_AS_INITIALISED,
            Packet::Unknown { header, .. } => header.packet_id,
        }
    }

    /// Short name used in log lines.
    pub fn name(&self) -> &'static str {
        match self {
            Packet::Login { .. } => "Login",
            Packet::PlayStatus(_) => "PlayStatus",
            Packet::Disconnect { .. } => "Disconnect",
            Packet::ResourcePacksInfo(_) => "ResourcePacksInfo",
            Packet::ResourcePackStack(_) => "ResourcePackStack",
            Packet::ResourcePackClientResponse(_) => "ResourcePackClientResponse",
            Packet::StartGame(_) => "StartGame",
            Packet::ResourcePackChunkData(_) => "ResourcePackChunkData",
            Packet::ResourcePackChunkRequest(_) => "ResourcePackChunkRequest",
            Packet::SetLocalPlayerAsInitialised { .. } => "SetLocalPlayerAsInitialised",
            Packet::Unknown { .. } => "Unknown",
        }
    }
}
