//! Reference packet codec.
//!
//! Every encoded packet is a 4-byte header followed by the body:
//!
//! ```text
//! [u16 packet_id][u8 sender_sub_client][u8 target_sub_client][body...]
//! ```
//!
//! Body fields are little-endian. Strings and byte blobs carry a length prefix
//! (`u16` for strings, `u32` for blobs), lists a `u32` element count. Decoding checks
//! every length against the remaining input and reports [`RelayError::Decode`]
//! instead of panicking on short data.

use bytes::{BufMut, Bytes, BytesMut};

use super::{
    GameData, IdentityData, PackInfoEntry, Packet, PlayStatus, ResourcePackChunkData,
    ResourcePackChunkRequest, ResourcePackClientResponse, ResourcePackStack, ResourcePacksInfo,
    ResponseStatus, StackEntry, ids,
};
use crate::{RelayError, Result};

/// Size of an encoded [`PacketHeader`].
pub const HEADER_SIZE: usize = 4;

/// Header preceding every packet body.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct PacketHeader {
    pub packet_id: u16,
    pub sender_sub_client: u8,
    pub target_sub_client: u8,
}

impl PacketHeader {
    pub fn new(packet_id: u16) -> Self {
        Self { packet_id, sender_sub_client: 0, target_sub_client: 0 }
    }

    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let id = self.packet_id.to_le_bytes();
        [id[0], id[1], self.sender_sub_client, self.target_sub_client]
    }

    pub fn write(&self, buf: &mut impl BufMut) {
        buf.put_slice(&self.to_bytes());
    }

    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < HEADER_SIZE {
            return Err(RelayError::decode(
                "packet header",
                format!("need {} bytes, have {}", HEADER_SIZE, data.len()),
            ));
        }
        Ok(Self {
            packet_id: u16::from_le_bytes([data[0], data[1]]),
            sender_sub_client: data[2],
            target_sub_client: data[3],
        })
    }
}

/// Split an encoded packet into its header and body.
pub fn split_frame(data: &[u8]) -> Result<(PacketHeader, &[u8])> {
    let header = PacketHeader::parse(data)?;
    Ok((header, &data[HEADER_SIZE..]))
}

/// Encode a packet into its header and body.
pub fn encode(packet: &Packet) -> (PacketHeader, Bytes) {
    if let Packet::Unknown { header, body } = packet {
        return (*header, body.clone());
    }

    let mut buf = BytesMut::new();
    match packet {
        Packet::Login { protocol, identity } => {
            buf.put_i32_le(*protocol);
            put_string(&mut buf, &identity.xuid);
            put_string(&mut buf, &identity.identity);
            put_string(&mut buf, &identity.display_name);
            put_string(&mut buf, &identity.title_id);
        }
        Packet::PlayStatus(status) => buf.put_u32_le(status.to_u32()),
        Packet::Disconnect { message } => put_string(&mut buf, message),
        Packet::ResourcePacksInfo(info) => {
            buf.put_u8(info.texture_pack_required as u8);
            buf.put_u32_le(info.packs.len() as u32);
            for pack in &info.packs {
                put_string(&mut buf, &pack.uuid);
                put_string(&mut buf, &pack.version);
                buf.put_u64_le(pack.size);
                put_string(&mut buf, &pack.content_key);
            }
        }
        Packet::ResourcePackStack(stack) => {
            buf.put_u8(stack.texture_pack_required as u8);
            buf.put_u32_le(stack.packs.len() as u32);
            for entry in &stack.packs {
                put_string(&mut buf, &entry.uuid);
                put_string(&mut buf, &entry.version);
            }
            put_string(&mut buf, &stack.base_game_version);
        }
        Packet::ResourcePackClientResponse(response) => {
            buf.put_u8(response.status.to_u8());
            buf.put_u32_le(response.pack_ids.len() as u32);
            for id in &response.pack_ids {
                put_string(&mut buf, id);
            }
        }
        Packet::StartGame(game) => put_game_data(&mut buf, game),
        Packet::ResourcePackChunkData(chunk) => {
            put_string(&mut buf, &chunk.uuid);
            buf.put_u32_le(chunk.chunk_index);
            buf.put_u64_le(chunk.data_offset);
            buf.put_u32_le(chunk.data.len() as u32);
            buf.put_slice(&chunk.data);
        }
        Packet::ResourcePackChunkRequest(request) => {
            put_string(&mut buf, &request.uuid);
            buf.put_u32_le(request.chunk_index);
        }
        Packet::SetLocalPlayerAsInitialised { entity_runtime_id } => {
            buf.put_u64_le(*entity_runtime_id);
        }
        Packet::Unknown { .. } => {}
    }

    (PacketHeader::new(packet.id()), buf.freeze())
}

/// Encode a packet as header followed by body, the form stored in capture frames.
pub fn encode_frame(packet: &Packet) -> Bytes {
    let (header, body) = encode(packet);
    join(&header, &body)
}

/// Concatenate an already-encoded header and body.
pub fn join(header: &PacketHeader, body: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(HEADER_SIZE + body.len());
    header.write(&mut buf);
    buf.put_slice(body);
    buf.freeze()
}

/// Decode a packet body using the id carried by its header.
pub fn decode(header: &PacketHeader, body: &[u8]) -> Result<Packet> {
    let mut r = Reader::new(body);
    let packet = match header.packet_id {
        ids::LOGIN => Packet::Login {
            protocol: r.i32()?,
            identity: IdentityData {
                xuid: r.string()?,
                identity: r.string()?,
                display_name: r.string()?,
                title_id: r.string()?,
            },
        },
        ids::PLAY_STATUS => Packet::PlayStatus(PlayStatus::from_u32(r.u32()?)),
        ids::DISCONNECT => Packet::Disconnect { message: r.string()? },
        ids::RESOURCE_PACKS_INFO => {
            let texture_pack_required = r.bool()?;
            let count = r.count()?;
            let mut packs = Vec::with_capacity(count);
            for _ in 0..count {
                packs.push(PackInfoEntry {
                    uuid: r.string()?,
                    version: r.string()?,
                    size: r.u64()?,
                    content_key: r.string()?,
                });
            }
            Packet::ResourcePacksInfo(ResourcePacksInfo { texture_pack_required, packs })
        }
        ids::RESOURCE_PACK_STACK => {
            let texture_pack_required = r.bool()?;
            let count = r.count()?;
            let mut packs = Vec::with_capacity(count);
            for _ in 0..count {
                packs.push(StackEntry { uuid: r.string()?, version: r.string()? });
            }
            Packet::ResourcePackStack(ResourcePackStack {
                texture_pack_required,
                packs,
                base_game_version: r.string()?,
            })
        }
        ids::RESOURCE_PACK_CLIENT_RESPONSE => {
            let raw = r.u8()?;
            let status = ResponseStatus::from_u8(raw).ok_or_else(|| {
                RelayError::decode("ResourcePackClientResponse", format!("unknown status {raw}"))
            })?;
            let count = r.count()?;
            let mut pack_ids = Vec::with_capacity(count);
            for _ in 0..count {
                pack_ids.push(r.string()?);
            }
            Packet::ResourcePackClientResponse(ResourcePackClientResponse { status, pack_ids })
        }
        ids::START_GAME => Packet::StartGame(read_game_data(&mut r)?),
        ids::RESOURCE_PACK_CHUNK_DATA => {
            let uuid = r.string()?;
            let chunk_index = r.u32()?;
            let data_offset = r.u64()?;
            let len = r.u32()? as usize;
            let data = Bytes::copy_from_slice(r.take(len)?);
            Packet::ResourcePackChunkData(ResourcePackChunkData {
                uuid,
                chunk_index,
                data_offset,
                data,
            })
        }
        ids::RESOURCE_PACK_CHUNK_REQUEST => {
            Packet::ResourcePackChunkRequest(ResourcePackChunkRequest {
                uuid: r.string()?,
                chunk_index: r.u32()?,
            })
        }
        ids::SET_LOCAL_PLAYER_AS_INITIALISED => {
            Packet::SetLocalPlayerAsInitialised { entity_runtime_id: r.u64()? }
        }
        _ => return Ok(Packet::Unknown { header: *header, body: Bytes::copy_from_slice(body) }),
    };
    Ok(packet)
}

fn put_string(buf: &mut BytesMut, value: &str) {
    let bytes = value.as_bytes();
    let len = bytes.len().min(u16::MAX as usize);
    buf.put_u16_le(len as u16);
    buf.put_slice(&bytes[..len]);
}

fn put_game_data(buf: &mut BytesMut, game: &GameData) {
    put_string(buf, &game.world_name);
    buf.put_i64_le(game.world_seed);
    buf.put_i32_le(game.difficulty);
    buf.put_i64_le(game.entity_unique_id);
    buf.put_u64_le(game.entity_runtime_id);
    buf.put_i32_le(game.player_game_mode);
    for value in game.player_position {
        buf.put_f32_le(value);
    }
    buf.put_f32_le(game.pitch);
    buf.put_f32_le(game.yaw);
    buf.put_i32_le(game.dimension);
    for value in game.world_spawn {
        buf.put_i32_le(value);
    }
    buf.put_i32_le(game.world_game_mode);
    buf.put_i64_le(game.time);
    put_string(buf, &game.base_game_version);
}

fn read_game_data(r: &mut Reader<'_>) -> Result<GameData> {
    Ok(GameData {
        world_name: r.string()?,
        world_seed: r.i64()?,
        difficulty: r.i32()?,
        entity_unique_id: r.i64()?,
        entity_runtime_id: r.u64()?,
        player_game_mode: r.i32()?,
        player_position: [r.f32()?, r.f32()?, r.f32()?],
        pitch: r.f32()?,
        yaw: r.f32()?,
        dimension: r.i32()?,
        world_spawn: [r.i32()?, r.i32()?, r.i32()?],
        world_game_mode: r.i32()?,
        time: r.i64()?,
        base_game_version: r.string()?,
    })
}

/// Bounds-checked little-endian cursor over a packet body.
struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8]> {
        let remaining = self.data.len() - self.pos;
        if len > remaining {
            return Err(RelayError::decode(
                "packet body",
                format!("need {} bytes at offset {}, have {}", len, self.pos, remaining),
            ));
        }
        let slice = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn bool(&mut self) -> Result<bool> {
        Ok(self.u8()? != 0)
    }

    fn u16(&mut self) -> Result<u16> {
        Ok(u16::from_le_bytes(self.array()?))
    }

    fn u32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.array()?))
    }

    fn i32(&mut self) -> Result<i32> {
        Ok(i32::from_le_bytes(self.array()?))
    }

    fn u64(&mut self) -> Result<u64> {
        Ok(u64::from_le_bytes(self.array()?))
    }

    fn i64(&mut self) -> Result<i64> {
        Ok(i64::from_le_bytes(self.array()?))
    }

    fn f32(&mut self) -> Result<f32> {
        Ok(f32::from_le_bytes(self.array()?))
    }

    fn string(&mut self) -> Result<String> {
        let len = self.u16()? as usize;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec())
            .map_err(|e| RelayError::decode("string field", e.to_string()))
    }

    /// Element count, rejected early when it cannot possibly fit the remaining input.
    fn count(&mut self) -> Result<usize> {
        let count = self.u32()? as usize;
        let remaining = self.data.len() - self.pos;
        if count > remaining {
            return Err(RelayError::decode(
                "list length",
                format!("{} elements declared with {} bytes left", count, remaining),
            ));
        }
        Ok(count)
    }
}
