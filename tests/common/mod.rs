//! Shared fixtures for the integration tests, built on the public API only.

#![allow(dead_code)]

use bytes::Bytes;
use relaytap::capture::{CaptureWriter, Direction};
use relaytap::connection::{ClientLogin, Handshake, ServerLogin};
use relaytap::protocol::codec;
use relaytap::{GameData, IdentityData, PackCache, Packet, PacketHeader, ResourcePack};
use std::path::Path;
use std::sync::Arc;

pub fn game_data(entity_runtime_id: u64) -> GameData {
    GameData {
        world_name: "Integration world".to_string(),
        world_seed: 1234,
        difficulty: 1,
        entity_unique_id: entity_runtime_id as i64,
        entity_runtime_id,
        player_position: [8.5, 64.0, 8.5],
        base_game_version: "1.20.60".to_string(),
        ..GameData::default()
    }
}

pub fn identity() -> IdentityData {
    IdentityData {
        xuid: "2535400000000001".to_string(),
        identity: "0f5e6a3c-4e52-4c11-9d3b-2a6f1f0c9e77".to_string(),
        display_name: "Alex".to_string(),
        title_id: "896928775".to_string(),
    }
}

pub fn pack(uuid: &str, size: usize) -> ResourcePack {
    let data: Vec<u8> = (0..size).map(|i| (i * 7 % 256) as u8).collect();
    ResourcePack::new(uuid, "1.0.0", None, Bytes::from(data))
}

pub fn opaque(packet_id: u16, body: &[u8]) -> Packet {
    Packet::Unknown { header: PacketHeader::new(packet_id), body: Bytes::copy_from_slice(body) }
}

/// Login between a fresh client and a server serving `game` and `packs`, in wire order.
pub fn login(
    game: &GameData,
    packs: &[ResourcePack],
    chunk_size: usize,
) -> relaytap::Result<Vec<(Direction, Packet)>> {
    let mut client = ClientLogin::new(Some(identity()), Arc::new(PackCache::new()));
    let mut server = ServerLogin::new(game.clone(), packs.to_vec(), chunk_size);
    let mut transcript = Vec::new();

    let mut to_server = client.start();
    let mut to_client = server.start();
    while !to_server.is_empty() || !to_client.is_empty() {
        for packet in std::mem::take(&mut to_server) {
            to_client.extend(server.handle(&packet)?.outgoing);
            transcript.push((Direction::ToServer, packet));
        }
        for packet in std::mem::take(&mut to_client) {
            let step = client.handle(&packet)?;
            transcript.push((Direction::ToClient, packet));
            for outgoing in step.outgoing {
                client.handle(&outgoing)?;
                to_server.push(outgoing);
            }
        }
    }
    Ok(transcript)
}

pub fn write_session(
    path: &Path,
    frames: &[(Direction, Packet)],
    packs: &[ResourcePack],
) -> relaytap::Result<()> {
    let writer = CaptureWriter::create(path)?;
    for (direction, packet) in frames {
        writer.write_frame(*direction, &codec::encode_frame(packet))?;
    }
    for pack in packs {
        writer.add_pack(pack.clone());
    }
    writer.finish()
}
