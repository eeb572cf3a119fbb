//! Test utilities for building sessions and capture files
//!
//! Sessions are produced by running [`ClientLogin`] against [`ServerLogin`], so every
//! transcript follows the same login sequence a live relay records.

#![cfg(any(test, feature = "benchmark"))]

use bytes::Bytes;
use std::path::Path;
use std::sync::Arc;

use crate::capture::{CaptureWriter, Direction};
use crate::connection::{ClientLogin, Handshake, ServerLogin};
use crate::packs::{PackCache, ResourcePack};
use crate::protocol::{GameData, IdentityData, Packet, PacketHeader, codec};
use crate::Result;

/// World settings with the given player entity id.
pub fn sample_game_data(entity_runtime_id: u64) -> GameData {
    GameData {
        world_name: "Bedrock level".to_string(),
        world_seed: -4_200_913,
        difficulty: 2,
        entity_unique_id: -(entity_runtime_id as i64),
        entity_runtime_id,
        player_game_mode: 0,
        player_position: [0.5, 72.0, -12.5],
        pitch: 0.0,
        yaw: 90.0,
        dimension: 0,
        world_spawn: [0, 70, 0],
        world_game_mode: 0,
        time: 6000,
        base_game_version: "1.20.60".to_string(),
    }
}

pub fn sample_identity() -> IdentityData {
    IdentityData {
        xuid: "2535416237846591".to_string(),
        identity: "8c7c5f6b-2f38-4bd8-9f0a-e8f5b5e8c1aa".to_string(),
        display_name: "Steve".to_string(),
        title_id: "896928775".to_string(),
    }
}

/// A pack of `size` bytes with a recognisable byte pattern.
pub fn sample_pack(uuid: &str, size: usize) -> ResourcePack {
    let data: Vec<u8> = (0..size).map(|i| (i % 251) as u8).collect();
    ResourcePack::new(uuid, "1.0.0", None, Bytes::from(data))
}

/// An uninterpreted packet, forwarded verbatim by every path.
pub fn opaque_packet(packet_id: u16, body: &[u8]) -> Packet {
    Packet::Unknown { header: PacketHeader::new(packet_id), body: Bytes::copy_from_slice(body) }
}

/// Full login sequence between a client and a server serving `game` and `packs`,
/// in wire order, tagged with direction.
pub fn login_transcript(
    game: &GameData,
    packs: &[ResourcePack],
    chunk_size: usize,
) -> Result<Vec<(Direction, Packet)>> {
    let mut client = ClientLogin::new(Some(sample_identity()), Arc::new(PackCache::new()));
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

/// Write `frames` into a finished capture at `path`, bundling `packs`.
pub fn write_capture(
    path: &Path,
    frames: &[(Direction, Packet)],
    packs: &[ResourcePack],
) -> Result<()> {
    let writer = CaptureWriter::create(path)?;
    for (direction, packet) in frames {
        writer.write_frame(*direction, &codec::encode_frame(packet))?;
    }
    for pack in packs {
        writer.add_pack(pack.clone());
    }
    writer.finish()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transcript_ends_with_the_spawn_confirmation() {
        let game = sample_game_data(7);
        let transcript = login_transcript(&game, &[sample_pack("a", 10)], 4).unwrap();

        assert!(matches!(transcript.first(), Some((Direction::ToServer, Packet::Login { .. }))));
        assert_eq!(
            transcript.last(),
            Some(&(Direction::ToServer, Packet::SetLocalPlayerAsInitialised { entity_runtime_id: 7 }))
        );
        let chunks = transcript
            .iter()
            .filter(|(_, packet)| matches!(packet, Packet::ResourcePackChunkData(_)))
            .count();
        assert_eq!(chunks, 3);
    }
}
