//! Login handshakes for both sides of a connection.
//!
//! A handshake is a plain state value. The connection's single reader feeds it every
//! packet in arrival order (its own outgoing packets included) and writes whatever
//! [`LoginStep::outgoing`] holds. Replay feeds the captured packets of both directions
//! through [`ClientLogin`] and discards the outgoing half.

use bytes::Bytes;
use std::sync::Arc;
use tracing::{debug, info};

use crate::packs::{Negotiation, PackCache, ResourcePack};
use crate::protocol::{
    GameData, IdentityData, PackInfoEntry, Packet, PlayStatus, Protocol, ResourcePackChunkData,
    ResourcePackChunkRequest, ResourcePackStack, ResourcePacksInfo, ResponseStatus, StackEntry,
};
use crate::{RelayError, Result};

/// Session facts learned while logging in.
#[derive(Debug, Clone, PartialEq)]
pub enum LoginEvent {
    Identified(IdentityData),
    PacksResolved(Vec<ResourcePack>),
    GameStarted(GameData),
    Spawned,
}

/// Result of applying one packet to a handshake.
#[derive(Debug, Default)]
pub struct LoginStep {
    pub outgoing: Vec<Packet>,
    pub events: Vec<LoginEvent>,
}

impl LoginStep {
    fn send(outgoing: Vec<Packet>) -> Self {
        Self { outgoing, events: Vec::new() }
    }

    fn event(mut self, event: LoginEvent) -> Self {
        self.events.push(event);
        self
    }

    pub fn is_spawned(&self) -> bool {
        self.events.contains(&LoginEvent::Spawned)
    }
}

/// One side of the login sequence.
pub trait Handshake: Send {
    /// Packets to send as soon as the transport is up.
    fn start(&mut self) -> Vec<Packet>;

    /// Apply one packet.
    fn handle(&mut self, packet: &Packet) -> Result<LoginStep>;
}

fn disconnected(packet: &Packet) -> Option<RelayError> {
    match packet {
        Packet::Disconnect { message } => Some(RelayError::Disconnected { message: message.clone() }),
        Packet::PlayStatus(status @ (PlayStatus::LoginFailedClient | PlayStatus::LoginFailedServer)) => {
            Some(RelayError::Disconnected { message: format!("login rejected ({:?})", status) })
        }
        _ => None,
    }
}

/// Checks a spawn confirmation against the start-of-game entity id.
fn confirm_spawn(started: Option<&GameData>, entity_runtime_id: u64) -> Result<()> {
    let Some(game) = started else {
        return Err(RelayError::invariant(format!(
            "spawn confirmation for entity {} before start of game",
            entity_runtime_id
        )));
    };
    if game.entity_runtime_id != entity_runtime_id {
        return Err(RelayError::invariant(format!(
            "spawn confirmation entity id {} does not match start of game entity id {}",
            entity_runtime_id, game.entity_runtime_id
        )));
    }
    Ok(())
}

/// Client role: logs in to a server (live) or re-runs a captured login (replay).
#[derive(Debug)]
pub struct ClientLogin {
    identity: Option<IdentityData>,
    negotiation: Negotiation,
    game_data: Option<GameData>,
    spawned: bool,
}

impl ClientLogin {
    /// `identity` is sent in the opening login message; replay passes `None`.
    pub fn new(identity: Option<IdentityData>, cache: Arc<PackCache>) -> Self {
        Self { identity, negotiation: Negotiation::new(cache), game_data: None, spawned: false }
    }

    pub fn negotiation(&self) -> &Negotiation {
        &self.negotiation
    }

    pub fn game_data(&self) -> Option<&GameData> {
        self.game_data.as_ref()
    }

    pub fn is_spawned(&self) -> bool {
        self.spawned
    }
}

impl Handshake for ClientLogin {
    fn start(&mut self) -> Vec<Packet> {
        match &self.identity {
            Some(identity) => vec![Packet::Login {
                protocol: Protocol::CURRENT.id,
                identity: identity.clone(),
            }],
            None => Vec::new(),
        }
    }

    fn handle(&mut self, packet: &Packet) -> Result<LoginStep> {
        if let Some(error) = disconnected(packet) {
            return Err(error);
        }

        match packet {
            Packet::Login { identity, .. } => {
                Ok(LoginStep::default().event(LoginEvent::Identified(identity.clone())))
            }
            Packet::ResourcePacksInfo(_) | Packet::ResourcePackChunkData(_) => {
                Ok(LoginStep::send(self.negotiation.handle(packet)?))
            }
            Packet::ResourcePackStack(_) => {
                let outgoing = self.negotiation.handle(packet)?;
                let packs = self.negotiation.resource_packs().to_vec();
                Ok(LoginStep::send(outgoing).event(LoginEvent::PacksResolved(packs)))
            }
            Packet::StartGame(game) => {
                if self.game_data.is_some() {
                    return Err(RelayError::invariant("duplicate start of game"));
                }
                debug!(
                    world = %game.world_name,
                    entity_runtime_id = game.entity_runtime_id,
                    "Start of game received"
                );
                self.game_data = Some(game.clone());
                let confirm =
                    Packet::SetLocalPlayerAsInitialised { entity_runtime_id: game.entity_runtime_id };
                Ok(LoginStep::send(vec![confirm]).event(LoginEvent::GameStarted(game.clone())))
            }
            Packet::SetLocalPlayerAsInitialised { entity_runtime_id } => {
                if self.spawned {
                    return Ok(LoginStep::default());
                }
                confirm_spawn(self.game_data.as_ref(), *entity_runtime_id)?;
                self.spawned = true;
                info!(entity_runtime_id, "Client spawned");
                Ok(LoginStep::default().event(LoginEvent::Spawned))
            }
            _ => Ok(LoginStep::default()),
        }
    }
}

/// Server role: serves a session's game data and packs to a connecting client.
#[derive(Debug)]
pub struct ServerLogin {
    game_data: GameData,
    packs: Vec<ResourcePack>,
    chunk_size: usize,
    game_started: bool,
    spawned: bool,
}

impl ServerLogin {
    pub fn new(game_data: GameData, packs: Vec<ResourcePack>, chunk_size: usize) -> Self {
        Self { game_data, packs, chunk_size: chunk_size.max(1), game_started: false, spawned: false }
    }

    fn packs_info(&self) -> Packet {
        Packet::ResourcePacksInfo(ResourcePacksInfo {
            texture_pack_required: false,
            packs: self
                .packs
                .iter()
                .map(|pack| PackInfoEntry {
                    uuid: pack.uuid().to_string(),
                    version: pack.version().to_string(),
                    size: pack.len() as u64,
                    content_key: pack.content_key().unwrap_or_default().to_string(),
                })
                .collect(),
        })
    }

    fn stack(&self) -> Packet {
        Packet::ResourcePackStack(ResourcePackStack {
            texture_pack_required: false,
            packs: self
                .packs
                .iter()
                .map(|pack| StackEntry {
                    uuid: pack.uuid().to_string(),
                    version: pack.version().to_string(),
                })
                .collect(),
            base_game_version: self.game_data.base_game_version.clone(),
        })
    }

    fn chunk(&self, request: &ResourcePackChunkRequest) -> Result<Packet> {
        let pack = self
            .packs
            .iter()
            .find(|pack| pack.uuid() == request.uuid)
            .ok_or_else(|| RelayError::UnknownPackReference { uuid: request.uuid.clone() })?;

        let offset = request.chunk_index as usize * self.chunk_size;
        if offset >= pack.len() {
            return Err(RelayError::invariant(format!(
                "chunk {} of pack {} lies past its {} bytes",
                request.chunk_index,
                request.uuid,
                pack.len()
            )));
        }
        let end = (offset + self.chunk_size).min(pack.len());
        let data: Bytes = pack.bytes().slice(offset..end);

        Ok(Packet::ResourcePackChunkData(ResourcePackChunkData {
            uuid: request.uuid.clone(),
            chunk_index: request.chunk_index,
            data_offset: offset as u64,
            data,
        }))
    }
}

impl Handshake for ServerLogin {
    fn start(&mut self) -> Vec<Packet> {
        vec![Packet::PlayStatus(PlayStatus::LoginSuccess), self.packs_info()]
    }

    fn handle(&mut self, packet: &Packet) -> Result<LoginStep> {
        if let Some(error) = disconnected(packet) {
            return Err(error);
        }

        match packet {
            Packet::Login { identity, .. } => {
                Ok(LoginStep::default().event(LoginEvent::Identified(identity.clone())))
            }
            Packet::ResourcePackChunkRequest(request) => Ok(LoginStep::send(vec![self.chunk(request)?])),
            Packet::ResourcePackClientResponse(response) => match response.status {
                ResponseStatus::SendPacks => {
                    debug!("Client requested {} packs", response.pack_ids.len());
                    Ok(LoginStep::default())
                }
                ResponseStatus::HaveAllPacks => Ok(LoginStep::send(vec![self.stack()])),
                ResponseStatus::Completed => {
                    if self.game_started {
                        return Ok(LoginStep::default());
                    }
                    self.game_started = true;
                    Ok(LoginStep::send(vec![Packet::StartGame(self.game_data.clone())])
                        .event(LoginEvent::PacksResolved(self.packs.clone()))
                        .event(LoginEvent::GameStarted(self.game_data.clone())))
                }
                ResponseStatus::Refused => Err(RelayError::Disconnected {
                    message: "client refused resource packs".to_string(),
                }),
            },
            Packet::SetLocalPlayerAsInitialised { entity_runtime_id } => {
                if self.spawned {
                    return Ok(LoginStep::default());
                }
                let started = self.game_started.then_some(&self.game_data);
                confirm_spawn(started, *entity_runtime_id)?;
                self.spawned = true;
                info!(entity_runtime_id, "Local client spawned");
                Ok(LoginStep::default().event(LoginEvent::Spawned))
            }
            _ => Ok(LoginStep::default()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn game(entity_runtime_id: u64) -> GameData {
        GameData { entity_runtime_id, world_name: "Bedrock level".into(), ..Default::default() }
    }

    /// Runs both roles against each other until neither has anything left to send.
    fn converse(client: &mut ClientLogin, server: &mut ServerLogin) -> Result<(bool, bool)> {
        let mut to_server = client.start();
        let mut to_client = server.start();
        let (mut client_spawned, mut server_spawned) = (false, false);

        while !to_server.is_empty() || !to_client.is_empty() {
            for packet in std::mem::take(&mut to_client) {
                let step = client.handle(&packet)?;
                client_spawned |= step.is_spawned();
                for outgoing in step.outgoing {
                    client_spawned |= client.handle(&outgoing)?.is_spawned();
                    to_server.push(outgoing);
                }
            }
            for packet in std::mem::take(&mut to_server) {
                let step = server.handle(&packet)?;
                server_spawned |= step.is_spawned();
                to_client.extend(step.outgoing);
            }
        }
        Ok((client_spawned, server_spawned))
    }

    #[test]
    fn full_login_downloads_packs_and_spawns_both_sides() {
        let pack = ResourcePack::new("pack-a", "1.0.0", None, Bytes::from(vec![9u8; 10]));
        let cache = Arc::new(PackCache::new());
        let mut client = ClientLogin::new(Some(IdentityData::default()), Arc::clone(&cache));
        let mut server = ServerLogin::new(game(42), vec![pack.clone()], 4);

        let (client_spawned, server_spawned) = converse(&mut client, &mut server).unwrap();

        assert!(client_spawned && server_spawned);
        assert_eq!(client.game_data(), Some(&game(42)));
        assert_eq!(client.negotiation().resource_packs(), &[pack]);
        assert!(cache.is_complete("pack-a", "1.0.0"));
    }

    #[test]
    fn mismatched_entity_id_is_an_invariant_violation() {
        let mut client = ClientLogin::new(None, Arc::new(PackCache::new()));
        client.handle(&Packet::StartGame(game(7))).unwrap();

        let err = client
            .handle(&Packet::SetLocalPlayerAsInitialised { entity_runtime_id: 8 })
            .unwrap_err();
        assert!(matches!(err, RelayError::ProtocolInvariantViolation { .. }));
        assert!(!client.is_spawned());
    }

    #[test]
    fn spawn_before_start_of_game_is_rejected() {
        let mut client = ClientLogin::new(None, Arc::new(PackCache::new()));
        let err = client
            .handle(&Packet::SetLocalPlayerAsInitialised { entity_runtime_id: 1 })
            .unwrap_err();
        assert!(matches!(err, RelayError::ProtocolInvariantViolation { .. }));
    }

    #[test]
    fn spawn_fires_once() {
        let mut client = ClientLogin::new(None, Arc::new(PackCache::new()));
        client.handle(&Packet::StartGame(game(3))).unwrap();

        let confirm = Packet::SetLocalPlayerAsInitialised { entity_runtime_id: 3 };
        assert!(client.handle(&confirm).unwrap().is_spawned());
        assert!(!client.handle(&confirm).unwrap().is_spawned());
    }

    #[test]
    fn disconnect_ends_the_login() {
        let mut client = ClientLogin::new(None, Arc::new(PackCache::new()));
        let err = client.handle(&Packet::Disconnect { message: "full".into() }).unwrap_err();
        assert!(matches!(err, RelayError::Disconnected { message } if message == "full"));
    }

    #[test]
    fn server_rejects_chunks_past_the_end() {
        let pack = ResourcePack::new("a", "1", None, Bytes::from_static(b"abc"));
        let mut server = ServerLogin::new(game(1), vec![pack], 2);

        let request = |chunk_index| {
            Packet::ResourcePackChunkRequest(ResourcePackChunkRequest { uuid: "a".into(), chunk_index })
        };
        let step = server.handle(&request(1)).unwrap();
        match &step.outgoing[..] {
            [Packet::ResourcePackChunkData(chunk)] => {
                assert_eq!(chunk.data_offset, 2);
                assert_eq!(&chunk.data[..], b"c");
            }
            other => panic!("unexpected reply {other:?}"),
        }
        assert!(server.handle(&request(2)).is_err());
    }
}
