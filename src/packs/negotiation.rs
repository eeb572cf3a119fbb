//! Resource pack negotiation state machine.
//!
//! ```text
//! Idle → InfoReceived → Downloading → Stacked → Ready
//!            └────────────────────────↗
//! ```
//!
//! The machine is an owned value. Each connection applies transitions synchronously
//! from its single reader, in arrival order, so no locking is involved. Every
//! transition returns the packets the client side should send next (chunk requests,
//! client responses); the live transport writes them and replay discards them.
//!
//! Errors here are protocol-invariant violations and are never retried.

use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, trace, warn};

use super::{PackCache, PackRecord, PackState, ResourcePack};
use crate::protocol::{
    PackInfoEntry, Packet, ResourcePackChunkData, ResourcePackChunkRequest,
    ResourcePackClientResponse, ResourcePackStack, ResourcePacksInfo, ResponseStatus,
};
use crate::{RelayError, Result};

/// Largest pack a peer may announce.
pub const MAX_PACK_SIZE: u64 = 1024 * 1024 * 1024;

/// Download buffers grow past this as chunks arrive instead of being reserved up front.
const INITIAL_BUFFER_LIMIT: u64 = 1024 * 1024;

/// Phase of the negotiation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationState {
    Idle,
    InfoReceived,
    Downloading,
    Stacked,
    Ready,
}

#[derive(Debug)]
struct Download {
    record: PackRecord,
    buffer: Vec<u8>,
    next_chunk: u32,
}

/// Drives pack discovery, chunked download and ordering for one session.
#[derive(Debug)]
pub struct Negotiation {
    state: NegotiationState,
    cache: Arc<PackCache>,
    announced: HashMap<String, PackInfoEntry>,
    downloads: HashMap<String, Download>,
    resolved: Vec<ResourcePack>,
}

impl Negotiation {
    pub fn new(cache: Arc<PackCache>) -> Self {
        Self {
            state: NegotiationState::Idle,
            cache,
            announced: HashMap::new(),
            downloads: HashMap::new(),
            resolved: Vec::new(),
        }
    }

    pub fn state(&self) -> NegotiationState {
        self.state
    }

    pub fn is_ready(&self) -> bool {
        self.state == NegotiationState::Ready
    }

    /// Final ordered pack list; empty until the machine is [`NegotiationState::Ready`].
    pub fn resource_packs(&self) -> &[ResourcePack] {
        &self.resolved
    }

    pub fn cache(&self) -> &Arc<PackCache> {
        &self.cache
    }

    /// Apply one message. Messages that do not concern negotiation yield nothing.
    pub fn handle(&mut self, packet: &Packet) -> Result<Vec<Packet>> {
        match packet {
            Packet::ResourcePacksInfo(info) => self.on_packs_info(info),
            Packet::ResourcePackChunkData(chunk) => self.on_chunk_data(chunk),
            Packet::ResourcePackStack(stack) => self.on_stack(stack),
            _ => Ok(Vec::new()),
        }
    }

    pub fn on_packs_info(&mut self, info: &ResourcePacksInfo) -> Result<Vec<Packet>> {
        if self.state != NegotiationState::Idle {
            return Err(RelayError::invariant(format!(
                "resource pack info received in state {:?}",
                self.state
            )));
        }

        if let Some(entry) = info.packs.iter().find(|entry| entry.size > MAX_PACK_SIZE) {
            return Err(RelayError::SizeMismatch {
                uuid: entry.uuid.clone(),
                declared: entry.size,
                received: 0,
            });
        }

        info!("Server announced {} resource packs", info.packs.len());
        let mut outgoing = Vec::new();

        for entry in &info.packs {
            self.announced.insert(entry.uuid.clone(), entry.clone());

            if self.cache.is_complete(&entry.uuid, &entry.version) {
                debug!(uuid = %entry.uuid, version = %entry.version, "Pack already cached");
                continue;
            }

            let content_key = Some(entry.content_key.clone());
            let mut record =
                PackRecord::announced(&entry.uuid, &entry.version, content_key, entry.size);

            if entry.size == 0 {
                self.cache.put(&entry.uuid, &entry.version, record.content_key, Default::default());
                continue;
            }

            record.state = PackState::Downloading;
            self.downloads.insert(
                entry.uuid.clone(),
                Download {
                    record,
                    buffer: Vec::with_capacity(entry.size.min(INITIAL_BUFFER_LIMIT) as usize),
                    next_chunk: 0,
                },
            );
        }

        if self.downloads.is_empty() {
            self.state = NegotiationState::InfoReceived;
            outgoing.push(client_response(ResponseStatus::HaveAllPacks, Vec::new()));
            return Ok(outgoing);
        }

        let mut missing: Vec<String> = self.downloads.keys().cloned().collect();
        missing.sort();
        debug!("Requesting {} packs: {:?}", missing.len(), missing);

        outgoing.push(client_response(ResponseStatus::SendPacks, missing.clone()));
        for uuid in missing {
            outgoing.push(Packet::ResourcePackChunkRequest(ResourcePackChunkRequest {
                uuid,
                chunk_index: 0,
            }));
        }

        self.state = NegotiationState::Downloading;
        Ok(outgoing)
    }

    pub fn on_chunk_data(&mut self, chunk: &ResourcePackChunkData) -> Result<Vec<Packet>> {
        let Some(download) = self.downloads.get_mut(&chunk.uuid) else {
            // A replayed log still carries the chunks of packs its directory already holds.
            if let Some(entry) = self.announced.get(&chunk.uuid) {
                if self.cache.is_complete(&entry.uuid, &entry.version) {
                    trace!(uuid = %chunk.uuid, chunk = chunk.chunk_index, "Chunk for cached pack ignored");
                    return Ok(Vec::new());
                }
            }
            return Err(RelayError::UnknownPackReference { uuid: chunk.uuid.clone() });
        };

        if chunk.chunk_index != download.next_chunk {
            return Err(RelayError::UnexpectedChunk {
                uuid: chunk.uuid.clone(),
                expected: download.next_chunk,
                got: chunk.chunk_index,
            });
        }

        let declared = download.record.declared_size;
        let received = download.record.received_bytes + chunk.data.len() as u64;
        if received > declared || chunk.data.is_empty() {
            return Err(RelayError::SizeMismatch { uuid: chunk.uuid.clone(), declared, received });
        }

        download.buffer.extend_from_slice(&chunk.data);
        download.record.received_bytes = received;
        download.next_chunk += 1;
        trace!(
            uuid = %chunk.uuid,
            chunk = chunk.chunk_index,
            received,
            declared,
            "Pack chunk received"
        );

        if received < declared {
            return Ok(vec![Packet::ResourcePackChunkRequest(ResourcePackChunkRequest {
                uuid: chunk.uuid.clone(),
                chunk_index: download.next_chunk,
            })]);
        }

        if let Some(done) = self.downloads.remove(&chunk.uuid) {
            let record = done.record;
            self.cache.put(&record.uuid, &record.version, record.content_key, done.buffer.into());
            info!(uuid = %record.uuid, size = record.declared_size, "Pack download complete");
        }

        if self.downloads.is_empty() {
            return Ok(vec![client_response(ResponseStatus::HaveAllPacks, Vec::new())]);
        }
        Ok(Vec::new())
    }

    pub fn on_stack(&mut self, stack: &ResourcePackStack) -> Result<Vec<Packet>> {
        if matches!(self.state, NegotiationState::Stacked | NegotiationState::Ready) {
            return Err(RelayError::invariant("duplicate resource pack stack"));
        }

        for entry in &stack.packs {
            if !self.announced.contains_key(&entry.uuid) {
                return Err(RelayError::UnknownPackReference { uuid: entry.uuid.clone() });
            }
            if let Some(download) = self.downloads.get(&entry.uuid) {
                return Err(RelayError::SizeMismatch {
                    uuid: entry.uuid.clone(),
                    declared: download.record.declared_size,
                    received: download.record.received_bytes,
                });
            }
        }

        if !self.downloads.is_empty() {
            warn!("{} announced packs never finished downloading", self.downloads.len());
        }
        self.state = NegotiationState::Stacked;

        let mut resolved = Vec::with_capacity(stack.packs.len());
        for entry in &stack.packs {
            let pack = self.cache.resolve(&entry.uuid)?;
            if pack.version() != entry.version {
                debug!(
                    uuid = %entry.uuid,
                    stacked = %entry.version,
                    cached = %pack.version(),
                    "Stack version differs from announced pack"
                );
            }
            resolved.push(pack);
        }

        self.resolved = resolved;
        self.state = NegotiationState::Ready;
        info!("Resource pack stack resolved ({} packs)", self.resolved.len());

        Ok(vec![client_response(ResponseStatus::Completed, Vec::new())])
    }
}

fn client_response(status: ResponseStatus, pack_ids: Vec<String>) -> Packet {
    Packet::ResourcePackClientResponse(ResourcePackClientResponse { status, pack_ids })
}
