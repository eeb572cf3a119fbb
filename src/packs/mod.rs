//! Resource packs: records, the content cache and the negotiation state machine.
//!
//! A pack is announced by uuid and version, downloaded chunk by chunk (live) or read
//! from the capture's bundled pack directory (replay), and finally resolved into the
//! ordered list a connection exposes through
//! [`Connection::resource_packs`](crate::Connection::resource_packs).

pub mod cache;
pub mod negotiation;

use bytes::Bytes;

pub use cache::PackCache;
pub use negotiation::{MAX_PACK_SIZE, Negotiation, NegotiationState};

/// Lifecycle of a pack record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PackState {
    /// Metadata announced, nothing requested yet.
    Info,
    /// Chunks are arriving.
    Downloading,
    /// All declared bytes are present.
    Complete,
}

/// Metadata and progress of one pack.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackRecord {
    pub uuid: String,
    pub version: String,
    pub content_key: Option<String>,
    pub declared_size: u64,
    pub received_bytes: u64,
    pub state: PackState,
}

impl PackRecord {
    pub fn announced(
        uuid: impl Into<String>,
        version: impl Into<String>,
        content_key: Option<String>,
        declared_size: u64,
    ) -> Self {
        Self {
            uuid: uuid.into(),
            version: version.into(),
            content_key: content_key.filter(|key| !key.is_empty()),
            declared_size,
            received_bytes: 0,
            state: PackState::Info,
        }
    }

    pub fn complete(
        uuid: impl Into<String>,
        version: impl Into<String>,
        content_key: Option<String>,
        size: u64,
    ) -> Self {
        Self {
            received_bytes: size,
            state: PackState::Complete,
            ..Self::announced(uuid, version, content_key, size)
        }
    }

    pub fn is_complete(&self) -> bool {
        self.state == PackState::Complete
    }
}

/// Descriptive metadata of a resolved pack.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackManifest {
    pub uuid: String,
    pub version: String,
    pub size: u64,
}

/// A fully available pack, as exposed to connection consumers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourcePack {
    uuid: String,
    version: String,
    content_key: Option<String>,
    data: Bytes,
}

impl ResourcePack {
    pub fn new(
        uuid: impl Into<String>,
        version: impl Into<String>,
        content_key: Option<String>,
        data: Bytes,
    ) -> Self {
        Self {
            uuid: uuid.into(),
            version: version.into(),
            content_key: content_key.filter(|key| !key.is_empty()),
            data,
        }
    }

    pub fn uuid(&self) -> &str {
        &self.uuid
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn content_key(&self) -> Option<&str> {
        self.content_key.as_deref()
    }

    pub fn encrypted(&self) -> bool {
        self.content_key.is_some()
    }

    /// Always false: no decryption key material is handled by the relay.
    pub fn can_decrypt(&self) -> bool {
        false
    }

    /// Raw pack bytes as transferred (still encrypted when [`Self::encrypted`]).
    pub fn bytes(&self) -> &Bytes {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn manifest(&self) -> PackManifest {
        PackManifest {
            uuid: self.uuid.clone(),
            version: self.version.clone(),
            size: self.data.len() as u64,
        }
    }
}
