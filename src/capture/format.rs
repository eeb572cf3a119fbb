//! Capture container format structures and parsing
//!
//! ## Container Structure
//!
//! 1. **Header** (8 bytes) - magic `BTCP` followed by an `i32` format version
//! 2. **Frame Log** - append-only sequence of frames
//! 3. **Pack Blobs** - raw bytes of every bundled resource pack (written on finish)
//! 4. **Pack Directory** - one entry per bundled pack, pointing into the blobs
//! 5. **Footer** (24 bytes) - locates the frame log end and the directory
//!
//! Sections 3-5 are only present once the capture was finished. A capture cut
//! short by a crash is still readable: its frame log runs to the end of the file.
//!
//! ## Frame Layout (little-endian)
//!
//! ```text
//! [u32 0xAAAAAAAA][u32 payload_len][u8 direction][i64 unix_millis][payload][u32 0xBBBBBBBB]
//! ```
//!
//! ## Directory Entry Layout
//!
//! ```text
//! [u32 0xCCCCCCCC][u16 len][uuid][u16 len][version][u16 len][content key][u64 offset][u64 size]
//! ```
//!
//! ## Footer Layout
//!
//! ```text
//! [u64 frames_end][u64 directory_offset][u32 entry_count][b"BTPD"]
//! ```

use bytes::Bytes;
use std::io::{self, Write};
use tracing::warn;

use crate::{RelayError, Result};

pub const CONTAINER_MAGIC: [u8; 4] = *b"BTCP";
pub const FORMAT_VERSION: i32 = 3;
pub const HEADER_SIZE: usize = 8;

pub const FRAME_MAGIC_START: u32 = 0xAAAA_AAAA;
pub const FRAME_MAGIC_END: u32 = 0xBBBB_BBBB;
/// Leading magic, length, direction and timestamp.
pub const FRAME_PREFIX_SIZE: usize = 4 + 4 + 1 + 8;
pub const FRAME_SUFFIX_SIZE: usize = 4;
/// Frames claiming more than this are treated as corruption, not allocated.
pub const MAX_FRAME_PAYLOAD: u32 = 64 * 1024 * 1024;

pub const PACK_ENTRY_MAGIC: u32 = 0xCCCC_CCCC;
pub const FOOTER_MAGIC: [u8; 4] = *b"BTPD";
pub const FOOTER_SIZE: usize = 8 + 8 + 4 + 4;

/// Traffic direction of a captured frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    ToServer,
    ToClient,
}

impl Direction {
    pub fn to_byte(self) -> u8 {
        match self {
            Direction::ToServer => 1,
            Direction::ToClient => 0,
        }
    }

    pub fn from_byte(value: u8) -> Option<Self> {
        match value {
            1 => Some(Direction::ToServer),
            0 => Some(Direction::ToClient),
            _ => None,
        }
    }
}

/// One captured protocol message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub direction: Direction,
    pub timestamp_ms: i64,
    pub payload: Bytes,
}

impl Frame {
    /// Bytes this frame occupies on disk.
    pub fn encoded_len(&self) -> usize {
        FRAME_PREFIX_SIZE + self.payload.len() + FRAME_SUFFIX_SIZE
    }
}

/// Container header record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContainerHeader {
    pub version: i32,
}

impl ContainerHeader {
    pub fn current() -> Self {
        Self { version: FORMAT_VERSION }
    }

    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut out = [0u8; HEADER_SIZE];
        out[..4].copy_from_slice(&CONTAINER_MAGIC);
        out[4..].copy_from_slice(&self.version.to_le_bytes());
        out
    }

    /// Parse and validate a header. Magic is checked before version.
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < HEADER_SIZE {
            return Err(RelayError::malformed(format!(
                "header needs {} bytes, file has {}",
                HEADER_SIZE,
                data.len()
            )));
        }
        if data[..4] != CONTAINER_MAGIC {
            return Err(RelayError::malformed(format!(
                "bad magic {:02x?}, expected {:02x?}",
                &data[..4],
                CONTAINER_MAGIC
            )));
        }
        let version = parse_i32_le(data, 4)?;
        if version != FORMAT_VERSION {
            return Err(RelayError::UnsupportedVersion { expected: FORMAT_VERSION, found: version });
        }
        Ok(Self { version })
    }
}

/// One bundled pack in the directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackEntry {
    pub uuid: String,
    pub version: String,
    pub content_key: String,
    pub offset: u64,
    pub size: u64,
}

impl PackEntry {
    pub fn write_to(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&PACK_ENTRY_MAGIC.to_le_bytes());
        write_string(out, &self.uuid);
        write_string(out, &self.version);
        write_string(out, &self.content_key);
        out.extend_from_slice(&self.offset.to_le_bytes());
        out.extend_from_slice(&self.size.to_le_bytes());
    }

    /// Parse one entry at `*pos`, advancing it past the entry.
    pub fn parse(data: &[u8], pos: &mut usize) -> Result<Self> {
        let magic = parse_u32_le(data, *pos)?;
        if magic != PACK_ENTRY_MAGIC {
            return Err(RelayError::malformed(format!(
                "pack directory entry at {} has magic {:#x}",
                *pos, magic
            )));
        }
        *pos += 4;
        let uuid = parse_string(data, pos)?;
        let version = parse_string(data, pos)?;
        let content_key = parse_string(data, pos)?;
        let offset = parse_u64_le(data, *pos)?;
        let size = parse_u64_le(data, *pos + 8)?;
        *pos += 16;
        Ok(Self { uuid, version, content_key, offset, size })
    }
}

/// Trailer locating the pack directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContainerFooter {
    pub frames_end: u64,
    pub directory_offset: u64,
    pub entry_count: u32,
}

impl ContainerFooter {
    pub fn to_bytes(&self) -> [u8; FOOTER_SIZE] {
        let mut out = [0u8; FOOTER_SIZE];
        out[0..8].copy_from_slice(&self.frames_end.to_le_bytes());
        out[8..16].copy_from_slice(&self.directory_offset.to_le_bytes());
        out[16..20].copy_from_slice(&self.entry_count.to_le_bytes());
        out[20..24].copy_from_slice(&FOOTER_MAGIC);
        out
    }

    /// Parse a footer read from the last [`FOOTER_SIZE`] bytes of a file of `file_len`.
    ///
    /// Returns `None` when no plausible footer is present (unfinished capture).
    pub fn parse(data: &[u8], file_len: u64) -> Option<Self> {
        if data.len() < FOOTER_SIZE || data[20..24] != FOOTER_MAGIC {
            return None;
        }
        let footer = Self {
            frames_end: parse_u64_le(data, 0).ok()?,
            directory_offset: parse_u64_le(data, 8).ok()?,
            entry_count: parse_u32_le(data, 16).ok()?,
        };
        let directory_end = file_len.checked_sub(FOOTER_SIZE as u64)?;
        let plausible = footer.frames_end >= HEADER_SIZE as u64
            && footer.frames_end <= footer.directory_offset
            && footer.directory_offset <= directory_end;
        plausible.then_some(footer)
    }
}

/// Current wall-clock time in unix milliseconds.
pub fn unix_millis() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as i64)
        .unwrap_or_default()
}

/// Write one frame.
///
/// A payload write that comes up short is padded with zero bytes to the declared
/// length so the trailing magic stays where a reader expects it. The payload error,
/// if any, is still returned after the frame is closed. Payloads over
/// [`MAX_FRAME_PAYLOAD`] are rejected before anything is written.
pub fn write_frame<W: Write>(
    out: &mut W,
    direction: Direction,
    timestamp_ms: i64,
    payload: &[u8],
) -> io::Result<()> {
    if payload.len() > MAX_FRAME_PAYLOAD as usize {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("frame payload of {} bytes exceeds {}", payload.len(), MAX_FRAME_PAYLOAD),
        ));
    }

    let mut prefix = [0u8; FRAME_PREFIX_SIZE];
    prefix[0..4].copy_from_slice(&FRAME_MAGIC_START.to_le_bytes());
    prefix[4..8].copy_from_slice(&(payload.len() as u32).to_le_bytes());
    prefix[8] = direction.to_byte();
    prefix[9..17].copy_from_slice(&timestamp_ms.to_le_bytes());
    out.write_all(&prefix)?;

    let mut written = 0;
    let mut payload_error = None;
    while written < payload.len() {
        match out.write(&payload[written..]) {
            Ok(0) => break,
            Ok(n) => written += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                payload_error = Some(e);
                break;
            }
        }
    }

    if written < payload.len() {
        let missing = payload.len() - written;
        warn!("Short payload write ({} of {} bytes), padding frame", written, payload.len());
        out.write_all(&vec![0u8; missing])?;
    }

    out.write_all(&FRAME_MAGIC_END.to_le_bytes())?;

    match payload_error {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

fn write_string(out: &mut Vec<u8>, value: &str) {
    let bytes = value.as_bytes();
    let len = bytes.len().min(u16::MAX as usize);
    out.extend_from_slice(&(len as u16).to_le_bytes());
    out.extend_from_slice(&bytes[..len]);
}

fn parse_string(data: &[u8], pos: &mut usize) -> Result<String> {
    let len = parse_u16_le(data, *pos)? as usize;
    *pos += 2;
    let end = pos.checked_add(len).filter(|end| *end <= data.len()).ok_or_else(|| {
        RelayError::malformed(format!("string of {} bytes at {} overruns directory", len, *pos))
    })?;
    let value = String::from_utf8_lossy(&data[*pos..end]).into_owned();
    *pos = end;
    Ok(value)
}

fn insufficient(kind: &str, offset: usize, need: usize, data: &[u8]) -> RelayError {
    RelayError::malformed(format!(
        "insufficient data for {} at offset {} (need {} bytes, have {})",
        kind,
        offset,
        need,
        data.len().saturating_sub(offset)
    ))
}

fn parse_u16_le(data: &[u8], offset: usize) -> Result<u16> {
    match data.get(offset..offset + 2) {
        Some(b) => Ok(u16::from_le_bytes([b[0], b[1]])),
        None => Err(insufficient("u16", offset, 2, data)),
    }
}

fn parse_u32_le(data: &[u8], offset: usize) -> Result<u32> {
    match data.get(offset..offset + 4) {
        Some(b) => Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]])),
        None => Err(insufficient("u32", offset, 4, data)),
    }
}

fn parse_i32_le(data: &[u8], offset: usize) -> Result<i32> {
    parse_u32_le(data, offset).map(|value| value as i32)
}

fn parse_u64_le(data: &[u8], offset: usize) -> Result<u64> {
    match data.get(offset..offset + 8) {
        Some(b) => {
            let mut raw = [0u8; 8];
            raw.copy_from_slice(b);
            Ok(u64::from_le_bytes(raw))
        }
        None => Err(insufficient("u64", offset, 8, data)),
    }
}
