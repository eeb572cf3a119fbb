//! Reading capture containers.
//!
//! [`CaptureArchive::open`] validates the header and locates the optional pack
//! directory. [`FrameReader`] then walks the frame log in write order.

use bytes::Bytes;
use std::path::{Path, PathBuf};
use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeekExt, BufReader, SeekFrom, Take};
use tracing::{debug, warn};

use super::format::{
    ContainerFooter, ContainerHeader, Direction, FOOTER_SIZE, FRAME_MAGIC_END, FRAME_MAGIC_START,
    FRAME_PREFIX_SIZE, FRAME_SUFFIX_SIZE, Frame, HEADER_SIZE, MAX_FRAME_PAYLOAD, PackEntry,
};
use crate::{RelayError, Result};

/// Sequential frame decoder over any async byte source.
///
/// The source must be positioned at the first frame (just past the header).
#[derive(Debug)]
pub struct FrameReader<R> {
    source: R,
    offset: u64,
    frames_read: u64,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    /// Wrap `source`, reporting offsets relative to `start_offset`.
    pub fn new(source: R, start_offset: u64) -> Self {
        Self { source, offset: start_offset, frames_read: 0 }
    }

    /// Next frame, `None` at a clean end of the log.
    ///
    /// A frame cut off part way reports [`RelayError::TruncatedFrame`]; a frame with
    /// broken markers reports [`RelayError::CorruptFrame`]. Either way every frame
    /// returned before it was complete.
    pub async fn next_frame(&mut self) -> Result<Option<Frame>> {
        let frame_offset = self.offset;
        let mut prefix = [0u8; FRAME_PREFIX_SIZE];
        let filled = self.fill(&mut prefix).await?;
        if filled == 0 {
            return Ok(None);
        }
        if filled < FRAME_PREFIX_SIZE {
            return Err(RelayError::TruncatedFrame {
                offset: frame_offset,
                details: format!("frame header has {} of {} bytes", filled, FRAME_PREFIX_SIZE),
            });
        }

        let magic = u32::from_le_bytes([prefix[0], prefix[1], prefix[2], prefix[3]]);
        if magic != FRAME_MAGIC_START {
            return Err(RelayError::CorruptFrame {
                offset: frame_offset,
                details: format!("start marker {:#010x}", magic),
            });
        }
        let len = u32::from_le_bytes([prefix[4], prefix[5], prefix[6], prefix[7]]);
        if len > MAX_FRAME_PAYLOAD {
            return Err(RelayError::CorruptFrame {
                offset: frame_offset,
                details: format!("payload length {} exceeds {}", len, MAX_FRAME_PAYLOAD),
            });
        }
        let direction = Direction::from_byte(prefix[8]).ok_or_else(|| RelayError::CorruptFrame {
            offset: frame_offset,
            details: format!("direction byte {}", prefix[8]),
        })?;
        let mut raw_ts = [0u8; 8];
        raw_ts.copy_from_slice(&prefix[9..17]);
        let timestamp_ms = i64::from_le_bytes(raw_ts);

        let mut payload = vec![0u8; len as usize];
        let filled = self.fill(&mut payload).await?;
        if filled < payload.len() {
            return Err(RelayError::TruncatedFrame {
                offset: frame_offset,
                details: format!("payload has {} of {} bytes", filled, len),
            });
        }

        let mut suffix = [0u8; FRAME_SUFFIX_SIZE];
        let filled = self.fill(&mut suffix).await?;
        if filled < FRAME_SUFFIX_SIZE {
            return Err(RelayError::TruncatedFrame {
                offset: frame_offset,
                details: "missing end marker".to_string(),
            });
        }
        let end = u32::from_le_bytes(suffix);
        if end != FRAME_MAGIC_END {
            return Err(RelayError::CorruptFrame {
                offset: frame_offset,
                details: format!("end marker {:#010x}", end),
            });
        }

        self.frames_read += 1;
        Ok(Some(Frame { direction, timestamp_ms, payload: Bytes::from(payload) }))
    }

    /// Frames returned so far.
    pub fn frames_read(&self) -> u64 {
        self.frames_read
    }

    /// Read until `buf` is full or the source ends, returning the bytes filled.
    async fn fill(&mut self, buf: &mut [u8]) -> Result<usize> {
        let mut filled = 0;
        while filled < buf.len() {
            let n = self
                .source
                .read(&mut buf[filled..])
                .await
                .map_err(|e| RelayError::io_error("reading capture frame", e))?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        self.offset += filled as u64;
        Ok(filled)
    }
}

/// An opened capture container.
#[derive(Debug, Clone)]
pub struct CaptureArchive {
    path: PathBuf,
    header: ContainerHeader,
    file_len: u64,
    frames_end: u64,
    packs: Vec<PackEntry>,
}

impl CaptureArchive {
    /// Open a container, validating its header and reading the pack directory if present.
    pub async fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut file =
            File::open(&path).await.map_err(|e| RelayError::file_error(path.clone(), e))?;
        let file_len = file
            .metadata()
            .await
            .map_err(|e| RelayError::file_error(path.clone(), e))?
            .len();

        let mut header_bytes = Vec::with_capacity(HEADER_SIZE);
        (&mut file)
            .take(HEADER_SIZE as u64)
            .read_to_end(&mut header_bytes)
            .await
            .map_err(|e| RelayError::file_error(path.clone(), e))?;
        let header = ContainerHeader::parse(&header_bytes)?;

        let (frames_end, packs) = match Self::read_directory(&mut file, file_len).await {
            Ok(Some(found)) => found,
            Ok(None) => {
                debug!("{} has no pack directory, reading frames to end of file", path.display());
                (file_len, Vec::new())
            }
            Err(e) => {
                warn!("Ignoring unreadable pack directory in {}: {}", path.display(), e);
                (file_len, Vec::new())
            }
        };

        debug!(
            path = %path.display(),
            version = header.version,
            frames_end,
            packs = packs.len(),
            "Opened capture"
        );
        Ok(Self { path, header, file_len, frames_end, packs })
    }

    async fn read_directory(
        file: &mut File,
        file_len: u64,
    ) -> Result<Option<(u64, Vec<PackEntry>)>> {
        if file_len < (HEADER_SIZE + FOOTER_SIZE) as u64 {
            return Ok(None);
        }
        let mut footer_bytes = [0u8; FOOTER_SIZE];
        file.seek(SeekFrom::Start(file_len - FOOTER_SIZE as u64)).await?;
        file.read_exact(&mut footer_bytes).await?;
        let Some(footer) = ContainerFooter::parse(&footer_bytes, file_len) else {
            return Ok(None);
        };

        let directory_len = file_len - FOOTER_SIZE as u64 - footer.directory_offset;
        let mut directory = vec![0u8; directory_len as usize];
        file.seek(SeekFrom::Start(footer.directory_offset)).await?;
        file.read_exact(&mut directory).await?;

        let mut pos = 0;
        let mut packs = Vec::with_capacity(footer.entry_count.min(1024) as usize);
        for _ in 0..footer.entry_count {
            let entry = PackEntry::parse(&directory, &mut pos)?;
            let in_bounds = entry
                .offset
                .checked_add(entry.size)
                .is_some_and(|end| entry.offset >= footer.frames_end && end <= footer.directory_offset);
            if !in_bounds {
                return Err(RelayError::malformed(format!(
                    "pack {} blob [{}, +{}) lies outside the blob section",
                    entry.uuid, entry.offset, entry.size
                )));
            }
            packs.push(entry);
        }
        Ok(Some((footer.frames_end, packs)))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn version(&self) -> i32 {
        self.header.version
    }

    /// Bundled packs, in the order they were added during capture.
    pub fn pack_entries(&self) -> &[PackEntry] {
        &self.packs
    }

    /// Whether the capture was finished (a pack directory is present).
    pub fn is_finished(&self) -> bool {
        self.frames_end < self.file_len
    }

    /// Open a fresh reader over the frame log.
    pub async fn frames(&self) -> Result<FrameReader<Take<BufReader<File>>>> {
        let mut file =
            File::open(&self.path).await.map_err(|e| RelayError::file_error(self.path.clone(), e))?;
        file.seek(SeekFrom::Start(HEADER_SIZE as u64))
            .await
            .map_err(|e| RelayError::file_error(self.path.clone(), e))?;
        let log_len = self.frames_end.saturating_sub(HEADER_SIZE as u64);
        Ok(FrameReader::new(BufReader::new(file).take(log_len), HEADER_SIZE as u64))
    }

    /// Read every frame, stopping at the first damaged one.
    ///
    /// Returns the complete frames plus the error that ended the log, if any.
    pub async fn read_all(&self) -> Result<(Vec<Frame>, Option<RelayError>)> {
        let mut reader = self.frames().await?;
        let mut frames = Vec::new();
        loop {
            match reader.next_frame().await {
                Ok(Some(frame)) => frames.push(frame),
                Ok(None) => return Ok((frames, None)),
                Err(e) => return Ok((frames, Some(e))),
            }
        }
    }
}
