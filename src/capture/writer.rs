//! Append-only capture writer.

use parking_lot::Mutex;
use std::fs::File;
use std::io::{BufWriter, Seek, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info, trace, warn};

use super::format::{
    ContainerFooter, ContainerHeader, Direction, PackEntry, unix_millis, write_frame,
};
use crate::packs::ResourcePack;
use crate::{RelayError, Result};

#[derive(Debug)]
struct WriterState {
    out: BufWriter<File>,
    packs: Vec<ResourcePack>,
}

/// Writes one capture container.
///
/// Every frame is written under a single lock owned by the writer, so concurrent
/// producers never interleave the parts of two frames. The pack directory is written
/// by [`CaptureWriter::finish`], which also runs on drop.
#[derive(Debug)]
pub struct CaptureWriter {
    path: PathBuf,
    state: Mutex<Option<WriterState>>,
    frames: AtomicU64,
}

impl CaptureWriter {
    /// Create (truncating) a container at `path` and write its header.
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .map_err(|e| RelayError::file_error(parent.to_path_buf(), e))?;
        }

        let file = File::create(&path).map_err(|e| RelayError::file_error(path.clone(), e))?;
        let mut out = BufWriter::new(file);
        out.write_all(&ContainerHeader::current().to_bytes())
            .and_then(|_| out.flush())
            .map_err(|e| RelayError::file_error(path.clone(), e))?;

        info!("Capturing to {}", path.display());
        Ok(Self {
            path,
            state: Mutex::new(Some(WriterState { out, packs: Vec::new() })),
            frames: AtomicU64::new(0),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one frame stamped with the current time.
    pub fn write_frame(&self, direction: Direction, payload: &[u8]) -> Result<()> {
        self.write_frame_at(direction, unix_millis(), payload)
    }

    /// Append one frame with an explicit timestamp.
    pub fn write_frame_at(&self, direction: Direction, timestamp_ms: i64, payload: &[u8]) -> Result<()> {
        let mut guard = self.state.lock();
        let state = guard.as_mut().ok_or(RelayError::ConnectionClosed)?;

        write_frame(&mut state.out, direction, timestamp_ms, payload)
            .and_then(|_| state.out.flush())
            .map_err(|e| RelayError::file_error(self.path.clone(), e))?;

        let total = self.frames.fetch_add(1, Ordering::Relaxed) + 1;
        trace!(frames = total, len = payload.len(), ?direction, "Captured frame");
        Ok(())
    }

    /// Best-effort [`Self::write_frame`]: failures are logged and swallowed so that
    /// capturing never interrupts forwarding.
    pub fn record(&self, direction: Direction, payload: &[u8]) {
        if let Err(e) = self.write_frame(direction, payload) {
            warn!("Capture write to {} failed: {}", self.path.display(), e);
        }
    }

    /// Bundle a resolved pack into the container. Later packs with the same uuid are ignored.
    pub fn add_pack(&self, pack: ResourcePack) {
        let mut guard = self.state.lock();
        let Some(state) = guard.as_mut() else {
            warn!("Capture already finished, not bundling pack {}", pack.uuid());
            return;
        };
        if state.packs.iter().any(|existing| existing.uuid() == pack.uuid()) {
            return;
        }
        debug!(uuid = %pack.uuid(), size = pack.len(), "Bundling pack into capture");
        state.packs.push(pack);
    }

    /// Frames appended so far.
    pub fn frames_written(&self) -> u64 {
        self.frames.load(Ordering::Relaxed)
    }

    pub fn is_finished(&self) -> bool {
        self.state.lock().is_none()
    }

    /// Write pack blobs, the pack directory and the footer, then close the file.
    ///
    /// Calling this again is a no-op. Frames written afterwards are rejected.
    pub fn finish(&self) -> Result<()> {
        let Some(mut state) = self.state.lock().take() else {
            return Ok(());
        };
        let path = self.path.clone();
        let io_err = |e| RelayError::file_error(path.clone(), e);

        let frames_end = state.out.stream_position().map_err(io_err)?;
        let mut position = frames_end;
        let mut entries = Vec::with_capacity(state.packs.len());
        for pack in &state.packs {
            state.out.write_all(pack.bytes()).map_err(io_err)?;
            entries.push(PackEntry {
                uuid: pack.uuid().to_string(),
                version: pack.version().to_string(),
                content_key: pack.content_key().unwrap_or_default().to_string(),
                offset: position,
                size: pack.len() as u64,
            });
            position += pack.len() as u64;
        }

        let mut directory = Vec::new();
        for entry in &entries {
            entry.write_to(&mut directory);
        }
        state.out.write_all(&directory).map_err(io_err)?;

        let footer = ContainerFooter {
            frames_end,
            directory_offset: position,
            entry_count: entries.len() as u32,
        };
        state.out.write_all(&footer.to_bytes()).map_err(io_err)?;
        state.out.flush().map_err(io_err)?;
        state.out.get_ref().sync_all().map_err(io_err)?;

        info!(
            frames = self.frames_written(),
            packs = entries.len(),
            "Capture {} finished",
            self.path.display()
        );
        Ok(())
    }
}

impl Drop for CaptureWriter {
    fn drop(&mut self) {
        if let Err(e) = self.finish() {
            warn!("Failed to finish capture {}: {}", self.path.display(), e);
        }
    }
}
