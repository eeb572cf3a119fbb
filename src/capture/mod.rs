//! Capture containers: recording a session to disk and reading it back.
//!
//! ```no_run
//! use relaytap::capture::{CaptureArchive, CaptureWriter, Direction};
//!
//! # async fn example() -> relaytap::Result<()> {
//! let writer = CaptureWriter::create("captures/session.pcap2")?;
//! writer.write_frame(Direction::ToServer, b"\x01\x00\x00\x00")?;
//! writer.finish()?;
//!
//! let archive = CaptureArchive::open("captures/session.pcap2").await?;
//! let mut frames = archive.frames().await?;
//! while let Some(frame) = frames.next_frame().await? {
//!     println!("{:?} {} bytes", frame.direction, frame.payload.len());
//! }
//! # Ok(())
//! # }
//! ```

pub mod format;
pub mod reader;
pub mod writer;

pub use format::{Direction, FORMAT_VERSION, Frame, PackEntry};
pub use reader::{CaptureArchive, FrameReader};
pub use writer::CaptureWriter;
