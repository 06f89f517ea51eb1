//! Cross-process IPC - segmented channels and the envelope codec
//!
//! # Architecture
//!
//! ```text
//! IpcWriter<E> ── encode ──▶ segment 0 ─▶ segment 1 ─▶ ... ──▶ IpcReader<E> ── deliver ──▶ E::Target
//!                             (heap or memory-mapped files)
//! ```
//!
//! - [`segments`]: fixed-capacity segments allocated lazily by index
//! - [`encoding`]: per-interface binary encodings and the channel header
//! - [`channel`]: record framing, the writer, the reader and `decode_all`
//! - [`dir`]: command directories (channel files + `channel.toml`)

pub mod channel;
pub mod dir;
pub mod encoding;
pub mod segments;

pub use channel::{ChannelOptions, IpcReader, IpcSender, IpcWriter, ReadOutcome, decode_all};
pub use dir::{ChannelMetadata, CommandDir, IpcCommandReader};
pub use encoding::{ChannelHeader, Encoding};
pub use segments::{AllocatedSegments, MappedSegments, Segment, SegmentSequence};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IpcError {
  #[error("IO error: {0}")]
  Io(String),
  #[error("Segment {index}: access of {len} bytes at offset {offset} exceeds capacity {capacity}")]
  OutOfBounds {
    index: usize,
    offset: usize,
    len: usize,
    capacity: usize,
  },
  #[error("Record of {size} bytes does not fit in a segment of {capacity} bytes")]
  RecordTooLarge { size: usize, capacity: usize },
  #[error("Channel full: limit of {0} segments reached")]
  ChannelFull(usize),
  #[error("Channel already closed")]
  Closed,
  #[error("Truncated data: needed {needed} bytes, {remaining} remaining")]
  Truncated { needed: usize, remaining: usize },
  #[error("Corrupt channel data: {0}")]
  Corrupt(String),
  #[error("Unknown {interface} message tag {tag}")]
  UnknownTag { interface: &'static str, tag: u8 },
  #[error("Unsupported channel format version {found} (supported: {supported})")]
  UnsupportedFormat { found: u16, supported: u16 },
  #[error("Channel carries {found} v{found_version}, expected {expected} v{expected_version}")]
  InterfaceMismatch {
    expected: String,
    expected_version: u32,
    found: String,
    found_version: u32,
  },
  #[error("Invalid channel metadata: {0}")]
  Metadata(String),
}

impl From<std::io::Error> for IpcError {
  fn from(err: std::io::Error) -> Self {
    IpcError::Io(err.to_string())
  }
}
