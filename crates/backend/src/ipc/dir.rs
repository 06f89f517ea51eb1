//! Command directories
//!
//! A command directory carries launcher → daemon commands:
//!
//! ```text
//! <run dir>/commands/
//!   ├── channel.toml     format version, interface, segment capacity
//!   ├── request.0        segment files, created on demand
//!   ├── request.1
//!   └── ...
//! ```
//!
//! The metadata file is written before any segment, and readers refuse
//! directories whose format or interface version they do not know.

use std::{
  path::{Path, PathBuf},
  sync::Arc,
  time::Duration,
};

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::{
  IpcError,
  channel::{ChannelOptions, IpcReader, IpcWriter, decode_all},
  encoding::{ChannelHeader, Encoding, FORMAT_VERSION},
  segments::MappedSegments,
};
use crate::events::{CommandEvent, CommandListener};

const METADATA_FILE: &str = "channel.toml";
const REQUEST_PREFIX: &str = "request";

/// Contents of `channel.toml`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelMetadata {
  pub format_version: u16,
  pub interface: String,
  pub interface_version: u32,
  pub segment_capacity: usize,
}

impl ChannelMetadata {
  pub fn for_encoding<E: Encoding>(segment_capacity: usize) -> Self {
    Self {
      format_version: FORMAT_VERSION,
      interface: E::INTERFACE.to_string(),
      interface_version: E::VERSION,
      segment_capacity,
    }
  }

  fn header(&self) -> ChannelHeader {
    ChannelHeader {
      format_version: self.format_version,
      interface: self.interface.clone(),
      interface_version: self.interface_version,
    }
  }
}

/// A directory holding one command channel.
#[derive(Debug, Clone)]
pub struct CommandDir {
  path: PathBuf,
  metadata: ChannelMetadata,
}

impl CommandDir {
  /// Create the directory and its metadata file.
  pub fn create(path: impl Into<PathBuf>, segment_capacity: usize) -> Result<Self, IpcError> {
    let path = path.into();
    std::fs::create_dir_all(&path)?;

    let metadata = ChannelMetadata::for_encoding::<CommandEvent>(segment_capacity);
    let rendered = toml::to_string_pretty(&metadata).map_err(|e| IpcError::Metadata(e.to_string()))?;
    std::fs::write(path.join(METADATA_FILE), rendered)?;

    info!(path = ?path, segment_capacity, "Created command directory");
    Ok(Self { path, metadata })
  }

  /// Open an existing directory, validating its metadata.
  pub fn open(path: impl Into<PathBuf>) -> Result<Self, IpcError> {
    let path = path.into();
    let metadata_path = path.join(METADATA_FILE);
    let content = std::fs::read_to_string(&metadata_path)
      .map_err(|e| IpcError::Metadata(format!("cannot read {:?}: {}", metadata_path, e)))?;
    let metadata: ChannelMetadata =
      toml::from_str(&content).map_err(|e| IpcError::Metadata(format!("cannot parse {:?}: {}", metadata_path, e)))?;

    metadata.header().check::<CommandEvent>()?;
    if metadata.segment_capacity == 0 {
      return Err(IpcError::Metadata("segment capacity must be positive".into()));
    }

    debug!(path = ?path, "Opened command directory");
    Ok(Self { path, metadata })
  }

  pub fn path(&self) -> &Path {
    &self.path
  }

  pub fn metadata(&self) -> &ChannelMetadata {
    &self.metadata
  }

  fn request_segments(&self) -> Arc<MappedSegments> {
    Arc::new(MappedSegments::new(
      &self.path,
      REQUEST_PREFIX,
      self.metadata.segment_capacity,
    ))
  }

  /// Writer for the launcher side.
  pub fn command_writer(&self, options: ChannelOptions) -> Result<IpcWriter<CommandEvent>, IpcError> {
    IpcWriter::create(self.request_segments(), options)
  }

  /// Reader for the daemon side.
  pub fn command_reader(&self) -> Result<IpcReader<CommandEvent>, IpcError> {
    IpcReader::open(self.request_segments())
  }
}

/// Reads a command directory and dispatches to a [`CommandListener`].
pub struct IpcCommandReader {
  reader: IpcReader<CommandEvent>,
  poll_interval: Duration,
}

impl IpcCommandReader {
  pub fn new(dir: &CommandDir, poll_interval: Duration) -> Result<Self, IpcError> {
    Ok(Self {
      reader: dir.command_reader()?,
      poll_interval,
    })
  }

  /// Run until end of stream or cancellation; corrupt input is an error.
  pub async fn run(
    mut self,
    target: &mut (dyn CommandListener + 'static),
    cancel: &CancellationToken,
  ) -> Result<u64, IpcError> {
    decode_all(&mut self.reader, target, self.poll_interval, cancel).await
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::domain::suite::SuiteConfiguration;
  use tempfile::TempDir;

  #[derive(Default)]
  struct Recorder(Vec<CommandEvent>);

  impl CommandListener for Recorder {
    fn run_tests(&mut self, config: SuiteConfiguration) {
      self.0.push(CommandEvent::RunTests(config));
    }

    fn shutdown(&mut self) {
      self.0.push(CommandEvent::Shutdown);
    }
  }

  #[tokio::test]
  async fn test_commands_cross_the_directory() {
    let tmp = TempDir::new().unwrap();
    let created = CommandDir::create(tmp.path().join("commands"), 256).unwrap();

    let mut writer = created.command_writer(ChannelOptions::default()).unwrap();
    let config = SuiteConfiguration {
      include_pattern: "bin/*".into(),
      ..Default::default()
    };
    writer.write(&CommandEvent::RunTests(config.clone())).unwrap();
    writer.write(&CommandEvent::Shutdown).unwrap();
    writer.close().unwrap();

    // The daemon opens the directory independently
    let opened = CommandDir::open(created.path()).unwrap();
    assert_eq!(opened.metadata(), created.metadata());

    let mut recorder = Recorder::default();
    let reader = IpcCommandReader::new(&opened, Duration::from_millis(1)).unwrap();
    let delivered = reader.run(&mut recorder, &CancellationToken::new()).await.unwrap();

    assert_eq!(delivered, 2);
    assert_eq!(recorder.0, vec![CommandEvent::RunTests(config), CommandEvent::Shutdown]);
  }

  #[test]
  fn test_unknown_format_version_is_rejected() {
    let tmp = TempDir::new().unwrap();
    let dir = CommandDir::create(tmp.path(), 256).unwrap();
    let mut metadata = dir.metadata().clone();
    metadata.format_version = FORMAT_VERSION + 1;
    std::fs::write(tmp.path().join(METADATA_FILE), toml::to_string(&metadata).unwrap()).unwrap();

    assert!(matches!(
      CommandDir::open(tmp.path()),
      Err(IpcError::UnsupportedFormat { .. })
    ));
  }

  #[test]
  fn test_missing_metadata_is_rejected() {
    let tmp = TempDir::new().unwrap();
    assert!(matches!(CommandDir::open(tmp.path()), Err(IpcError::Metadata(_))));
  }
}
