//! Binary encodings for envelopes
//!
//! Each interface gets a closed tag space: one `u8` tag per method followed by
//! the arguments in declaration order. Integers are little-endian, strings are
//! `u32` length + UTF-8, optional values carry a `u8` presence flag.
//!
//! A channel (file-backed or socket) starts with a [`ChannelHeader`] naming
//! the interface and its version. Readers refuse anything they do not
//! understand instead of guessing.

use std::path::PathBuf;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::IpcError;
use crate::{
  domain::suite::{StackTrace, SuiteConfiguration, TestFile, TestId},
  events::{CommandEvent, SuiteEvent},
};

/// Version of the framing and header layout itself
pub const FORMAT_VERSION: u16 = 1;

const MAGIC: &[u8; 4] = b"VLLY";

/// Deepest cause chain accepted when decoding a stack trace
const MAX_CAUSE_DEPTH: usize = 64;

/// Binary encoding of one interface's envelopes.
pub trait Encoding: Sized + Send + 'static {
  /// Interface name written into channel headers
  const INTERFACE: &'static str;
  /// Bumped whenever the tag space or argument layout changes
  const VERSION: u32;

  fn encode(&self, buf: &mut BytesMut);

  fn decode(buf: &mut Bytes) -> Result<Self, IpcError>;
}

/// Encode into a standalone buffer.
pub fn to_bytes<E: Encoding>(event: &E) -> Bytes {
  let mut buf = BytesMut::new();
  event.encode(&mut buf);
  buf.freeze()
}

/// Decode a buffer that must contain exactly one envelope.
pub fn from_bytes<E: Encoding>(mut bytes: Bytes) -> Result<E, IpcError> {
  let event = E::decode(&mut bytes)?;
  if bytes.has_remaining() {
    return Err(IpcError::Corrupt(format!(
      "{} trailing bytes after {} message",
      bytes.remaining(),
      E::INTERFACE
    )));
  }
  Ok(event)
}

// ============================================================================
// Channel header
// ============================================================================

/// First record of every channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelHeader {
  pub format_version: u16,
  pub interface: String,
  pub interface_version: u32,
}

impl ChannelHeader {
  pub fn for_encoding<E: Encoding>() -> Self {
    Self {
      format_version: FORMAT_VERSION,
      interface: E::INTERFACE.to_string(),
      interface_version: E::VERSION,
    }
  }

  pub fn encode(&self, buf: &mut BytesMut) {
    buf.put_slice(MAGIC);
    buf.put_u16_le(self.format_version);
    put_string(buf, &self.interface);
    buf.put_u32_le(self.interface_version);
  }

  pub fn decode(buf: &mut Bytes) -> Result<Self, IpcError> {
    ensure(buf, MAGIC.len())?;
    let magic = buf.split_to(MAGIC.len());
    if magic.as_ref() != MAGIC {
      return Err(IpcError::Corrupt(format!("bad channel magic {:02x?}", magic.as_ref())));
    }
    let format_version = get_u16(buf)?;
    if format_version != FORMAT_VERSION {
      return Err(IpcError::UnsupportedFormat {
        found: format_version,
        supported: FORMAT_VERSION,
      });
    }
    Ok(Self {
      format_version,
      interface: get_string(buf)?,
      interface_version: get_u32(buf)?,
    })
  }

  /// Accept the header only if it describes exactly `E`.
  pub fn check<E: Encoding>(&self) -> Result<(), IpcError> {
    if self.format_version != FORMAT_VERSION {
      return Err(IpcError::UnsupportedFormat {
        found: self.format_version,
        supported: FORMAT_VERSION,
      });
    }
    if self.interface != E::INTERFACE || self.interface_version != E::VERSION {
      return Err(IpcError::InterfaceMismatch {
        expected: E::INTERFACE.to_string(),
        expected_version: E::VERSION,
        found: self.interface.clone(),
        found_version: self.interface_version,
      });
    }
    Ok(())
  }
}

// ============================================================================
// Primitives
// ============================================================================

fn ensure(buf: &Bytes, needed: usize) -> Result<(), IpcError> {
  if buf.remaining() < needed {
    return Err(IpcError::Truncated {
      needed,
      remaining: buf.remaining(),
    });
  }
  Ok(())
}

fn get_u8(buf: &mut Bytes) -> Result<u8, IpcError> {
  ensure(buf, 1)?;
  Ok(buf.get_u8())
}

fn get_u16(buf: &mut Bytes) -> Result<u16, IpcError> {
  ensure(buf, 2)?;
  Ok(buf.get_u16_le())
}

fn get_u32(buf: &mut Bytes) -> Result<u32, IpcError> {
  ensure(buf, 4)?;
  Ok(buf.get_u32_le())
}

fn put_string(buf: &mut BytesMut, value: &str) {
  buf.put_u32_le(value.len() as u32);
  buf.put_slice(value.as_bytes());
}

fn get_string(buf: &mut Bytes) -> Result<String, IpcError> {
  let len = get_u32(buf)? as usize;
  ensure(buf, len)?;
  let raw = buf.split_to(len);
  String::from_utf8(raw.to_vec()).map_err(|e| IpcError::Corrupt(format!("invalid UTF-8 string: {}", e)))
}

fn put_opt_string(buf: &mut BytesMut, value: Option<&str>) {
  match value {
    Some(value) => {
      buf.put_u8(1);
      put_string(buf, value);
    }
    None => buf.put_u8(0),
  }
}

fn get_opt_string(buf: &mut Bytes) -> Result<Option<String>, IpcError> {
  match get_u8(buf)? {
    0 => Ok(None),
    1 => Ok(Some(get_string(buf)?)),
    flag => Err(IpcError::Corrupt(format!("invalid presence flag {}", flag))),
  }
}

fn put_strings(buf: &mut BytesMut, values: &[String]) {
  buf.put_u32_le(values.len() as u32);
  for value in values {
    put_string(buf, value);
  }
}

fn get_strings(buf: &mut Bytes) -> Result<Vec<String>, IpcError> {
  let count = get_u32(buf)? as usize;
  // Every string needs at least its length prefix
  ensure(buf, count.saturating_mul(4))?;
  (0..count).map(|_| get_string(buf)).collect()
}

fn put_test_file(buf: &mut BytesMut, file: &TestFile) {
  put_string(buf, file.as_str());
}

fn get_test_file(buf: &mut Bytes) -> Result<TestFile, IpcError> {
  Ok(TestFile::new(get_string(buf)?))
}

fn put_test_id(buf: &mut BytesMut, id: &TestId) {
  buf.put_u32_le(id.path().len() as u32);
  for index in id.path() {
    buf.put_u32_le(*index);
  }
}

fn get_test_id(buf: &mut Bytes) -> Result<TestId, IpcError> {
  let depth = get_u32(buf)? as usize;
  ensure(buf, depth.saturating_mul(4))?;
  let path: Vec<u32> = (0..depth).map(|_| buf.get_u32_le()).collect();
  Ok(TestId::of(&path))
}

/// Causes beyond `MAX_CAUSE_DEPTH` are dropped so the reader always accepts
/// what the writer produced.
fn put_stack_trace(buf: &mut BytesMut, trace: &StackTrace) {
  let mut current = Some(trace);
  let mut depth = 0;
  while let Some(trace) = current {
    depth += 1;
    put_string(buf, &trace.kind);
    put_opt_string(buf, trace.message.as_deref());
    put_strings(buf, &trace.frames);
    current = trace.cause.as_deref().filter(|_| depth < MAX_CAUSE_DEPTH);
    buf.put_u8(u8::from(current.is_some()));
  }
}

fn get_stack_trace(buf: &mut Bytes) -> Result<StackTrace, IpcError> {
  // Read the chain iteratively, then link it back together from the innermost cause
  let mut chain = Vec::new();
  loop {
    if chain.len() == MAX_CAUSE_DEPTH {
      return Err(IpcError::Corrupt(format!(
        "stack trace cause chain deeper than {}",
        MAX_CAUSE_DEPTH
      )));
    }
    let trace = StackTrace::new(get_string(buf)?, get_opt_string(buf)?).with_frames(get_strings(buf)?);
    chain.push(trace);
    match get_u8(buf)? {
      0 => break,
      1 => continue,
      flag => return Err(IpcError::Corrupt(format!("invalid cause flag {}", flag))),
    }
  }

  let mut current: Option<StackTrace> = None;
  while let Some(mut trace) = chain.pop() {
    trace.cause = current.map(Box::new);
    current = Some(trace);
  }
  current.ok_or_else(|| IpcError::Corrupt("empty stack trace".into()))
}

// ============================================================================
// Suite listener encoding
// ============================================================================

mod suite_tag {
  pub const SUITE_STARTED: u8 = 1;
  pub const INTERNAL_ERROR: u8 = 2;
  pub const TEST_FILE_FOUND: u8 = 3;
  pub const ALL_TEST_FILES_FOUND: u8 = 4;
  pub const TEST_FOUND: u8 = 5;
  pub const TEST_STARTED: u8 = 6;
  pub const FAILURE: u8 = 7;
  pub const TEST_FINISHED: u8 = 8;
  pub const TEST_FILE_FINISHED: u8 = 9;
  pub const SUITE_FINISHED: u8 = 10;
}

impl Encoding for SuiteEvent {
  const INTERFACE: &'static str = "SuiteListener";
  const VERSION: u32 = 1;

  fn encode(&self, buf: &mut BytesMut) {
    use suite_tag::*;

    match self {
      SuiteEvent::SuiteStarted => buf.put_u8(SUITE_STARTED),
      SuiteEvent::InternalError { message, trace } => {
        buf.put_u8(INTERNAL_ERROR);
        put_string(buf, message);
        put_stack_trace(buf, trace);
      }
      SuiteEvent::TestFileFound(file) => {
        buf.put_u8(TEST_FILE_FOUND);
        put_test_file(buf, file);
      }
      SuiteEvent::AllTestFilesFound => buf.put_u8(ALL_TEST_FILES_FOUND),
      SuiteEvent::TestFound { file, id, name } => {
        buf.put_u8(TEST_FOUND);
        put_test_file(buf, file);
        put_test_id(buf, id);
        put_string(buf, name);
      }
      SuiteEvent::TestStarted { file, id } => {
        buf.put_u8(TEST_STARTED);
        put_test_file(buf, file);
        put_test_id(buf, id);
      }
      SuiteEvent::Failure { file, id, trace } => {
        buf.put_u8(FAILURE);
        put_test_file(buf, file);
        put_test_id(buf, id);
        put_stack_trace(buf, trace);
      }
      SuiteEvent::TestFinished { file, id } => {
        buf.put_u8(TEST_FINISHED);
        put_test_file(buf, file);
        put_test_id(buf, id);
      }
      SuiteEvent::TestFileFinished(file) => {
        buf.put_u8(TEST_FILE_FINISHED);
        put_test_file(buf, file);
      }
      SuiteEvent::SuiteFinished => buf.put_u8(SUITE_FINISHED),
    }
  }

  fn decode(buf: &mut Bytes) -> Result<Self, IpcError> {
    use suite_tag::*;

    let event = match get_u8(buf)? {
      SUITE_STARTED => SuiteEvent::SuiteStarted,
      INTERNAL_ERROR => SuiteEvent::InternalError {
        message: get_string(buf)?,
        trace: get_stack_trace(buf)?,
      },
      TEST_FILE_FOUND => SuiteEvent::TestFileFound(get_test_file(buf)?),
      ALL_TEST_FILES_FOUND => SuiteEvent::AllTestFilesFound,
      TEST_FOUND => SuiteEvent::TestFound {
        file: get_test_file(buf)?,
        id: get_test_id(buf)?,
        name: get_string(buf)?,
      },
      TEST_STARTED => SuiteEvent::TestStarted {
        file: get_test_file(buf)?,
        id: get_test_id(buf)?,
      },
      FAILURE => SuiteEvent::Failure {
        file: get_test_file(buf)?,
        id: get_test_id(buf)?,
        trace: get_stack_trace(buf)?,
      },
      TEST_FINISHED => SuiteEvent::TestFinished {
        file: get_test_file(buf)?,
        id: get_test_id(buf)?,
      },
      TEST_FILE_FINISHED => SuiteEvent::TestFileFinished(get_test_file(buf)?),
      SUITE_FINISHED => SuiteEvent::SuiteFinished,
      tag => {
        return Err(IpcError::UnknownTag {
          interface: Self::INTERFACE,
          tag,
        });
      }
    };
    Ok(event)
  }
}

// ============================================================================
// Command listener encoding
// ============================================================================

const RUN_TESTS: u8 = 1;
const SHUTDOWN: u8 = 2;

fn put_suite_configuration(buf: &mut BytesMut, config: &SuiteConfiguration) {
  put_string(buf, &config.base_dir.to_string_lossy());
  put_string(buf, &config.include_pattern);
  put_strings(buf, &config.test_args);
}

fn get_suite_configuration(buf: &mut Bytes) -> Result<SuiteConfiguration, IpcError> {
  Ok(SuiteConfiguration {
    base_dir: PathBuf::from(get_string(buf)?),
    include_pattern: get_string(buf)?,
    test_args: get_strings(buf)?,
  })
}

impl Encoding for CommandEvent {
  const INTERFACE: &'static str = "CommandListener";
  const VERSION: u32 = 1;

  fn encode(&self, buf: &mut BytesMut) {
    match self {
      CommandEvent::RunTests(config) => {
        buf.put_u8(RUN_TESTS);
        put_suite_configuration(buf, config);
      }
      CommandEvent::Shutdown => buf.put_u8(SHUTDOWN),
    }
  }

  fn decode(buf: &mut Bytes) -> Result<Self, IpcError> {
    match get_u8(buf)? {
      RUN_TESTS => Ok(CommandEvent::RunTests(get_suite_configuration(buf)?)),
      SHUTDOWN => Ok(CommandEvent::Shutdown),
      tag => Err(IpcError::UnknownTag {
        interface: Self::INTERFACE,
        tag,
      }),
    }
  }
}
