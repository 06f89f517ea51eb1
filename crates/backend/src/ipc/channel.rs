//! Record framing over a segment sequence
//!
//! Layout of one segment, starting at offset 0:
//!
//! ```text
//! [marker u8][len u32 LE][payload ...][marker u8][len u32 LE][payload ...] ... [marker u8]
//! ```
//!
//! | marker | meaning |
//! |---|---|
//! | 0 | nothing written yet (segments start zero-filled) |
//! | 1 | a record follows |
//! | 2 | continue at offset 0 of the next segment |
//! | 3 | end of stream |
//!
//! The writer stores length and payload first and the marker last, so a reader
//! never sees a half-written record. It also always keeps one spare byte at
//! the end of a segment for the next marker, and allocates segment `i + 1`
//! before publishing the "next segment" marker in segment `i`.
//!
//! The first record of segment 0 is the [`ChannelHeader`].

use std::{
  marker::PhantomData,
  sync::{
    Arc, Mutex, PoisonError,
    atomic::{Ordering, fence},
  },
  time::Duration,
};

use bytes::{Bytes, BytesMut};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace};

use super::{
  IpcError,
  encoding::{ChannelHeader, Encoding},
  segments::{Segment, SegmentSequence},
};
use crate::actor::{Envelope, MessageSender};

const EMPTY: u8 = 0;
const RECORD: u8 = 1;
const NEXT_SEGMENT: u8 = 2;
const END_OF_STREAM: u8 = 3;

/// marker + length prefix
const RECORD_OVERHEAD: usize = 5;

/// Largest payload that fits in one segment of `capacity` bytes
pub fn max_payload(capacity: usize) -> usize {
  capacity.saturating_sub(RECORD_OVERHEAD + 1)
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ChannelOptions {
  /// Writers fail with [`IpcError::ChannelFull`] instead of growing past this
  pub max_segments: Option<usize>,
}

// ============================================================================
// Writer
// ============================================================================

/// The single writer of a channel.
pub struct IpcWriter<E> {
  segments: Arc<dyn SegmentSequence>,
  current: Segment,
  position: usize,
  options: ChannelOptions,
  closed: bool,
  records: u64,
  _event: PhantomData<fn(E)>,
}

impl<E: Encoding> IpcWriter<E> {
  /// Start a new channel by writing its header.
  pub fn create(segments: Arc<dyn SegmentSequence>, options: ChannelOptions) -> Result<Self, IpcError> {
    let current = segments.get(0)?;
    let mut writer = Self {
      segments,
      current,
      position: 0,
      options,
      closed: false,
      records: 0,
      _event: PhantomData,
    };

    let mut header = BytesMut::new();
    ChannelHeader::for_encoding::<E>().encode(&mut header);
    writer.write_record(&header)?;
    debug!(interface = E::INTERFACE, version = E::VERSION, "IPC channel created");
    Ok(writer)
  }

  /// Append one envelope.
  pub fn write(&mut self, event: &E) -> Result<(), IpcError> {
    let mut buf = BytesMut::new();
    event.encode(&mut buf);
    self.write_record(&buf)?;
    self.records += 1;
    Ok(())
  }

  fn write_record(&mut self, payload: &[u8]) -> Result<(), IpcError> {
    if self.closed {
      return Err(IpcError::Closed);
    }
    let capacity = self.current.capacity();
    if payload.len() > max_payload(capacity) {
      return Err(IpcError::RecordTooLarge {
        size: payload.len(),
        capacity,
      });
    }

    if self.position + RECORD_OVERHEAD + payload.len() + 1 > capacity {
      self.advance_segment()?;
    }

    let position = self.position;
    self
      .current
      .write(position + 1, &(payload.len() as u32).to_le_bytes())?;
    self.current.write(position + RECORD_OVERHEAD, payload)?;
    fence(Ordering::Release);
    self.current.write_u8(position, RECORD)?;

    self.position += RECORD_OVERHEAD + payload.len();
    trace!(
      segment = self.current.index(),
      offset = position,
      len = payload.len(),
      "IPC record written"
    );
    Ok(())
  }

  fn advance_segment(&mut self) -> Result<(), IpcError> {
    let next_index = self.current.index() + 1;
    if let Some(max) = self.options.max_segments
      && next_index >= max
    {
      return Err(IpcError::ChannelFull(max));
    }

    // The next segment must exist before the reader is told to go there
    let next = self.segments.get(next_index)?;
    fence(Ordering::Release);
    self.current.write_u8(self.position, NEXT_SEGMENT)?;
    debug!(segment = next_index, "IPC channel moved to next segment");

    self.current = next;
    self.position = 0;
    Ok(())
  }

  /// Mark the end of the stream. Further writes fail.
  pub fn close(&mut self) -> Result<(), IpcError> {
    if self.closed {
      return Ok(());
    }
    fence(Ordering::Release);
    self.current.write_u8(self.position, END_OF_STREAM)?;
    self.current.flush()?;
    self.closed = true;
    debug!(records = self.records, "IPC channel closed");
    Ok(())
  }

  pub fn is_closed(&self) -> bool {
    self.closed
  }

  /// Segments touched so far
  pub fn segments_used(&self) -> usize {
    self.current.index() + 1
  }
}

/// Shareable writer that implements [`MessageSender`].
///
/// Write failures cannot reach the sender's caller; they are logged and kept
/// so the owner can inspect them.
pub struct IpcSender<E> {
  writer: Arc<Mutex<IpcWriter<E>>>,
  last_error: Arc<Mutex<Option<IpcError>>>,
}

impl<E> Clone for IpcSender<E> {
  fn clone(&self) -> Self {
    Self {
      writer: Arc::clone(&self.writer),
      last_error: Arc::clone(&self.last_error),
    }
  }
}

impl<E: Encoding> IpcSender<E> {
  pub fn new(writer: IpcWriter<E>) -> Self {
    Self {
      writer: Arc::new(Mutex::new(writer)),
      last_error: Arc::new(Mutex::new(None)),
    }
  }

  pub fn close(&self) -> Result<(), IpcError> {
    self.writer.lock().unwrap_or_else(PoisonError::into_inner).close()
  }

  pub fn last_error(&self) -> Option<IpcError> {
    self.last_error.lock().unwrap_or_else(PoisonError::into_inner).clone()
  }
}

impl<E: Encoding> MessageSender<E> for IpcSender<E> {
  fn send(&self, message: E) {
    let result = self.writer.lock().unwrap_or_else(PoisonError::into_inner).write(&message);
    if let Err(e) = result {
      error!(interface = E::INTERFACE, error = %e, "Failed to write IPC message");
      *self.last_error.lock().unwrap_or_else(PoisonError::into_inner) = Some(e);
    }
  }
}

// ============================================================================
// Reader
// ============================================================================

/// Result of one non-blocking read
#[derive(Debug, PartialEq, Eq)]
pub enum ReadOutcome<E> {
  Message(E),
  /// The reader has caught up with the writer
  Empty,
  /// The writer closed the channel
  Closed,
}

/// The single reader of a channel.
pub struct IpcReader<E> {
  segments: Arc<dyn SegmentSequence>,
  current: Segment,
  position: usize,
  header: Option<ChannelHeader>,
  closed: bool,
  failure: Option<IpcError>,
  _event: PhantomData<fn() -> E>,
}

impl<E: Encoding> IpcReader<E> {
  pub fn open(segments: Arc<dyn SegmentSequence>) -> Result<Self, IpcError> {
    let current = segments.get(0)?;
    Ok(Self {
      segments,
      current,
      position: 0,
      header: None,
      closed: false,
      failure: None,
      _event: PhantomData,
    })
  }

  /// Header of the channel, once it has been read
  pub fn header(&self) -> Option<&ChannelHeader> {
    self.header.as_ref()
  }

  /// Read the next envelope without waiting.
  ///
  /// Errors are sticky: once the stream is found corrupt every later call
  /// returns the same error.
  pub fn try_read(&mut self) -> Result<ReadOutcome<E>, IpcError> {
    if let Some(e) = &self.failure {
      return Err(e.clone());
    }
    match self.read_next() {
      Ok(outcome) => Ok(outcome),
      Err(e) => {
        error!(error = %e, segment = self.current.index(), offset = self.position, "IPC channel is unreadable");
        self.failure = Some(e.clone());
        Err(e)
      }
    }
  }

  fn read_next(&mut self) -> Result<ReadOutcome<E>, IpcError> {
    loop {
      if self.closed {
        return Ok(ReadOutcome::Closed);
      }

      let marker = self.current.read_u8(self.position)?;
      fence(Ordering::Acquire);
      match marker {
        EMPTY => return Ok(ReadOutcome::Empty),
        RECORD => {
          let payload = self.read_record()?;
          if self.header.is_none() {
            let header = ChannelHeader::decode(&mut payload.clone())?;
            header.check::<E>()?;
            trace!(interface = %header.interface, "IPC channel header accepted");
            self.header = Some(header);
            continue;
          }
          return super::encoding::from_bytes(payload).map(ReadOutcome::Message);
        }
        NEXT_SEGMENT => {
          let next = self.current.index() + 1;
          self.current = self.segments.get(next)?;
          self.position = 0;
        }
        END_OF_STREAM => {
          self.closed = true;
          return Ok(ReadOutcome::Closed);
        }
        other => {
          return Err(IpcError::Corrupt(format!(
            "unknown record marker {} at segment {} offset {}",
            other,
            self.current.index(),
            self.position
          )));
        }
      }
    }
  }

  fn read_record(&mut self) -> Result<Bytes, IpcError> {
    let mut len = [0u8; 4];
    self.current.read(self.position + 1, &mut len)?;
    let len = u32::from_le_bytes(len) as usize;

    if self.position + RECORD_OVERHEAD + len + 1 > self.current.capacity() {
      return Err(IpcError::Corrupt(format!(
        "record of {} bytes at segment {} offset {} overruns the segment",
        len,
        self.current.index(),
        self.position
      )));
    }

    let mut payload = vec![0u8; len];
    self.current.read(self.position + RECORD_OVERHEAD, &mut payload)?;
    self.position += RECORD_OVERHEAD + len;
    Ok(Bytes::from(payload))
  }
}

/// Decode envelopes and deliver them to `target` until the writer closes the
/// channel, the token is cancelled, or the stream turns out to be corrupt.
///
/// Returns the number of delivered envelopes.
pub async fn decode_all<E>(
  reader: &mut IpcReader<E>,
  target: &mut E::Target,
  poll_interval: Duration,
  cancel: &CancellationToken,
) -> Result<u64, IpcError>
where
  E: Encoding + Envelope,
{
  let mut delivered = 0u64;
  loop {
    match reader.try_read()? {
      ReadOutcome::Message(event) => {
        event.deliver(target);
        delivered += 1;
      }
      ReadOutcome::Closed => {
        debug!(interface = E::INTERFACE, delivered, "IPC channel reached end of stream");
        return Ok(delivered);
      }
      ReadOutcome::Empty => {
        tokio::select! {
          _ = cancel.cancelled() => {
            debug!(interface = E::INTERFACE, delivered, "IPC decode loop cancelled");
            return Ok(delivered);
          }
          _ = tokio::time::sleep(poll_interval) => {}
        }
      }
    }
  }
}
