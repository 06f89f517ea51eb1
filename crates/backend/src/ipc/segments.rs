//! Segment sequences - the storage under a channel
//!
//! A [`SegmentSequence`] hands out fixed-capacity [`Segment`]s by index,
//! allocating each one on first access. Asking for the same index twice
//! returns a view over the same storage; distinct indices never alias.
//!
//! Two implementations:
//!
//! - [`AllocatedSegments`]: heap buffers, for in-process channels and tests
//! - [`MappedSegments`]: one memory-mapped file per segment, shared between
//!   processes through the file system

use std::{
  fs::OpenOptions,
  path::{Path, PathBuf},
  sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use dashmap::DashMap;
use memmap2::{MmapMut, MmapOptions};
use tracing::trace;

use super::IpcError;

/// Lazily allocated, index-addressed segments of one fixed capacity.
pub trait SegmentSequence: Send + Sync {
  fn segment_capacity(&self) -> usize;

  /// View of segment `index`, allocating it if needed.
  fn get(&self, index: usize) -> Result<Segment, IpcError>;
}

impl<T: SegmentSequence + ?Sized> SegmentSequence for Arc<T> {
  fn segment_capacity(&self) -> usize {
    (**self).segment_capacity()
  }

  fn get(&self, index: usize) -> Result<Segment, IpcError> {
    (**self).get(index)
  }
}

// ============================================================================
// Segment view
// ============================================================================

enum Storage {
  Heap(Box<[u8]>),
  Mapped(MmapMut),
}

impl Storage {
  fn bytes(&self) -> &[u8] {
    match self {
      Storage::Heap(buf) => buf,
      Storage::Mapped(map) => map,
    }
  }

  fn bytes_mut(&mut self) -> &mut [u8] {
    match self {
      Storage::Heap(buf) => buf,
      Storage::Mapped(map) => map,
    }
  }
}

/// A view over one segment's storage.
///
/// Views are cheap to clone; all views of an index share the same bytes.
#[derive(Clone)]
pub struct Segment {
  index: usize,
  capacity: usize,
  storage: Arc<Mutex<Storage>>,
}

impl std::fmt::Debug for Segment {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Segment")
      .field("index", &self.index)
      .field("capacity", &self.capacity)
      .finish()
  }
}

impl Segment {
  fn new(index: usize, storage: Storage) -> Self {
    Self {
      index,
      capacity: storage.bytes().len(),
      storage: Arc::new(Mutex::new(storage)),
    }
  }

  pub fn index(&self) -> usize {
    self.index
  }

  pub fn capacity(&self) -> usize {
    self.capacity
  }

  /// True if both views share the same storage
  pub fn same_storage(&self, other: &Segment) -> bool {
    Arc::ptr_eq(&self.storage, &other.storage)
  }

  fn lock(&self) -> MutexGuard<'_, Storage> {
    self.storage.lock().unwrap_or_else(PoisonError::into_inner)
  }

  fn check(&self, offset: usize, len: usize) -> Result<(), IpcError> {
    match offset.checked_add(len) {
      Some(end) if end <= self.capacity => Ok(()),
      _ => Err(IpcError::OutOfBounds {
        index: self.index,
        offset,
        len,
        capacity: self.capacity,
      }),
    }
  }

  pub fn read_u8(&self, offset: usize) -> Result<u8, IpcError> {
    self.check(offset, 1)?;
    Ok(self.lock().bytes()[offset])
  }

  pub fn write_u8(&self, offset: usize, value: u8) -> Result<(), IpcError> {
    self.check(offset, 1)?;
    self.lock().bytes_mut()[offset] = value;
    Ok(())
  }

  /// Copy `buf.len()` bytes starting at `offset` into `buf`.
  pub fn read(&self, offset: usize, buf: &mut [u8]) -> Result<(), IpcError> {
    self.check(offset, buf.len())?;
    buf.copy_from_slice(&self.lock().bytes()[offset..offset + buf.len()]);
    Ok(())
  }

  pub fn write(&self, offset: usize, data: &[u8]) -> Result<(), IpcError> {
    self.check(offset, data.len())?;
    self.lock().bytes_mut()[offset..offset + data.len()].copy_from_slice(data);
    Ok(())
  }

  /// Flush a mapped segment to its file. No-op for heap segments.
  pub fn flush(&self) -> Result<(), IpcError> {
    if let Storage::Mapped(map) = &*self.lock() {
      map.flush()?;
    }
    Ok(())
  }
}

// ============================================================================
// Heap segments
// ============================================================================

/// Heap-backed segments.
pub struct AllocatedSegments {
  capacity: usize,
  segments: DashMap<usize, Segment>,
}

impl AllocatedSegments {
  pub fn new(capacity: usize) -> Self {
    Self {
      capacity,
      segments: DashMap::new(),
    }
  }

  /// Number of segments allocated so far
  pub fn allocated(&self) -> usize {
    self.segments.len()
  }
}

impl SegmentSequence for AllocatedSegments {
  fn segment_capacity(&self) -> usize {
    self.capacity
  }

  fn get(&self, index: usize) -> Result<Segment, IpcError> {
    let segment = self
      .segments
      .entry(index)
      .or_insert_with(|| {
        trace!(segment = index, capacity = self.capacity, "Allocating heap segment");
        Segment::new(index, Storage::Heap(vec![0u8; self.capacity].into_boxed_slice()))
      })
      .clone();
    Ok(segment)
  }
}

// ============================================================================
// Memory-mapped segments
// ============================================================================

/// File-backed segments: `<dir>/<prefix>.<index>`.
///
/// Files are created zero-filled at full capacity; an existing file (created
/// by the peer process) is mapped as is.
pub struct MappedSegments {
  dir: PathBuf,
  prefix: String,
  capacity: usize,
  segments: DashMap<usize, Segment>,
}

impl MappedSegments {
  pub fn new(dir: impl Into<PathBuf>, prefix: impl Into<String>, capacity: usize) -> Self {
    Self {
      dir: dir.into(),
      prefix: prefix.into(),
      capacity,
      segments: DashMap::new(),
    }
  }

  pub fn segment_path(&self, index: usize) -> PathBuf {
    self.dir.join(format!("{}.{}", self.prefix, index))
  }

  pub fn dir(&self) -> &Path {
    &self.dir
  }

  fn map(&self, index: usize) -> Result<Segment, IpcError> {
    let path = self.segment_path(index);
    let file = OpenOptions::new()
      .read(true)
      .write(true)
      .create(true)
      .truncate(false)
      .open(&path)?;

    let len = file.metadata()?.len();
    if len < self.capacity as u64 {
      file.set_len(self.capacity as u64)?;
    } else if len > self.capacity as u64 {
      return Err(IpcError::Corrupt(format!(
        "segment file {:?} is {} bytes, expected {}",
        path, len, self.capacity
      )));
    }

    // SAFETY: segment files are only touched through this module; the peer
    // process never truncates them while they are mapped.
    let map = unsafe { MmapOptions::new().len(self.capacity).map_mut(&file)? };
    trace!(segment = index, path = ?path, "Mapped segment file");
    Ok(Segment::new(index, Storage::Mapped(map)))
  }
}

impl SegmentSequence for MappedSegments {
  fn segment_capacity(&self) -> usize {
    self.capacity
  }

  fn get(&self, index: usize) -> Result<Segment, IpcError> {
    if let Some(segment) = self.segments.get(&index) {
      return Ok(segment.clone());
    }
    let segment = self.map(index)?;
    // Another thread may have mapped it meanwhile; keep the first one
    Ok(self.segments.entry(index).or_insert(segment).clone())
  }
}
