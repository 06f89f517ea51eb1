//! Worker counters - completion barriers over dynamic sets of tasks
//!
//! A [`WorkerCounter`] is an [`Executor`] that remembers how many of the tasks
//! it started are still running. Once its owner registers a completion
//! listener with [`WorkerCounter::after_previous_workers_finished`], the
//! listener fires exactly once, as soon as the count is zero.
//!
//! Counters chain: a counter's underlying executor can be another counter, so
//! every worker of the child is also a worker of the parent. The parent is
//! only ever released after the child's worker has fully returned, which is
//! what lets per-file completion events reach the listener before the
//! suite-level one.
//!
//! ```text
//! suite counter ◀── (executor of) ── file counter ◀── driver / nested work
//! ```

use std::{
  fmt,
  sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use tracing::{error, trace};

use super::{envelope::Envelope, thread::ActorRef};

/// A unit of work handed to an [`Executor`]
pub type Work = Box<dyn FnOnce() + Send + 'static>;

/// Something that runs work, eventually, somewhere.
pub trait Executor: Send + Sync {
  fn execute(&self, work: Work);
}

impl<T: Executor + ?Sized> Executor for Arc<T> {
  fn execute(&self, work: Work) {
    (**self).execute(work)
  }
}

/// Runs work on the tokio blocking pool.
///
/// Test drivers are ordinary blocking code, so they must not run on the async
/// workers.
#[derive(Debug, Clone)]
pub struct BlockingExecutor {
  handle: tokio::runtime::Handle,
}

impl BlockingExecutor {
  /// Executor bound to the current runtime.
  pub fn current() -> Self {
    Self {
      handle: tokio::runtime::Handle::current(),
    }
  }

  pub fn new(handle: tokio::runtime::Handle) -> Self {
    Self { handle }
  }
}

impl Executor for BlockingExecutor {
  fn execute(&self, work: Work) {
    // The handle is intentionally dropped: completion is tracked by counters.
    let _ = self.handle.spawn_blocking(work);
  }
}

// ============================================================================
// Listener interface
// ============================================================================

/// Receives the "all workers finished" notification.
pub trait WorkerListener: Send {
  fn on_all_workers_finished(&mut self);
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerEvent {
  AllWorkersFinished,
}

impl Envelope for WorkerEvent {
  type Target = dyn WorkerListener;

  fn deliver(self, target: &mut Self::Target) {
    match self {
      WorkerEvent::AllWorkersFinished => target.on_all_workers_finished(),
    }
  }
}

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WorkerError {
  #[error("Worker counter '{0}' is closed; no more workers may be added")]
  Closed(String),
  #[error("Worker counter '{0}' was decremented more times than it was incremented")]
  Underflow(String),
  #[error("Worker counter '{0}' already has a completion listener")]
  ListenerAlreadyRegistered(String),
}

// ============================================================================
// Worker counter
// ============================================================================

/// Lifecycle of a counter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CounterPhase {
  /// No listener yet; workers come and go freely
  Open,
  /// Listener registered, waiting for the count to reach zero; new workers
  /// are still accepted
  Draining,
  /// Listener fired; the counter accepts nothing more
  Closed,
}

struct CounterState {
  active: usize,
  phase: CounterPhase,
  listener: Option<ActorRef<WorkerEvent>>,
}

struct CounterInner {
  name: String,
  executor: Arc<dyn Executor>,
  state: Mutex<CounterState>,
}

/// Completion barrier and executor in one.
///
/// Cheap to clone; clones share the same count.
#[derive(Clone)]
pub struct WorkerCounter {
  inner: Arc<CounterInner>,
}

impl fmt::Debug for WorkerCounter {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let state = self.state();
    f.debug_struct("WorkerCounter")
      .field("name", &self.inner.name)
      .field("active", &state.active)
      .field("phase", &state.phase)
      .finish()
  }
}

impl WorkerCounter {
  /// Create a counter whose workers run on `executor`.
  pub fn new(name: impl Into<String>, executor: Arc<dyn Executor>) -> Self {
    Self {
      inner: Arc::new(CounterInner {
        name: name.into(),
        executor,
        state: Mutex::new(CounterState {
          active: 0,
          phase: CounterPhase::Open,
          listener: None,
        }),
      }),
    }
  }

  /// Create a counter whose workers are also workers of `self`.
  pub fn child(&self, name: impl Into<String>) -> WorkerCounter {
    WorkerCounter::new(name, Arc::new(self.clone()))
  }

  pub fn name(&self) -> &str {
    &self.inner.name
  }

  fn state(&self) -> MutexGuard<'_, CounterState> {
    self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
  }

  pub fn active_workers(&self) -> usize {
    self.state().active
  }

  pub fn phase(&self) -> CounterPhase {
    self.state().phase
  }

  /// Register one more outstanding worker.
  pub fn increment(&self) -> Result<(), WorkerError> {
    let mut state = self.state();
    if state.phase == CounterPhase::Closed {
      return Err(WorkerError::Closed(self.inner.name.clone()));
    }
    state.active += 1;
    trace!(counter = %self.inner.name, active = state.active, "Worker started");
    Ok(())
  }

  /// Mark one worker finished.
  ///
  /// Going below zero is a programming error; it is reported and the count is
  /// left untouched.
  pub fn decrement(&self) -> Result<(), WorkerError> {
    let fire = {
      let mut state = self.state();
      if state.active == 0 {
        error!(counter = %self.inner.name, "Worker counter underflow");
        return Err(WorkerError::Underflow(self.inner.name.clone()));
      }
      state.active -= 1;
      trace!(counter = %self.inner.name, active = state.active, "Worker finished");
      Self::take_listener_if_done(&mut state)
    };

    if let Some(listener) = fire {
      listener.tell(WorkerEvent::AllWorkersFinished);
    }
    Ok(())
  }

  /// Fire `listener` once the count reaches zero. Until then any increment
  /// is accepted, so workers started by running workers (or by anyone else)
  /// delay the listener; once it has fired the counter is closed.
  ///
  /// The listener is an actor, so even when the count is already zero the
  /// notification is queued rather than delivered inside this call.
  pub fn after_previous_workers_finished(&self, listener: ActorRef<WorkerEvent>) -> Result<(), WorkerError> {
    let fire = {
      let mut state = self.state();
      if state.phase != CounterPhase::Open {
        return Err(WorkerError::ListenerAlreadyRegistered(self.inner.name.clone()));
      }
      state.listener = Some(listener);
      state.phase = CounterPhase::Draining;
      Self::take_listener_if_done(&mut state)
    };

    if let Some(listener) = fire {
      listener.tell(WorkerEvent::AllWorkersFinished);
    }
    Ok(())
  }

  fn take_listener_if_done(state: &mut CounterState) -> Option<ActorRef<WorkerEvent>> {
    if state.active == 0 && state.phase == CounterPhase::Draining {
      state.phase = CounterPhase::Closed;
      state.listener.take()
    } else {
      None
    }
  }

  /// Start `work` as a worker of this counter.
  ///
  /// The worker is released when `work` returns or unwinds, so a panicking
  /// worker never leaves the counter stuck.
  pub fn start_worker(&self, work: Work) -> Result<(), WorkerError> {
    self.increment()?;
    let guard = WorkerGuard {
      counter: self.clone(),
    };
    self.inner.executor.execute(Box::new(move || {
      let _guard = guard;
      work();
    }));
    Ok(())
  }
}

impl Executor for WorkerCounter {
  fn execute(&self, work: Work) {
    if let Err(e) = self.start_worker(work) {
      error!(counter = %self.inner.name, error = %e, "Rejected worker");
    }
  }
}

/// Releases one worker when dropped
struct WorkerGuard {
  counter: WorkerCounter,
}

impl Drop for WorkerGuard {
  fn drop(&mut self) {
    // Underflow is already logged inside decrement
    let _ = self.counter.decrement();
  }
}
