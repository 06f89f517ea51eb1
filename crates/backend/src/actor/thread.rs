//! Actor threads and actor references
//!
//! An [`ActorThread`] is a long-lived task that owns any number of bound
//! objects. Other components only ever see an [`ActorRef`], which turns a method
//! call (an [`Envelope`]) into a message on the thread's queue. The thread
//! applies messages one at a time, in arrival order, so a bound object never
//! observes concurrent calls.
//!
//! # Failure handling
//!
//! `tell` never fails for the caller. Anything that goes wrong on the way to
//! the target (unknown actor, stopped thread, panicking handler, discarded
//! mailbox) is logged and reported on the optional failure channel.
//!
//! # Lifecycle
//!
//! A bound object lives until the last [`ActorRef`] to it is dropped. Messages
//! sent before that point are still applied; the object is released right
//! after them.

use std::{
  any::Any,
  collections::HashMap,
  fmt,
  marker::PhantomData,
  panic::{AssertUnwindSafe, catch_unwind},
  sync::{
    Arc, Mutex, PoisonError,
    atomic::{AtomicU64, AtomicUsize, Ordering},
  },
};

use serde::{Deserialize, Serialize};
use tokio::{sync::mpsc, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use super::envelope::{Envelope, MessageSender};

type ActorId = u64;
type Job = Box<dyn FnOnce(&mut dyn Any) + Send>;

// ============================================================================
// Configuration
// ============================================================================

/// What happens to queued messages when an actor thread is stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DrainPolicy {
  /// Apply every message queued before the stop request, then exit
  #[default]
  Drain,
  /// Drop every message not yet applied when the stop is requested, and
  /// report how many were dropped
  Discard,
}

/// Configuration for a single actor thread
#[derive(Debug, Clone)]
pub struct ActorThreadConfig {
  /// Thread name, used in logs and failure reports
  pub name: String,
  /// Mailbox policy on stop
  pub drain_policy: DrainPolicy,
  /// Trace every delivered message
  pub log_messages: bool,
}

impl ActorThreadConfig {
  pub fn new(name: impl Into<String>) -> Self {
    Self {
      name: name.into(),
      drain_policy: DrainPolicy::Drain,
      log_messages: false,
    }
  }

  pub fn with_drain_policy(mut self, policy: DrainPolicy) -> Self {
    self.drain_policy = policy;
    self
  }

  pub fn with_message_logging(mut self, enabled: bool) -> Self {
    self.log_messages = enabled;
    self
  }
}

// ============================================================================
// Failures
// ============================================================================

/// A delivery problem, reported out of band
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActorFailure {
  /// Actor (or thread) name
  pub actor: String,
  pub kind: FailureKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureKind {
  /// The handler panicked while applying a message
  Panicked(String),
  /// The message was sent after the thread stopped
  ThreadStopped,
  /// The message was addressed to an actor the thread does not know
  UnknownActor,
  /// Messages dropped on stop under [`DrainPolicy::Discard`]
  Discarded(usize),
}

impl fmt::Display for FailureKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      FailureKind::Panicked(message) => write!(f, "handler panicked: {}", message),
      FailureKind::ThreadStopped => write!(f, "actor thread has stopped"),
      FailureKind::UnknownActor => write!(f, "unknown actor"),
      FailureKind::Discarded(count) => write!(f, "{} queued messages discarded", count),
    }
  }
}

#[derive(Clone)]
struct FailureReporter {
  tx: Option<mpsc::UnboundedSender<ActorFailure>>,
}

impl FailureReporter {
  fn report(&self, actor: &str, kind: FailureKind) {
    error!(actor = %actor, "Actor failure: {}", kind);
    if let Some(tx) = &self.tx {
      let _ = tx.send(ActorFailure {
        actor: actor.to_string(),
        kind,
      });
    }
  }
}

/// Best-effort text of a panic payload
pub fn panic_message(payload: &(dyn Any + Send)) -> String {
  if let Some(s) = payload.downcast_ref::<&str>() {
    (*s).to_string()
  } else if let Some(s) = payload.downcast_ref::<String>() {
    s.clone()
  } else {
    "non-string panic payload".to_string()
  }
}

// ============================================================================
// Actor thread
// ============================================================================

enum Command {
  Bind {
    id: ActorId,
    target: Box<dyn Any + Send>,
  },
  Deliver {
    id: ActorId,
    name: Arc<str>,
    job: Job,
  },
  Unbind {
    id: ActorId,
  },
  Stop,
}

struct Shared {
  name: String,
  tx: mpsc::UnboundedSender<Command>,
  next_id: AtomicU64,
  log_messages: bool,
  reporter: FailureReporter,
  stopping: CancellationToken,
  bound: Arc<AtomicUsize>,
  task: Mutex<Option<JoinHandle<()>>>,
}

/// Handle to a running actor thread.
///
/// Cheap to clone; all clones address the same thread.
#[derive(Clone)]
pub struct ActorThread {
  shared: Arc<Shared>,
}

impl fmt::Debug for ActorThread {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("ActorThread").field("name", &self.shared.name).finish()
  }
}

impl ActorThread {
  /// Start a new actor thread on the current tokio runtime.
  pub fn spawn(config: ActorThreadConfig) -> Self {
    Self::start(config, None)
  }

  /// Start a new actor thread and receive its delivery failures.
  pub fn spawn_with_failures(config: ActorThreadConfig) -> (Self, mpsc::UnboundedReceiver<ActorFailure>) {
    let (failure_tx, failure_rx) = mpsc::unbounded_channel();
    (Self::start(config, Some(failure_tx)), failure_rx)
  }

  fn start(config: ActorThreadConfig, failures: Option<mpsc::UnboundedSender<ActorFailure>>) -> Self {
    let (tx, rx) = mpsc::unbounded_channel();
    let reporter = FailureReporter { tx: failures };
    let stopping = CancellationToken::new();
    let bound = Arc::new(AtomicUsize::new(0));

    let task = tokio::spawn(run_thread(
      config.name.clone(),
      config.drain_policy,
      rx,
      reporter.clone(),
      stopping.clone(),
      Arc::clone(&bound),
    ));
    debug!(thread = %config.name, policy = ?config.drain_policy, "Actor thread started");

    Self {
      shared: Arc::new(Shared {
        name: config.name,
        tx,
        next_id: AtomicU64::new(1),
        log_messages: config.log_messages,
        reporter,
        stopping,
        bound,
        task: Mutex::new(Some(task)),
      }),
    }
  }

  pub fn name(&self) -> &str {
    &self.shared.name
  }

  /// Number of objects currently bound to the thread
  pub fn bound_actors(&self) -> usize {
    self.shared.bound.load(Ordering::Acquire)
  }

  /// Bind `target` to this thread and return the only reference to it.
  ///
  /// The target is moved into the thread; from now on it is reachable
  /// exclusively through envelopes of type `E`.
  pub fn bind<E: Envelope>(&self, target: Box<E::Target>, name: impl Into<String>) -> ActorRef<E> {
    let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
    let name: Arc<str> = Arc::from(name.into());

    let target: Box<dyn Any + Send> = Box::new(target);
    if self.shared.tx.send(Command::Bind { id, target }).is_err() {
      self.shared.reporter.report(&name, FailureKind::ThreadStopped);
    }
    trace!(thread = %self.shared.name, actor = %name, id, "Actor bound");

    ActorRef {
      binding: Arc::new(Binding {
        id,
        name,
        shared: Arc::clone(&self.shared),
      }),
      _event: PhantomData,
    }
  }

  /// Ask the thread to stop. Messages not yet applied follow the drain policy;
  /// a message being applied is never interrupted.
  pub fn stop(&self) {
    self.shared.stopping.cancel();
    if self.shared.tx.send(Command::Stop).is_err() {
      debug!(thread = %self.shared.name, "Stop requested on an already stopped actor thread");
    }
  }

  /// Wait for the thread to exit. Only the first caller actually waits.
  pub async fn join(&self) {
    let task = self.shared.task.lock().unwrap_or_else(PoisonError::into_inner).take();
    if let Some(task) = task
      && let Err(e) = task.await
    {
      warn!(thread = %self.shared.name, error = %e, "Actor thread ended abnormally");
    }
  }

  /// Stop and wait.
  pub async fn shutdown(&self) {
    self.stop();
    self.join().await;
  }
}

async fn run_thread(
  name: String,
  policy: DrainPolicy,
  mut rx: mpsc::UnboundedReceiver<Command>,
  reporter: FailureReporter,
  stopping: CancellationToken,
  bound: Arc<AtomicUsize>,
) {
  let mut bindings: HashMap<ActorId, Box<dyn Any + Send>> = HashMap::new();
  let mut applied = 0usize;
  let mut discarded = 0usize;
  let mut stop_seen = false;

  while let Some(command) = rx.recv().await {
    match command {
      Command::Bind { id, target } => {
        bindings.insert(id, target);
      }
      Command::Unbind { id } => {
        if bindings.remove(&id).is_some() {
          trace!(thread = %name, id, "Actor released");
        }
      }
      Command::Deliver { id, name: actor, job } => {
        // Checked per message so a stop overtakes everything still queued
        if policy == DrainPolicy::Discard && stopping.is_cancelled() {
          discarded += 1;
        } else {
          if stop_seen {
            applied += 1;
          }
          apply(&mut bindings, id, &actor, job, &reporter);
        }
      }
      Command::Stop => {
        if !stop_seen {
          stop_seen = true;
          rx.close();
        }
      }
    }
    bound.store(bindings.len(), Ordering::Release);
  }

  match policy {
    DrainPolicy::Drain => debug!(thread = %name, drained = applied, "Mailbox drained"),
    DrainPolicy::Discard if discarded > 0 => reporter.report(&name, FailureKind::Discarded(discarded)),
    DrainPolicy::Discard => {}
  }
  bindings.clear();
  bound.store(0, Ordering::Release);

  info!(thread = %name, "Actor thread stopped");
}

fn apply(
  bindings: &mut HashMap<ActorId, Box<dyn Any + Send>>,
  id: ActorId,
  name: &str,
  job: Job,
  reporter: &FailureReporter,
) {
  let Some(target) = bindings.get_mut(&id) else {
    reporter.report(name, FailureKind::UnknownActor);
    return;
  };

  let target: &mut dyn Any = &mut **target;
  if let Err(payload) = catch_unwind(AssertUnwindSafe(|| job(target))) {
    reporter.report(name, FailureKind::Panicked(panic_message(&*payload)));
  }
}

// ============================================================================
// Actor reference
// ============================================================================

/// The only way to address a bound actor.
///
/// Cheap to clone and safe to share across threads. Dropping the last clone
/// releases the bound object once the messages sent through it are applied.
pub struct ActorRef<E> {
  binding: Arc<Binding>,
  _event: PhantomData<fn(E)>,
}

struct Binding {
  id: ActorId,
  name: Arc<str>,
  shared: Arc<Shared>,
}

impl Drop for Binding {
  fn drop(&mut self) {
    // The thread may already be gone, in which case the object went with it
    let _ = self.shared.tx.send(Command::Unbind { id: self.id });
  }
}

impl<E> Clone for ActorRef<E> {
  fn clone(&self) -> Self {
    Self {
      binding: Arc::clone(&self.binding),
      _event: PhantomData,
    }
  }
}

impl<E> fmt::Debug for ActorRef<E> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("ActorRef")
      .field("name", &self.binding.name)
      .field("thread", &self.binding.shared.name)
      .finish()
  }
}

impl<E: Envelope> ActorRef<E> {
  pub fn name(&self) -> &str {
    &self.binding.name
  }

  /// Enqueue `event` for the actor. Never blocks.
  pub fn tell(&self, event: E) {
    let binding = &*self.binding;
    let log_messages = binding.shared.log_messages;
    let actor = Arc::clone(&binding.name);

    let job: Job = Box::new(move |target: &mut dyn Any| {
      if log_messages {
        debug!(actor = %actor, message = ?event, "Delivering message");
      }
      match target.downcast_mut::<Box<E::Target>>() {
        Some(target) => event.deliver(&mut **target),
        None => error!(actor = %actor, "Message type does not match the bound actor"),
      }
    });

    let command = Command::Deliver {
      id: binding.id,
      name: Arc::clone(&binding.name),
      job,
    };
    if binding.shared.tx.send(command).is_err() {
      binding.shared.reporter.report(&binding.name, FailureKind::ThreadStopped);
    }
  }
}

impl<E: Envelope> MessageSender<E> for ActorRef<E> {
  fn send(&self, message: E) {
    self.tell(message)
  }
}

// ============================================================================
// Tests
// ============================================================================
