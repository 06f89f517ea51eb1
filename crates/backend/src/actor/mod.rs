//! Actor runtime
//!
//! Components never call each other directly across threads. Instead every
//! interface is turned into an [`Envelope`] enum and delivered through an
//! [`ActorRef`] to the [`ActorThread`] that owns the target object.
//!
//! # Architecture
//!
//! ```text
//! ActorThread ("daemon")
//!   ├── mailbox (unbounded FIFO of envelopes)
//!   ├── bound object #1  ◀── ActorRef<SuiteEvent>
//!   ├── bound object #2  ◀── ActorRef<WorkerEvent>
//!   └── ...
//! ```
//!
//! - [`envelope`]: the `Envelope` and `MessageSender` abstractions
//! - [`thread`]: actor threads, actor references, delivery failures
//! - [`workers`]: worker counters (completion barriers) and executors

pub mod envelope;
pub mod thread;
pub mod workers;

#[cfg(test)]
mod __tests__;

pub use envelope::{Envelope, MessageLog, MessageSender};
pub use thread::{ActorFailure, ActorRef, ActorThread, ActorThreadConfig, DrainPolicy, FailureKind};
pub use workers::{BlockingExecutor, Executor, Work, WorkerCounter, WorkerError, WorkerEvent, WorkerListener};
