//! Event envelopes - method calls turned into values
//!
//! Every interface that crosses an actor, IPC or network boundary is described
//! by a closed enum with one variant per method. The variant carries the
//! arguments, and [`Envelope::deliver`] turns the value back into a direct call
//! on the target interface.
//!
//! ```text
//! caller ── proxy (impl Listener) ── Envelope ──▶ MessageSender ──▶ deliver(&mut target)
//! ```

use std::{
  fmt,
  sync::{Arc, Mutex, PoisonError},
};

/// A method call on `Self::Target`, reified as a value.
pub trait Envelope: Send + fmt::Debug + 'static {
  /// The interface the envelope is delivered to
  type Target: ?Sized + Send + 'static;

  /// Apply the call to the target.
  fn deliver(self, target: &mut Self::Target);
}

/// Anything that accepts envelopes of type `E`.
///
/// Implemented by actor references, IPC writers, network connections and test
/// collectors. Sending never blocks and never fails from the caller's point of
/// view; transports report their failures out of band.
pub trait MessageSender<E>: Send + Sync {
  fn send(&self, message: E);
}

impl<E, S: MessageSender<E> + ?Sized> MessageSender<E> for Arc<S> {
  fn send(&self, message: E) {
    (**self).send(message)
  }
}

/// Forwards into a tokio channel; a closed receiver drops the message.
impl<E: Send> MessageSender<E> for tokio::sync::mpsc::UnboundedSender<E> {
  fn send(&self, message: E) {
    if tokio::sync::mpsc::UnboundedSender::send(self, message).is_err() {
      tracing::debug!("Receiver dropped, message discarded");
    }
  }
}

/// Collects every sent message, in order.
///
/// Mostly useful for tests and for buffering events before a real sink exists.
pub struct MessageLog<E> {
  messages: Arc<Mutex<Vec<E>>>,
}

impl<E> Clone for MessageLog<E> {
  fn clone(&self) -> Self {
    Self {
      messages: Arc::clone(&self.messages),
    }
  }
}

impl<E> Default for MessageLog<E> {
  fn default() -> Self {
    Self {
      messages: Arc::new(Mutex::new(Vec::new())),
    }
  }
}

impl<E: Clone> MessageLog<E> {
  pub fn new() -> Self {
    Self::default()
  }

  /// Snapshot of everything received so far
  pub fn messages(&self) -> Vec<E> {
    self.messages.lock().unwrap_or_else(PoisonError::into_inner).clone()
  }

  pub fn len(&self) -> usize {
    self.messages.lock().unwrap_or_else(PoisonError::into_inner).len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }
}

impl<E: Send> MessageSender<E> for MessageLog<E> {
  fn send(&self, message: E) {
    self
      .messages
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .push(message);
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  trait Greeter: Send {
    fn greet(&mut self, name: &str);
  }

  #[derive(Debug, Clone, PartialEq)]
  enum GreeterEvent {
    Greet(String),
  }

  impl Envelope for GreeterEvent {
    type Target = dyn Greeter;

    fn deliver(self, target: &mut Self::Target) {
      match self {
        GreeterEvent::Greet(name) => target.greet(&name),
      }
    }
  }

  #[derive(Default)]
  struct Spy(Vec<String>);

  impl Greeter for Spy {
    fn greet(&mut self, name: &str) {
      self.0.push(name.to_string());
    }
  }

  #[test]
  fn test_deliver_calls_the_target_method() {
    let mut spy = Spy::default();
    GreeterEvent::Greet("world".into()).deliver(&mut spy);
    assert_eq!(spy.0, vec!["world".to_string()]);
  }

  #[test]
  fn test_message_log_keeps_send_order() {
    let log = MessageLog::new();
    let shared: Arc<dyn MessageSender<GreeterEvent>> = Arc::new(log.clone());
    shared.send(GreeterEvent::Greet("a".into()));
    shared.send(GreeterEvent::Greet("b".into()));

    assert_eq!(
      log.messages(),
      vec![GreeterEvent::Greet("a".into()), GreeterEvent::Greet("b".into())]
    );
  }
}
