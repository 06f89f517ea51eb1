//! Network rendezvous between launcher and daemon
//!
//! # Architecture
//!
//! ```text
//! launcher                                   daemon
//! listen_on_any_port(factory) ─ port ─▶ argv ─▶ connect(port)
//!        │ accept (once)                          │
//!        ▼                                        ▼
//! handshake: header frame ◀──────────────▶ header frame
//!        │                                        │
//! NetworkEndpoint<SuiteEvent, CommandEvent>  NetworkEndpoint<CommandEvent, SuiteEvent>
//! ```
//!
//! Both directions carry length-delimited frames. The first frame on each side
//! is a [`ChannelHeader`](crate::ipc::ChannelHeader) naming the interface that
//! side sends; every later frame is one encoded envelope.

mod client;
mod connection;
mod server;

use std::{
  fmt,
  net::SocketAddr,
  sync::{Arc, Mutex, PoisonError},
};

pub use client::{PendingConnection, connect};
pub use connection::NetworkSender;
pub use server::listen_on_any_port;

use crate::{
  actor::{Envelope, MessageSender},
  ipc::{Encoding, IpcError},
};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NetworkError {
  #[error("IO error: {0}")]
  Io(String),
  #[error("Already connected once")]
  AlreadyConnected,
  #[error("Handshake failed: {0}")]
  Handshake(String),
  #[error("Protocol error: {0}")]
  Protocol(String),
}

impl From<std::io::Error> for NetworkError {
  fn from(err: std::io::Error) -> Self {
    NetworkError::Io(err.to_string())
  }
}

impl From<IpcError> for NetworkError {
  fn from(err: IpcError) -> Self {
    NetworkError::Protocol(err.to_string())
  }
}

/// The remote side of an established connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NetworkConnection {
  pub peer: SocketAddr,
}

/// Receives what happens on one connection: messages of type `In`, and a
/// sender for replies of type `Out`.
pub trait NetworkEndpoint<In, Out>: Send {
  fn on_connected(&mut self, connection: NetworkConnection, sender: NetworkSender<Out>);

  fn on_message(&mut self, message: In);

  /// The connection ended, or never got past the handshake
  fn on_disconnected(&mut self);
}

pub enum NetworkEvent<In, Out> {
  Connected {
    connection: NetworkConnection,
    sender: NetworkSender<Out>,
  },
  Message(In),
  Disconnected,
}

impl<In: fmt::Debug, Out> fmt::Debug for NetworkEvent<In, Out> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      NetworkEvent::Connected { connection, .. } => f.debug_tuple("Connected").field(&connection.peer).finish(),
      NetworkEvent::Message(message) => f.debug_tuple("Message").field(message).finish(),
      NetworkEvent::Disconnected => f.write_str("Disconnected"),
    }
  }
}

impl<In, Out> Envelope for NetworkEvent<In, Out>
where
  In: Encoding + fmt::Debug,
  Out: Encoding,
{
  type Target = dyn NetworkEndpoint<In, Out>;

  fn deliver(self, target: &mut Self::Target) {
    match self {
      NetworkEvent::Connected { connection, sender } => target.on_connected(connection, sender),
      NetworkEvent::Message(message) => target.on_message(message),
      NetworkEvent::Disconnected => target.on_disconnected(),
    }
  }
}

/// Where a connection's events go
pub type EndpointSink<In, Out> = Arc<dyn MessageSender<NetworkEvent<In, Out>>>;

/// Hands out the endpoint for each accepted connection.
pub trait NetworkEndpointFactory<In, Out>: Send + Sync {
  fn create_endpoint(&self) -> Result<EndpointSink<In, Out>, NetworkError>;
}

/// Accepts exactly one connection; every later one is refused.
pub struct OneTimeEndpointFactory<In, Out> {
  endpoint: Mutex<Option<EndpointSink<In, Out>>>,
}

impl<In, Out> OneTimeEndpointFactory<In, Out> {
  pub fn new(endpoint: EndpointSink<In, Out>) -> Self {
    Self {
      endpoint: Mutex::new(Some(endpoint)),
    }
  }
}

impl<In: Send + 'static, Out: Send + 'static> NetworkEndpointFactory<In, Out> for OneTimeEndpointFactory<In, Out> {
  fn create_endpoint(&self) -> Result<EndpointSink<In, Out>, NetworkError> {
    self
      .endpoint
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .take()
      .ok_or(NetworkError::AlreadyConnected)
  }
}

#[cfg(test)]
mod tests {
  use std::{net::Ipv4Addr, time::Duration};

  use tokio_util::sync::CancellationToken;

  use super::*;
  use crate::{
    actor::MessageLog,
    domain::suite::TestFile,
    events::{CommandEvent, SuiteEvent},
  };

  /// Flattened view of endpoint events for assertions
  #[derive(Debug, Clone, PartialEq)]
  enum Seen<In> {
    Connected,
    Message(In),
    Disconnected,
  }

  /// Records events and keeps the reply sender around.
  struct Recording<In, Out> {
    log: MessageLog<Seen<In>>,
    sender: Arc<Mutex<Option<NetworkSender<Out>>>>,
  }

  impl<In: Clone + Send + 'static, Out: Send + 'static> MessageSender<NetworkEvent<In, Out>> for Recording<In, Out> {
    fn send(&self, event: NetworkEvent<In, Out>) {
      match event {
        NetworkEvent::Connected { sender, .. } => {
          *self.sender.lock().unwrap() = Some(sender);
          self.log.send(Seen::Connected);
        }
        NetworkEvent::Message(message) => self.log.send(Seen::Message(message)),
        NetworkEvent::Disconnected => self.log.send(Seen::Disconnected),
      }
    }
  }

  fn recording<In: Clone + Send + 'static, Out: Send + 'static>()
  -> (EndpointSink<In, Out>, MessageLog<Seen<In>>, Arc<Mutex<Option<NetworkSender<Out>>>>) {
    let log = MessageLog::new();
    let sender = Arc::new(Mutex::new(None));
    let sink: EndpointSink<In, Out> = Arc::new(Recording {
      log: log.clone(),
      sender: Arc::clone(&sender),
    });
    (sink, log, sender)
  }

  async fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    for _ in 0..500 {
      if condition() {
        return true;
      }
      tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
  }

  #[tokio::test]
  async fn test_messages_flow_both_ways() {
    let cancel = CancellationToken::new();
    let (launcher_sink, launcher_log, launcher_reply) = recording::<SuiteEvent, CommandEvent>();
    let factory = Arc::new(OneTimeEndpointFactory::new(launcher_sink));
    let addr = listen_on_any_port::<SuiteEvent, CommandEvent>(factory, cancel.clone())
      .await
      .unwrap();
    assert_eq!(addr.ip(), Ipv4Addr::LOCALHOST);

    let (daemon_sink, daemon_log, _) = recording::<CommandEvent, SuiteEvent>();
    let pending = connect::<CommandEvent, SuiteEvent>(addr).await.unwrap();
    let results = pending.sender();
    let task = pending.run(daemon_sink, cancel.clone());

    results.send(SuiteEvent::TestFileFound(TestFile::new("a_test")));
    assert!(wait_until(|| launcher_log.len() == 2).await);
    assert_eq!(
      launcher_log.messages(),
      vec![
        Seen::Connected,
        Seen::Message(SuiteEvent::TestFileFound(TestFile::new("a_test")))
      ]
    );

    let commands = launcher_reply.lock().unwrap().clone().unwrap();
    commands.send(CommandEvent::Shutdown);
    assert!(wait_until(|| daemon_log.len() == 2).await);
    assert_eq!(daemon_log.messages()[1], Seen::Message(CommandEvent::Shutdown));

    cancel.cancel();
    task.await.unwrap().unwrap();
    assert!(wait_until(|| launcher_log.messages().last() == Some(&Seen::Disconnected)).await);
  }

  #[tokio::test]
  async fn test_second_connection_is_refused() {
    let cancel = CancellationToken::new();
    let (sink, log, _) = recording::<SuiteEvent, CommandEvent>();
    let factory = Arc::new(OneTimeEndpointFactory::new(sink));
    let addr = listen_on_any_port::<SuiteEvent, CommandEvent>(factory.clone(), cancel.clone())
      .await
      .unwrap();

    let _first = connect::<CommandEvent, SuiteEvent>(addr).await.unwrap();
    let second = tokio::time::timeout(Duration::from_secs(5), connect::<CommandEvent, SuiteEvent>(addr))
      .await
      .unwrap();

    assert!(matches!(second, Err(NetworkError::Handshake(_))));
    assert!(matches!(factory.create_endpoint(), Err(NetworkError::AlreadyConnected)));
    assert!(wait_until(|| log.messages().first() == Some(&Seen::Connected)).await);
    cancel.cancel();
  }

  #[tokio::test]
  async fn test_interface_mismatch_fails_the_handshake() {
    let cancel = CancellationToken::new();
    let (sink, log, _) = recording::<SuiteEvent, CommandEvent>();
    let addr = listen_on_any_port::<SuiteEvent, CommandEvent>(Arc::new(OneTimeEndpointFactory::new(sink)), cancel.clone())
      .await
      .unwrap();

    // Sends commands where results are expected
    let result = connect::<SuiteEvent, CommandEvent>(addr).await;

    assert!(matches!(result, Err(NetworkError::Handshake(_))));
    assert!(wait_until(|| log.messages() == vec![Seen::Disconnected]).await);
    cancel.cancel();
  }
}
