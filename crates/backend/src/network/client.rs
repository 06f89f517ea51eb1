//! Daemon side: connect back to the launcher

use std::net::SocketAddr;

use tokio::{net::TcpStream, sync::mpsc, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::{
  EndpointSink, NetworkError, NetworkSender,
  connection::{FramedStream, framed, handshake, serve},
};
use crate::ipc::Encoding;

/// A connection that passed the handshake but is not served yet.
///
/// Replies can be queued through [`sender`](Self::sender) before the endpoint
/// exists; they are written once [`run`](Self::run) starts.
pub struct PendingConnection<In, Out> {
  framed: FramedStream,
  peer: SocketAddr,
  tx: mpsc::UnboundedSender<Out>,
  rx: mpsc::UnboundedReceiver<Out>,
  _in: std::marker::PhantomData<fn() -> In>,
}

/// Connect to `addr` and exchange headers.
pub async fn connect<In: Encoding, Out: Encoding>(addr: SocketAddr) -> Result<PendingConnection<In, Out>, NetworkError> {
  let stream = TcpStream::connect(addr).await?;
  stream.set_nodelay(true)?;
  let mut framed = framed(stream);
  handshake::<In, Out>(&mut framed).await?;
  info!(peer = %addr, "Connected to launcher");

  let (tx, rx) = mpsc::unbounded_channel();
  Ok(PendingConnection {
    framed,
    peer: addr,
    tx,
    rx,
    _in: std::marker::PhantomData,
  })
}

impl<In: Encoding, Out: Encoding> PendingConnection<In, Out> {
  pub fn peer(&self) -> SocketAddr {
    self.peer
  }

  pub fn sender(&self) -> NetworkSender<Out> {
    NetworkSender::new(self.tx.clone())
  }

  /// Serve the connection on a new task.
  pub fn run(self, endpoint: EndpointSink<In, Out>, cancel: CancellationToken) -> JoinHandle<Result<(), NetworkError>> {
    tokio::spawn(serve(self.framed, self.peer, self.tx, self.rx, endpoint, cancel))
  }
}
