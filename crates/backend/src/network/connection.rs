//! One framed connection, shared by both ends

use std::{fmt, net::SocketAddr, time::Duration};

use bytes::BytesMut;
use futures::{SinkExt, StreamExt};
use tokio::{net::TcpStream, sync::mpsc};
use tokio_util::{
  codec::{Framed, LengthDelimitedCodec},
  sync::CancellationToken,
};
use tracing::{debug, trace, warn};

use super::{EndpointSink, NetworkConnection, NetworkError, NetworkEvent};
use crate::{
  actor::MessageSender,
  ipc::{
    ChannelHeader, Encoding,
    encoding::{from_bytes, to_bytes},
  },
};

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

pub(crate) type FramedStream = Framed<TcpStream, LengthDelimitedCodec>;

pub(crate) fn framed(stream: TcpStream) -> FramedStream {
  Framed::new(stream, LengthDelimitedCodec::new())
}

/// Sends `Out` messages over a connection.
///
/// Messages are queued and written by the connection task; once the
/// connection is gone they are dropped.
pub struct NetworkSender<Out> {
  tx: mpsc::UnboundedSender<Out>,
}

impl<Out> Clone for NetworkSender<Out> {
  fn clone(&self) -> Self {
    Self { tx: self.tx.clone() }
  }
}

impl<Out> fmt::Debug for NetworkSender<Out> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("NetworkSender")
      .field("closed", &self.tx.is_closed())
      .finish()
  }
}

impl<Out> NetworkSender<Out> {
  pub(crate) fn new(tx: mpsc::UnboundedSender<Out>) -> Self {
    Self { tx }
  }

  pub fn is_closed(&self) -> bool {
    self.tx.is_closed()
  }
}

impl<Out: Send> MessageSender<Out> for NetworkSender<Out> {
  fn send(&self, message: Out) {
    if self.tx.send(message).is_err() {
      debug!("Connection closed, message dropped");
    }
  }
}

/// Exchange header frames: announce `Out`, require `In` from the peer.
pub(crate) async fn handshake<In: Encoding, Out: Encoding>(framed: &mut FramedStream) -> Result<(), NetworkError> {
  let mut header = BytesMut::new();
  ChannelHeader::for_encoding::<Out>().encode(&mut header);
  framed
    .send(header.freeze())
    .await
    .map_err(|e| NetworkError::Handshake(format!("cannot send header: {}", e)))?;

  let frame = match tokio::time::timeout(HANDSHAKE_TIMEOUT, framed.next()).await {
    Err(_) => return Err(NetworkError::Handshake("timed out waiting for peer header".into())),
    Ok(None) => return Err(NetworkError::Handshake("peer closed the connection".into())),
    Ok(Some(Err(e))) => return Err(NetworkError::Handshake(format!("cannot read header: {}", e))),
    Ok(Some(Ok(frame))) => frame,
  };

  let mut bytes = frame.freeze();
  ChannelHeader::decode(&mut bytes)
    .and_then(|header| header.check::<In>())
    .map_err(|e| NetworkError::Handshake(e.to_string()))?;
  trace!(receives = In::INTERFACE, sends = Out::INTERFACE, "Handshake complete");
  Ok(())
}

/// Pump a handshaken connection until either side closes or `cancel` fires.
///
/// Replies still queued when `cancel` fires are written before the connection
/// closes. The endpoint always sees `Disconnected` last.
pub(crate) async fn serve<In: Encoding, Out: Encoding>(
  framed: FramedStream,
  peer: SocketAddr,
  tx: mpsc::UnboundedSender<Out>,
  mut rx: mpsc::UnboundedReceiver<Out>,
  endpoint: EndpointSink<In, Out>,
  cancel: CancellationToken,
) -> Result<(), NetworkError> {
  endpoint.send(NetworkEvent::Connected {
    connection: NetworkConnection { peer },
    sender: NetworkSender::new(tx),
  });

  let (mut sink, mut stream) = framed.split();
  let mut outgoing_open = true;
  let mut received = 0u64;

  let result = loop {
    tokio::select! {
      _ = cancel.cancelled() => {
        while let Ok(message) = rx.try_recv() {
          if let Err(e) = sink.send(to_bytes(&message)).await {
            warn!(peer = %peer, error = %e, "Failed to flush message on close");
            break;
          }
        }
        break Ok(());
      }

      outgoing = rx.recv(), if outgoing_open => {
        match outgoing {
          Some(message) => {
            if let Err(e) = sink.send(to_bytes(&message)).await {
              break Err(NetworkError::from(e));
            }
          }
          None => outgoing_open = false,
        }
      }

      incoming = stream.next() => {
        match incoming {
          Some(Ok(frame)) => match from_bytes::<In>(frame.freeze()) {
            Ok(message) => {
              received += 1;
              endpoint.send(NetworkEvent::Message(message));
            }
            Err(e) => break Err(NetworkError::from(e)),
          },
          Some(Err(e)) => break Err(NetworkError::from(e)),
          None => break Ok(()),
        }
      }
    }
  };

  if let Err(e) = sink.close().await {
    trace!(peer = %peer, error = %e, "Error closing connection");
  }
  match &result {
    Ok(()) => debug!(peer = %peer, received, "Connection closed"),
    Err(e) => warn!(peer = %peer, received, error = %e, "Connection failed"),
  }
  endpoint.send(NetworkEvent::Disconnected);
  result
}
