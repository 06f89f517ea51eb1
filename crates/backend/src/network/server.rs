//! Launcher side: accept the daemon's connection

use std::{
  net::{Ipv4Addr, SocketAddr},
  sync::Arc,
};

use tokio::{net::TcpListener, sync::mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{
  NetworkEndpointFactory, NetworkError, NetworkEvent,
  connection::{framed, handshake, serve},
};
use crate::{actor::MessageSender, ipc::Encoding};

/// Listen on an ephemeral loopback port and serve connections until `cancel`.
///
/// Each accepted connection asks `factory` for an endpoint; a refused
/// connection is closed before the handshake, so the peer fails fast.
pub async fn listen_on_any_port<In, Out>(
  factory: Arc<dyn NetworkEndpointFactory<In, Out>>,
  cancel: CancellationToken,
) -> Result<SocketAddr, NetworkError>
where
  In: Encoding,
  Out: Encoding,
{
  let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await?;
  let addr = listener.local_addr()?;
  info!(port = addr.port(), "Listening for daemon connection");

  tokio::spawn(accept_loop(listener, factory, cancel));
  Ok(addr)
}

async fn accept_loop<In: Encoding, Out: Encoding>(
  listener: TcpListener,
  factory: Arc<dyn NetworkEndpointFactory<In, Out>>,
  cancel: CancellationToken,
) {
  loop {
    tokio::select! {
      biased;

      _ = cancel.cancelled() => {
        debug!("Listener shutting down (cancelled)");
        break;
      }

      result = listener.accept() => {
        match result {
          Ok((stream, peer)) => {
            let endpoint = match factory.create_endpoint() {
              Ok(endpoint) => endpoint,
              Err(e) => {
                warn!(peer = %peer, error = %e, "Refusing connection");
                drop(stream);
                continue;
              }
            };
            info!(peer = %peer, "Daemon connected");

            let cancel = cancel.clone();
            tokio::spawn(async move {
              let mut framed = framed(stream);
              if let Err(e) = handshake::<In, Out>(&mut framed).await {
                error!(peer = %peer, error = %e, "Handshake with daemon failed");
                endpoint.send(NetworkEvent::Disconnected);
                return;
              }
              let (tx, rx) = mpsc::unbounded_channel();
              // Failures are logged and reported as a disconnect by serve
              let _ = serve(framed, peer, tx, rx, endpoint, cancel).await;
            });
          }
          Err(e) => {
            error!(error = %e, "Accept error");
          }
        }
      }
    }
  }
}
