//! Per-connection forwarding

use std::net::SocketAddr;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::net::TcpStream;
use tokio::sync::mpsc;

use nl_core::traits::RemoteEndpoint;
use nl_core::ForwardingError;

use super::TunnelEvent;

/// Relay one accepted local connection to the remote endpoint until either side closes
pub(super) async fn forward_connection(
    id: u64,
    mut local: TcpStream,
    peer: SocketAddr,
    endpoint: Arc<dyn RemoteEndpoint>,
    events: mpsc::Sender<TunnelEvent>,
    connections: Arc<DashMap<u64, SocketAddr>>,
) {
    let result = match endpoint.connect().await {
        Ok(mut remote) => tokio::io::copy_bidirectional(&mut local, &mut remote)
            .await
            .map_err(|source| ForwardingError::Relay { peer, source }),
        Err(source) => Err(ForwardingError::Connect { peer, source }),
    };

    connections.remove(&id);

    let event = match result {
        Ok((to_remote, to_local)) => TunnelEvent::Closed {
            id,
            peer,
            to_remote,
            to_local,
        },
        Err(error) => TunnelEvent::Failed { id, error },
    };

    // Best effort - never block forwarding on the event consumer
    if events.try_send(event).is_err() {
        tracing::debug!("Dropped tunnel event for connection {}", id);
    }
}
