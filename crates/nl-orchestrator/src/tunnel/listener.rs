//! Tunnel listener and accept loop

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;

use nl_core::traits::{ExeUnit, RemoteEndpoint};
use nl_core::{SessionError, TunnelBinding};

use super::forward::forward_connection;
use super::{TunnelEvent, TUNNEL_EVENT_CHANNEL_CAPACITY};

/// Pause after a failed accept so a persistent error (e.g. EMFILE) cannot spin
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Forwards local TCP connections to one port on the rented node
pub struct Tunnel {
    /// Where forwarded connections go
    endpoint: Arc<dyn RemoteEndpoint>,
    /// Event sender shared with forwarders
    events: mpsc::Sender<TunnelEvent>,
    /// Live forwarded connections by id
    connections: Arc<DashMap<u64, SocketAddr>>,
    /// Accept loop, present while listening
    listener: Option<ListenerTask>,
    /// Port of the last bound listener
    local_port: u16,
}

struct ListenerTask {
    local_addr: SocketAddr,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl Tunnel {
    /// Create a tunnel to an already prepared remote endpoint.
    ///
    /// Returns the tunnel and the receiving side of its event channel.
    pub fn new(endpoint: Arc<dyn RemoteEndpoint>) -> (Self, mpsc::Receiver<TunnelEvent>) {
        let (events, events_rx) = mpsc::channel(TUNNEL_EVENT_CHANNEL_CAPACITY);
        let tunnel = Self {
            endpoint,
            events,
            connections: Arc::new(DashMap::new()),
            listener: None,
            local_port: 0,
        };
        (tunnel, events_rx)
    }

    /// Prepare forwarding to `remote_port` through `exe`.
    ///
    /// Fails with [`SessionError::TunnelSetup`] if the remote port cannot be reached.
    pub async fn open(
        exe: &dyn ExeUnit,
        remote_port: u16,
    ) -> Result<(Self, mpsc::Receiver<TunnelEvent>), SessionError> {
        let endpoint = exe
            .open_endpoint(remote_port)
            .await
            .map_err(|source| SessionError::TunnelSetup {
                remote_port,
                source,
            })?;
        Ok(Self::new(endpoint))
    }

    /// Bind the local listener and start forwarding.
    ///
    /// Port 0 binds an ephemeral port; the bound address is returned.
    /// Calling this while already listening returns the current address.
    pub async fn listen(
        &mut self,
        bind_address: &str,
        local_port: u16,
    ) -> Result<SocketAddr, SessionError> {
        if let Some(listener) = &self.listener {
            tracing::debug!("Tunnel already listening on {}", listener.local_addr);
            return Ok(listener.local_addr);
        }

        let addr = format!("{}:{}", bind_address, local_port);
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|source| SessionError::Bind {
                addr: addr.clone(),
                source,
            })?;
        let local_addr = listener.local_addr().map_err(|source| SessionError::Bind {
            addr: addr.clone(),
            source,
        })?;

        let cancel = CancellationToken::new();
        let task = tokio::spawn(accept_loop(
            listener,
            Arc::clone(&self.endpoint),
            self.events.clone(),
            Arc::clone(&self.connections),
            cancel.clone(),
        ));

        tracing::info!(
            "Tunnel listening on {} -> remote port {}",
            local_addr,
            self.endpoint.remote_port()
        );

        self.local_port = local_addr.port();
        self.listener = Some(ListenerTask {
            local_addr,
            cancel,
            task,
        });
        Ok(local_addr)
    }

    /// Address of the local listener, if listening
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.as_ref().map(|l| l.local_addr)
    }

    /// Current ports and state
    pub fn binding(&self) -> TunnelBinding {
        TunnelBinding {
            local_port: self.local_port,
            remote_port: self.endpoint.remote_port(),
            open: self.listener.is_some(),
        }
    }

    /// Number of connections currently being forwarded
    pub fn active_connections(&self) -> usize {
        self.connections.len()
    }

    /// Stop accepting, end every forwarded connection and release the port.
    ///
    /// A no-op when the tunnel is already closed or was never opened.
    pub async fn close(&mut self) {
        let Some(listener) = self.listener.take() else {
            return;
        };

        listener.cancel.cancel();
        if let Err(e) = listener.task.await {
            if e.is_panic() {
                tracing::warn!("Tunnel accept loop panicked: {}", e);
            }
        }

        tracing::info!("Tunnel on {} closed", listener.local_addr);
    }
}

impl Drop for Tunnel {
    fn drop(&mut self) {
        if let Some(listener) = &self.listener {
            listener.cancel.cancel();
        }
    }
}

async fn accept_loop(
    listener: TcpListener,
    endpoint: Arc<dyn RemoteEndpoint>,
    events: mpsc::Sender<TunnelEvent>,
    connections: Arc<DashMap<u64, SocketAddr>>,
    cancel: CancellationToken,
) {
    let mut forwards = JoinSet::new();
    let mut next_id: u64 = 0;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                break;
            }

            result = listener.accept() => {
                match result {
                    Ok((socket, peer)) => {
                        next_id += 1;
                        let id = next_id;
                        connections.insert(id, peer);
                        if events.try_send(TunnelEvent::Opened { id, peer }).is_err() {
                            tracing::debug!("Dropped tunnel event for connection {}", id);
                        }

                        forwards.spawn(forward_connection(
                            id,
                            socket,
                            peer,
                            Arc::clone(&endpoint),
                            events.clone(),
                            Arc::clone(&connections),
                        ));
                    }
                    Err(e) => {
                        tracing::error!("Failed to accept tunnel connection: {}", e);
                        tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                    }
                }
            }

            Some(_) = forwards.join_next(), if !forwards.is_empty() => {}
        }
    }

    drop(listener);

    let in_flight = forwards.len();
    forwards.shutdown().await;
    connections.clear();

    if in_flight > 0 {
        tracing::debug!("Ended {} in-flight tunnel connection(s)", in_flight);
    }
}
