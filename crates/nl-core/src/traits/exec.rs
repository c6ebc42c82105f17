//! Remote execution traits

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

use crate::error::MarketError;
use crate::rental::ProviderInfo;
use crate::types::ProcessStatus;

/// Byte stream usable in both directions
pub trait AsyncReadWrite: AsyncRead + AsyncWrite {}

impl<T: AsyncRead + AsyncWrite + ?Sized> AsyncReadWrite for T {}

/// One forwarded connection to the remote port
pub type RemoteStream = Box<dyn AsyncReadWrite + Send + Unpin>;

/// Raw handle to a command running on the node.
///
/// Output arrives as chunks in write order; chunk boundaries carry no
/// meaning. Both chunk channels close when the process exits or its
/// transport breaks, and `status` then reports which of the two happened.
pub struct RemoteProcess {
    pub stdout: mpsc::Receiver<Bytes>,
    pub stderr: mpsc::Receiver<Bytes>,
    pub status: watch::Receiver<ProcessStatus>,
    /// Cancel to request termination of the process
    pub kill: CancellationToken,
}

/// Execution context on a rented node
#[async_trait]
pub trait ExeUnit: Send + Sync {
    /// Provider of the node this context runs on
    fn provider(&self) -> &ProviderInfo;

    /// Run `command` and stream its output
    async fn run_and_stream(&self, command: &str) -> Result<RemoteProcess, MarketError>;

    /// Prepare forwarding to `remote_port` on the node
    async fn open_endpoint(&self, remote_port: u16)
        -> Result<Arc<dyn RemoteEndpoint>, MarketError>;
}

/// Target of tunnel forwarding on the node
#[async_trait]
pub trait RemoteEndpoint: Send + Sync {
    /// Port on the node
    fn remote_port(&self) -> u16;

    /// Open a new byte stream to the remote port
    async fn connect(&self) -> std::io::Result<RemoteStream>;
}
