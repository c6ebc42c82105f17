//! Local child processes and loopback forwarding

use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashSet;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::net::TcpStream;
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use nl_core::traits::{ExeUnit, RemoteEndpoint, RemoteProcess, RemoteStream};
use nl_core::{MarketError, ProcessStatus, ProviderInfo};

/// Chunks buffered per output stream
const CHUNK_CHANNEL_CAPACITY: usize = 64;

/// Read buffer size for child output
const READ_BUFFER_SIZE: usize = 8 * 1024;

/// Process ids of every local child that has not been reaped yet
#[derive(Clone, Default)]
pub struct ProcessRegistry {
    pids: Arc<DashSet<u32>>,
}

impl ProcessRegistry {
    /// Number of children still running
    pub fn len(&self) -> usize {
        self.pids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pids.is_empty()
    }

    /// Send SIGKILL to the process group of every running child.
    ///
    /// Synchronous so it can run right before the process exits.
    pub fn kill_all(&self) {
        for pid in self.pids.iter() {
            let pid = *pid;
            tracing::warn!("Killing local process group {}", pid);
            #[cfg(unix)]
            if let Err(e) = kill_group(pid) {
                tracing::debug!("Process group kill failed: {}", e);
            }
        }
    }

    fn insert(&self, pid: u32) {
        self.pids.insert(pid);
    }

    fn remove(&self, pid: u32) {
        self.pids.remove(&pid);
    }
}

/// Runs commands through `sh -c` on this machine
pub struct LocalExeUnit {
    provider: ProviderInfo,
    target_host: String,
    /// Cancelled when the rental stops; kills every launched process
    activity: CancellationToken,
    registry: ProcessRegistry,
    waiters: Mutex<Vec<JoinHandle<()>>>,
}

impl LocalExeUnit {
    pub(super) fn new(
        provider: ProviderInfo,
        target_host: String,
        activity: CancellationToken,
        registry: ProcessRegistry,
    ) -> Self {
        Self {
            provider,
            target_host,
            activity,
            registry,
            waiters: Mutex::new(Vec::new()),
        }
    }

    /// Wait until every launched process has been reaped
    pub async fn wait_for_processes(&self) {
        let waiters: Vec<_> = self.waiters.lock().await.drain(..).collect();
        for waiter in waiters {
            if let Err(e) = waiter.await {
                tracing::warn!("Process waiter task failed: {}", e);
            }
        }
    }

    fn command(command: &str) -> Command {
        let mut cmd = std::process::Command::new("sh");
        cmd.arg("-c")
            .arg(command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        // Own process group so termination reaches everything `sh` spawned
        #[cfg(unix)]
        std::os::unix::process::CommandExt::process_group(&mut cmd, 0);

        let mut cmd = Command::from(cmd);
        cmd.kill_on_drop(true);
        cmd
    }
}

#[async_trait]
impl ExeUnit for LocalExeUnit {
    fn provider(&self) -> &ProviderInfo {
        &self.provider
    }

    async fn run_and_stream(&self, command: &str) -> Result<RemoteProcess, MarketError> {
        if self.activity.is_cancelled() {
            return Err(MarketError::Revoked("rental already stopped".to_string()));
        }

        let mut child = Self::command(command).spawn()?;
        let pid = child.id();
        tracing::debug!("Spawned local process {:?}", pid);
        if let Some(pid) = pid {
            self.registry.insert(pid);
        }

        let (stdout_tx, stdout) = mpsc::channel(CHUNK_CHANNEL_CAPACITY);
        let (stderr_tx, stderr) = mpsc::channel(CHUNK_CHANNEL_CAPACITY);
        if let Some(out) = child.stdout.take() {
            tokio::spawn(read_chunks(out, stdout_tx));
        }
        if let Some(err) = child.stderr.take() {
            tokio::spawn(read_chunks(err, stderr_tx));
        }

        let (status_tx, status) = watch::channel(ProcessStatus::Running);
        let kill = self.activity.child_token();
        let kill_token = kill.clone();
        let registry = self.registry.clone();
        let waiter = tokio::spawn(async move {
            wait_for_exit(child, kill_token, status_tx).await;
            if let Some(pid) = pid {
                registry.remove(pid);
            }
        });
        self.waiters.lock().await.push(waiter);

        Ok(RemoteProcess {
            stdout,
            stderr,
            status,
            kill,
        })
    }

    async fn open_endpoint(
        &self,
        remote_port: u16,
    ) -> Result<Arc<dyn RemoteEndpoint>, MarketError> {
        let endpoint = LocalEndpoint::new(self.target_host.clone(), remote_port);
        // Fail early if nothing listens on the port yet
        drop(endpoint.connect().await?);
        Ok(Arc::new(endpoint))
    }
}

/// Forwards to `host:port` over plain TCP
pub struct LocalEndpoint {
    host: String,
    port: u16,
}

impl LocalEndpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

#[async_trait]
impl RemoteEndpoint for LocalEndpoint {
    fn remote_port(&self) -> u16 {
        self.port
    }

    async fn connect(&self) -> std::io::Result<RemoteStream> {
        let stream = TcpStream::connect((self.host.as_str(), self.port)).await?;
        stream.set_nodelay(true)?;
        Ok(Box::new(stream))
    }
}

async fn read_chunks<R>(mut reader: R, tx: mpsc::Sender<Bytes>)
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; READ_BUFFER_SIZE];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                if tx.send(Bytes::copy_from_slice(&buf[..n])).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                tracing::debug!("Local process output read failed: {}", e);
                break;
            }
        }
    }
}

async fn wait_for_exit(
    mut child: Child,
    kill: CancellationToken,
    status: watch::Sender<ProcessStatus>,
) {
    let waited = tokio::select! {
        result = child.wait() => result,
        _ = kill.cancelled() => {
            terminate(&mut child).await;
            child.wait().await
        }
    };

    let next = match waited {
        Ok(exit) => ProcessStatus::Exited { code: exit.code() },
        Err(e) => ProcessStatus::Lost {
            reason: e.to_string(),
        },
    };
    tracing::debug!("Local process finished ({})", next);
    status.send_replace(next);
}

async fn terminate(child: &mut Child) {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        match kill_group(pid) {
            Ok(()) => return,
            Err(e) => tracing::debug!("Process group kill failed: {}", e),
        }
    }

    if let Err(e) = child.kill().await {
        tracing::debug!("Process kill failed: {}", e);
    }
}

#[cfg(unix)]
fn kill_group(pid: u32) -> std::io::Result<()> {
    // Negative pid addresses the whole process group
    let result = unsafe { libc::kill(-(pid as libc::pid_t), libc::SIGKILL) };
    if result == 0 {
        Ok(())
    } else {
        Err(std::io::Error::last_os_error())
    }
}
