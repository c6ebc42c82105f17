//! Process handle and line streams

use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use futures::Stream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use nl_core::traits::{ExeUnit, RemoteProcess};
use nl_core::{LineEvent, LineSource, ProcessStatus, SessionError};

use super::LineSplitter;

/// Buffered lines per stream before the pump waits for the consumer
const LINE_CHANNEL_CAPACITY: usize = 256;

/// Launch `command` on `exe` and start splitting its output into lines
pub async fn start(exe: &dyn ExeUnit, command: &str) -> Result<ProcessHandle, SessionError> {
    tracing::info!(provider = %exe.provider().name, "Starting remote command: {}", command);

    let remote = exe.run_and_stream(command).await.map_err(SessionError::Launch)?;
    Ok(ProcessHandle::new(command, remote))
}

/// A running remote command.
///
/// Each output stream can be taken exactly once. A taken stream yields
/// lines in write order until the process ends, then stays exhausted.
pub struct ProcessHandle {
    command: String,
    stdout: Option<LineStream>,
    stderr: Option<LineStream>,
    status: watch::Receiver<ProcessStatus>,
    kill: CancellationToken,
    pumps: Vec<JoinHandle<()>>,
}

impl ProcessHandle {
    /// Wrap a raw remote process
    pub fn new(command: &str, remote: RemoteProcess) -> Self {
        let RemoteProcess {
            stdout,
            stderr,
            status,
            kill,
        } = remote;

        let (stdout_stream, stdout_pump) = spawn_pump(LineSource::Stdout, stdout, status.clone());
        let (stderr_stream, stderr_pump) = spawn_pump(LineSource::Stderr, stderr, status.clone());

        Self {
            command: command.to_string(),
            stdout: Some(stdout_stream),
            stderr: Some(stderr_stream),
            status,
            kill,
            pumps: vec![stdout_pump, stderr_pump],
        }
    }

    /// Command line this process was started with
    pub fn command(&self) -> &str {
        &self.command
    }

    /// Take the standard output line stream
    pub fn take_stdout(&mut self) -> Option<LineStream> {
        self.stdout.take()
    }

    /// Take the standard error line stream
    pub fn take_stderr(&mut self) -> Option<LineStream> {
        self.stderr.take()
    }

    /// Whether the process has exited or its transport failed
    pub fn is_finished(&self) -> bool {
        self.status.borrow().is_finished()
    }

    /// Current exit condition
    pub fn status(&self) -> ProcessStatus {
        self.status.borrow().clone()
    }

    /// Wait until the process is no longer running
    pub async fn wait(&mut self) -> ProcessStatus {
        loop {
            let current = self.status.borrow_and_update().clone();
            if current.is_finished() {
                return current;
            }
            if self.status.changed().await.is_err() {
                let last = self.status.borrow().clone();
                return if last.is_finished() {
                    last
                } else {
                    ProcessStatus::Lost {
                        reason: "status channel closed".to_string(),
                    }
                };
            }
        }
    }

    /// Ask the remote side to terminate the process
    pub fn kill(&self) {
        if !self.kill.is_cancelled() {
            tracing::debug!("Requesting termination of `{}`", self.command);
            self.kill.cancel();
        }
    }
}

impl Drop for ProcessHandle {
    fn drop(&mut self) {
        for pump in &self.pumps {
            pump.abort();
        }
    }
}

/// Lazy, single-pass sequence of output lines.
///
/// Once it has returned `None` it keeps returning `None`.
pub struct LineStream {
    source: LineSource,
    rx: mpsc::Receiver<LineEvent>,
    exhausted: bool,
}

impl LineStream {
    /// Which output stream this is
    pub fn source(&self) -> LineSource {
        self.source
    }

    /// Receive the next line
    pub async fn next_line(&mut self) -> Option<LineEvent> {
        if self.exhausted {
            return None;
        }
        let line = self.rx.recv().await;
        if line.is_none() {
            self.exhausted = true;
        }
        line
    }
}

impl Stream for LineStream {
    type Item = LineEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.exhausted {
            return Poll::Ready(None);
        }
        let polled = self.rx.poll_recv(cx);
        if let Poll::Ready(None) = polled {
            self.exhausted = true;
        }
        polled
    }
}

fn spawn_pump(
    source: LineSource,
    chunks: mpsc::Receiver<Bytes>,
    status: watch::Receiver<ProcessStatus>,
) -> (LineStream, JoinHandle<()>) {
    let (tx, rx) = mpsc::channel(LINE_CHANNEL_CAPACITY);
    let task = tokio::spawn(pump(source, chunks, status, tx));
    let stream = LineStream {
        source,
        rx,
        exhausted: false,
    };
    (stream, task)
}

/// Forward chunks as lines until the chunk channel closes.
///
/// A transport failure ends the stream immediately without flushing the
/// partial line. A graceful exit drains whatever output is still queued.
async fn pump(
    source: LineSource,
    mut chunks: mpsc::Receiver<Bytes>,
    mut status: watch::Receiver<ProcessStatus>,
    tx: mpsc::Sender<LineEvent>,
) {
    let mut splitter = LineSplitter::new();
    let mut watching_status = true;

    loop {
        tokio::select! {
            chunk = chunks.recv() => {
                let Some(chunk) = chunk else { break };
                for line in splitter.push(&chunk) {
                    // Keep draining even without a consumer so the remote side never stalls
                    let _ = tx.send(LineEvent::new(source, line)).await;
                }
            }
            changed = status.changed(), if watching_status => {
                if changed.is_err() {
                    watching_status = false;
                    continue;
                }
                if let ProcessStatus::Lost { reason } = &*status.borrow_and_update() {
                    tracing::warn!(stream = %source, "Output stream ended by transport failure: {}", reason);
                    return;
                }
            }
        }
    }

    if let Some(line) = splitter.finish() {
        let _ = tx.send(LineEvent::new(source, line)).await;
    }
    tracing::debug!(stream = %source, "Output stream finished");
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    struct FakeRemote {
        stdout: mpsc::Sender<Bytes>,
        stderr: mpsc::Sender<Bytes>,
        status: watch::Sender<ProcessStatus>,
        kill: CancellationToken,
    }

    fn fake_process() -> (ProcessHandle, FakeRemote) {
        let (stdout_tx, stdout_rx) = mpsc::channel(16);
        let (stderr_tx, stderr_rx) = mpsc::channel(16);
        let (status_tx, status_rx) = watch::channel(ProcessStatus::Running);
        let kill = CancellationToken::new();
        let handle = ProcessHandle::new(
            "ollama serve",
            RemoteProcess {
                stdout: stdout_rx,
                stderr: stderr_rx,
                status: status_rx,
                kill: kill.clone(),
            },
        );
        let remote = FakeRemote {
            stdout: stdout_tx,
            stderr: stderr_tx,
            status: status_tx,
            kill,
        };
        (handle, remote)
    }

    #[tokio::test]
    async fn test_streams_are_independent_and_ordered() {
        let (mut handle, remote) = fake_process();
        let mut stdout = handle.take_stdout().unwrap();
        let mut stderr = handle.take_stderr().unwrap();

        remote.stdout.send(Bytes::from_static(b"one\ntw")).await.unwrap();
        remote.stderr.send(Bytes::from_static(b"err-a\n")).await.unwrap();
        remote.stdout.send(Bytes::from_static(b"o\nthree\n")).await.unwrap();
        drop(remote.stdout);
        drop(remote.stderr);

        let out: Vec<String> = (&mut stdout).map(|l| l.to_string()).collect().await;
        assert_eq!(out, vec!["one", "two", "three"]);

        let err = stderr.next_line().await.unwrap();
        assert_eq!(err.source, LineSource::Stderr);
        assert_eq!(err.text(), Some("err-a"));
        assert!(stderr.next_line().await.is_none());
    }

    #[tokio::test]
    async fn test_stream_is_not_restartable() {
        let (mut handle, remote) = fake_process();
        let mut stdout = handle.take_stdout().unwrap();
        assert!(handle.take_stdout().is_none());

        remote.stdout.send(Bytes::from_static(b"only\n")).await.unwrap();
        drop(remote.stdout);

        assert!(stdout.next_line().await.is_some());
        assert!(stdout.next_line().await.is_none());
        assert!(stdout.next().await.is_none());
        assert!(stdout.next_line().await.is_none());
    }

    #[tokio::test]
    async fn test_trailing_partial_line_flushed_on_exit() {
        let (mut handle, remote) = fake_process();
        let mut stderr = handle.take_stderr().unwrap();

        remote.stderr.send(Bytes::from_static(b"no newline")).await.unwrap();
        remote
            .status
            .send(ProcessStatus::Exited { code: Some(0) })
            .unwrap();
        drop(remote.stderr);

        assert_eq!(stderr.next_line().await.unwrap().text(), Some("no newline"));
        assert!(stderr.next_line().await.is_none());
        assert!(handle.is_finished());
        assert!(handle.status().is_graceful());
    }

    #[tokio::test]
    async fn test_transport_failure_ends_both_streams() {
        let (mut handle, remote) = fake_process();
        let mut stdout = handle.take_stdout().unwrap();
        let mut stderr = handle.take_stderr().unwrap();

        remote
            .status
            .send(ProcessStatus::Lost {
                reason: "connection reset".to_string(),
            })
            .unwrap();

        // Senders are still alive: only the failure may end the streams
        let both = async {
            assert!(stdout.next_line().await.is_none());
            assert!(stderr.next_line().await.is_none());
        };
        tokio::time::timeout(std::time::Duration::from_secs(1), both)
            .await
            .expect("streams did not end");

        assert!(handle.is_finished());
        assert!(!handle.status().is_graceful());
        drop(remote.stdout);
    }

    #[tokio::test]
    async fn test_wait_and_kill() {
        let (mut handle, remote) = fake_process();
        assert_eq!(handle.command(), "ollama serve");
        assert!(!handle.is_finished());

        handle.kill();
        assert!(remote.kill.is_cancelled());

        remote
            .status
            .send(ProcessStatus::Exited { code: Some(137) })
            .unwrap();
        assert_eq!(handle.wait().await, ProcessStatus::Exited { code: Some(137) });
    }

    #[tokio::test]
    async fn test_wait_reports_lost_when_status_sender_dropped() {
        let (mut handle, remote) = fake_process();
        drop(remote.status);
        assert!(matches!(handle.wait().await, ProcessStatus::Lost { .. }));
    }
}
