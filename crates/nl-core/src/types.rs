//! Core domain types

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Unique identifier for a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(pub uuid::Uuid);

impl SessionId {
    /// Create a new random session ID
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }

    /// Short form used in log lines
    pub fn short(&self) -> String {
        self.0.simple().to_string()[..8].to_string()
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Session lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionState {
    /// Establishing the market connection
    Connecting,
    /// Collecting and filtering offers
    Negotiating,
    /// An offer was accepted, waiting for an execution context
    Renting,
    /// Launching the remote command
    Starting,
    /// Waiting for the readiness marker
    AwaitingReady,
    /// Tunnel open, waiting for the remote process to finish
    Tunneling,
    /// Remote process finished normally
    Completed,
    /// A fatal error ended the session
    Failed,
    /// A shutdown request ended the session
    Cancelled,
}

impl SessionState {
    /// Whether no further transitions can happen
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionState::Completed | SessionState::Failed | SessionState::Cancelled
        )
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionState::Connecting => "connecting",
            SessionState::Negotiating => "negotiating",
            SessionState::Renting => "renting",
            SessionState::Starting => "starting",
            SessionState::AwaitingReady => "awaiting-ready",
            SessionState::Tunneling => "tunneling",
            SessionState::Completed => "completed",
            SessionState::Failed => "failed",
            SessionState::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Exit condition of a remote process
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessStatus {
    /// Still running
    Running,
    /// Exited on its own (or was killed) with an optional exit code
    Exited { code: Option<i32> },
    /// The transport carrying the process broke; the real exit is unknown
    Lost { reason: String },
}

impl ProcessStatus {
    /// Whether the process is no longer running
    pub fn is_finished(&self) -> bool {
        !matches!(self, ProcessStatus::Running)
    }

    /// Whether the process finished without a transport failure
    pub fn is_graceful(&self) -> bool {
        matches!(self, ProcessStatus::Exited { .. })
    }
}

impl fmt::Display for ProcessStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProcessStatus::Running => write!(f, "running"),
            ProcessStatus::Exited { code: Some(code) } => write!(f, "exited with code {}", code),
            ProcessStatus::Exited { code: None } => write!(f, "exited"),
            ProcessStatus::Lost { reason } => write!(f, "lost: {}", reason),
        }
    }
}

/// Which output stream a line came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LineSource {
    Stdout,
    Stderr,
}

impl fmt::Display for LineSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LineSource::Stdout => f.write_str("stdout"),
            LineSource::Stderr => f.write_str("stderr"),
        }
    }
}

/// A single line of remote process output.
///
/// The raw bytes are kept as received; remote output is not guaranteed to
/// be valid UTF-8.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LineEvent {
    pub source: LineSource,
    pub raw: Bytes,
}

impl LineEvent {
    /// Create a new line event
    pub fn new(source: LineSource, raw: impl Into<Bytes>) -> Self {
        Self {
            source,
            raw: raw.into(),
        }
    }

    /// The line as text, or `None` if it is not valid UTF-8
    pub fn text(&self) -> Option<&str> {
        std::str::from_utf8(&self.raw).ok()
    }
}

impl fmt::Display for LineEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", String::from_utf8_lossy(&self.raw))
    }
}

/// Ports and state of the session tunnel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TunnelBinding {
    /// Port the local listener is bound to
    pub local_port: u16,
    /// Port on the remote node connections are forwarded to
    pub remote_port: u16,
    /// Whether the listener is accepting connections
    pub open: bool,
}

/// Why a shutdown was requested
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShutdownReason {
    /// SIGINT / Ctrl+C
    Interrupt,
    /// SIGTERM
    Terminate,
    /// Programmatic request
    Requested(String),
}

impl fmt::Display for ShutdownReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShutdownReason::Interrupt => write!(f, "interrupt signal"),
            ShutdownReason::Terminate => write!(f, "terminate signal"),
            ShutdownReason::Requested(why) => write!(f, "{}", why),
        }
    }
}

/// A termination request as seen by the shutdown coordinator
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShutdownRequest {
    pub reason: ShutdownReason,
    /// Set when a shutdown was already in progress: skip cleanup and exit
    pub escalate: bool,
}
