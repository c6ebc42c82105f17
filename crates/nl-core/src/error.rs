//! Core error types for NodeLease

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::types::{ProcessStatus, SessionState};

/// Fatal errors that end a session.
///
/// Every variant except [`SessionError::Cancelled`] moves the session to
/// `Failed`. Cleanup runs regardless of which variant ended the session.
#[derive(Error, Debug)]
pub enum SessionError {
    /// The market connection could not be established
    #[error("Failed to connect to market after {attempts} attempt(s): {source}")]
    Connect {
        attempts: u32,
        #[source]
        source: MarketError,
    },

    /// No offer was accepted within the negotiation window
    #[error("No acceptable offer within {window:?} ({evaluated} evaluated, {rejected} rejected)")]
    NoCapacity {
        window: Duration,
        evaluated: usize,
        rejected: usize,
    },

    /// The rental was granted but no execution context could be obtained
    #[error("Rental granted but unusable: {0}")]
    RentalUnusable(#[source] MarketError),

    /// The remote command could not be launched
    #[error("Failed to launch remote command: {0}")]
    Launch(#[source] MarketError),

    /// The readiness wait ended before the marker was seen
    #[error("Remote service not ready after {waited:?}")]
    ReadinessTimeout { waited: Duration },

    /// The remote process finished before it became ready
    #[error("Remote process exited before becoming ready ({status})")]
    ProcessExitedEarly { status: ProcessStatus },

    /// The remote process transport failed while the session was running
    #[error("Lost remote process: {reason}")]
    ProcessLost { reason: String },

    /// The local tunnel port is unavailable
    #[error("Failed to bind tunnel listener on {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    /// The remote tunnel endpoint is unreachable
    #[error("Failed to set up tunnel to remote port {remote_port}: {source}")]
    TunnelSetup {
        remote_port: u16,
        #[source]
        source: MarketError,
    },

    /// A wait was interrupted by a shutdown request
    #[error("Interrupted by shutdown while {stage}")]
    Cancelled { stage: SessionState },
}

/// Fieldless discriminant of [`SessionError`], used in reports and logs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Connect,
    NoCapacity,
    RentalUnusable,
    Launch,
    ReadinessTimeout,
    ProcessExitedEarly,
    ProcessLost,
    Bind,
    TunnelSetup,
    Cancelled,
}

impl SessionError {
    /// Get the kind of this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            SessionError::Connect { .. } => ErrorKind::Connect,
            SessionError::NoCapacity { .. } => ErrorKind::NoCapacity,
            SessionError::RentalUnusable(_) => ErrorKind::RentalUnusable,
            SessionError::Launch(_) => ErrorKind::Launch,
            SessionError::ReadinessTimeout { .. } => ErrorKind::ReadinessTimeout,
            SessionError::ProcessExitedEarly { .. } => ErrorKind::ProcessExitedEarly,
            SessionError::ProcessLost { .. } => ErrorKind::ProcessLost,
            SessionError::Bind { .. } => ErrorKind::Bind,
            SessionError::TunnelSetup { .. } => ErrorKind::TunnelSetup,
            SessionError::Cancelled { .. } => ErrorKind::Cancelled,
        }
    }
}

/// Failure of a single forwarded tunnel connection.
///
/// Never fatal: only the affected connection ends.
#[derive(Error, Debug)]
pub enum ForwardingError {
    /// The remote side of the connection could not be opened
    #[error("Failed to open remote stream for {peer}: {source}")]
    Connect {
        peer: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    /// The connection broke while relaying bytes
    #[error("Relay for {peer} broke: {source}")]
    Relay {
        peer: SocketAddr,
        #[source]
        source: std::io::Error,
    },
}

impl ForwardingError {
    /// Local peer address of the failed connection
    pub fn peer(&self) -> SocketAddr {
        match self {
            ForwardingError::Connect { peer, .. } | ForwardingError::Relay { peer, .. } => *peer,
        }
    }
}

/// Errors reported by the marketplace and remote-execution collaborators
#[derive(Error, Debug)]
pub enum MarketError {
    /// Market backend is unreachable
    #[error("Market unavailable: {0}")]
    Unavailable(String),

    /// The request was refused (offer withdrawn, rental rejected, ...)
    #[error("Rejected: {0}")]
    Rejected(String),

    /// The rental or connection is no longer usable
    #[error("Rental revoked: {0}")]
    Revoked(String),

    /// The connection to the market was closed
    #[error("Market connection closed")]
    Disconnected,

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Configuration-related errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Config file not found
    #[error("Config file not found: {0}")]
    NotFound(PathBuf),

    /// Invalid configuration
    #[error("Invalid config: {0}")]
    Invalid(String),

    /// TOML parse error
    #[error("TOML parse error: {0}")]
    Parse(#[from] toml::de::Error),

    /// TOML serialize error
    #[error("TOML serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),
}
