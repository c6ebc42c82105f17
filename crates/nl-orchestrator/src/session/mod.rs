//! Session aggregate and lifecycle
//!
//! A [`Session`] owns every resource acquired while a node is rented: the
//! market connection, the rental, the remote process and the tunnel. Only
//! the [`Orchestrator`] adds resources to it, and [`Session::cleanup`]
//! releases them in reverse order of acquisition.

mod cleanup;
mod orchestrator;
mod report;
pub mod wait;

pub use cleanup::{CleanupReport, CleanupStep, StepOutcome};
pub use orchestrator::Orchestrator;
pub use report::{SessionOutcome, SessionReport};

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::Instant;

use nl_core::traits::{ExeUnit, MarketConnection, Rental};
use nl_core::SessionId;

use crate::process::ProcessHandle;
use crate::state::SessionFlags;
use crate::tunnel::Tunnel;

/// Resources held by one orchestrated session.
///
/// Invariant: a tunnel is only attached once a process is attached and
/// the ready flag is set.
pub struct Session {
    id: SessionId,
    flags: Arc<SessionFlags>,
    connection: Option<Box<dyn MarketConnection>>,
    rental: Option<Box<dyn Rental>>,
    exe: Option<Arc<dyn ExeUnit>>,
    process: Option<ProcessHandle>,
    tunnel: Option<Tunnel>,
    /// Tasks feeding process output to the readiness detector
    consumers: Vec<JoinHandle<()>>,
    /// Other background tasks, such as the tunnel event logger
    tasks: Vec<JoinHandle<()>>,
}

impl Session {
    /// Create an empty session
    pub fn new(id: SessionId, flags: Arc<SessionFlags>) -> Self {
        Self {
            id,
            flags,
            connection: None,
            rental: None,
            exe: None,
            process: None,
            tunnel: None,
            consumers: Vec::new(),
            tasks: Vec::new(),
        }
    }

    /// Take ownership of the market connection; released last
    pub fn attach_connection(&mut self, connection: Box<dyn MarketConnection>) {
        self.connection = Some(connection);
    }

    /// Take ownership of the negotiated rental; stopped before disconnecting
    pub fn attach_rental(&mut self, rental: Box<dyn Rental>) {
        self.rental = Some(rental);
    }

    /// Keep the rental's execution context until the rental is stopped
    pub fn attach_exe(&mut self, exe: Arc<dyn ExeUnit>) {
        self.exe = Some(exe);
    }

    /// Take ownership of the launched process.
    ///
    /// A forced cleanup kills it before anything else is released.
    pub fn attach_process(&mut self, process: ProcessHandle) {
        self.process = Some(process);
    }

    /// Attach an open tunnel.
    ///
    /// Must only be called once the process is attached and ready.
    pub fn attach_tunnel(&mut self, tunnel: Tunnel) {
        debug_assert!(
            self.process.is_some() && self.flags.is_ready(),
            "tunnel attached before the remote process was ready"
        );
        self.tunnel = Some(tunnel);
    }

    /// Keep an output consumer alive until its stream ends or cleanup runs
    pub fn track_output_consumer(&mut self, consumer: JoinHandle<()>) {
        self.consumers.push(consumer);
    }

    /// Keep a background task alive for the session's lifetime
    pub fn track_task(&mut self, task: JoinHandle<()>) {
        self.tasks.push(task);
    }

    /// Wait up to `limit` for every output consumer to reach the end of its stream.
    ///
    /// Consumers still running after `limit` are aborted.
    pub async fn drain_output(&mut self, limit: Duration) {
        let deadline = Instant::now() + limit;
        for mut consumer in self.consumers.drain(..) {
            if tokio::time::timeout_at(deadline, &mut consumer).await.is_err() {
                tracing::debug!("Output consumer still running after {:?}", limit);
                consumer.abort();
            }
        }
    }

    pub fn connection(&self) -> Option<&dyn MarketConnection> {
        self.connection.as_deref()
    }

    pub fn rental(&self) -> Option<&dyn Rental> {
        self.rental.as_deref()
    }

    pub fn process(&self) -> Option<&ProcessHandle> {
        self.process.as_ref()
    }

    /// Whether any resource is still held
    pub fn holds_resources(&self) -> bool {
        self.connection.is_some()
            || self.rental.is_some()
            || self.exe.is_some()
            || self.process.is_some()
            || self.tunnel.is_some()
    }
}
