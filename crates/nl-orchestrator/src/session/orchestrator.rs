//! Session state machine
//!
//! ```text
//! Connecting -> Negotiating -> Renting -> Starting -> AwaitingReady -> Tunneling -> Completed
//!                                  any non-terminal state -> Failed | Cancelled
//! ```
//!
//! Every wait observes the session's cancellation token. Whatever way the
//! state machine ends, [`Session::cleanup`] runs before the report is
//! returned.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use nl_core::config::SessionConfig;
use nl_core::traits::Market;
use nl_core::{ProcessStatus, RentalSpec, SessionError, SessionId, SessionState};

use super::wait::{poll_until, PollOutcome};
use super::{Session, SessionOutcome, SessionReport};
use crate::market;
use crate::process::{self, LineStream};
use crate::readiness::ReadinessDetector;
use crate::shutdown::ShutdownCoordinator;
use crate::state::SessionFlags;
use crate::tunnel::{Tunnel, TunnelEvent};

/// How long buffered output may take to reach the detector after an exit
const OUTPUT_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Drives one session from market connection to cleanup
pub struct Orchestrator {
    id: SessionId,
    config: SessionConfig,
    spec: RentalSpec,
    market: Arc<dyn Market>,
    flags: Arc<SessionFlags>,
    /// Interrupts every wait
    cancel: CancellationToken,
    /// Abandons cleanup
    force: CancellationToken,
    state_tx: watch::Sender<SessionState>,
}

impl Orchestrator {
    /// Create an orchestrator renting according to `config.rental`
    pub fn new(config: SessionConfig, market: Arc<dyn Market>) -> Self {
        let spec = RentalSpec::from_config(&config.rental);
        let (state_tx, _) = watch::channel(SessionState::Connecting);

        Self {
            id: SessionId::new(),
            config,
            spec,
            market,
            flags: Arc::new(SessionFlags::new()),
            cancel: CancellationToken::new(),
            force: CancellationToken::new(),
            state_tx,
        }
    }

    /// Replace the rental spec built from configuration
    pub fn with_rental_spec(mut self, spec: RentalSpec) -> Self {
        self.spec = spec;
        self
    }

    /// Session identifier
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Shared session flags
    pub fn flags(&self) -> Arc<SessionFlags> {
        Arc::clone(&self.flags)
    }

    /// Coordinator that can interrupt this session
    pub fn shutdown_coordinator(&self) -> ShutdownCoordinator {
        ShutdownCoordinator::new(
            Arc::clone(&self.flags),
            self.cancel.clone(),
            self.force.clone(),
        )
    }

    /// Watch state transitions
    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.state_tx.subscribe()
    }

    /// Run the session to a terminal state and clean up
    pub async fn run(self) -> SessionReport {
        let span = tracing::info_span!("session", id = %self.id.short());
        self.run_inner().instrument(span).await
    }

    async fn run_inner(self) -> SessionReport {
        let mut session = Session::new(self.id, Arc::clone(&self.flags));

        let outcome = match self.drive(&mut session).await {
            Ok(()) => SessionOutcome::Completed,
            Err(e) if self.cancel.is_cancelled() => {
                tracing::info!("Session interrupted: {}", e);
                SessionOutcome::Cancelled
            }
            Err(e) => {
                tracing::error!("Session failed: {}", e);
                SessionOutcome::Failed(e)
            }
        };

        let cleanup = session
            .cleanup(self.config.shutdown.cleanup_step_timeout, &self.force)
            .await;
        let warnings = cleanup.warnings().count();
        if warnings > 0 {
            tracing::warn!("Cleanup finished with {} warning(s)", warnings);
        }

        let forced = self.force.is_cancelled();
        self.transition(outcome.state());

        SessionReport {
            session_id: self.id,
            outcome,
            cleanup,
            forced,
        }
    }

    async fn drive(&self, session: &mut Session) -> Result<(), SessionError> {
        self.transition(SessionState::Connecting);
        let connection =
            market::connect_with_retry(&*self.market, &self.config.market, &self.cancel).await?;
        session.attach_connection(connection);

        self.transition(SessionState::Negotiating);
        tracing::debug!("Negotiating for {:?}", self.spec);
        let rental = match session.connection() {
            Some(connection) => {
                market::negotiate(
                    connection,
                    &self.spec,
                    self.config.rental.negotiation_timeout,
                    &self.cancel,
                )
                .await?
            }
            None => return Err(self.cancelled(SessionState::Negotiating)),
        };
        session.attach_rental(rental);

        self.transition(SessionState::Renting);
        let exe = match session.rental() {
            Some(rental) => tokio::select! {
                _ = self.cancel.cancelled() => return Err(self.cancelled(SessionState::Renting)),
                result = rental.exe_unit() => result.map_err(SessionError::RentalUnusable)?,
            },
            None => return Err(self.cancelled(SessionState::Renting)),
        };
        session.attach_exe(Arc::clone(&exe));

        self.transition(SessionState::Starting);
        let command = &self.config.process.command;
        let mut process = tokio::select! {
            _ = self.cancel.cancelled() => return Err(self.cancelled(SessionState::Starting)),
            result = process::start(&*exe, command) => result?,
        };

        let detector = ReadinessDetector::new(
            self.config.process.readiness_marker.clone(),
            self.config.process.readiness_source,
            Arc::clone(&self.flags),
        );
        for stream in [process.take_stdout(), process.take_stderr()].into_iter().flatten() {
            session.track_output_consumer(spawn_output_consumer(stream, detector.clone()));
        }
        session.attach_process(process);

        self.transition(SessionState::AwaitingReady);
        self.await_ready(session).await?;

        self.transition(SessionState::Tunneling);
        let tunnel_config = &self.config.tunnel;
        let (mut tunnel, events) = tokio::select! {
            _ = self.cancel.cancelled() => return Err(self.cancelled(SessionState::Tunneling)),
            result = Tunnel::open(&*exe, tunnel_config.remote_port) => result?,
        };
        session.track_task(spawn_event_logger(events));

        let local_addr = tunnel
            .listen(&tunnel_config.bind_address, tunnel_config.local_port)
            .await?;
        session.attach_tunnel(tunnel);
        tracing::info!("Server proxy listening at http://{}", local_addr);

        self.await_completion(session).await
    }

    /// Wait for the readiness flag, an early exit, cancellation or the optional timeout
    ///
    /// An exit observed before the marker only fails the session once the
    /// output already written has been read: the marker line may still be
    /// queued behind the exit status.
    async fn await_ready(&self, session: &mut Session) -> Result<(), SessionError> {
        let started = Instant::now();
        let outcome = {
            let Some(process) = session.process() else {
                return Err(self.cancelled(SessionState::AwaitingReady));
            };

            poll_until(
                self.config.process.poll_interval,
                self.config.process.readiness_timeout,
                &self.cancel,
                || {
                    if self.flags.is_ready() {
                        Some(Ok(()))
                    } else if process.is_finished() {
                        Some(Err(process.status()))
                    } else {
                        None
                    }
                },
            )
            .await
        };

        match outcome {
            PollOutcome::Ready(Ok(())) => Ok(()),
            PollOutcome::Ready(Err(status)) => {
                session.drain_output(OUTPUT_DRAIN_TIMEOUT).await;
                if self.flags.is_ready() {
                    tracing::debug!("Readiness marker was read after the process exited");
                    Ok(())
                } else {
                    Err(SessionError::ProcessExitedEarly { status })
                }
            }
            PollOutcome::Cancelled | PollOutcome::TimedOut => Err(SessionError::ReadinessTimeout {
                waited: started.elapsed(),
            }),
        }
    }

    /// Wait for the remote process to finish
    async fn await_completion(&self, session: &Session) -> Result<(), SessionError> {
        let Some(process) = session.process() else {
            return Err(self.cancelled(SessionState::Tunneling));
        };

        let outcome = poll_until(self.config.process.poll_interval, None, &self.cancel, || {
            process.is_finished().then(|| process.status())
        })
        .await;

        match outcome {
            PollOutcome::Ready(ProcessStatus::Lost { reason }) => {
                Err(SessionError::ProcessLost { reason })
            }
            PollOutcome::Ready(status) => {
                tracing::info!("Remote process finished ({})", status);
                Ok(())
            }
            PollOutcome::Cancelled | PollOutcome::TimedOut => {
                Err(self.cancelled(SessionState::Tunneling))
            }
        }
    }

    fn cancelled(&self, stage: SessionState) -> SessionError {
        SessionError::Cancelled { stage }
    }

    fn transition(&self, next: SessionState) {
        let previous = self.state_tx.send_replace(next);
        if previous != next {
            tracing::info!("Session state: {} -> {}", previous, next);
        }
    }
}

/// Log every line of one output stream and feed it to the detector
fn spawn_output_consumer(mut stream: LineStream, detector: ReadinessDetector) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(line) = stream.next_line().await {
            tracing::info!(stream = %line.source, "$ {}", line);
            detector.observe(&line);
        }
    })
}

/// Report tunnel events; forwarding failures never end the session
fn spawn_event_logger(mut events: mpsc::Receiver<TunnelEvent>) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                TunnelEvent::Opened { id, peer } => {
                    tracing::debug!("Tunnel connection {} opened from {}", id, peer);
                }
                TunnelEvent::Closed {
                    id,
                    peer,
                    to_remote,
                    to_local,
                } => {
                    tracing::debug!(
                        "Tunnel connection {} from {} closed ({} bytes up, {} bytes down)",
                        id,
                        peer,
                        to_remote,
                        to_local
                    );
                }
                TunnelEvent::Failed { id, error } => {
                    tracing::warn!("Tunnel reported an error on connection {}: {}", id, error);
                }
            }
        }
    })
}
