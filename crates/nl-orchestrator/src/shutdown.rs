//! Shutdown coordination
//!
//! The first termination request marks the session as shutting down and
//! cancels every wait, which sends the orchestrator into its normal
//! cleanup path. A second request while shutdown is already in progress
//! raises the force token: cleanup is abandoned and the binary exits
//! immediately.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use nl_core::{ShutdownReason, ShutdownRequest};

use crate::state::SessionFlags;

/// Turns termination requests into cancellation of one session
#[derive(Clone)]
pub struct ShutdownCoordinator {
    flags: Arc<SessionFlags>,
    cancel: CancellationToken,
    force: CancellationToken,
}

impl ShutdownCoordinator {
    /// Create a coordinator over a session's flags and tokens
    pub fn new(flags: Arc<SessionFlags>, cancel: CancellationToken, force: CancellationToken) -> Self {
        Self {
            flags,
            cancel,
            force,
        }
    }

    /// Handle one termination request.
    ///
    /// Safe to call from any task, any number of times, including while the
    /// session is already finishing on its own.
    pub fn request(&self, reason: ShutdownReason) -> ShutdownRequest {
        let escalate = self.flags.begin_shutdown();

        if escalate {
            tracing::error!("Forced shutdown initiated ({})", reason);
            self.force.cancel();
        } else {
            tracing::info!("Session shutdown initiated ({})", reason);
        }
        self.cancel.cancel();

        ShutdownRequest { reason, escalate }
    }

    /// Whether a shutdown has been requested
    pub fn is_shutting_down(&self) -> bool {
        self.flags.is_shutting_down()
    }

    /// Whether a forced shutdown has been requested
    pub fn is_forced(&self) -> bool {
        self.force.is_cancelled()
    }

    /// Wait until a forced shutdown is requested
    pub async fn forced(&self) {
        self.force.cancelled().await
    }
}

/// Feed SIGINT and SIGTERM into `coordinator` until the task is dropped.
///
/// Both signals are treated identically.
#[cfg(unix)]
pub async fn listen_for_signals(coordinator: ShutdownCoordinator) -> std::io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut interrupt = signal(SignalKind::interrupt())?;
    let mut terminate = signal(SignalKind::terminate())?;

    loop {
        let reason = tokio::select! {
            Some(()) = interrupt.recv() => ShutdownReason::Interrupt,
            Some(()) = terminate.recv() => ShutdownReason::Terminate,
            else => return Ok(()),
        };
        coordinator.request(reason);
    }
}

/// Feed Ctrl+C into `coordinator` until the task is dropped.
#[cfg(not(unix))]
pub async fn listen_for_signals(coordinator: ShutdownCoordinator) -> std::io::Result<()> {
    loop {
        tokio::signal::ctrl_c().await?;
        coordinator.request(ShutdownReason::Interrupt);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn coordinator() -> (ShutdownCoordinator, CancellationToken, CancellationToken) {
        let cancel = CancellationToken::new();
        let force = CancellationToken::new();
        let coordinator = ShutdownCoordinator::new(
            Arc::new(SessionFlags::new()),
            cancel.clone(),
            force.clone(),
        );
        (coordinator, cancel, force)
    }

    #[test]
    fn test_first_request_cancels_without_force() {
        let (coordinator, cancel, force) = coordinator();
        let request = coordinator.request(ShutdownReason::Interrupt);

        assert!(!request.escalate);
        assert!(coordinator.is_shutting_down());
        assert!(cancel.is_cancelled());
        assert!(!force.is_cancelled());
    }

    #[test]
    fn test_second_request_escalates() {
        let (coordinator, _cancel, force) = coordinator();
        coordinator.request(ShutdownReason::Interrupt);
        let request = coordinator.request(ShutdownReason::Terminate);

        assert!(request.escalate);
        assert_eq!(request.reason, ShutdownReason::Terminate);
        assert!(force.is_cancelled());
        assert!(coordinator.is_forced());
    }

    #[tokio::test]
    async fn test_concurrent_requests_escalate_exactly_once() {
        let (coordinator, _cancel, _force) = coordinator();
        let mut handles = Vec::new();
        for i in 0..16 {
            let c = coordinator.clone();
            handles.push(tokio::spawn(async move {
                c.request(ShutdownReason::Requested(format!("task {}", i)))
            }));
        }

        let mut first = 0;
        for handle in handles {
            if !handle.await.unwrap().escalate {
                first += 1;
            }
        }
        assert_eq!(first, 1);
        coordinator.forced().await;
    }
}
