//! Best-effort, ordered release of session resources
//!
//! Resources are released in reverse order of acquisition:
//! tunnel, then rental, then the market connection. The tunnel forwards
//! through the rental's network and the rental lives on the connection, so
//! the order is fixed. A failing step is logged and the next one still runs.
//!
//! Once the force token fires, the remote process is killed, the step in
//! progress is abandoned and the remaining steps are skipped.

use std::fmt;
use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use nl_core::MarketError;

use super::Session;

/// One cleanup step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CleanupStep {
    TunnelClose,
    RentalStop,
    ConnectionDisconnect,
}

impl fmt::Display for CleanupStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CleanupStep::TunnelClose => f.write_str("tunnel close"),
            CleanupStep::RentalStop => f.write_str("rental stop"),
            CleanupStep::ConnectionDisconnect => f.write_str("connection disconnect"),
        }
    }
}

/// Result of one cleanup step
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome {
    /// Resource released
    Done,
    /// Resource was never acquired or already released
    NotNeeded,
    /// Release failed
    Failed(String),
    /// Release did not finish within the step timeout
    TimedOut,
    /// Forced shutdown arrived while the step was running
    Abandoned,
    /// Forced shutdown arrived before the step started
    Skipped,
}

impl StepOutcome {
    /// Whether this outcome should be surfaced as a warning
    pub fn is_warning(&self) -> bool {
        matches!(self, StepOutcome::Failed(_) | StepOutcome::TimedOut)
    }
}

/// Ordered record of what cleanup did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanupReport {
    steps: Vec<(CleanupStep, StepOutcome)>,
}

impl CleanupReport {
    /// Steps in execution order
    pub fn steps(&self) -> &[(CleanupStep, StepOutcome)] {
        &self.steps
    }

    /// Outcome of a given step
    pub fn outcome(&self, step: CleanupStep) -> Option<&StepOutcome> {
        self.steps.iter().find(|(s, _)| *s == step).map(|(_, o)| o)
    }

    /// Steps that failed or timed out
    pub fn warnings(&self) -> impl Iterator<Item = &(CleanupStep, StepOutcome)> {
        self.steps.iter().filter(|(_, o)| o.is_warning())
    }

    /// Whether every step released its resource or had nothing to do
    pub fn is_clean(&self) -> bool {
        self.steps
            .iter()
            .all(|(_, o)| matches!(o, StepOutcome::Done | StepOutcome::NotNeeded))
    }

    fn record(&mut self, step: CleanupStep, outcome: StepOutcome) {
        match &outcome {
            StepOutcome::Done => tracing::debug!("Cleanup: {} done", step),
            StepOutcome::NotNeeded => {}
            StepOutcome::Failed(e) => tracing::warn!("Cleanup: {} failed: {}", step, e),
            StepOutcome::TimedOut => tracing::warn!("Cleanup: {} timed out", step),
            StepOutcome::Abandoned => tracing::warn!("Cleanup: {} abandoned", step),
            StepOutcome::Skipped => tracing::debug!("Cleanup: {} skipped", step),
        }
        self.steps.push((step, outcome));
    }
}

impl Session {
    /// Release every held resource. Safe to call more than once.
    pub async fn cleanup(
        &mut self,
        step_timeout: Duration,
        force: &CancellationToken,
    ) -> CleanupReport {
        let mut report = CleanupReport::default();
        tracing::debug!("Releasing resources of session {}", self.id.short());

        self.kill_process_if_forced(force);
        let outcome = match self.tunnel.take() {
            _ if force.is_cancelled() => StepOutcome::Skipped,
            Some(mut tunnel) => {
                run_step(step_timeout, force, async move {
                    tunnel.close().await;
                    Ok(())
                })
                .await
            }
            None => StepOutcome::NotNeeded,
        };
        report.record(CleanupStep::TunnelClose, outcome);

        self.kill_process_if_forced(force);
        let outcome = match self.rental.take() {
            _ if force.is_cancelled() => StepOutcome::Skipped,
            Some(rental) => {
                tracing::info!("Stopping rental from {}", rental.provider().name);
                run_step(step_timeout, force, rental.stop_and_finalize()).await
            }
            None => StepOutcome::NotNeeded,
        };
        report.record(CleanupStep::RentalStop, outcome);

        // The rental owned the process and the execution context
        self.kill_process_if_forced(force);
        self.process = None;
        self.exe = None;

        let outcome = match self.connection.take() {
            _ if force.is_cancelled() => StepOutcome::Skipped,
            Some(connection) => run_step(step_timeout, force, connection.disconnect()).await,
            None => StepOutcome::NotNeeded,
        };
        report.record(CleanupStep::ConnectionDisconnect, outcome);

        for task in self.consumers.drain(..).chain(self.tasks.drain(..)) {
            task.abort();
        }

        report
    }

    /// Kill the attached process once a forced shutdown was requested
    fn kill_process_if_forced(&self, force: &CancellationToken) {
        if !force.is_cancelled() {
            return;
        }
        if let Some(process) = &self.process {
            tracing::warn!("Forced shutdown: killing `{}`", process.command());
            process.kill();
        }
    }
}

async fn run_step<F>(step_timeout: Duration, force: &CancellationToken, step: F) -> StepOutcome
where
    F: Future<Output = Result<(), MarketError>>,
{
    tokio::select! {
        biased;

        _ = force.cancelled() => StepOutcome::Abandoned,
        result = tokio::time::timeout(step_timeout, step) => match result {
            Ok(Ok(())) => StepOutcome::Done,
            Ok(Err(e)) => StepOutcome::Failed(e.to_string()),
            Err(_) => StepOutcome::TimedOut,
        },
    }
}
