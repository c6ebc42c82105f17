//! Final session report

use nl_core::{ErrorKind, SessionError, SessionId, SessionState};

use super::CleanupReport;

/// How a session ended
#[derive(Debug)]
pub enum SessionOutcome {
    /// The remote process finished normally
    Completed,
    /// A fatal error ended the session
    Failed(SessionError),
    /// A shutdown request ended the session
    Cancelled,
}

impl SessionOutcome {
    /// Terminal state matching this outcome
    pub fn state(&self) -> SessionState {
        match self {
            SessionOutcome::Completed => SessionState::Completed,
            SessionOutcome::Failed(_) => SessionState::Failed,
            SessionOutcome::Cancelled => SessionState::Cancelled,
        }
    }
}

/// Everything a caller learns once a session is over.
///
/// Produced only after cleanup has finished. Cleanup problems are warnings
/// and never change the outcome.
#[derive(Debug)]
pub struct SessionReport {
    pub session_id: SessionId,
    pub outcome: SessionOutcome,
    pub cleanup: CleanupReport,
    /// A second shutdown request cut cleanup short
    pub forced: bool,
}

impl SessionReport {
    /// Terminal state
    pub fn state(&self) -> SessionState {
        self.outcome.state()
    }

    /// Error that failed the session, if any
    pub fn error(&self) -> Option<&SessionError> {
        match &self.outcome {
            SessionOutcome::Failed(e) => Some(e),
            _ => None,
        }
    }

    /// Kind of the error that failed the session, if any
    pub fn error_kind(&self) -> Option<ErrorKind> {
        self.error().map(SessionError::kind)
    }

    /// Process exit code for this report
    pub fn exit_code(&self) -> i32 {
        if self.forced {
            return 1;
        }
        match self.outcome {
            SessionOutcome::Completed | SessionOutcome::Cancelled => 0,
            SessionOutcome::Failed(_) => 1,
        }
    }
}
