//! Readiness marker detection
//!
//! The remote server prints a known line once it accepts connections.
//! The detector scans every output line for that marker and flips the
//! session's ready flag the first time it appears.

use std::sync::Arc;

use nl_core::config::ReadinessSource;
use nl_core::LineEvent;

use crate::state::SessionFlags;

/// Scans output lines for the readiness marker
#[derive(Debug, Clone)]
pub struct ReadinessDetector {
    marker: String,
    source: ReadinessSource,
    flags: Arc<SessionFlags>,
}

impl ReadinessDetector {
    /// Create a detector that sets `flags`' ready flag
    pub fn new(marker: impl Into<String>, source: ReadinessSource, flags: Arc<SessionFlags>) -> Self {
        Self {
            marker: marker.into(),
            source,
            flags,
        }
    }

    /// Inspect one line.
    ///
    /// Lines that are not valid UTF-8 never match.
    pub fn observe(&self, line: &LineEvent) {
        if !self.source.includes(line.source) {
            return;
        }

        let Some(text) = line.text() else {
            return;
        };

        if text.contains(&self.marker) && self.flags.mark_ready() {
            tracing::info!(stream = %line.source, "Remote service is ready");
        }
    }

    /// Whether the marker has been seen
    pub fn is_ready(&self) -> bool {
        self.flags.is_ready()
    }
}
