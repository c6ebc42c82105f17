//! Flags shared between the session's concurrent tasks

use std::sync::atomic::{AtomicBool, Ordering};

/// The only session state written from more than one task.
///
/// Both flags only ever go from `false` to `true`.
#[derive(Debug, Default)]
pub struct SessionFlags {
    ready: AtomicBool,
    shutting_down: AtomicBool,
}

impl SessionFlags {
    /// Create a new set of flags, all cleared
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark the remote service ready.
    ///
    /// Returns `true` only for the call that actually flipped the flag.
    pub fn mark_ready(&self) -> bool {
        !self.ready.swap(true, Ordering::SeqCst)
    }

    /// Whether the readiness marker has been seen
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    /// Mark the session as shutting down.
    ///
    /// Returns `true` if a shutdown was already in progress.
    pub fn begin_shutdown(&self) -> bool {
        self.shutting_down.swap(true, Ordering::SeqCst)
    }

    /// Whether a shutdown has been requested
    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }
}
