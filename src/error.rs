//! Error types for the loop core.
//!
//! The taxonomy is small and deliberate:
//!
//! - Resource-acquisition failures ([`LoopError::ReactorInit`]) are never
//!   swallowed; they surface immediately and are not retried.
//! - Invalid-state operations ([`LoopError::WatcherState`]) are surfaced to
//!   the caller and not retried.
//! - Steady-state operational anomalies ([`LoopError::Reap`]) are absorbed
//!   locally (logged, retried on the next signal delivery) and never
//!   interrupt the loop.
//! - [`LoopError::CloseBusy`] is recovered locally exactly once during
//!   `destroy`; a second failure is a fatal invariant violation.

use std::io;
use thiserror::Error;

/// Errors produced by the event loop and its watchers.
#[derive(Debug, Error)]
pub enum LoopError {
    /// The reactor engine could not be allocated.
    ///
    /// This is fatal for the loop being constructed; there is no retry.
    #[error("failed to initialize reactor engine: {source}")]
    ReactorInit {
        /// The underlying allocation failure.
        #[source]
        source: io::Error,
    },

    /// An operation was attempted on a watcher in an invalid state, such as
    /// restarting a closed watcher or adding interest to a multiplexer that
    /// is being torn down.
    #[error("invalid watcher state: {0}")]
    WatcherState(&'static str),

    /// Reaping an exited child failed transiently.
    ///
    /// Callers normally never see this: the reap loop logs it and gives up
    /// until the next SIGCHLD delivery.
    #[error("failed to reap child process: {source}")]
    Reap {
        /// The underlying wait error.
        #[source]
        source: io::Error,
    },

    /// Closing the loop found outstanding native handles.
    ///
    /// `destroy` recovers from this once by force-closing every remaining
    /// handle and spinning the engine; if the retry also fails the loop
    /// panics, because a second failure means a handle leak the core cannot
    /// explain.
    #[error("loop close reported outstanding handles")]
    CloseBusy,
}

impl LoopError {
    /// Wraps an I/O error from engine allocation.
    #[must_use]
    pub fn reactor_init(source: io::Error) -> Self {
        Self::ReactorInit { source }
    }

    /// Wraps an I/O error from a child reap attempt.
    #[must_use]
    pub fn reap(source: io::Error) -> Self {
        Self::Reap { source }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_names_the_failure() {
        let err = LoopError::reactor_init(io::Error::new(io::ErrorKind::Other, "boom"));
        let msg = format!("{err}");
        assert!(msg.contains("initialize reactor engine"));
        assert!(msg.contains("boom"));
    }

    #[test]
    fn watcher_state_carries_reason() {
        let err = LoopError::WatcherState("watcher is closed");
        assert!(format!("{err}").contains("watcher is closed"));
    }

    #[test]
    fn close_busy_names_the_condition() {
        let msg = format!("{}", LoopError::CloseBusy);
        assert!(msg.contains("outstanding handles"));
    }
}
