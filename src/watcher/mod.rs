//! Logical watchers: the application-facing registrations multiplexed onto
//! the engines' native handles.
//!
//! Every watcher follows the same lifecycle: created stopped, started and
//! stopped any number of times, closed exactly once. A closed watcher can
//! never be started again; starting an active watcher is a no-op; `stop`
//! and `close` are idempotent. Each watcher carries a ref flag deciding
//! whether it keeps the loop alive, and a priority hint whose effect
//! depends on the engine (real ordering on the queued engine, best-effort
//! elsewhere).
//!
//! Watcher handles are RAII: dropping one closes it, releasing the native
//! resources. Keep the handle for as long as the watcher should exist.

pub mod child;
pub mod fork;
pub mod io;
pub mod signal;
pub mod timer;

pub use child::{ChildExit, ChildWatcher};
pub use fork::ForkWatcher;
pub use io::IoWatcher;
pub use signal::SignalWatcher;
pub use timer::TimerWatcher;

/// Lifecycle state shared by every watcher kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WatcherState {
    /// Created or stopped; may be started.
    Stopped,
    /// Registered and eligible to fire.
    Active,
    /// Native resources released; terminal.
    Closed,
}

impl WatcherState {
    pub(crate) fn is_active(self) -> bool {
        matches!(self, Self::Active)
    }

    pub(crate) fn is_closed(self) -> bool {
        matches!(self, Self::Closed)
    }
}
