//! Reactor engines: native handle management and the poll/dispatch cycle.
//!
//! Two engines implement the [`Reactor`] trait and differ only in their
//! internal phase order:
//!
//! - [`QueuedReactor`] runs its prepare hooks, polls for readiness, then
//!   dispatches everything that became ready (I/O, expired timers, latched
//!   signals) from a single priority-ordered queue, and finally runs its
//!   check hooks. Watcher priority is a real ordering input here.
//! - [`StagedReactor`] runs a fixed stage order every iteration: timers →
//!   idle → prepare → poll (I/O dispatched inline) → signals → check.
//!   Priority is accepted but has no effect on stage order.
//!
//! The loop core is written against the trait alone; nothing engine-specific
//! leaks past it. Native handles live in an arena keyed by [`HandleId`], and
//! every handle carries an opaque [`DataKey`] that the loop core's registry
//! resolves back to the owning watcher on each callback: plain arena plus
//! index ownership, no back-pointers into application objects.

pub mod interest;
pub(crate) mod signal_pending;
pub(crate) mod table;

mod base;
mod queued;
mod staged;

pub use interest::Interest;
pub use queued::QueuedReactor;
pub use staged::StagedReactor;

use std::io;
use std::os::fd::RawFd;

use crate::error::LoopError;

/// Identifies a native handle inside an engine's arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandleId(pub(crate) usize);

/// Opaque key stored in a native handle's user-data slot.
///
/// The loop core allocates one per logical watcher and resolves it through
/// its registry whenever the engine reports a firing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DataKey(pub(crate) usize);

/// Which engine flavor a loop runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EngineKind {
    /// Dispatch-after-poll engine with priority-ordered firing.
    Queued,
    /// Fixed-stage-order engine (timers before poll, check after).
    #[default]
    Staged,
}

/// How long one call to [`Reactor::run`] may keep iterating.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    /// Block until no active referenced handles remain (or the loop is
    /// stopped).
    Default,
    /// Perform at most one iteration, blocking in the poll step.
    Once,
    /// Perform at most one iteration and never block.
    NoWait,
}

impl RunMode {
    /// Maps the classic `(nowait, once)` flag pair to a mode.
    ///
    /// `nowait` wins when both are set, because it cannot block.
    #[must_use]
    pub fn from_flags(nowait: bool, once: bool) -> Self {
        if nowait {
            Self::NoWait
        } else if once {
            Self::Once
        } else {
            Self::Default
        }
    }
}

/// What a native handle watches.
#[derive(Debug, Clone, Copy)]
pub enum HandleSpec {
    /// Readiness on a file descriptor. Interest starts empty and is applied
    /// with [`Reactor::set_io_interest`].
    Io {
        /// The descriptor to register with the OS poller.
        fd: RawFd,
    },
    /// A deadline, one-shot (`repeat_ms == 0`) or repeating.
    Timer {
        /// Delay until the first firing, in loop-clock milliseconds.
        after_ms: u64,
        /// Re-arm period after each firing; zero means one-shot.
        repeat_ms: u64,
    },
    /// A latched OS signal.
    Signal {
        /// Signal number to watch.
        signum: i32,
    },
    /// Phase hook before the poll step.
    Prepare,
    /// Phase hook after the poll step.
    Check {
        /// Spin checks zero the staged engine's poll timeout while active,
        /// so a forced extra iteration is prompt. They fire like any other
        /// check handle.
        spin: bool,
    },
    /// Phase hook that runs before prepare and forces a zero poll timeout
    /// while active.
    Idle,
}

/// Event delivered to the loop core for a fired handle.
#[derive(Debug, Clone, Copy)]
pub enum Fired {
    /// I/O readiness, with the subset of the registered interest that is
    /// ready.
    Io(Interest),
    /// A timer reached its deadline.
    Timer,
    /// A latched signal was drained.
    Signal(i32),
    /// The prepare phase reached this hook.
    Prepare,
    /// The check phase reached this hook.
    Check,
    /// The idle phase reached this hook.
    Idle,
}

/// Sink for native callbacks; implemented by the loop core.
///
/// Engines call this with the handle's [`DataKey`] at the phase the firing
/// belongs to. Implementations may re-enter the engine (start, stop, close,
/// create handles) but must not call [`Reactor::run`] recursively.
pub trait Dispatch {
    /// Delivers one firing.
    fn fire(&self, data: DataKey, event: Fired);
}

/// A reactor engine: owns the OS poller and the native handle arena.
///
/// All methods take `&self`; engines use interior mutability so that
/// callbacks running under [`Reactor::run`] can re-enter handle operations.
pub trait Reactor {
    /// Which flavor this engine is.
    fn kind(&self) -> EngineKind;

    /// The cached loop clock, in milliseconds since engine creation.
    fn now_ms(&self) -> u64;

    /// Forces the cached clock to resync with the OS.
    ///
    /// Engines cache time across an iteration; a long-running callback that
    /// arms timers should resync first or the deadlines will be computed
    /// against stale time.
    fn update_now(&self);

    /// Drives the poll/dispatch cycle according to `mode`.
    ///
    /// Returns true if more work remains (active referenced handles or
    /// handles still closing). Not reentrant; a nested call logs a warning
    /// and returns without iterating.
    fn run(&self, mode: RunMode, dispatch: &dyn Dispatch) -> bool;

    /// Makes the current (or next) `run` return as soon as the iteration in
    /// progress completes.
    fn stop(&self);

    /// Allocates a native handle. The handle starts inactive.
    ///
    /// # Errors
    ///
    /// Returns an error if the OS registration fails (I/O handles only).
    fn create(&self, spec: HandleSpec, data: DataKey) -> io::Result<HandleId>;

    /// Activates a handle. Starting an active handle is a no-op.
    ///
    /// # Errors
    ///
    /// Returns an error if the OS poller rejects the arming.
    fn start(&self, id: HandleId) -> io::Result<()>;

    /// Deactivates a handle. Stopping an inactive handle is a no-op.
    fn stop_handle(&self, id: HandleId);

    /// Begins closing a handle: the OS registration is released immediately,
    /// the arena slot is reclaimed at the end of the current (or next)
    /// iteration. Closing twice is a no-op.
    fn close(&self, id: HandleId);

    /// Replaces the interest mask of an I/O handle, re-applying it to the
    /// OS poller if the handle is active.
    ///
    /// # Errors
    ///
    /// Returns an error if the handle is not an I/O handle or the poller
    /// update fails.
    fn set_io_interest(&self, id: HandleId, interest: Interest) -> io::Result<()>;

    /// Sets whether this handle keeps the loop alive.
    fn set_ref(&self, id: HandleId, referenced: bool);

    /// Sets the dispatch-order hint. Higher priorities fire earlier on the
    /// queued engine; the staged engine ignores it.
    fn set_priority(&self, id: HandleId, priority: i32);

    /// True if any active referenced handle remains.
    fn alive(&self) -> bool;

    /// Number of handles not yet reclaimed (including closing ones).
    fn open_handles(&self) -> usize;

    /// Force-closes every handle not already closing.
    fn walk_force_close(&self);

    /// Shuts the engine down.
    ///
    /// # Errors
    ///
    /// Returns [`LoopError::CloseBusy`] if any handle is still open; the
    /// caller is expected to force-close and spin once before retrying.
    fn close_engine(&self) -> Result<(), LoopError>;

    /// Re-opens the OS poller and re-arms surviving registrations.
    ///
    /// Must be called in the child after a fork; the inherited poller
    /// descriptor is not usable there. Calling this on a running loop is a
    /// caller error.
    ///
    /// # Errors
    ///
    /// Returns an error if the new poller cannot be allocated or a
    /// registration cannot be re-armed.
    fn reinit(&self) -> io::Result<()>;
}

/// Converts an interest set to the poller's event representation.
pub(crate) fn interest_to_event(key: usize, interest: Interest) -> polling::Event {
    match (interest.is_readable(), interest.is_writable()) {
        (true, true) => polling::Event::all(key),
        (true, false) => polling::Event::readable(key),
        (false, true) => polling::Event::writable(key),
        (false, false) => polling::Event::none(key),
    }
}

/// Converts a delivered poller event to the readiness it reports.
pub(crate) fn event_to_interest(event: &polling::Event) -> Interest {
    let mut ready = Interest::NONE;
    if event.readable {
        ready |= Interest::READABLE;
    }
    if event.writable {
        ready |= Interest::WRITABLE;
    }
    ready
}

/// Builds the engine selected by `kind`.
///
/// # Errors
///
/// Returns [`LoopError::ReactorInit`] if the OS poller cannot be allocated.
pub(crate) fn new_engine(kind: EngineKind) -> Result<Box<dyn Reactor>, LoopError> {
    match kind {
        EngineKind::Queued => Ok(Box::new(QueuedReactor::new()?)),
        EngineKind::Staged => Ok(Box::new(StagedReactor::new()?)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nowait_wins_over_once() {
        assert_eq!(RunMode::from_flags(true, true), RunMode::NoWait);
        assert_eq!(RunMode::from_flags(true, false), RunMode::NoWait);
        assert_eq!(RunMode::from_flags(false, true), RunMode::Once);
        assert_eq!(RunMode::from_flags(false, false), RunMode::Default);
    }

    #[test]
    fn default_engine_is_staged() {
        assert_eq!(EngineKind::default(), EngineKind::Staged);
    }
}
