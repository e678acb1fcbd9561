//! Spindle: a cooperative event-loop core.
//!
//! # Overview
//!
//! Spindle is the reactor/watcher substrate a cooperative-multitasking
//! runtime sits on. It unifies two structurally different reactor engines
//! (one that queues readiness and dispatches after polling, one with a fixed
//! stage order that runs timers before polling) behind a single interface,
//! and multiplexes many logical watchers (I/O readiness, timers, OS
//! signals, child-process exit, fork events) onto the small number of
//! native registrations the engine actually holds.
//!
//! # Core Guarantees
//!
//! - **Deterministic flush**: callbacks pending before an iteration's flush
//!   run before that iteration's poll (queued engine) or within the same
//!   iteration via the check hook (staged engine); callbacks scheduled
//!   *during* a flush run on the next flush, never the current one.
//! - **One registration per descriptor**: N logical watchers on a
//!   descriptor share one native registration whose interest mask is always
//!   the OR of the active watchers' masks; the last close tears it down.
//! - **Exactly-once child fan-out**: one process-wide SIGCHLD registration
//!   reaps every exited child and notifies each interested watcher at most
//!   once per exit event, exact-pid watchers before wildcard ones.
//! - **Bounded signal/fork latency**: a bounded-period keep-spin timer (and
//!   poll interruption) keeps an otherwise-idle loop noticing
//!   asynchronously latched events, without busy-waiting.
//!
//! # Module Structure
//!
//! - [`event_loop`]: the loop core (run modes, clock, lifecycle)
//! - [`reactor`]: the engine trait and its two implementations
//! - [`watcher`]: logical watchers multiplexed onto the engines
//! - [`callback`]: the pending-callback queue
//! - [`error`](mod@error): the error taxonomy
//!
//! # Example
//!
//! ```
//! use spindle::{EventLoop, LoopConfig};
//! use std::cell::Cell;
//! use std::rc::Rc;
//! use std::time::Duration;
//!
//! let lp = EventLoop::new(LoopConfig::default()).unwrap();
//! let ticks = Rc::new(Cell::new(0u32));
//!
//! let counted = Rc::clone(&ticks);
//! let timer = lp.timer(Duration::from_millis(1), Duration::ZERO).unwrap();
//! timer.start(move || counted.set(counted.get() + 1)).unwrap();
//!
//! lp.run_default();
//! assert_eq!(ticks.get(), 1);
//! ```

// Unsafe is confined to the sigaction install in reactor::signal_pending,
// which opts back in with a module-level allow.
#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::cast_possible_truncation)]

#[cfg(not(unix))]
compile_error!("spindle requires a Unix platform (waitpid/sigaction/poller fds)");

pub mod callback;
pub mod error;
pub mod event_loop;
pub mod reactor;
pub mod watcher;

#[cfg(test)]
mod util;

#[cfg(test)]
pub(crate) mod test_util;

pub use callback::CallbackHandle;
pub use error::LoopError;
pub use event_loop::{EventLoop, LoopConfig};
pub use reactor::{EngineKind, Interest, RunMode};
pub use watcher::{ChildExit, ChildWatcher, ForkWatcher, IoWatcher, SignalWatcher, TimerWatcher};
