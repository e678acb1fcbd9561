//! Fork watchers.
//!
//! Neither engine's signal path can report a fork, so the loop core detects
//! it itself: the pid observed at each callback-flush entry is compared
//! with the last observed pid, and on a mismatch every registered fork
//! watcher fires once. Detection latency is bounded by one iteration, not
//! zero.

use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};

use super::WatcherState;
use crate::error::LoopError;
use crate::event_loop::LoopInner;

pub(crate) struct ForkCore {
    lp: Weak<LoopInner>,
    state: Cell<WatcherState>,
    cb: RefCell<Option<Box<dyn FnMut()>>>,
}

impl ForkCore {
    pub(crate) fn on_fork(&self) {
        if !self.state.get().is_active() {
            return;
        }
        let cb = self.cb.borrow_mut().take();
        if let Some(mut cb) = cb {
            cb();
            let mut slot = self.cb.borrow_mut();
            if slot.is_none() && !self.state.get().is_closed() {
                *slot = Some(cb);
            }
        }
    }
}

/// A watcher fired once after each detected fork.
///
/// Dropping the watcher closes it.
pub struct ForkWatcher {
    core: Rc<ForkCore>,
}

impl ForkWatcher {
    /// Registers for fork notifications. Starting an active watcher is a
    /// no-op.
    ///
    /// # Errors
    ///
    /// Returns [`LoopError::WatcherState`] if the watcher is closed or the
    /// loop is destroyed.
    pub fn start(&self, callback: impl FnMut() + 'static) -> Result<(), LoopError> {
        let state = self.core.state.get();
        if state.is_closed() {
            return Err(LoopError::WatcherState("watcher is closed"));
        }
        if state.is_active() {
            return Ok(());
        }
        let lp = self
            .core
            .lp
            .upgrade()
            .ok_or(LoopError::WatcherState("loop has been destroyed"))?;
        lp.ensure_live()?;
        *self.core.cb.borrow_mut() = Some(Box::new(callback));
        self.core.state.set(WatcherState::Active);
        lp.fork_register(&self.core);
        Ok(())
    }

    /// Unregisters. Idempotent; the watcher may be restarted.
    pub fn stop(&self) {
        if !self.core.state.get().is_active() {
            return;
        }
        self.core.state.set(WatcherState::Stopped);
        if let Some(lp) = self.core.lp.upgrade() {
            lp.fork_unregister(&self.core);
        }
    }

    /// Closes the watcher. Idempotent.
    pub fn close(&self) {
        if self.core.state.get().is_closed() {
            return;
        }
        self.stop();
        self.core.state.set(WatcherState::Closed);
        self.core.cb.borrow_mut().take();
    }

    /// True while the watcher is registered.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.core.state.get().is_active()
    }

    /// True once the watcher has been closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.core.state.get().is_closed()
    }
}

impl Drop for ForkWatcher {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for ForkWatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ForkWatcher")
            .field("state", &self.core.state.get())
            .finish()
    }
}

pub(crate) fn create(lp: &Rc<LoopInner>) -> Result<ForkWatcher, LoopError> {
    lp.ensure_live()?;
    let core = Rc::new(ForkCore {
        lp: Rc::downgrade(lp),
        state: Cell::new(WatcherState::Stopped),
        cb: RefCell::new(None),
    });
    Ok(ForkWatcher { core })
}
