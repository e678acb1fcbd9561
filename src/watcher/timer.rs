//! Timer watchers.
//!
//! One-shot or repeating deadlines on the loop clock. The degenerate
//! `after == 0 && repeat == 0` form exists purely to force one extra loop
//! iteration: on the queued engine it is a true zero timer (timers fire
//! after the poll there); on the staged engine, where timers fire *before*
//! the poll and a zero timer would do nothing useful, it is a one-shot
//! spin check that fires right after the poll instead.

use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};
use std::time::Duration;

use super::WatcherState;
use crate::error::LoopError;
use crate::event_loop::{LoopInner, Target};
use crate::reactor::{DataKey, EngineKind, HandleId, HandleSpec};

pub(crate) struct TimerCore {
    lp: Weak<LoopInner>,
    key: DataKey,
    handle: Cell<Option<HandleId>>,
    /// Degenerate spin variant (check handle on the staged engine).
    spin: bool,
    repeating: bool,
    state: Cell<WatcherState>,
    referenced: Cell<bool>,
    cb: RefCell<Option<Box<dyn FnMut()>>>,
}

impl TimerCore {
    /// Native firing: settle the lifecycle first, then run the callback,
    /// so a callback observing the watcher sees it already stopped for the
    /// non-repeating variants.
    pub(crate) fn on_fire(&self) {
        if !self.state.get().is_active() {
            return;
        }
        if self.spin {
            // Spin checks are not auto-stopped by the engine.
            if let (Some(lp), Some(handle)) = (self.lp.upgrade(), self.handle.get()) {
                lp.engine().stop_handle(handle);
            }
            self.state.set(WatcherState::Stopped);
        } else if !self.repeating {
            self.state.set(WatcherState::Stopped);
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

/// A one-shot or repeating deadline watcher.
///
/// Dropping the watcher closes it.
pub struct TimerWatcher {
    core: Rc<TimerCore>,
}

impl TimerWatcher {
    /// Arms the timer and stores `callback`. Starting an active timer is a
    /// no-op; the stored callback is kept.
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
        let handle = self
            .core
            .handle
            .get()
            .ok_or(LoopError::WatcherState("watcher is closed"))?;
        *self.core.cb.borrow_mut() = Some(Box::new(callback));
        lp.engine()
            .start(handle)
            .map_err(|_| LoopError::WatcherState("engine rejected the timer"))?;
        lp.engine().set_ref(handle, self.core.referenced.get());
        self.core.state.set(WatcherState::Active);
        Ok(())
    }

    /// Disarms the timer. Idempotent; the watcher may be restarted.
    pub fn stop(&self) {
        if !self.core.state.get().is_active() {
            return;
        }
        self.core.state.set(WatcherState::Stopped);
        if let (Some(lp), Some(handle)) = (self.core.lp.upgrade(), self.core.handle.get()) {
            lp.engine().stop_handle(handle);
        }
    }

    /// Releases the native handle. Idempotent; a closed timer can never be
    /// started again.
    pub fn close(&self) {
        if self.core.state.get().is_closed() {
            return;
        }
        self.stop();
        self.core.state.set(WatcherState::Closed);
        self.core.cb.borrow_mut().take();
        if let Some(lp) = self.core.lp.upgrade() {
            if let Some(handle) = self.core.handle.take() {
                lp.engine().close(handle);
            }
            lp.unregister(self.core.key);
        }
    }

    /// True while the timer is armed.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.core.state.get().is_active()
    }

    /// True once the timer has been closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.core.state.get().is_closed()
    }

    /// True for the degenerate zero-delay, non-repeating spin variant.
    #[must_use]
    pub fn is_spin(&self) -> bool {
        self.core.spin
    }

    /// Sets whether this timer keeps the loop alive.
    pub fn set_referenced(&self, referenced: bool) {
        self.core.referenced.set(referenced);
        if let (Some(lp), Some(handle)) = (self.core.lp.upgrade(), self.core.handle.get()) {
            lp.engine().set_ref(handle, referenced);
        }
    }

    /// Sets the dispatch-order hint.
    pub fn set_priority(&self, priority: i32) {
        if let (Some(lp), Some(handle)) = (self.core.lp.upgrade(), self.core.handle.get()) {
            lp.engine().set_priority(handle, priority);
        }
    }
}

impl Drop for TimerWatcher {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for TimerWatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimerWatcher")
            .field("state", &self.core.state.get())
            .field("spin", &self.core.spin)
            .finish()
    }
}

pub(crate) fn create(
    lp: &Rc<LoopInner>,
    after: Duration,
    repeat: Duration,
) -> Result<TimerWatcher, LoopError> {
    lp.ensure_live()?;
    let after_ms = u64::try_from(after.as_millis()).unwrap_or(u64::MAX);
    let repeat_ms = u64::try_from(repeat.as_millis()).unwrap_or(u64::MAX);
    let spin =
        after_ms == 0 && repeat_ms == 0 && lp.engine_kind() == EngineKind::Staged;
    let core = Rc::new_cyclic(|weak: &Weak<TimerCore>| {
        let key = lp.register(Target::Timer(weak.clone()));
        TimerCore {
            lp: Rc::downgrade(lp),
            key,
            handle: Cell::new(None),
            spin,
            repeating: repeat_ms > 0,
            state: Cell::new(WatcherState::Stopped),
            referenced: Cell::new(true),
            cb: RefCell::new(None),
        }
    });
    let spec = if spin {
        HandleSpec::Check { spin: true }
    } else {
        HandleSpec::Timer {
            after_ms,
            repeat_ms,
        }
    };
    let handle = match lp.engine().create(spec, core.key) {
        Ok(handle) => handle,
        Err(err) => {
            lp.unregister(core.key);
            return Err(LoopError::reactor_init(err));
        }
    };
    core.handle.set(Some(handle));
    Ok(TimerWatcher { core })
}
