//! Per-signal watchers.
//!
//! Each watcher owns a native signal handle; deliveries are latched by the
//! process-global handler and drained by the engine after its poll step.
//! For a loop blocked in poll, latency is bounded by the poll being
//! interrupted or by the staged engine's keep-spin timer.

use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};

use super::WatcherState;
use crate::error::LoopError;
use crate::event_loop::{LoopInner, Target};
use crate::reactor::{signal_pending, DataKey, HandleId, HandleSpec};

pub(crate) struct SignalCore {
    lp: Weak<LoopInner>,
    signum: i32,
    key: DataKey,
    handle: Cell<Option<HandleId>>,
    /// Whether this watcher holds a reference on the latch handler.
    installed: Cell<bool>,
    state: Cell<WatcherState>,
    referenced: Cell<bool>,
    cb: RefCell<Option<Box<dyn FnMut(i32)>>>,
}

impl SignalCore {
    pub(crate) fn on_fire(&self, signum: i32) {
        if !self.state.get().is_active() {
            return;
        }
        let cb = self.cb.borrow_mut().take();
        if let Some(mut cb) = cb {
            cb(signum);
            let mut slot = self.cb.borrow_mut();
            if slot.is_none() && !self.state.get().is_closed() {
                *slot = Some(cb);
            }
        }
    }

    fn drop_install(&self) {
        if self.installed.replace(false) {
            signal_pending::uninstall(self.signum);
        }
    }
}

/// A watcher fired once per delivered OS signal.
///
/// Dropping the watcher closes it.
pub struct SignalWatcher {
    core: Rc<SignalCore>,
}

impl SignalWatcher {
    /// Installs the latch handler and starts delivery. Starting an active
    /// watcher is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`LoopError::WatcherState`] if the watcher is closed, the
    /// loop is destroyed, or the handler cannot be installed.
    pub fn start(&self, callback: impl FnMut(i32) + 'static) -> Result<(), LoopError> {
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
        signal_pending::install(self.core.signum)?;
        self.core.installed.set(true);
        *self.core.cb.borrow_mut() = Some(Box::new(callback));
        if let Err(_err) = lp.engine().start(handle) {
            self.core.drop_install();
            self.core.cb.borrow_mut().take();
            return Err(LoopError::WatcherState("engine rejected the signal handle"));
        }
        lp.engine().set_ref(handle, self.core.referenced.get());
        self.core.state.set(WatcherState::Active);
        Ok(())
    }

    /// Stops delivery and drops this watcher's handler reference.
    /// Idempotent; the watcher may be restarted.
    pub fn stop(&self) {
        if !self.core.state.get().is_active() {
            return;
        }
        self.core.state.set(WatcherState::Stopped);
        if let (Some(lp), Some(handle)) = (self.core.lp.upgrade(), self.core.handle.get()) {
            lp.engine().stop_handle(handle);
        }
        self.core.drop_install();
    }

    /// Closes the watcher. Idempotent.
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

    /// True while the watcher is started.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.core.state.get().is_active()
    }

    /// True once the watcher has been closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.core.state.get().is_closed()
    }

    /// The signal number this watcher listens for.
    #[must_use]
    pub fn signum(&self) -> i32 {
        self.core.signum
    }

    /// Sets whether this watcher keeps the loop alive.
    pub fn set_referenced(&self, referenced: bool) {
        self.core.referenced.set(referenced);
        if let (Some(lp), Some(handle)) = (self.core.lp.upgrade(), self.core.handle.get()) {
            lp.engine().set_ref(handle, referenced);
        }
    }
}

impl Drop for SignalWatcher {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for SignalWatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignalWatcher")
            .field("signum", &self.core.signum)
            .field("state", &self.core.state.get())
            .finish()
    }
}

pub(crate) fn create(lp: &Rc<LoopInner>, signum: i32) -> Result<SignalWatcher, LoopError> {
    lp.ensure_live()?;
    let core = Rc::new_cyclic(|weak: &Weak<SignalCore>| {
        let key = lp.register(Target::Signal(weak.clone()));
        SignalCore {
            lp: Rc::downgrade(lp),
            signum,
            key,
            handle: Cell::new(None),
            installed: Cell::new(false),
            state: Cell::new(WatcherState::Stopped),
            referenced: Cell::new(true),
            cb: RefCell::new(None),
        }
    });
    let handle = match lp.engine().create(HandleSpec::Signal { signum }, core.key) {
        Ok(handle) => handle,
        Err(err) => {
            lp.unregister(core.key);
            return Err(LoopError::reactor_init(err));
        }
    };
    core.handle.set(Some(handle));
    Ok(SignalWatcher { core })
}
