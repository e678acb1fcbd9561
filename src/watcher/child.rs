//! Child-exit watchers.
//!
//! Neither engine offers per-child exit delivery that coexists with a
//! process-wide signal handler, so child watching is one SIGCHLD
//! registration owned by the default loop plus a table of logical watchers
//! keyed by pid (0 = any child). Each delivery reaps every exited child
//! with a non-blocking wait and fans each (pid, status) out to the exact-pid
//! watchers, then the wildcard watchers. A watcher fires at most once per
//! exit event and stays registered; repeat semantics belong to the caller.
//!
//! "No more children" ends a reap loop normally; any other reap error
//! aborts that delivery and is logged; the next SIGCHLD tries again.

use nix::errno::Errno;
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;
use parking_lot::Mutex;
use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};

use super::WatcherState;
use crate::error::LoopError;
use crate::event_loop::LoopInner;

/// Which loop instance owns the process-wide SIGCHLD registration.
static SIGCHLD_OWNER: Mutex<Option<usize>> = Mutex::new(None);

/// Claims process-wide SIGCHLD ownership for a loop instance. Idempotent
/// per instance.
pub(crate) fn claim_sigchld(instance_id: usize) -> Result<(), LoopError> {
    let mut owner = SIGCHLD_OWNER.lock();
    match *owner {
        Some(current) if current != instance_id => Err(LoopError::WatcherState(
            "another loop already owns the SIGCHLD registration",
        )),
        _ => {
            *owner = Some(instance_id);
            Ok(())
        }
    }
}

/// Releases SIGCHLD ownership if this instance holds it. Idempotent.
pub(crate) fn release_sigchld(instance_id: usize) {
    let mut owner = SIGCHLD_OWNER.lock();
    if *owner == Some(instance_id) {
        *owner = None;
    }
}

/// How a reaped child exited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildExit {
    /// Normal exit with a status code.
    Exited {
        /// The exit status code.
        code: i32,
    },
    /// Terminated by a signal.
    Signaled {
        /// The terminating signal number.
        signal: i32,
    },
}

/// Reaps every exited child and fans the statuses out.
pub(crate) fn reap_and_dispatch(lp: &LoopInner) {
    loop {
        match waitpid(Pid::from_raw(-1), Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) => break,
            Ok(WaitStatus::Exited(pid, code)) => {
                lp.dispatch_child_exit(pid.as_raw(), ChildExit::Exited { code });
            }
            Ok(WaitStatus::Signaled(pid, signal, _core_dumped)) => {
                lp.dispatch_child_exit(
                    pid.as_raw(),
                    ChildExit::Signaled {
                        signal: signal as i32,
                    },
                );
            }
            // Stop/continue events are not exits; keep reaping.
            Ok(_) => {}
            Err(Errno::ECHILD) => break,
            Err(Errno::EINTR) => {}
            Err(errno) => {
                let err = LoopError::reap(std::io::Error::from_raw_os_error(errno as i32));
                tracing::warn!(error = %err, "giving up until the next SIGCHLD");
                break;
            }
        }
    }
}

pub(crate) struct ChildCore {
    lp: Weak<LoopInner>,
    pid: i32,
    rpid: Cell<i32>,
    rstatus: Cell<Option<ChildExit>>,
    state: Cell<WatcherState>,
    cb: RefCell<Option<Box<dyn FnMut(i32, ChildExit)>>>,
}

impl ChildCore {
    pub(crate) fn is_active(&self) -> bool {
        self.state.get().is_active()
    }

    pub(crate) fn on_exit(&self, pid: i32, exit: ChildExit) {
        if !self.state.get().is_active() {
            return;
        }
        self.rpid.set(pid);
        self.rstatus.set(Some(exit));
        let cb = self.cb.borrow_mut().take();
        if let Some(mut cb) = cb {
            cb(pid, exit);
            let mut slot = self.cb.borrow_mut();
            if slot.is_none() && !self.state.get().is_closed() {
                *slot = Some(cb);
            }
        }
    }
}

/// A watcher for one child pid, or for any child (pid 0).
///
/// Dropping the watcher closes it.
pub struct ChildWatcher {
    core: Rc<ChildCore>,
}

impl ChildWatcher {
    /// Registers for exit events and stores `callback`, which receives the
    /// reaped pid and its exit status. Starting an active watcher is a
    /// no-op.
    ///
    /// # Errors
    ///
    /// Returns [`LoopError::WatcherState`] if the watcher is closed or the
    /// loop is destroyed.
    pub fn start(&self, callback: impl FnMut(i32, ChildExit) + 'static) -> Result<(), LoopError> {
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
        lp.child_table
            .borrow_mut()
            .entry(self.core.pid)
            .or_default()
            .push(Rc::clone(&self.core));
        lp.update_sigchld_ref();
        Ok(())
    }

    /// Unregisters from exit events. Idempotent; the watcher may be
    /// restarted.
    pub fn stop(&self) {
        if !self.core.state.get().is_active() {
            return;
        }
        self.core.state.set(WatcherState::Stopped);
        if let Some(lp) = self.core.lp.upgrade() {
            let mut table = lp.child_table.borrow_mut();
            if let Some(list) = table.get_mut(&self.core.pid) {
                list.retain(|w| !Rc::ptr_eq(w, &self.core));
                if list.is_empty() {
                    table.remove(&self.core.pid);
                }
            }
            drop(table);
            lp.update_sigchld_ref();
        }
    }

    /// Closes the watcher. Idempotent; a closed watcher can never be
    /// started again.
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

    /// The pid this watcher was created for; 0 means any child.
    #[must_use]
    pub fn pid(&self) -> i32 {
        self.core.pid
    }

    /// The pid of the most recently reaped child this watcher saw.
    #[must_use]
    pub fn last_pid(&self) -> i32 {
        self.core.rpid.get()
    }

    /// The most recent exit status this watcher saw.
    #[must_use]
    pub fn last_status(&self) -> Option<ChildExit> {
        self.core.rstatus.get()
    }
}

impl Drop for ChildWatcher {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for ChildWatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChildWatcher")
            .field("pid", &self.core.pid)
            .field("state", &self.core.state.get())
            .finish()
    }
}

pub(crate) fn create(lp: &Rc<LoopInner>, pid: i32) -> Result<ChildWatcher, LoopError> {
    lp.ensure_live()?;
    if !lp.is_default() {
        return Err(LoopError::WatcherState(
            "child watchers are only available on the default loop",
        ));
    }
    if pid < 0 {
        return Err(LoopError::WatcherState("pid must be non-negative"));
    }
    lp.install_sigchld()?;
    let core = Rc::new(ChildCore {
        lp: Rc::downgrade(lp),
        pid,
        rpid: Cell::new(0),
        rstatus: Cell::new(None),
        state: Cell::new(WatcherState::Stopped),
        cb: RefCell::new(None),
    });
    Ok(ChildWatcher { core })
}
