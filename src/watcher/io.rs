//! Per-descriptor I/O multiplexing.
//!
//! A descriptor gets exactly one native registration no matter how many
//! logical watchers are interested in it. The [`IoMultiplexer`] owns that
//! registration and fans readiness out to its sub-watchers; the combined
//! interest mask is recomputed on every start, stop and close, so the
//! native registration never watches for more than somebody asked for.
//! Watching for too much means spurious wakeups and busy loops.
//!
//! When the last sub-watcher closes, the multiplexer tears itself down:
//! the native registration is released and the loop's per-fd entry is
//! removed. A registration left behind for a descriptor nobody watches
//! would wake the loop forever.

use smallvec::SmallVec;
use std::cell::{Cell, RefCell};
use std::os::fd::RawFd;
use std::rc::{Rc, Weak};

use super::WatcherState;
use crate::error::LoopError;
use crate::event_loop::{LoopInner, Target};
use crate::reactor::{DataKey, HandleId, HandleSpec, Interest};

pub(crate) struct IoMultiplexer {
    lp: Weak<LoopInner>,
    fd: RawFd,
    key: DataKey,
    handle: Cell<Option<HandleId>>,
    subs: RefCell<SmallVec<[Rc<IoSubCore>; 2]>>,
    closing: Cell<bool>,
    native_active: Cell<bool>,
}

impl IoMultiplexer {
    pub(crate) fn has_subs(&self) -> bool {
        !self.subs.borrow().is_empty()
    }

    fn combined_mask(&self) -> Interest {
        self.subs
            .borrow()
            .iter()
            .filter(|s| s.state.get().is_active())
            .fold(Interest::NONE, |acc, s| acc | s.mask)
    }

    /// Re-derives the native registration from the sub-watcher set: the
    /// interest mask is the OR of all active masks, the handle is started
    /// only while the mask is non-empty, and the ref/priority state is
    /// aggregated from the active sub-watchers.
    fn sync(&self) -> Result<(), LoopError> {
        let Some(lp) = self.lp.upgrade() else {
            return Err(LoopError::WatcherState("loop has been destroyed"));
        };
        let Some(handle) = self.handle.get() else {
            return Err(LoopError::WatcherState("multiplexer is being torn down"));
        };
        let mask = self.combined_mask();
        let engine = lp.engine();
        if mask.is_empty() {
            if self.native_active.replace(false) {
                engine.stop_handle(handle);
            }
            return Ok(());
        }
        engine.set_io_interest(handle, mask).map_err(|_| {
            LoopError::WatcherState("the OS poller rejected this descriptor")
        })?;
        if !self.native_active.replace(true) {
            if engine.start(handle).is_err() {
                self.native_active.set(false);
                return Err(LoopError::WatcherState(
                    "the OS poller rejected this descriptor",
                ));
            }
        }
        let subs = self.subs.borrow();
        let active = subs.iter().filter(|s| s.state.get().is_active());
        let referenced = active.clone().any(|s| s.referenced.get());
        let priority = active.map(|s| s.priority.get()).max().unwrap_or(0);
        engine.set_ref(handle, referenced);
        engine.set_priority(handle, priority);
        Ok(())
    }

    /// Fans readiness out to the interested sub-watchers, in the order they
    /// were added. A sub-watcher stopped or closed by an earlier callback
    /// in the same fan-out is skipped.
    pub(crate) fn dispatch(&self, ready: Interest) {
        let interested: Vec<Rc<IoSubCore>> = self
            .subs
            .borrow()
            .iter()
            .filter(|s| s.state.get().is_active() && !(s.mask & ready).is_empty())
            .cloned()
            .collect();
        for sub in interested {
            if self.closing.get() || !sub.state.get().is_active() {
                continue;
            }
            sub.invoke(ready & sub.mask);
        }
    }

    /// Detaches a closed sub-watcher; tears the multiplexer down when it
    /// was the last one.
    fn remove_sub(&self, sub: &IoSubCore) {
        self.subs
            .borrow_mut()
            .retain(|s| !std::ptr::eq(&**s, sub));
        if self.subs.borrow().is_empty() {
            self.teardown();
        } else {
            let _ = self.sync();
        }
    }

    fn teardown(&self) {
        if self.closing.replace(true) {
            return;
        }
        let Some(lp) = self.lp.upgrade() else {
            return;
        };
        lp.remove_io_mux(self.fd);
        if let Some(handle) = self.handle.take() {
            lp.engine().stop_handle(handle);
            lp.engine().close(handle);
        }
        lp.unregister(self.key);
    }
}

pub(crate) struct IoSubCore {
    mux: Weak<IoMultiplexer>,
    mask: Interest,
    state: Cell<WatcherState>,
    referenced: Cell<bool>,
    priority: Cell<i32>,
    cb: RefCell<Option<Box<dyn FnMut(Interest)>>>,
}

impl IoSubCore {
    fn invoke(&self, ready: Interest) {
        let cb = self.cb.borrow_mut().take();
        if let Some(mut cb) = cb {
            cb(ready);
            // The callback may have replaced itself through a restart;
            // only put ours back if the slot is still empty.
            let mut slot = self.cb.borrow_mut();
            if slot.is_none() && !self.state.get().is_closed() {
                *slot = Some(cb);
            }
        }
    }
}

/// A logical readiness watcher on one descriptor.
///
/// Dropping the watcher closes it.
pub struct IoWatcher {
    core: Rc<IoSubCore>,
}

impl IoWatcher {
    /// Starts delivering readiness to `callback`. Starting an active
    /// watcher is a no-op; the stored callback is kept.
    ///
    /// # Errors
    ///
    /// Returns [`LoopError::WatcherState`] if the watcher is closed or its
    /// multiplexer is being torn down.
    pub fn start(&self, callback: impl FnMut(Interest) + 'static) -> Result<(), LoopError> {
        let state = self.core.state.get();
        if state.is_closed() {
            return Err(LoopError::WatcherState("watcher is closed"));
        }
        if state.is_active() {
            return Ok(());
        }
        let Some(mux) = self.core.mux.upgrade() else {
            return Err(LoopError::WatcherState("multiplexer is being torn down"));
        };
        if mux.closing.get() {
            return Err(LoopError::WatcherState("multiplexer is being torn down"));
        }
        *self.core.cb.borrow_mut() = Some(Box::new(callback));
        self.core.state.set(WatcherState::Active);
        let synced = mux.sync();
        if synced.is_err() {
            self.core.state.set(WatcherState::Stopped);
            self.core.cb.borrow_mut().take();
        }
        synced
    }

    /// Stops delivery. The watcher stays attached to its multiplexer and
    /// may be restarted. Idempotent.
    pub fn stop(&self) {
        if !self.core.state.get().is_active() {
            return;
        }
        self.core.state.set(WatcherState::Stopped);
        if let Some(mux) = self.core.mux.upgrade() {
            let _ = mux.sync();
        }
    }

    /// Closes the watcher, detaching it from the multiplexer. The last
    /// close tears the multiplexer down. Idempotent.
    pub fn close(&self) {
        if self.core.state.get().is_closed() {
            return;
        }
        self.core.state.set(WatcherState::Closed);
        self.core.cb.borrow_mut().take();
        if let Some(mux) = self.core.mux.upgrade() {
            mux.remove_sub(&self.core);
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

    /// The interest mask this watcher was created with.
    #[must_use]
    pub fn interest(&self) -> Interest {
        self.core.mask
    }

    /// Sets whether this watcher keeps the loop alive.
    pub fn set_referenced(&self, referenced: bool) {
        self.core.referenced.set(referenced);
        if let Some(mux) = self.core.mux.upgrade() {
            let _ = mux.sync();
        }
    }

    /// Sets the dispatch-order hint.
    pub fn set_priority(&self, priority: i32) {
        self.core.priority.set(priority);
        if let Some(mux) = self.core.mux.upgrade() {
            let _ = mux.sync();
        }
    }
}

impl Drop for IoWatcher {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for IoWatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IoWatcher")
            .field("mask", &self.core.mask)
            .field("state", &self.core.state.get())
            .finish()
    }
}

/// Adds interest on `fd`, creating the multiplexer on first use.
pub(crate) fn create(
    lp: &Rc<LoopInner>,
    fd: RawFd,
    interest: Interest,
) -> Result<IoWatcher, LoopError> {
    lp.ensure_live()?;
    if interest.is_empty() {
        return Err(LoopError::WatcherState("interest mask must not be empty"));
    }

    let existing = lp.io_muxes.borrow().get(&fd).cloned();
    let mux = match existing {
        Some(mux) => {
            debug_assert!(mux.has_subs(), "multiplexer kept alive without watchers");
            if mux.closing.get() {
                return Err(LoopError::WatcherState("multiplexer is being torn down"));
            }
            mux
        }
        None => {
            let mux = Rc::new_cyclic(|weak| {
                let key = lp.register(Target::IoMux(weak.clone()));
                IoMultiplexer {
                    lp: Rc::downgrade(lp),
                    fd,
                    key,
                    handle: Cell::new(None),
                    subs: RefCell::new(SmallVec::new()),
                    closing: Cell::new(false),
                    native_active: Cell::new(false),
                }
            });
            // The native registration starts with an empty mask; sub-watcher
            // starts widen it.
            let handle = match lp.engine().create(HandleSpec::Io { fd }, mux.key) {
                Ok(handle) => handle,
                Err(_) => {
                    lp.unregister(mux.key);
                    return Err(LoopError::WatcherState(
                        "the OS poller rejected this descriptor",
                    ));
                }
            };
            mux.handle.set(Some(handle));
            lp.io_muxes.borrow_mut().insert(fd, Rc::clone(&mux));
            mux
        }
    };

    let sub = Rc::new(IoSubCore {
        mux: Rc::downgrade(&mux),
        mask: interest,
        state: Cell::new(WatcherState::Stopped),
        referenced: Cell::new(true),
        priority: Cell::new(0),
        cb: RefCell::new(None),
    });
    mux.subs.borrow_mut().push(Rc::clone(&sub));
    Ok(IoWatcher { core: sub })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_loop::{EventLoop, LoopConfig};
    use crate::reactor::EngineKind;
    use crate::test_util::init_test_logging;
    use std::os::fd::AsRawFd;
    use std::os::unix::net::UnixStream;

    fn init_test(name: &str) {
        init_test_logging();
        crate::test_phase!(name);
    }

    fn test_loop(engine: EngineKind) -> EventLoop {
        EventLoop::new(LoopConfig {
            engine,
            default: false,
        })
        .expect("create loop")
    }

    #[test]
    fn empty_mask_is_rejected() {
        init_test("io_empty_mask_is_rejected");
        let lp = test_loop(EngineKind::Staged);
        let (sock, _peer) = UnixStream::pair().expect("socketpair");
        let result = lp.io(sock.as_raw_fd(), Interest::NONE);
        assert!(matches!(result, Err(LoopError::WatcherState(_))));
        crate::test_complete!("io_empty_mask_is_rejected");
    }

    #[test]
    fn one_multiplexer_per_descriptor() {
        init_test("io_one_multiplexer_per_descriptor");
        let lp = test_loop(EngineKind::Staged);
        let (sock, _peer) = UnixStream::pair().expect("socketpair");
        let fd = sock.as_raw_fd();

        let a = lp.io(fd, Interest::READABLE).expect("first watcher");
        let b = lp.io(fd, Interest::WRITABLE).expect("second watcher");
        crate::assert_with_log!(
            lp.io_multiplexer_count() == 1,
            "one entry for one fd",
            1usize,
            lp.io_multiplexer_count()
        );
        drop(a);
        crate::assert_with_log!(
            lp.io_multiplexer_count() == 1,
            "entry survives while a watcher remains",
            1usize,
            lp.io_multiplexer_count()
        );
        drop(b);
        crate::assert_with_log!(
            lp.io_multiplexer_count() == 0,
            "last close removes the entry",
            0usize,
            lp.io_multiplexer_count()
        );
        crate::test_complete!("io_one_multiplexer_per_descriptor");
    }

    #[test]
    fn close_is_idempotent() {
        init_test("io_close_is_idempotent");
        let lp = test_loop(EngineKind::Staged);
        let (sock, _peer) = UnixStream::pair().expect("socketpair");
        let w = lp.io(sock.as_raw_fd(), Interest::READABLE).expect("watcher");
        w.start(|_| {}).expect("start");
        w.close();
        w.close();
        assert!(w.is_closed());
        assert!(matches!(
            w.start(|_| {}),
            Err(LoopError::WatcherState(_))
        ));
        crate::test_complete!("io_close_is_idempotent");
    }

    #[test]
    fn stop_is_idempotent_and_restartable() {
        init_test("io_stop_is_idempotent_and_restartable");
        let lp = test_loop(EngineKind::Staged);
        let (sock, _peer) = UnixStream::pair().expect("socketpair");
        let w = lp.io(sock.as_raw_fd(), Interest::WRITABLE).expect("watcher");
        w.start(|_| {}).expect("start");
        w.stop();
        w.stop();
        assert!(!w.is_active());
        w.start(|_| {}).expect("restart after stop");
        assert!(w.is_active());
        crate::test_complete!("io_stop_is_idempotent_and_restartable");
    }

    /// For all interleavings of add/start/stop/close on one descriptor, the
    /// native interest mask equals the OR of the active sub-watcher masks,
    /// and removing the last interest removes the multiplexer entry.
    #[test]
    fn mask_invariant_holds_under_random_interleavings() {
        init_test("io_mask_invariant_holds_under_random_interleavings");
        for seed in [3, 17, 0xfeed_beef, 0x5eed_0001] {
            let mut rng = crate::util::DetRng::new(seed);
            let lp = test_loop(EngineKind::Staged);
            let (sock, _peer) = UnixStream::pair().expect("socketpair");
            let fd = sock.as_raw_fd();

            let mut watchers: Vec<IoWatcher> = Vec::new();
            for _ in 0..200 {
                let add = watchers.is_empty() || rng.next_usize(4) == 0;
                if add && watchers.len() < 8 {
                    let mask = if rng.next_bool() {
                        Interest::READABLE
                    } else if rng.next_bool() {
                        Interest::WRITABLE
                    } else {
                        Interest::both()
                    };
                    watchers.push(lp.io(fd, mask).expect("add interest"));
                } else {
                    let pick = rng.next_usize(watchers.len());
                    match rng.next_usize(3) {
                        0 => watchers[pick].start(|_| {}).expect("start"),
                        1 => watchers[pick].stop(),
                        _ => {
                            watchers.swap_remove(pick).close();
                        }
                    }
                }

                let expected = watchers
                    .iter()
                    .filter(|w| w.is_active())
                    .fold(Interest::NONE, |acc, w| acc | w.interest());
                if watchers.is_empty() {
                    crate::assert_with_log!(
                        lp.io_multiplexer_count() == 0,
                        "no residual registration without watchers",
                        0usize,
                        lp.io_multiplexer_count()
                    );
                } else {
                    let mux = lp
                        .inner()
                        .io_muxes
                        .borrow()
                        .get(&fd)
                        .cloned()
                        .expect("multiplexer present while watchers exist");
                    let actual = mux.combined_mask();
                    crate::assert_with_log!(
                        actual == expected,
                        "native mask equals OR of active masks",
                        expected,
                        actual
                    );
                }
            }
            drop(watchers);
            assert_eq!(lp.io_multiplexer_count(), 0, "seed {seed}");
        }
        crate::test_complete!("io_mask_invariant_holds_under_random_interleavings");
    }

    #[test]
    fn mask_is_or_of_active_subs() {
        init_test("io_mask_is_or_of_active_subs");
        let lp = test_loop(EngineKind::Staged);
        let (sock, _peer) = UnixStream::pair().expect("socketpair");
        let fd = sock.as_raw_fd();

        let r = lp.io(fd, Interest::READABLE).expect("reader");
        let w = lp.io(fd, Interest::WRITABLE).expect("writer");
        let mux = lp.inner().io_muxes.borrow().get(&fd).cloned().unwrap();

        assert_eq!(mux.combined_mask(), Interest::NONE);
        r.start(|_| {}).expect("start reader");
        assert_eq!(mux.combined_mask(), Interest::READABLE);
        w.start(|_| {}).expect("start writer");
        assert_eq!(mux.combined_mask(), Interest::both());
        r.stop();
        assert_eq!(mux.combined_mask(), Interest::WRITABLE);
        w.stop();
        assert_eq!(mux.combined_mask(), Interest::NONE);
        crate::test_complete!("io_mask_is_or_of_active_subs");
    }
}
