//! The loop core.
//!
//! An [`EventLoop`] owns one reactor engine and multiplexes the logical
//! watchers onto it. It installs three auxiliary hooks at creation:
//!
//! - a *prepare* hook that flushes pending callbacks immediately before the
//!   poll step,
//! - a *check* hook that exists so every iteration passes a point where
//!   latched signals are noticed,
//! - a *flush spinner*, armed only while callbacks are pending, that forces
//!   the engine to come around promptly: a zero-delay timer on the queued
//!   engine (where timers fire after the poll), a spin check handle on the
//!   staged engine (where timers fire *before* the poll and a zero timer
//!   would do nothing useful).
//!
//! On the staged engine a fourth, always-unreferenced timer with a 300 ms
//! period keeps the loop spinning even with no other active watcher, so
//! asynchronously latched signals and fork events are noticed promptly.
//! The period must stay in the hundreds of milliseconds: shorter burns CPU,
//! longer delays signal delivery.
//!
//! Fork detection piggybacks on the flush cadence: the pid observed at each
//! flush entry is compared with the last observed pid, and every registered
//! fork watcher fires once on a mismatch. Detection latency is bounded by
//! one iteration.
//!
//! The loop is single-threaded by construction (`!Send`); watcher tables
//! are plain shared mutable state touched only by the driving thread.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::os::fd::RawFd;
use std::rc::{Rc, Weak};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use crate::callback::{CallbackHandle, CallbackQueue};
use crate::error::LoopError;
use crate::reactor::{
    new_engine, DataKey, Dispatch, EngineKind, Fired, HandleId, HandleSpec, Interest, Reactor,
    RunMode,
};
use crate::watcher::child::{self, ChildCore, ChildExit, ChildWatcher};
use crate::watcher::fork::{ForkCore, ForkWatcher};
use crate::watcher::io::{IoMultiplexer, IoWatcher};
use crate::watcher::signal::{SignalCore, SignalWatcher};
use crate::watcher::timer::{TimerCore, TimerWatcher};

/// Keep-spin period for the staged engine. Bounded, never zero.
const KEEP_SPIN_MS: u64 = 300;

static NEXT_INSTANCE: AtomicUsize = AtomicUsize::new(1);

/// Loop construction parameters.
#[derive(Debug, Clone, Copy)]
pub struct LoopConfig {
    /// Which reactor engine to drive.
    pub engine: EngineKind,
    /// Whether this loop is the process default. Only the default loop may
    /// own the process-wide SIGCHLD registration.
    pub default: bool,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            engine: EngineKind::default(),
            default: true,
        }
    }
}

/// What a registry key resolves to when the engine reports a firing.
#[derive(Clone)]
pub(crate) enum Target {
    IoMux(Weak<IoMultiplexer>),
    Timer(Weak<TimerCore>),
    Signal(Weak<SignalCore>),
    /// The process-wide SIGCHLD registration: reap and fan out.
    Sigchld,
    /// Prepare hook: flush pending callbacks.
    FlushPrepare,
    /// The flush spinner.
    Spin,
    /// Check hook kept so signals latched during the poll are noticed.
    CheckNotice,
    /// The staged engine's bounded keep-spin timer.
    KeepSpin,
}

pub(crate) struct LoopInner {
    engine: Box<dyn Reactor>,
    kind: EngineKind,
    is_default: bool,
    instance_id: usize,
    created_pid: i32,
    observed_pid: Cell<i32>,
    destroyed: Cell<bool>,
    destroying: Cell<bool>,
    next_key: Cell<usize>,
    registry: RefCell<HashMap<usize, Target>>,
    callbacks: RefCell<CallbackQueue>,
    pub(crate) io_muxes: RefCell<HashMap<RawFd, Rc<IoMultiplexer>>>,
    pub(crate) child_table: RefCell<HashMap<i32, Vec<Rc<ChildCore>>>>,
    fork_watchers: RefCell<Vec<Weak<ForkCore>>>,
    aux_prepare: Cell<Option<HandleId>>,
    aux_check: Cell<Option<HandleId>>,
    aux_spin: Cell<Option<HandleId>>,
    aux_keep_spin: Cell<Option<HandleId>>,
    spin_armed: Cell<bool>,
    sigchld_handle: Cell<Option<HandleId>>,
    sigchld_key: Cell<Option<DataKey>>,
}

impl LoopInner {
    pub(crate) fn engine(&self) -> &dyn Reactor {
        &*self.engine
    }

    pub(crate) fn engine_kind(&self) -> EngineKind {
        self.kind
    }

    pub(crate) fn is_default(&self) -> bool {
        self.is_default
    }

    pub(crate) fn ensure_live(&self) -> Result<(), LoopError> {
        if self.destroyed.get() || self.destroying.get() {
            Err(LoopError::WatcherState("loop has been destroyed"))
        } else {
            Ok(())
        }
    }

    pub(crate) fn register(&self, target: Target) -> DataKey {
        let key = self.next_key.get();
        self.next_key.set(key + 1);
        self.registry.borrow_mut().insert(key, target);
        DataKey(key)
    }

    pub(crate) fn unregister(&self, key: DataKey) {
        self.registry.borrow_mut().remove(&key.0);
    }

    pub(crate) fn remove_io_mux(&self, fd: RawFd) {
        self.io_muxes.borrow_mut().remove(&fd);
    }

    fn init_aux(&self) -> Result<(), LoopError> {
        let prepare_key = self.register(Target::FlushPrepare);
        let prepare = self
            .engine
            .create(HandleSpec::Prepare, prepare_key)
            .map_err(LoopError::reactor_init)?;
        self.engine.start(prepare).map_err(LoopError::reactor_init)?;
        self.engine.set_ref(prepare, false);
        self.aux_prepare.set(Some(prepare));

        let check_key = self.register(Target::CheckNotice);
        let check = self
            .engine
            .create(HandleSpec::Check { spin: false }, check_key)
            .map_err(LoopError::reactor_init)?;
        self.engine.start(check).map_err(LoopError::reactor_init)?;
        self.engine.set_ref(check, false);
        self.aux_check.set(Some(check));

        // The spinner is created stopped; run_callback arms it.
        let spin_key = self.register(Target::Spin);
        let spin_spec = match self.kind {
            EngineKind::Queued => HandleSpec::Timer {
                after_ms: 0,
                repeat_ms: 0,
            },
            EngineKind::Staged => HandleSpec::Check { spin: true },
        };
        let spin = self
            .engine
            .create(spin_spec, spin_key)
            .map_err(LoopError::reactor_init)?;
        self.engine.set_ref(spin, false);
        self.aux_spin.set(Some(spin));

        if self.kind == EngineKind::Staged {
            let keep_key = self.register(Target::KeepSpin);
            let keep = self
                .engine
                .create(
                    HandleSpec::Timer {
                        after_ms: KEEP_SPIN_MS,
                        repeat_ms: KEEP_SPIN_MS,
                    },
                    keep_key,
                )
                .map_err(LoopError::reactor_init)?;
            self.engine.start(keep).map_err(LoopError::reactor_init)?;
            self.engine.set_ref(keep, false);
            self.aux_keep_spin.set(Some(keep));
        }
        Ok(())
    }

    /// Arms the flush spinner so the next iteration comes around promptly
    /// and the loop stays alive while callbacks are pending.
    pub(crate) fn arm_spin(&self) {
        if let Some(spin) = self.aux_spin.get() {
            let _ = self.engine.start(spin);
            self.engine.set_ref(spin, true);
            self.spin_armed.set(true);
        }
    }

    /// Forces a fresh arming even if the spinner is already active. The
    /// queued engine's spinner is a one-shot timer whose current arming may
    /// already have been consumed this iteration; a plain start would be a
    /// no-op then and the loop could retire with callbacks still queued.
    fn rearm_spin(&self) {
        if let Some(spin) = self.aux_spin.get() {
            self.engine.stop_handle(spin);
            let _ = self.engine.start(spin);
            self.engine.set_ref(spin, true);
            self.spin_armed.set(true);
        }
    }

    fn disarm_spin(&self) {
        if !self.spin_armed.replace(false) {
            return;
        }
        if let Some(spin) = self.aux_spin.get() {
            self.engine.stop_handle(spin);
            self.engine.set_ref(spin, false);
        }
    }

    /// The deterministic flush: fork detection, then the batch of callbacks
    /// that were pending at entry. Callbacks scheduled while the batch runs
    /// wait for the next flush.
    fn flush_callbacks(&self) {
        let current_pid = nix::unistd::getpid().as_raw();
        if current_pid != self.observed_pid.get() {
            self.observed_pid.set(current_pid);
            let watchers: Vec<Rc<ForkCore>> = self
                .fork_watchers
                .borrow()
                .iter()
                .filter_map(Weak::upgrade)
                .collect();
            for watcher in watchers {
                watcher.on_fork();
            }
        }

        let batch = self.callbacks.borrow_mut().take_batch();
        for entry in batch {
            entry.invoke();
        }
        if self.callbacks.borrow().is_empty() {
            self.disarm_spin();
        } else {
            // The queued engine's spinner is a one-shot timer; re-arm it
            // for the batch that arrived during this flush.
            self.arm_spin();
        }
    }

    pub(crate) fn fork_register(&self, core: &Rc<ForkCore>) {
        let mut watchers = self.fork_watchers.borrow_mut();
        if !watchers
            .iter()
            .any(|w| w.as_ptr() == Rc::as_ptr(core))
        {
            watchers.push(Rc::downgrade(core));
        }
    }

    pub(crate) fn fork_unregister(&self, core: &Rc<ForkCore>) {
        self.fork_watchers
            .borrow_mut()
            .retain(|w| w.as_ptr() != Rc::as_ptr(core) && w.strong_count() > 0);
    }

    /// Installs the process-wide SIGCHLD registration. Idempotent; only the
    /// default loop may own it.
    pub(crate) fn install_sigchld(&self) -> Result<(), LoopError> {
        if !self.is_default {
            return Err(LoopError::WatcherState(
                "child watchers are only available on the default loop",
            ));
        }
        if self.sigchld_handle.get().is_some() {
            return Ok(());
        }
        child::claim_sigchld(self.instance_id)?;
        let signum = nix::sys::signal::Signal::SIGCHLD as i32;
        if let Err(err) = crate::reactor::signal_pending::install(signum) {
            child::release_sigchld(self.instance_id);
            return Err(err);
        }
        let key = self.register(Target::Sigchld);
        let handle = match self.engine.create(HandleSpec::Signal { signum }, key) {
            Ok(handle) => handle,
            Err(err) => {
                self.unregister(key);
                crate::reactor::signal_pending::uninstall(signum);
                child::release_sigchld(self.instance_id);
                return Err(LoopError::reactor_init(err));
            }
        };
        let _ = self.engine.start(handle);
        // Unreferenced until a child watcher is active; the registration by
        // itself must not keep the loop running.
        self.engine.set_ref(handle, false);
        self.sigchld_handle.set(Some(handle));
        self.sigchld_key.set(Some(key));
        Ok(())
    }

    /// Removes the SIGCHLD registration. Idempotent.
    pub(crate) fn reset_sigchld(&self) {
        let Some(handle) = self.sigchld_handle.take() else {
            return;
        };
        self.engine.stop_handle(handle);
        self.engine.close(handle);
        if let Some(key) = self.sigchld_key.take() {
            self.unregister(key);
        }
        crate::reactor::signal_pending::uninstall(nix::sys::signal::Signal::SIGCHLD as i32);
        child::release_sigchld(self.instance_id);
    }

    /// The SIGCHLD handle keeps the loop alive exactly while a child
    /// watcher is active.
    pub(crate) fn update_sigchld_ref(&self) {
        if let Some(handle) = self.sigchld_handle.get() {
            let any_active = self
                .child_table
                .borrow()
                .values()
                .flatten()
                .any(|w| w.is_active());
            self.engine.set_ref(handle, any_active);
        }
    }

    /// Fans one reaped (pid, status) out to the watchers registered for
    /// that exact pid, then to the wildcard (pid 0) watchers. Each watcher
    /// sees the event at most once and stays registered.
    pub(crate) fn dispatch_child_exit(&self, pid: i32, exit: ChildExit) {
        let targets: Vec<Rc<ChildCore>> = {
            let table = self.child_table.borrow();
            let exact = table.get(&pid).into_iter().flatten();
            let wildcard = table.get(&0).into_iter().flatten();
            exact.chain(wildcard).cloned().collect()
        };
        for watcher in targets {
            watcher.on_exit(pid, exit);
        }
    }

    fn destroy_inner(&self) {
        if self.destroyed.get() || self.destroying.replace(true) {
            return;
        }

        for slot in [
            &self.aux_prepare,
            &self.aux_check,
            &self.aux_spin,
            &self.aux_keep_spin,
        ] {
            if let Some(handle) = slot.take() {
                self.engine.stop_handle(handle);
                self.engine.close(handle);
            }
        }
        self.reset_sigchld();
        self.engine.stop();

        match self.engine.close_engine() {
            Ok(()) => {}
            Err(LoopError::CloseBusy) => {
                // Open handles remain: force-close everything, spin the
                // engine so the closes drain, and retry exactly once. A
                // second failure is a handle leak the core cannot explain.
                self.engine.walk_force_close();
                let more = self.engine.run(RunMode::Once, self);
                if more {
                    self.engine.run(RunMode::NoWait, self);
                }
                assert!(
                    self.engine.close_engine().is_ok(),
                    "loop close failed after force-closing all handles"
                );
            }
            Err(err) => unreachable!("unexpected close failure: {err}"),
        }

        self.registry.borrow_mut().clear();
        self.io_muxes.borrow_mut().clear();
        self.child_table.borrow_mut().clear();
        self.fork_watchers.borrow_mut().clear();
        self.callbacks.borrow_mut().clear();
        self.destroying.set(false);
        self.destroyed.set(true);
    }
}

impl Dispatch for LoopInner {
    fn fire(&self, data: DataKey, event: Fired) {
        if self.destroyed.get() {
            return;
        }
        let target = self.registry.borrow().get(&data.0).cloned();
        let Some(target) = target else {
            return;
        };
        match (target, event) {
            (Target::FlushPrepare, Fired::Prepare) => self.flush_callbacks(),
            // On the staged engine the spinner is a check handle and the
            // flush runs here, right after the poll; on the queued engine
            // it is a zero timer whose only job was forcing this iteration
            // (the prepare hook already flushed).
            (Target::Spin, Fired::Check) => self.flush_callbacks(),
            (Target::Spin, Fired::Timer) => {
                // The one-shot spin timer just auto-stopped; keep the loop
                // alive for the batch that arrived after the last flush.
                if !self.callbacks.borrow().is_empty() {
                    self.rearm_spin();
                }
            }
            (Target::CheckNotice, Fired::Check) => {}
            (Target::KeepSpin, Fired::Timer) => {}
            (Target::Sigchld, Fired::Signal(_)) => child::reap_and_dispatch(self),
            (Target::IoMux(weak), Fired::Io(ready)) => {
                if let Some(mux) = weak.upgrade() {
                    mux.dispatch(ready);
                }
            }
            // Spin-variant timers surface as check firings on the staged
            // engine.
            (Target::Timer(weak), Fired::Timer | Fired::Check) => {
                if let Some(timer) = weak.upgrade() {
                    timer.on_fire();
                }
            }
            (Target::Signal(weak), Fired::Signal(signum)) => {
                if let Some(signal) = weak.upgrade() {
                    signal.on_fire(signum);
                }
            }
            _ => tracing::debug!("dropping firing with mismatched target"),
        }
    }
}

impl Drop for LoopInner {
    fn drop(&mut self) {
        self.destroy_inner();
    }
}

/// A cooperative event loop.
///
/// Cloning is cheap and shares the same loop. The loop is single-threaded:
/// it is `!Send` and must be driven by the thread that created it.
///
/// # Example
///
/// ```
/// use spindle::{EventLoop, LoopConfig};
/// use std::time::Duration;
/// use std::cell::Cell;
/// use std::rc::Rc;
///
/// let lp = EventLoop::new(LoopConfig::default()).unwrap();
/// let fired = Rc::new(Cell::new(false));
/// let seen = Rc::clone(&fired);
/// let timer = lp.timer(Duration::from_millis(1), Duration::ZERO).unwrap();
/// timer.start(move || seen.set(true)).unwrap();
/// lp.run_default();
/// assert!(fired.get());
/// ```
#[derive(Clone)]
pub struct EventLoop {
    inner: Rc<LoopInner>,
}

impl EventLoop {
    /// Creates a loop with the given configuration.
    ///
    /// # Errors
    ///
    /// Returns [`LoopError::ReactorInit`] if the engine cannot be
    /// allocated.
    pub fn new(config: LoopConfig) -> Result<Self, LoopError> {
        let engine = new_engine(config.engine)?;
        engine.update_now();
        let pid = nix::unistd::getpid().as_raw();
        let inner = Rc::new(LoopInner {
            engine,
            kind: config.engine,
            is_default: config.default,
            instance_id: NEXT_INSTANCE.fetch_add(1, Ordering::Relaxed),
            created_pid: pid,
            observed_pid: Cell::new(pid),
            destroyed: Cell::new(false),
            destroying: Cell::new(false),
            next_key: Cell::new(0),
            registry: RefCell::new(HashMap::new()),
            callbacks: RefCell::new(CallbackQueue::new()),
            io_muxes: RefCell::new(HashMap::new()),
            child_table: RefCell::new(HashMap::new()),
            fork_watchers: RefCell::new(Vec::new()),
            aux_prepare: Cell::new(None),
            aux_check: Cell::new(None),
            aux_spin: Cell::new(None),
            aux_keep_spin: Cell::new(None),
            spin_armed: Cell::new(false),
            sigchld_handle: Cell::new(None),
            sigchld_key: Cell::new(None),
        });
        inner.init_aux()?;
        Ok(Self { inner })
    }

    /// Drives the loop in the given mode. Returns true if more work remains
    /// (active referenced watchers, or handles still closing).
    pub fn run(&self, mode: RunMode) -> bool {
        if self.inner.ensure_live().is_err() {
            return false;
        }
        self.inner.engine.run(mode, &*self.inner)
    }

    /// Blocks until no active referenced watcher remains.
    pub fn run_default(&self) -> bool {
        self.run(RunMode::Default)
    }

    /// Performs at most one iteration, blocking in the poll step.
    pub fn run_once(&self) -> bool {
        self.run(RunMode::Once)
    }

    /// Performs at most one iteration without blocking.
    pub fn run_nowait(&self) -> bool {
        self.run(RunMode::NoWait)
    }

    /// Classic flag-pair entry point; `nowait` wins over `once` because it
    /// cannot block.
    pub fn run_with(&self, nowait: bool, once: bool) -> bool {
        self.run(RunMode::from_flags(nowait, once))
    }

    /// Makes the current (or next) `run` return once the iteration in
    /// progress completes.
    pub fn stop(&self) {
        if self.inner.ensure_live().is_ok() {
            self.inner.engine.stop();
        }
    }

    /// No-op: keep-alive is aggregated from the per-watcher ref flags, not
    /// counted on the loop object itself.
    pub fn ref_loop(&self) {}

    /// No-op, see [`EventLoop::ref_loop`].
    pub fn unref_loop(&self) {}

    /// The cached monotonic loop clock.
    #[must_use]
    pub fn now(&self) -> Duration {
        Duration::from_millis(self.now_ms())
    }

    /// The cached monotonic loop clock, in milliseconds.
    #[must_use]
    pub fn now_ms(&self) -> u64 {
        self.inner.engine.now_ms()
    }

    /// Forces the cached clock to resync with the OS. Long-running
    /// callbacks that arm timers should call this first, or the deadlines
    /// are computed against stale time.
    pub fn update_now(&self) {
        self.inner.engine.update_now();
    }

    /// Re-opens the engine's kernel state after a fork, in the child.
    ///
    /// Not calling this in the child before running the loop again is
    /// undefined behavior at the OS level (the inherited poller descriptor
    /// is shared with the parent); it is a documented hazard, not caught.
    ///
    /// # Errors
    ///
    /// Returns [`LoopError::ReactorInit`] if the new kernel state cannot be
    /// allocated.
    pub fn reinit(&self) -> Result<(), LoopError> {
        self.inner.ensure_live()?;
        self.inner.engine.reinit().map_err(LoopError::reactor_init)
    }

    /// Stops the auxiliary watchers and the SIGCHLD registration, then
    /// closes the engine, force-closing stragglers if the first close
    /// attempt reports outstanding handles.
    ///
    /// Idempotent: a second call is a no-op.
    ///
    /// # Panics
    ///
    /// Panics if the engine still reports outstanding handles after every
    /// handle has been force-closed and the closes were given an iteration
    /// to drain; that is a handle leak the core cannot explain.
    pub fn destroy(&self) {
        self.inner.destroy_inner();
    }

    /// True once [`EventLoop::destroy`] has completed.
    #[must_use]
    pub fn is_destroyed(&self) -> bool {
        self.inner.destroyed.get()
    }

    /// Which engine flavor this loop drives.
    #[must_use]
    pub fn engine_kind(&self) -> EngineKind {
        self.inner.kind
    }

    /// Whether this loop was created as the process default.
    #[must_use]
    pub fn is_default(&self) -> bool {
        self.inner.is_default
    }

    /// The pid captured when the loop was created.
    #[must_use]
    pub fn created_pid(&self) -> i32 {
        self.inner.created_pid
    }

    /// Registers interest in readiness on a descriptor.
    ///
    /// The first interest on a descriptor creates its multiplexer and the
    /// single native registration; further calls add logical sub-watchers
    /// and the combined mask is recomputed on every change.
    ///
    /// # Errors
    ///
    /// Returns [`LoopError::WatcherState`] if the mask is empty, the loop
    /// is destroyed, or the descriptor's multiplexer is being torn down.
    pub fn io(&self, fd: RawFd, interest: Interest) -> Result<IoWatcher, LoopError> {
        crate::watcher::io::create(&self.inner, fd, interest)
    }

    /// Creates a timer watcher.
    ///
    /// `repeat == 0` makes it one-shot. `after == 0 && repeat == 0` yields
    /// the degenerate spin variant that fires on the next iteration and
    /// exists purely to force one extra loop spin.
    ///
    /// # Errors
    ///
    /// Returns [`LoopError::WatcherState`] if the loop is destroyed.
    pub fn timer(&self, after: Duration, repeat: Duration) -> Result<TimerWatcher, LoopError> {
        crate::watcher::timer::create(&self.inner, after, repeat)
    }

    /// Creates a watcher for one child pid, or for any child with `pid == 0`.
    ///
    /// # Errors
    ///
    /// Returns [`LoopError::WatcherState`] if this is not the default loop
    /// or the process-wide SIGCHLD registration cannot be claimed.
    pub fn child(&self, pid: i32) -> Result<ChildWatcher, LoopError> {
        crate::watcher::child::create(&self.inner, pid)
    }

    /// Creates a watcher fired once after each detected fork.
    ///
    /// # Errors
    ///
    /// Returns [`LoopError::WatcherState`] if the loop is destroyed.
    pub fn fork_watcher(&self) -> Result<ForkWatcher, LoopError> {
        crate::watcher::fork::create(&self.inner)
    }

    /// Creates a watcher for an OS signal.
    ///
    /// # Errors
    ///
    /// Returns [`LoopError::WatcherState`] if the signal number cannot be
    /// latched or the loop is destroyed.
    pub fn signal(&self, signum: i32) -> Result<SignalWatcher, LoopError> {
        crate::watcher::signal::create(&self.inner, signum)
    }

    /// Schedules `func` to run at the next callback flush and keeps the
    /// loop alive until it has run or been stopped.
    ///
    /// # Errors
    ///
    /// Returns [`LoopError::WatcherState`] if the loop is destroyed.
    pub fn run_callback(
        &self,
        func: impl FnOnce() + 'static,
    ) -> Result<CallbackHandle, LoopError> {
        self.run_callback_with_priority(func, 0)
    }

    /// [`EventLoop::run_callback`] with an explicit priority; higher runs
    /// earlier within a flush, ties keep scheduling order.
    ///
    /// # Errors
    ///
    /// Returns [`LoopError::WatcherState`] if the loop is destroyed.
    pub fn run_callback_with_priority(
        &self,
        func: impl FnOnce() + 'static,
        priority: i32,
    ) -> Result<CallbackHandle, LoopError> {
        self.inner.ensure_live()?;
        let handle = self
            .inner
            .callbacks
            .borrow_mut()
            .push(Box::new(func), priority);
        self.inner.arm_spin();
        Ok(handle)
    }

    /// Number of descriptors with a live multiplexer entry.
    #[must_use]
    pub fn io_multiplexer_count(&self) -> usize {
        self.inner.io_muxes.borrow().len()
    }

    /// Native handles the engine has not reclaimed yet.
    #[must_use]
    pub fn open_handle_count(&self) -> usize {
        self.inner.engine.open_handles()
    }

    /// Callbacks waiting for the next flush.
    #[must_use]
    pub fn pending_callback_count(&self) -> usize {
        self.inner.callbacks.borrow().len()
    }

    #[cfg(test)]
    pub(crate) fn inner(&self) -> &Rc<LoopInner> {
        &self.inner
    }

    /// Test hook: pretend the process pid changed so the next flush runs
    /// the fork watchers.
    #[cfg(test)]
    pub(crate) fn simulate_pid_change(&self) {
        self.inner.observed_pid.set(self.inner.observed_pid.get() ^ 0x4000_0000);
    }

    /// Test hook: inject a reaped child exit without a real process.
    #[cfg(test)]
    pub(crate) fn simulate_child_exit(&self, pid: i32, exit: ChildExit) {
        self.inner.dispatch_child_exit(pid, exit);
    }
}

impl std::fmt::Debug for EventLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventLoop")
            .field("engine", &self.inner.kind)
            .field("default", &self.inner.is_default)
            .field("destroyed", &self.inner.destroyed.get())
            .field("open_handles", &self.inner.engine.open_handles())
            .finish_non_exhaustive()
    }
}
