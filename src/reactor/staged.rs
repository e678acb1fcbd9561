//! Fixed-stage-order engine.
//!
//! Phase order per iteration:
//!
//! 1. clock resync
//! 2. due timers (arm order among equals)
//! 3. idle hooks
//! 4. prepare hooks
//! 5. poll for readiness; I/O dispatched *inline* as events arrive
//! 6. latched signals
//! 7. check hooks
//! 8. deferred closes are reclaimed
//!
//! Timers run before the poll step, so a zero-delay timer scheduled from a
//! post-poll callback would do nothing useful here; the loop core arms a
//! spin check handle instead, and this engine zeroes its poll timeout while
//! one is active so the forced extra iteration is prompt.
//!
//! Priority is accepted for interface parity but does not reorder stages.

use std::time::Duration;

use super::base::EngineBase;
use super::signal_pending;
use super::table::PhaseKind;
use super::{
    DataKey, Dispatch, EngineKind, Fired, HandleId, HandleSpec, Interest, Reactor, RunMode,
};
use crate::error::LoopError;

/// The fixed-stage-order engine. See the module docs for the stage order.
pub struct StagedReactor {
    base: EngineBase,
}

impl StagedReactor {
    /// Creates a new engine with a fresh OS poller.
    ///
    /// # Errors
    ///
    /// Returns [`LoopError::ReactorInit`] if the poller cannot be allocated.
    pub fn new() -> Result<Self, LoopError> {
        Ok(Self {
            base: EngineBase::new()?,
        })
    }

    fn poll_timeout(&self, mode: RunMode) -> Option<Duration> {
        if matches!(mode, RunMode::NoWait)
            || self.base.stop_requested()
            || !self.base.alive()
            || signal_pending::any_pending()
        {
            return Some(Duration::ZERO);
        }
        {
            let table = self.base.table.borrow();
            if table.has_pending_closes() || table.has_active_idle() || table.has_active_spin_check()
            {
                return Some(Duration::ZERO);
            }
        }
        let now = self.base.now_ms();
        self.base
            .table
            .borrow_mut()
            .next_timer_delay(now)
            .map(Duration::from_millis)
    }

    fn run_phase(&self, phase: PhaseKind, event: Fired, dispatch: &dyn Dispatch) {
        // Collect before dispatching: callbacks re-enter the handle table.
        let fires = self.base.table.borrow().collect_phase(phase);
        for fire in fires {
            let data = self.base.table.borrow().firable(fire.id, None);
            if let Some(data) = data {
                dispatch.fire(data, event);
            }
        }
    }

    fn iterate(&self, mode: RunMode, dispatch: &dyn Dispatch) {
        self.base.update_now();
        let now = self.base.now_ms();

        let due_timers = self.base.table.borrow_mut().collect_due_timers(now);
        for due in due_timers {
            let data = self.base.table.borrow().firable(due.id, Some(due.gen));
            if let Some(data) = data {
                dispatch.fire(data, Fired::Timer);
            }
        }

        self.run_phase(PhaseKind::Idle, Fired::Idle, dispatch);
        self.run_phase(PhaseKind::Prepare, Fired::Prepare, dispatch);

        let timeout = self.poll_timeout(mode);
        for (key, ready) in self.base.poll(timeout) {
            let id = HandleId(key);
            if let Some((data, hit)) = self.base.io_deliverable(id, ready) {
                dispatch.fire(data, Fired::Io(hit));
                self.base.rearm_io(id);
            }
        }

        let mask = signal_pending::take_pending();
        if mask != 0 {
            let signals = self.base.table.borrow().collect_signals(mask);
            for sig in signals {
                let data = self.base.table.borrow().firable(sig.id, None);
                if let Some(data) = data {
                    dispatch.fire(data, Fired::Signal(sig.signum));
                }
            }
        }

        self.run_phase(PhaseKind::Check, Fired::Check, dispatch);
        self.base.table.borrow_mut().drain_closes();
    }
}

impl Reactor for StagedReactor {
    fn kind(&self) -> EngineKind {
        EngineKind::Staged
    }

    fn now_ms(&self) -> u64 {
        self.base.now_ms()
    }

    fn update_now(&self) {
        self.base.update_now();
    }

    fn run(&self, mode: RunMode, dispatch: &dyn Dispatch) -> bool {
        if !self.base.begin_run() {
            return false;
        }
        if !self.base.loop_alive() {
            self.base.update_now();
            self.base.end_run();
            return false;
        }
        loop {
            self.iterate(mode, dispatch);
            if !self.base.loop_alive()
                || self.base.stop_requested()
                || !matches!(mode, RunMode::Default)
            {
                break;
            }
        }
        self.base.end_run();
        self.base.loop_alive()
    }

    fn stop(&self) {
        self.base.stop();
    }

    fn create(&self, spec: HandleSpec, data: DataKey) -> std::io::Result<HandleId> {
        self.base.create(spec, data)
    }

    fn start(&self, id: HandleId) -> std::io::Result<()> {
        self.base.start(id)
    }

    fn stop_handle(&self, id: HandleId) {
        self.base.stop_handle(id);
    }

    fn close(&self, id: HandleId) {
        self.base.close(id);
    }

    fn set_io_interest(&self, id: HandleId, interest: Interest) -> std::io::Result<()> {
        self.base.set_io_interest(id, interest)
    }

    fn set_ref(&self, id: HandleId, referenced: bool) {
        self.base.set_ref(id, referenced);
    }

    fn set_priority(&self, id: HandleId, priority: i32) {
        self.base.set_priority(id, priority);
    }

    fn alive(&self) -> bool {
        self.base.alive()
    }

    fn open_handles(&self) -> usize {
        self.base.open_handles()
    }

    fn walk_force_close(&self) {
        self.base.walk_force_close();
    }

    fn close_engine(&self) -> Result<(), LoopError> {
        self.base.close_engine()
    }

    fn reinit(&self) -> std::io::Result<()> {
        self.base.reinit()
    }
}

impl std::fmt::Debug for StagedReactor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StagedReactor")
            .field("open_handles", &self.open_handles())
            .finish_non_exhaustive()
    }
}
