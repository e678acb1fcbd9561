//! Dispatch-after-poll engine.
//!
//! Phase order per iteration:
//!
//! 1. prepare hooks (priority order)
//! 2. poll for readiness; ready descriptors are *queued*, not dispatched
//! 3. clock resync, expired timers and latched signals join the queue
//! 4. the queue is dispatched in priority order (stable within a priority)
//! 5. check hooks
//! 6. deferred closes are reclaimed
//!
//! Because everything that became ready funnels through one queue, watcher
//! priority is a real ordering input on this engine: a high-priority timer
//! fires before a low-priority readiness callback collected in the same
//! iteration.
//!
//! With no timer armed the poll step would block without bound, so it is
//! capped at roughly a minute; an async signal additionally interrupts the
//! poll (the latch handlers are installed without `SA_RESTART`).

use std::time::Duration;

use super::base::EngineBase;
use super::signal_pending;
use super::table::PhaseKind;
use super::{
    DataKey, Dispatch, EngineKind, Fired, HandleId, HandleSpec, Interest, Reactor, RunMode,
};
use crate::error::LoopError;

/// Upper bound on one poll block; keeps an otherwise-idle loop responsive
/// to process-wide state changes. Hundreds of milliseconds would busy the
/// CPU needlessly, zero would spin it; a minute is the conventional cap.
const MAX_BLOCK_MS: u64 = 59_700;

enum Queued {
    Io { id: HandleId, ready: Interest },
    Timer { id: HandleId, gen: u64 },
    Signal { id: HandleId, signum: i32 },
}

/// The dispatch-after-poll engine. See the module docs for the phase order.
pub struct QueuedReactor {
    base: EngineBase,
}

impl QueuedReactor {
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
        // A dead loop must not block either: the flush that ran before this
        // poll may have retired the last referenced handle, and the caller
        // checks liveness only after the iteration completes.
        if matches!(mode, RunMode::NoWait)
            || self.base.stop_requested()
            || !self.base.alive()
            || signal_pending::any_pending()
            || self.base.table.borrow().has_pending_closes()
        {
            return Some(Duration::ZERO);
        }
        let now = self.base.now_ms();
        let delay = self
            .base
            .table
            .borrow_mut()
            .next_timer_delay(now)
            .map_or(MAX_BLOCK_MS, |d| d.min(MAX_BLOCK_MS));
        Some(Duration::from_millis(delay))
    }

    fn run_phase(&self, phase: PhaseKind, event: Fired, dispatch: &dyn Dispatch) {
        let mut fires = self.base.table.borrow().collect_phase(phase);
        fires.sort_by(|a, b| b.priority.cmp(&a.priority));
        for fire in fires {
            let data = self.base.table.borrow().firable(fire.id, None);
            if let Some(data) = data {
                dispatch.fire(data, event);
            }
        }
    }

    fn iterate(&self, mode: RunMode, dispatch: &dyn Dispatch) {
        self.run_phase(PhaseKind::Prepare, Fired::Prepare, dispatch);

        let timeout = self.poll_timeout(mode);
        let io_events = self.base.poll(timeout);
        self.base.update_now();
        let now = self.base.now_ms();

        // Everything that became ready joins one queue; priority decides
        // dispatch order, insertion order breaks ties.
        let mut queue: Vec<(i32, Queued)> = Vec::new();
        {
            let table = self.base.table.borrow();
            for (key, ready) in io_events {
                let id = HandleId(key);
                if let Some(handle) = table.get(id) {
                    if !ready.is_empty() {
                        queue.push((handle.priority, Queued::Io { id, ready }));
                    }
                }
            }
        }
        let due_timers = self.base.table.borrow_mut().collect_due_timers(now);
        for due in due_timers {
            queue.push((
                due.priority,
                Queued::Timer {
                    id: due.id,
                    gen: due.gen,
                },
            ));
        }
        let mask = signal_pending::take_pending();
        if mask != 0 {
            let signals = self.base.table.borrow().collect_signals(mask);
            for sig in signals {
                queue.push((
                    sig.priority,
                    Queued::Signal {
                        id: sig.id,
                        signum: sig.signum,
                    },
                ));
            }
        }
        queue.sort_by(|a, b| b.0.cmp(&a.0));

        for (_, entry) in queue {
            match entry {
                Queued::Io { id, ready } => {
                    if let Some((data, hit)) = self.base.io_deliverable(id, ready) {
                        dispatch.fire(data, Fired::Io(hit));
                        self.base.rearm_io(id);
                    }
                }
                Queued::Timer { id, gen } => {
                    let data = self.base.table.borrow().firable(id, Some(gen));
                    if let Some(data) = data {
                        dispatch.fire(data, Fired::Timer);
                    }
                }
                Queued::Signal { id, signum } => {
                    let data = self.base.table.borrow().firable(id, None);
                    if let Some(data) = data {
                        dispatch.fire(data, Fired::Signal(signum));
                    }
                }
            }
        }

        self.run_phase(PhaseKind::Check, Fired::Check, dispatch);
        self.base.table.borrow_mut().drain_closes();
    }
}

impl Reactor for QueuedReactor {
    fn kind(&self) -> EngineKind {
        EngineKind::Queued
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

impl std::fmt::Debug for QueuedReactor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueuedReactor")
            .field("open_handles", &self.open_handles())
            .finish_non_exhaustive()
    }
}
