//! Bookkeeping shared by both engines.
//!
//! `EngineBase` owns the OS poller, the handle arena, and the cached loop
//! clock. The engines differ in phase order and dispatch strategy, not in
//! how handles are created, armed, or closed, so that part lives here once.
//!
//! The OS poller is one-shot: after an event for a descriptor is delivered,
//! interest must be re-applied before the next event can arrive. Engines
//! call [`EngineBase::rearm_io`] after dispatching each readiness firing.

use polling::Poller;
use std::cell::{Cell, RefCell};
use std::io;
use std::time::{Duration, Instant};

use super::table::{HandleKind, HandleTable};
use super::{interest_to_event, DataKey, HandleId, HandleSpec, Interest};
use crate::error::LoopError;

pub(crate) struct EngineBase {
    poller: RefCell<Poller>,
    origin: Instant,
    cached_now: Cell<u64>,
    pub(crate) table: RefCell<HandleTable>,
    stop_requested: Cell<bool>,
    running: Cell<bool>,
    closed: Cell<bool>,
}

impl EngineBase {
    pub fn new() -> Result<Self, LoopError> {
        let poller = Poller::new().map_err(LoopError::reactor_init)?;
        Ok(Self {
            poller: RefCell::new(poller),
            origin: Instant::now(),
            cached_now: Cell::new(0),
            table: RefCell::new(HandleTable::new()),
            stop_requested: Cell::new(false),
            running: Cell::new(false),
            closed: Cell::new(false),
        })
    }

    pub fn now_ms(&self) -> u64 {
        self.cached_now.get()
    }

    pub fn update_now(&self) {
        let elapsed = self.origin.elapsed().as_millis();
        self.cached_now.set(u64::try_from(elapsed).unwrap_or(u64::MAX));
    }

    pub fn stop(&self) {
        self.stop_requested.set(true);
    }

    pub fn stop_requested(&self) -> bool {
        self.stop_requested.get()
    }

    /// Marks the engine as running. Returns false (and logs) if it already
    /// is, or if the engine has been shut down.
    pub fn begin_run(&self) -> bool {
        if self.closed.get() {
            return false;
        }
        if self.running.get() {
            tracing::warn!("reactor run() is not reentrant; ignoring nested call");
            return false;
        }
        self.running.set(true);
        true
    }

    pub fn end_run(&self) {
        self.running.set(false);
        self.stop_requested.set(false);
    }

    pub fn create(&self, spec: HandleSpec, data: DataKey) -> io::Result<HandleId> {
        let id = self.table.borrow_mut().insert(spec, data);
        if let HandleSpec::Io { fd } = spec {
            // Register with empty interest; the real mask is applied when
            // the multiplexer recomputes it. Watching for too much causes
            // spurious wakeups.
            let event = polling::Event::none(id.0);
            if let Err(err) = self.poller.borrow().add(fd, event) {
                self.table.borrow_mut().begin_close(id);
                self.table.borrow_mut().drain_closes();
                return Err(err);
            }
        }
        Ok(id)
    }

    pub fn start(&self, id: HandleId) -> io::Result<()> {
        let now = self.cached_now.get();
        let io_arm = {
            let mut table = self.table.borrow_mut();
            if !table.activate(id, now) {
                return Ok(());
            }
            match table.get(id).map(|h| &h.kind) {
                Some(&HandleKind::Io { fd, interest }) => Some((fd, interest)),
                _ => None,
            }
        };
        if let Some((fd, interest)) = io_arm {
            let event = interest_to_event(id.0, interest);
            if let Err(err) = self.poller.borrow().modify(fd, event) {
                self.table.borrow_mut().deactivate(id);
                return Err(err);
            }
        }
        Ok(())
    }

    pub fn stop_handle(&self, id: HandleId) {
        let io_disarm = {
            let mut table = self.table.borrow_mut();
            let fd = match table.get(id) {
                Some(h) if h.active && !h.closing => match h.kind {
                    HandleKind::Io { fd, .. } => Some(fd),
                    _ => None,
                },
                _ => None,
            };
            table.deactivate(id);
            fd
        };
        if let Some(fd) = io_disarm {
            // The descriptor may already be gone; stopping must not fail.
            let _ = self
                .poller
                .borrow()
                .modify(fd, polling::Event::none(id.0));
        }
    }

    pub fn close(&self, id: HandleId) {
        let fd = self.table.borrow_mut().begin_close(id);
        if let Some(fd) = fd {
            let _ = self.poller.borrow().delete(fd);
        }
    }

    pub fn set_io_interest(&self, id: HandleId, interest: Interest) -> io::Result<()> {
        let apply = {
            let mut table = self.table.borrow_mut();
            let Some(handle) = table.get_mut(id) else {
                return Err(io::Error::new(
                    io::ErrorKind::NotFound,
                    "handle not registered",
                ));
            };
            match &mut handle.kind {
                HandleKind::Io {
                    fd,
                    interest: stored,
                } => {
                    *stored = interest;
                    if handle.active && !handle.closing {
                        Some(*fd)
                    } else {
                        None
                    }
                }
                _ => {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidInput,
                        "not an I/O handle",
                    ))
                }
            }
        };
        if let Some(fd) = apply {
            self.poller
                .borrow()
                .modify(fd, interest_to_event(id.0, interest))?;
        }
        Ok(())
    }

    pub fn set_ref(&self, id: HandleId, referenced: bool) {
        if let Some(handle) = self.table.borrow_mut().get_mut(id) {
            handle.referenced = referenced;
        }
    }

    pub fn set_priority(&self, id: HandleId, priority: i32) {
        if let Some(handle) = self.table.borrow_mut().get_mut(id) {
            handle.priority = priority;
        }
    }

    pub fn alive(&self) -> bool {
        self.table.borrow().alive()
    }

    /// Active referenced handles remain, or closes are still draining.
    pub fn loop_alive(&self) -> bool {
        let table = self.table.borrow();
        table.alive() || table.has_pending_closes()
    }

    pub fn open_handles(&self) -> usize {
        self.table.borrow().open_handles()
    }

    pub fn walk_force_close(&self) {
        let fds = self.table.borrow_mut().walk_force_close();
        let poller = self.poller.borrow();
        for fd in fds {
            let _ = poller.delete(fd);
        }
    }

    pub fn close_engine(&self) -> Result<(), LoopError> {
        if self.table.borrow().open_handles() > 0 {
            return Err(LoopError::CloseBusy);
        }
        self.closed.set(true);
        Ok(())
    }

    pub fn reinit(&self) -> io::Result<()> {
        let poller = Poller::new()?;
        let registrations = self.table.borrow().io_registrations();
        {
            let mut slot = self.poller.borrow_mut();
            *slot = poller;
        }
        let poller = self.poller.borrow();
        for (id, fd, interest, active) in registrations {
            let event = if active {
                interest_to_event(id.0, interest)
            } else {
                polling::Event::none(id.0)
            };
            poller.add(fd, event)?;
        }
        Ok(())
    }

    /// Blocks in the OS poller for up to `timeout` and returns the
    /// delivered `(key, readiness)` pairs.
    ///
    /// An interrupted wait (a signal handler ran) is treated as a wake with
    /// no events; the caller's signal drain picks the latch up. Other poll
    /// errors are absorbed and logged: steady-state anomalies must not tear
    /// the loop down.
    pub fn poll(&self, timeout: Option<Duration>) -> Vec<(usize, Interest)> {
        let mut events: Vec<polling::Event> = Vec::with_capacity(64);
        match self.poller.borrow().wait(&mut events, timeout) {
            Ok(_) => {}
            Err(err) if err.kind() == io::ErrorKind::Interrupted => {
                tracing::trace!("poll interrupted by signal");
            }
            Err(err) => {
                tracing::error!(error = %err, "poll failed; treating as spurious wake");
            }
        }
        events
            .iter()
            .map(|ev| (ev.key, super::event_to_interest(ev)))
            .collect()
    }

    /// Re-applies a descriptor's interest after a one-shot delivery.
    pub fn rearm_io(&self, id: HandleId) {
        let arm = {
            let table = self.table.borrow();
            match table.get(id) {
                Some(h) if h.active && !h.closing => match h.kind {
                    HandleKind::Io { fd, interest } => Some((fd, interest)),
                    _ => None,
                },
                _ => None,
            }
        };
        if let Some((fd, interest)) = arm {
            let _ = self
                .poller
                .borrow()
                .modify(fd, interest_to_event(id.0, interest));
        }
    }

    /// Readiness actually deliverable to an I/O handle right now: the
    /// intersection of what the poller reported and the current interest.
    pub fn io_deliverable(&self, id: HandleId, ready: Interest) -> Option<(DataKey, Interest)> {
        let table = self.table.borrow();
        let handle = table.get(id)?;
        if !handle.active || handle.closing {
            return None;
        }
        match handle.kind {
            HandleKind::Io { interest, .. } => {
                let hit = ready & interest;
                if hit.is_empty() {
                    None
                } else {
                    Some((handle.data, hit))
                }
            }
            _ => None,
        }
    }
}
