//! Pending-callback queue.
//!
//! Application callbacks scheduled with `run_callback` land here and are
//! drained at the loop's deterministic flush point. A flush drains only the
//! batch present at entry: callbacks scheduled by callbacks already running
//! in a flush go to the next flush, never the current one, so one
//! pathological callback cannot starve the I/O poll.
//!
//! Draining is FIFO unless priority differentiates; higher priorities run
//! first, ties keep their scheduling order.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::rc::Rc;

pub(crate) struct ScheduledCallback {
    pending: Cell<bool>,
    priority: i32,
    func: RefCell<Option<Box<dyn FnOnce()>>>,
}

impl ScheduledCallback {
    fn new(func: Box<dyn FnOnce()>, priority: i32) -> Self {
        Self {
            pending: Cell::new(true),
            priority,
            func: RefCell::new(Some(func)),
        }
    }

    /// Runs the callback if it is still pending. Each entry runs at most
    /// once.
    pub(crate) fn invoke(&self) {
        if !self.pending.replace(false) {
            return;
        }
        let func = self.func.borrow_mut().take();
        if let Some(func) = func {
            func();
        }
    }

    fn cancel(&self) {
        self.pending.set(false);
        self.func.borrow_mut().take();
    }
}

/// Handle to a callback scheduled for the next flush.
///
/// The callback keeps the loop alive until it has run or been stopped.
pub struct CallbackHandle {
    inner: Rc<ScheduledCallback>,
}

impl CallbackHandle {
    /// True until the callback has run or been stopped.
    #[must_use]
    pub fn pending(&self) -> bool {
        self.inner.pending.get()
    }

    /// Cancels the callback. A stopped callback never runs; stopping twice
    /// is a no-op.
    pub fn stop(&self) {
        self.inner.cancel();
    }
}

impl std::fmt::Debug for CallbackHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallbackHandle")
            .field("pending", &self.pending())
            .finish()
    }
}

#[derive(Default)]
pub(crate) struct CallbackQueue {
    entries: VecDeque<Rc<ScheduledCallback>>,
}

impl CallbackQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, func: Box<dyn FnOnce()>, priority: i32) -> CallbackHandle {
        let entry = Rc::new(ScheduledCallback::new(func, priority));
        self.entries.push_back(Rc::clone(&entry));
        CallbackHandle { inner: entry }
    }

    /// Drains the entries currently queued, in dispatch order. Entries
    /// pushed after this call belong to the next batch.
    pub fn take_batch(&mut self) -> Vec<Rc<ScheduledCallback>> {
        let mut batch: Vec<_> = self.entries.drain(..).collect();
        // Stable: ties keep scheduling order.
        batch.sort_by(|a, b| b.priority.cmp(&a.priority));
        batch
    }

    /// Entries still waiting for a flush (stopped ones included until the
    /// next drain).
    pub fn len(&self) -> usize {
        self.entries.iter().filter(|e| e.pending.get()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&mut self) {
        for entry in self.entries.drain(..) {
            entry.cancel();
        }
    }
}
