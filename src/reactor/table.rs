//! Native-handle arena shared by both engines.
//!
//! Handles live in a [`slab::Slab`] keyed by [`HandleId`]. Timers are a
//! min-heap of `(deadline, seq)` entries stamped with the handle's arm
//! generation: stopping or restarting a timer bumps the generation, so stale
//! heap entries are detected lazily and skipped instead of being removed.
//! Closes are two-step: the OS registration is released by the engine when
//! the close is requested, while the arena slot is reclaimed at the end of
//! the iteration so in-flight firings can still resolve their keys.

use slab::Slab;
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::os::fd::RawFd;

use super::{DataKey, HandleId, HandleSpec, Interest};

/// Phase hooks a handle can belong to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PhaseKind {
    Prepare,
    Check,
    Idle,
}

#[derive(Debug)]
pub(crate) enum HandleKind {
    Io { fd: RawFd, interest: Interest },
    Timer { after_ms: u64, repeat_ms: u64 },
    Signal { signum: i32 },
    Prepare,
    Check { spin: bool },
    Idle,
}

#[derive(Debug)]
pub(crate) struct Handle {
    pub kind: HandleKind,
    pub data: DataKey,
    pub active: bool,
    pub referenced: bool,
    pub priority: i32,
    pub closing: bool,
    /// Bumped on every timer start/stop; heap entries carry the value they
    /// were armed with.
    pub arm_gen: u64,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
struct TimerEntry {
    due_ms: u64,
    seq: u64,
    id: HandleId,
    gen: u64,
}

impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reverse ordering for a min-heap: earliest deadline first, then
        // arm order, so same-deadline timers fire in the order they were
        // armed.
        other
            .due_ms
            .cmp(&self.due_ms)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// A timer that reached its deadline, recorded at collection time.
#[derive(Debug, Clone, Copy)]
pub(crate) struct DueTimer {
    pub id: HandleId,
    pub data: DataKey,
    pub gen: u64,
    pub priority: i32,
}

/// A phase hook due to fire.
#[derive(Debug, Clone, Copy)]
pub(crate) struct PhaseFire {
    pub id: HandleId,
    pub data: DataKey,
    pub priority: i32,
}

/// A latched signal matched to a watching handle.
#[derive(Debug, Clone, Copy)]
pub(crate) struct SignalFire {
    pub id: HandleId,
    pub data: DataKey,
    pub signum: i32,
    pub priority: i32,
}

#[derive(Debug, Default)]
pub(crate) struct HandleTable {
    handles: Slab<Handle>,
    timers: BinaryHeap<TimerEntry>,
    timer_seq: u64,
    pending_closes: Vec<HandleId>,
}

impl HandleTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, spec: HandleSpec, data: DataKey) -> HandleId {
        let kind = match spec {
            HandleSpec::Io { fd } => HandleKind::Io {
                fd,
                interest: Interest::NONE,
            },
            HandleSpec::Timer {
                after_ms,
                repeat_ms,
            } => HandleKind::Timer {
                after_ms,
                repeat_ms,
            },
            HandleSpec::Signal { signum } => HandleKind::Signal { signum },
            HandleSpec::Prepare => HandleKind::Prepare,
            HandleSpec::Check { spin } => HandleKind::Check { spin },
            HandleSpec::Idle => HandleKind::Idle,
        };
        let key = self.handles.insert(Handle {
            kind,
            data,
            active: false,
            referenced: true,
            priority: 0,
            closing: false,
            arm_gen: 0,
        });
        HandleId(key)
    }

    pub fn get(&self, id: HandleId) -> Option<&Handle> {
        self.handles.get(id.0)
    }

    pub fn get_mut(&mut self, id: HandleId) -> Option<&mut Handle> {
        self.handles.get_mut(id.0)
    }

    /// Activates a handle; timers are armed against `now_ms`.
    ///
    /// Returns false if the handle is missing, closing, or already active.
    pub fn activate(&mut self, id: HandleId, now_ms: u64) -> bool {
        let seq = {
            let Some(handle) = self.handles.get_mut(id.0) else {
                return false;
            };
            if handle.closing || handle.active {
                return false;
            }
            handle.active = true;
            if let HandleKind::Timer { after_ms, .. } = handle.kind {
                handle.arm_gen += 1;
                Some((now_ms.saturating_add(after_ms), handle.arm_gen))
            } else {
                None
            }
        };
        if let Some((due_ms, gen)) = seq {
            self.push_timer(due_ms, id, gen);
        }
        true
    }

    /// Deactivates a handle. Pending timer heap entries become stale.
    pub fn deactivate(&mut self, id: HandleId) {
        if let Some(handle) = self.handles.get_mut(id.0) {
            if handle.active {
                handle.active = false;
                if matches!(handle.kind, HandleKind::Timer { .. }) {
                    handle.arm_gen += 1;
                }
            }
        }
    }

    fn push_timer(&mut self, due_ms: u64, id: HandleId, gen: u64) {
        let seq = self.timer_seq;
        self.timer_seq += 1;
        self.timers.push(TimerEntry {
            due_ms,
            seq,
            id,
            gen,
        });
    }

    /// Milliseconds until the next live timer deadline, if any.
    ///
    /// Stale heap entries encountered on the way are discarded.
    pub fn next_timer_delay(&mut self, now_ms: u64) -> Option<u64> {
        while let Some(entry) = self.timers.peek().copied() {
            if self.timer_entry_live(&entry) {
                return Some(entry.due_ms.saturating_sub(now_ms));
            }
            self.timers.pop();
        }
        None
    }

    fn timer_entry_live(&self, entry: &TimerEntry) -> bool {
        self.handles.get(entry.id.0).is_some_and(|h| {
            h.active && !h.closing && h.arm_gen == entry.gen
        })
    }

    /// Pops every timer due at `now_ms`, auto-stopping one-shots and
    /// re-arming repeating timers with their period.
    pub fn collect_due_timers(&mut self, now_ms: u64) -> Vec<DueTimer> {
        let mut due = Vec::new();
        while let Some(entry) = self.timers.peek().copied() {
            if entry.due_ms > now_ms {
                break;
            }
            self.timers.pop();
            if !self.timer_entry_live(&entry) {
                continue;
            }
            let (data, priority, rearm) = {
                let handle = &mut self.handles[entry.id.0];
                let rearm = match handle.kind {
                    HandleKind::Timer { repeat_ms, .. } if repeat_ms > 0 => {
                        Some(now_ms.saturating_add(repeat_ms))
                    }
                    _ => {
                        // One-shot: auto-stop without bumping the arm
                        // generation, so the firing collected here stays
                        // deliverable.
                        handle.active = false;
                        None
                    }
                };
                (handle.data, handle.priority, rearm)
            };
            if let Some(due_ms) = rearm {
                self.push_timer(due_ms, entry.id, entry.gen);
            }
            due.push(DueTimer {
                id: entry.id,
                data,
                gen: entry.gen,
                priority,
            });
        }
        due
    }

    /// Active hooks of one phase, in arena order.
    pub fn collect_phase(&self, phase: PhaseKind) -> Vec<PhaseFire> {
        self.handles
            .iter()
            .filter(|(_, h)| h.active && !h.closing)
            .filter(|(_, h)| {
                matches!(
                    (&h.kind, phase),
                    (HandleKind::Prepare, PhaseKind::Prepare)
                        | (HandleKind::Check { .. }, PhaseKind::Check)
                        | (HandleKind::Idle, PhaseKind::Idle)
                )
            })
            .map(|(key, h)| PhaseFire {
                id: HandleId(key),
                data: h.data,
                priority: h.priority,
            })
            .collect()
    }

    /// Active signal handles whose signum bit is set in `mask`.
    pub fn collect_signals(&self, mask: u64) -> Vec<SignalFire> {
        self.handles
            .iter()
            .filter(|(_, h)| h.active && !h.closing)
            .filter_map(|(key, h)| match h.kind {
                HandleKind::Signal { signum }
                    if (0..64).contains(&signum) && mask & (1u64 << signum as u32) != 0 =>
                {
                    Some(SignalFire {
                        id: HandleId(key),
                        data: h.data,
                        signum,
                        priority: h.priority,
                    })
                }
                _ => None,
            })
            .collect()
    }

    /// True while an active idle handle forces a zero poll timeout.
    pub fn has_active_idle(&self) -> bool {
        self.handles
            .iter()
            .any(|(_, h)| h.active && !h.closing && matches!(h.kind, HandleKind::Idle))
    }

    /// True while an active spin check forces a zero poll timeout on the
    /// staged engine.
    pub fn has_active_spin_check(&self) -> bool {
        self.handles.iter().any(|(_, h)| {
            h.active && !h.closing && matches!(h.kind, HandleKind::Check { spin: true })
        })
    }

    /// Pre-fire recheck: the key to deliver to, if the handle is still
    /// eligible. `expect_gen` pins timer firings to the arming they were
    /// collected under, so a stop from an earlier callback in the same batch
    /// cancels delivery.
    pub fn firable(&self, id: HandleId, expect_gen: Option<u64>) -> Option<DataKey> {
        let handle = self.handles.get(id.0)?;
        if handle.closing {
            return None;
        }
        match expect_gen {
            Some(gen) => {
                if handle.arm_gen != gen {
                    return None;
                }
            }
            None => {
                if !handle.active {
                    return None;
                }
            }
        }
        Some(handle.data)
    }

    /// Marks a handle closing and schedules its slot for reclamation.
    ///
    /// Returns the descriptor the engine must release from the OS poller,
    /// when the handle is an I/O registration. Closing twice is a no-op.
    pub fn begin_close(&mut self, id: HandleId) -> Option<RawFd> {
        let fd = {
            let handle = self.handles.get_mut(id.0)?;
            if handle.closing {
                return None;
            }
            handle.closing = true;
            handle.active = false;
            match handle.kind {
                HandleKind::Io { fd, .. } => Some(fd),
                _ => None,
            }
        };
        self.pending_closes.push(id);
        fd
    }

    /// Reclaims every slot whose close was requested.
    pub fn drain_closes(&mut self) -> usize {
        let closes = std::mem::take(&mut self.pending_closes);
        let count = closes.len();
        for id in closes {
            self.handles.try_remove(id.0);
        }
        count
    }

    pub fn has_pending_closes(&self) -> bool {
        !self.pending_closes.is_empty()
    }

    /// True if any active referenced handle remains.
    pub fn alive(&self) -> bool {
        self.handles
            .iter()
            .any(|(_, h)| h.active && h.referenced && !h.closing)
    }

    /// Open handles, closing ones included.
    pub fn open_handles(&self) -> usize {
        self.handles.len()
    }

    /// Force-closes everything not already closing; returns the I/O
    /// descriptors the engine must release.
    pub fn walk_force_close(&mut self) -> Vec<RawFd> {
        let ids: Vec<HandleId> = self
            .handles
            .iter()
            .filter(|(_, h)| !h.closing)
            .map(|(key, _)| HandleId(key))
            .collect();
        ids.into_iter()
            .filter_map(|id| self.begin_close(id))
            .collect()
    }

    /// Snapshot of I/O registrations for post-fork re-arming.
    pub fn io_registrations(&self) -> Vec<(HandleId, RawFd, Interest, bool)> {
        self.handles
            .iter()
            .filter(|(_, h)| !h.closing)
            .filter_map(|(key, h)| match h.kind {
                HandleKind::Io { fd, interest } => {
                    Some((HandleId(key), fd, interest, h.active))
                }
                _ => None,
            })
            .collect()
    }
}
