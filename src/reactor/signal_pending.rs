//! Process-global pending-signal latch.
//!
//! Signal handlers cannot call into the loop, so delivery is split in two:
//! a minimal handler latches the signal number into one atomic bitmask, and
//! the engines drain the mask after every poll step. Latency for a loop
//! blocked in poll is bounded by the poll being interrupted (handlers are
//! installed without `SA_RESTART`) or by the bounded keep-spin timer.
//!
//! Handler installation is refcounted per signal number so several watchers
//! for the same signal share one `sigaction` registration; the default
//! disposition is restored when the last watcher goes away.

// The sigaction install is the one place the crate touches raw signal
// machinery; everything it does from the handler is a single lock-free
// atomic OR.
#![allow(unsafe_code)]

use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, Signal};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::LoopError;

/// One bit per signal number, set by the handler, drained by the engines.
static PENDING: AtomicU64 = AtomicU64::new(0);

/// Install refcounts per signal number.
static INSTALLED: Mutex<BTreeMap<i32, usize>> = Mutex::new(BTreeMap::new());

extern "C" fn latch_signal(signum: libc::c_int) {
    // SAFETY-relevant: this runs in signal-handler context. A lock-free
    // fetch_or on an AtomicU64 is async-signal-safe; nothing else happens
    // here.
    if (0..64).contains(&signum) {
        PENDING.fetch_or(1u64 << signum as u32, Ordering::SeqCst);
    }
}

/// Installs the latch handler for `signum`, refcounted.
///
/// # Errors
///
/// Returns [`LoopError::WatcherState`] if the signal number is outside the
/// latchable range or the OS rejects the handler.
pub(crate) fn install(signum: i32) -> Result<(), LoopError> {
    if !(1..64).contains(&signum) {
        return Err(LoopError::WatcherState(
            "signal number outside the latchable range",
        ));
    }
    let signal = Signal::try_from(signum)
        .map_err(|_| LoopError::WatcherState("unknown signal number"))?;

    let mut installed = INSTALLED.lock();
    let count = installed.entry(signum).or_insert(0);
    if *count == 0 {
        // No SA_RESTART: a delivery should interrupt a blocking poll so the
        // engines notice the latch promptly. SA_NOCLDSTOP keeps stopped
        // (not exited) children from raising SIGCHLD.
        let mut flags = SaFlags::empty();
        if signal == Signal::SIGCHLD {
            flags |= SaFlags::SA_NOCLDSTOP;
        }
        let action = SigAction::new(SigHandler::Handler(latch_signal), flags, SigSet::empty());
        // SAFETY: `latch_signal` is async-signal-safe (one atomic OR, no
        // allocation, no locks) and stays valid for the life of the
        // process.
        unsafe { signal::sigaction(signal, &action) }
            .map_err(|_| LoopError::WatcherState("failed to install signal handler"))?;
    }
    *count += 1;
    Ok(())
}

/// Drops one reference to the latch handler for `signum`, restoring the
/// default disposition when the last reference goes away. Removing a signal
/// that was never installed is a no-op.
pub(crate) fn uninstall(signum: i32) {
    let mut installed = INSTALLED.lock();
    let Some(count) = installed.get_mut(&signum) else {
        return;
    };
    *count = count.saturating_sub(1);
    if *count > 0 {
        return;
    }
    installed.remove(&signum);
    if let Ok(signal) = Signal::try_from(signum) {
        let action = SigAction::new(SigHandler::SigDfl, SaFlags::empty(), SigSet::empty());
        // SAFETY: restoring the default disposition; no handler of ours can
        // run for this signal afterwards.
        let _ = unsafe { signal::sigaction(signal, &action) };
    }
}

/// True if any latched signal awaits draining. Engines use this to skip
/// blocking in poll when a delivery already happened.
pub(crate) fn any_pending() -> bool {
    PENDING.load(Ordering::SeqCst) != 0
}

/// Drains and returns the pending bitmask.
///
/// The mask is process-global: whichever loop drains first sees the bit,
/// exactly like a process-wide signal handler.
pub(crate) fn take_pending() -> u64 {
    PENDING.swap(0, Ordering::SeqCst)
}
