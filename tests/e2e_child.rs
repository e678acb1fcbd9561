//! Child-watcher E2E suite: reaps real child processes through the loop.
//!
//! These tests own the process-wide SIGCHLD registration, so they live in
//! their own test binary and run against the default loop.
//!
//! Run with: `cargo test --test e2e_child`

mod common {
    pub fn init_test_logging() {
        // Initialize tracing for tests if not already done
        let _ = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::INFO)
            .with_test_writer()
            .try_init();
    }
}

/// Phase tracking macro for structured test logging.
#[macro_export]
macro_rules! test_phase {
    ($name:expr) => {
        tracing::info!(test = $name, "=== TEST START ===");
    };
}

/// Assertion with logging for better test output.
#[macro_export]
macro_rules! assert_with_log {
    ($cond:expr, $msg:expr, $expected:expr, $actual:expr) => {
        if !$cond {
            tracing::error!(
                message = $msg,
                expected = ?$expected,
                actual = ?$actual,
                "Assertion failed"
            );
        }
        assert!($cond, "{}: expected {:?}, got {:?}", $msg, $expected, $actual);
    };
}

use parking_lot::Mutex;
use spindle::{ChildExit, EventLoop, LoopConfig};
use std::cell::RefCell;
use std::process::Command;
use std::rc::Rc;
use std::time::{Duration, Instant};

/// Both tests claim the process-wide SIGCHLD registration and reap with a
/// process-wide wait; they must not overlap.
static SIGCHLD_TEST_LOCK: Mutex<()> = Mutex::new(());

fn run_until(lp: &EventLoop, done: impl Fn() -> bool, deadline: Duration) -> bool {
    let start = Instant::now();
    while !done() {
        if start.elapsed() > deadline {
            return false;
        }
        lp.run_once();
    }
    true
}

#[test]
fn exited_child_reaches_specific_and_wildcard_watchers() {
    common::init_test_logging();
    test_phase!("e2e_exited_child_reaches_specific_and_wildcard_watchers");
    let _guard = SIGCHLD_TEST_LOCK.lock();

    let lp = EventLoop::new(LoopConfig::default()).expect("default loop");

    // Creating the first child watcher installs the SIGCHLD registration;
    // that must happen before the child can exit, or the delivery is lost.
    let wildcard = lp.child(0).expect("wildcard watcher");

    let child = Command::new("true").spawn().expect("spawn child");
    let pid = i32::try_from(child.id()).expect("pid fits");
    // The loop's reap owns the wait; do not call child.wait() here.
    drop(child);

    let events = Rc::new(RefCell::new(Vec::new()));
    let specific = lp.child(pid).expect("specific watcher");
    let seen = Rc::clone(&events);
    specific
        .start(move |got_pid, exit| seen.borrow_mut().push(("specific", got_pid, exit)))
        .expect("start specific");
    let seen = Rc::clone(&events);
    wildcard
        .start(move |got_pid, exit| seen.borrow_mut().push(("wildcard", got_pid, exit)))
        .expect("start wildcard");

    let reaped = run_until(&lp, || events.borrow().len() >= 2, Duration::from_secs(10));
    assert_with_log!(reaped, "child reaped through the loop", true, reaped);

    let got = events.borrow().clone();
    assert_with_log!(
        got == vec![
            ("specific", pid, ChildExit::Exited { code: 0 }),
            ("wildcard", pid, ChildExit::Exited { code: 0 }),
        ],
        "one notification each, exact pid before wildcard",
        2usize,
        got.len()
    );
    assert_eq!(specific.last_pid(), pid);
    assert_eq!(specific.last_status(), Some(ChildExit::Exited { code: 0 }));

    // The watchers stay registered: a second child only reaches the
    // wildcard one.
    let child = Command::new("true").spawn().expect("spawn second child");
    let second_pid = i32::try_from(child.id()).expect("pid fits");
    drop(child);
    let reaped = run_until(&lp, || events.borrow().len() >= 3, Duration::from_secs(10));
    assert_with_log!(reaped, "second child reaped", true, reaped);
    assert_eq!(
        events.borrow()[2],
        ("wildcard", second_pid, ChildExit::Exited { code: 0 })
    );

    specific.close();
    wildcard.close();
    lp.destroy();
}

#[test]
fn child_watcher_keeps_default_run_blocking_until_exit() {
    common::init_test_logging();
    test_phase!("e2e_child_watcher_keeps_default_run_blocking_until_exit");
    let _guard = SIGCHLD_TEST_LOCK.lock();

    let lp = EventLoop::new(LoopConfig::default()).expect("default loop");

    let child = Command::new("sh")
        .args(["-c", "sleep 0.2"])
        .spawn()
        .expect("spawn child");
    let pid = i32::try_from(child.id()).expect("pid fits");
    drop(child);

    let exits = Rc::new(RefCell::new(Vec::new()));
    let watcher = lp.child(pid).expect("watcher");
    let seen = Rc::clone(&exits);
    let lp2 = lp.clone();
    watcher
        .start(move |got_pid, exit| {
            seen.borrow_mut().push((got_pid, exit));
            lp2.stop();
        })
        .expect("start");

    // Failsafe: turn a hang into a clean assertion failure.
    let failsafe = lp
        .timer(Duration::from_secs(10), Duration::ZERO)
        .expect("failsafe timer");
    let lp3 = lp.clone();
    failsafe.start(move || lp3.stop()).expect("start failsafe");

    let start = Instant::now();
    lp.run_default();
    let waited = start.elapsed();
    failsafe.close();

    assert_with_log!(
        exits.borrow().len() == 1,
        "exactly one exit notification",
        1usize,
        exits.borrow().len()
    );
    assert_eq!(exits.borrow()[0].0, pid);
    assert!(
        waited >= Duration::from_millis(100),
        "run blocked while the child lived (waited {waited:?})"
    );

    watcher.close();
    lp.destroy();
}
