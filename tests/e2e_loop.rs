//! Loop E2E test suite entry point.
//!
//! Drives real descriptors through both engines and checks the observable
//! contracts: readiness fan-out, run-mode semantics, flush ordering, and
//! teardown.
//!
//! Run with: `cargo test --test e2e_loop`

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

use spindle::{EngineKind, EventLoop, Interest, LoopConfig};
use std::cell::{Cell, RefCell};
use std::io::Write;
use std::os::fd::AsRawFd;
use std::os::unix::net::UnixStream;
use std::rc::Rc;
use std::time::{Duration, Instant};

fn init_test(name: &str) {
    common::init_test_logging();
    test_phase!(name);
}

fn private_loop(engine: EngineKind) -> EventLoop {
    EventLoop::new(LoopConfig {
        engine,
        default: false,
    })
    .expect("create loop")
}

/// Spins the loop in ONCE steps until `done` reports true or the deadline
/// passes.
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
fn writable_socket_fires_on_both_engines() {
    init_test("e2e_writable_socket_fires_on_both_engines");
    for engine in [EngineKind::Queued, EngineKind::Staged] {
        let lp = private_loop(engine);
        let (sock, _peer) = UnixStream::pair().expect("socketpair");

        let ready = Rc::new(Cell::new(Interest::NONE));
        let seen = Rc::clone(&ready);
        let w = lp.io(sock.as_raw_fd(), Interest::WRITABLE).expect("watcher");
        w.start(move |got| seen.set(got)).expect("start");

        // A fresh socket is immediately writable.
        let fired = run_until(&lp, || ready.get().is_writable(), Duration::from_secs(5));
        assert_with_log!(fired, "writable readiness delivered", true, fired);
        assert!(
            !ready.get().is_readable(),
            "engine {engine:?}: only the requested interest is reported"
        );
        w.close();
        lp.destroy();
    }
}

#[test]
fn readable_fires_after_peer_writes() {
    init_test("e2e_readable_fires_after_peer_writes");
    for engine in [EngineKind::Queued, EngineKind::Staged] {
        let lp = private_loop(engine);
        let (sock, mut peer) = UnixStream::pair().expect("socketpair");

        let hits = Rc::new(Cell::new(0u32));
        let seen = Rc::clone(&hits);
        let w = lp.io(sock.as_raw_fd(), Interest::READABLE).expect("watcher");
        w.start(move |got| {
            assert!(got.is_readable());
            seen.set(seen.get() + 1);
        })
        .expect("start");

        // Nothing to read yet: a nonblocking spin delivers nothing.
        lp.run_nowait();
        assert_eq!(hits.get(), 0, "engine {engine:?}");

        peer.write_all(b"ping").expect("write");
        let fired = run_until(&lp, || hits.get() > 0, Duration::from_secs(5));
        assert_with_log!(fired, "readable readiness delivered", true, fired);
        w.close();
        lp.destroy();
    }
}

#[test]
fn fan_out_reaches_every_interested_watcher_in_order() {
    init_test("e2e_fan_out_reaches_every_interested_watcher_in_order");
    for engine in [EngineKind::Queued, EngineKind::Staged] {
        let lp = private_loop(engine);
        let (sock, mut peer) = UnixStream::pair().expect("socketpair");
        let fd = sock.as_raw_fd();

        let order = Rc::new(RefCell::new(Vec::new()));
        let first = lp.io(fd, Interest::READABLE).expect("first");
        let second = lp.io(fd, Interest::READABLE).expect("second");
        let writer = lp.io(fd, Interest::WRITABLE).expect("writer");
        writer.stop(); // created but never started: must not fire

        let seen = Rc::clone(&order);
        first.start(move |_| seen.borrow_mut().push("first")).expect("start");
        let seen = Rc::clone(&order);
        second.start(move |_| seen.borrow_mut().push("second")).expect("start");

        peer.write_all(b"x").expect("write");
        let fired = run_until(&lp, || order.borrow().len() >= 2, Duration::from_secs(5));
        assert_with_log!(fired, "both watchers notified", true, fired);
        let got = order.borrow().clone();
        assert_with_log!(
            got == vec!["first", "second"],
            "fan-out follows add order",
            vec!["first", "second"],
            got
        );

        first.close();
        second.close();
        writer.close();
        assert_eq!(lp.io_multiplexer_count(), 0, "engine {engine:?}");
        lp.destroy();
    }
}

#[test]
fn closing_watchers_inside_a_callback_is_safe() {
    init_test("e2e_closing_watchers_inside_a_callback_is_safe");
    for engine in [EngineKind::Queued, EngineKind::Staged] {
        let lp = private_loop(engine);
        let (sock, mut peer) = UnixStream::pair().expect("socketpair");
        let fd = sock.as_raw_fd();

        let a = Rc::new(RefCell::new(None::<spindle::IoWatcher>));
        let b = Rc::new(RefCell::new(None::<spindle::IoWatcher>));
        *a.borrow_mut() = Some(lp.io(fd, Interest::READABLE).expect("a"));
        *b.borrow_mut() = Some(lp.io(fd, Interest::READABLE).expect("b"));

        let fired = Rc::new(Cell::new(false));
        let seen = Rc::clone(&fired);
        let close_a = Rc::clone(&a);
        let close_b = Rc::clone(&b);
        a.borrow()
            .as_ref()
            .unwrap()
            .start(move |_| {
                // Tear the whole multiplexer down from inside the fan-out.
                if let Some(w) = close_a.borrow_mut().take() {
                    w.close();
                }
                if let Some(w) = close_b.borrow_mut().take() {
                    w.close();
                }
                seen.set(true);
            })
            .expect("start a");
        b.borrow()
            .as_ref()
            .unwrap()
            .start(|_| panic!("closed watcher must not fire"))
            .expect("start b");

        peer.write_all(b"x").expect("write");
        let done = run_until(&lp, || fired.get(), Duration::from_secs(5));
        assert_with_log!(done, "callback ran", true, done);
        assert_eq!(lp.io_multiplexer_count(), 0, "engine {engine:?}");

        // The descriptor can be watched again with a fresh registration.
        let again = lp.io(fd, Interest::WRITABLE).expect("rewatch");
        let ok = Rc::new(Cell::new(false));
        let seen = Rc::clone(&ok);
        again.start(move |_| seen.set(true)).expect("start again");
        let done = run_until(&lp, || ok.get(), Duration::from_secs(5));
        assert_with_log!(done, "fresh registration works", true, done);
        again.close();
        lp.destroy();
    }
}

#[test]
fn nowait_never_blocks() {
    init_test("e2e_nowait_never_blocks");
    for engine in [EngineKind::Queued, EngineKind::Staged] {
        let lp = private_loop(engine);
        // A long timer would block ONCE mode for a while; NOWAIT must
        // return immediately anyway.
        let timer = lp.timer(Duration::from_secs(30), Duration::ZERO).expect("timer");
        timer.start(|| panic!("must not fire")).expect("start");

        let start = Instant::now();
        let more = lp.run_nowait();
        assert!(
            start.elapsed() < Duration::from_secs(1),
            "engine {engine:?}: NOWAIT returned promptly"
        );
        assert_with_log!(more, "work remains after NOWAIT", true, more);
        timer.close();
        lp.destroy();
    }
}

#[test]
fn destroy_with_open_watchers_recovers_and_is_final() {
    init_test("e2e_destroy_with_open_watchers_recovers_and_is_final");
    for engine in [EngineKind::Queued, EngineKind::Staged] {
        let lp = private_loop(engine);
        let (sock, _peer) = UnixStream::pair().expect("socketpair");

        let io = lp.io(sock.as_raw_fd(), Interest::READABLE).expect("io");
        io.start(|_| {}).expect("start");
        let timer = lp
            .timer(Duration::from_secs(60), Duration::from_secs(60))
            .expect("timer");
        timer.start(|| {}).expect("start");

        // Destroy must force-close the stragglers and succeed.
        lp.destroy();
        assert!(lp.is_destroyed());
        assert_eq!(lp.open_handle_count(), 0, "engine {engine:?}");
        lp.destroy();
        assert!(lp.is_destroyed());

        // Watcher handles outlive the loop without panicking.
        io.close();
        timer.close();
    }
}

#[test]
fn signal_watcher_sees_a_raised_signal() {
    init_test("e2e_signal_watcher_sees_a_raised_signal");
    // One signal, one test: SIGHUP is unused elsewhere in this binary.
    let lp = private_loop(EngineKind::Staged);
    let signum = libc::SIGHUP;

    let hits = Rc::new(Cell::new(0u32));
    let seen = Rc::clone(&hits);
    let watcher = lp.signal(signum).expect("signal watcher");
    watcher
        .start(move |got| {
            assert_eq!(got, signum);
            seen.set(seen.get() + 1);
        })
        .expect("start");

    // The latch is process-global; a parallel test's loop may drain a
    // delivery before ours sees it. Re-raise until our watcher fires.
    let start = Instant::now();
    while hits.get() == 0 && start.elapsed() < Duration::from_secs(10) {
        nix::sys::signal::raise(nix::sys::signal::Signal::SIGHUP).expect("raise");
        lp.run_once();
    }
    assert_with_log!(hits.get() >= 1, "signal delivered through the loop", true, hits.get() >= 1);

    watcher.close();
    lp.destroy();
}
