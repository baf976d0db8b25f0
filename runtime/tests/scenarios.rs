//! End-to-end scenarios exercising the scheduler, poller, rendezvous, pool resize, and
//! blocking-admission machinery together rather than in isolation.

use std::os::fd::AsFd;
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use pretty_assertions::assert_eq;
use serial_test::serial;

use taskmn::{
    fd_noblock, fd_read, fd_write, rendez_sleep, rendez_wake, run, task_create, task_delay, task_pool_size,
    task_yield, BlockingGuard, Rendez, RuntimeConfig,
};

/// S1: a single-worker runtime where the root task sleeps ~1s then exits.
#[test]
#[serial]
fn s1_delay_sleeps_at_least_the_requested_duration() {
    let start = Instant::now();
    let code = run(
        |root| {
            let slept = unsafe { task_delay(root, 200) };
            assert!(slept >= 200, "task_delay returned {slept}ms, expected at least 200");
        },
        1,
        RuntimeConfig::default(),
    );
    assert_eq!(code, 0);
    assert!(start.elapsed() >= Duration::from_millis(200));
    assert!(start.elapsed() <= Duration::from_millis(600), "delay overran its slack budget");
}

/// S2: four tasks each round-tripping a byte over their own pipe, interleaved on one
/// worker via the poller.
#[test]
#[serial]
fn s2_fan_out_fd_readiness_loop() {
    let completed = Arc::new(AtomicUsize::new(0));

    let code = run(
        {
            let completed = Arc::clone(&completed);
            move |root| {
                for _ in 0..4 {
                    let completed = Arc::clone(&completed);
                    task_create(root, move |me| {
                        let (a, b) = UnixStream::pair().expect("socketpair failed");
                        fd_noblock(a.as_fd()).expect("fd_noblock failed");
                        fd_noblock(b.as_fd()).expect("fd_noblock failed");

                        unsafe { fd_write(me, b.as_fd(), b"x") }.expect("write failed");
                        let mut buf = [0u8; 1];
                        let n = unsafe { fd_read(me, a.as_fd(), &mut buf) }.expect("read failed");
                        assert_eq!(n, 1);
                        assert_eq!(&buf, b"x");
                        completed.fetch_add(1, Ordering::SeqCst);
                    });
                }
            }
        },
        1,
        RuntimeConfig::default(),
    );

    assert_eq!(code, 0);
    assert_eq!(completed.load(Ordering::SeqCst), 4);
}

/// S3: two tasks forwarding bytes in opposite directions over a socketpair until EOF.
#[test]
#[serial]
fn s3_proxy_shaped_copy_preserves_byte_order() {
    const PAYLOAD: &[u8] = b"the quick brown fox jumps over the lazy dog";
    let received = Arc::new(Mutex::new(Vec::new()));

    let code = run(
        {
            let received = Arc::clone(&received);
            move |root| {
                let (client, server) = UnixStream::pair().expect("socketpair failed");
                fd_noblock(client.as_fd()).unwrap();
                fd_noblock(server.as_fd()).unwrap();

                task_create(root, move |me| {
                    unsafe { fd_write(me, client.as_fd(), PAYLOAD) }.expect("write failed");
                    drop(client);
                });

                let received = Arc::clone(&received);
                task_create(root, move |me| {
                    let mut buf = [0u8; 8];
                    loop {
                        match unsafe { fd_read(me, server.as_fd(), &mut buf) } {
                            Ok(0) => break,
                            Ok(n) => received.lock().unwrap().extend_from_slice(&buf[..n]),
                            Err(e) => panic!("read failed: {e}"),
                        }
                    }
                });
            }
        },
        1,
        RuntimeConfig::default(),
    );

    assert_eq!(code, 0);
    assert_eq!(received.lock().unwrap().as_slice(), PAYLOAD);
}

/// S4: two tasks ping-ponging over a shared rendezvous 1000 times with no lost wakeups.
#[test]
#[serial]
fn s4_rendezvous_ping_pong_completes_without_lost_wakeups() {
    const ROUNDS: usize = 1000;

    struct Shared {
        turn: Mutex<u8>, // 0 = A's turn, 1 = B's turn
        rendez: Rendez,
    }

    let shared = Arc::new(Shared { turn: Mutex::new(0), rendez: Rendez::new() });
    let a_rounds = Arc::new(AtomicUsize::new(0));
    let b_rounds = Arc::new(AtomicUsize::new(0));

    let code = run(
        {
            let shared = Arc::clone(&shared);
            let a_rounds = Arc::clone(&a_rounds);
            let b_rounds = Arc::clone(&b_rounds);
            move |root| {
                task_create(root, {
                    let shared = Arc::clone(&shared);
                    let a_rounds = Arc::clone(&a_rounds);
                    move |me| {
                        for _ in 0..ROUNDS {
                            let mut guard = shared.turn.lock().unwrap();
                            while *guard != 0 {
                                guard = unsafe { rendez_sleep(me, &shared.rendez, &shared.turn, guard) };
                            }
                            *guard = 1;
                            drop(guard);
                            rendez_wake(&shared.rendez);
                            a_rounds.fetch_add(1, Ordering::SeqCst);
                        }
                    }
                });

                task_create(root, move |me| {
                    for _ in 0..ROUNDS {
                        let mut guard = shared.turn.lock().unwrap();
                        while *guard != 1 {
                            guard = unsafe { rendez_sleep(me, &shared.rendez, &shared.turn, guard) };
                        }
                        *guard = 0;
                        drop(guard);
                        rendez_wake(&shared.rendez);
                        b_rounds.fetch_add(1, Ordering::SeqCst);
                    }
                });
            }
        },
        1,
        RuntimeConfig::default(),
    );

    assert_eq!(code, 0);
    assert_eq!(a_rounds.load(Ordering::SeqCst), ROUNDS);
    assert_eq!(b_rounds.load(Ordering::SeqCst), ROUNDS);
}

/// S5: starting at 4 workers, several busy-yielding tasks keep making progress while
/// the pool target is lowered to 1.
#[test]
#[serial]
fn s5_pool_resize_converges_while_tasks_keep_progressing() {
    let progress = Arc::new(AtomicUsize::new(0));

    let code = run(
        {
            let progress = Arc::clone(&progress);
            move |root| {
                for _ in 0..8 {
                    let progress = Arc::clone(&progress);
                    task_create(root, move |me| {
                        for _ in 0..200 {
                            unsafe { task_yield(me) };
                            progress.fetch_add(1, Ordering::SeqCst);
                        }
                    });
                }
                task_pool_size(root, 1);
            }
        },
        4,
        RuntimeConfig::default(),
    );

    assert_eq!(code, 0);
    assert_eq!(progress.load(Ordering::SeqCst), 8 * 200);
}

/// S6: with 4 workers and the default 75% threshold, at most 3 tasks are ever inside a
/// blocking section at once; a 4th waits for one to leave before entering.
#[test]
#[serial]
fn s6_blocking_admission_caps_concurrency_at_threshold() {
    let in_section = Arc::new(AtomicUsize::new(0));
    let max_observed = Arc::new(AtomicUsize::new(0));

    let code = run(
        {
            let in_section = Arc::clone(&in_section);
            let max_observed = Arc::clone(&max_observed);
            move |root| {
                for _ in 0..4 {
                    let in_section = Arc::clone(&in_section);
                    let max_observed = Arc::clone(&max_observed);
                    task_create(root, move |me| {
                        let _guard = unsafe { BlockingGuard::enter(me) };
                        let now = in_section.fetch_add(1, Ordering::SeqCst) + 1;
                        max_observed.fetch_max(now, Ordering::SeqCst);
                        std::thread::sleep(Duration::from_millis(80));
                        in_section.fetch_sub(1, Ordering::SeqCst);
                    });
                }
            }
        },
        4,
        RuntimeConfig::default(),
    );

    assert_eq!(code, 0);
    assert!(
        max_observed.load(Ordering::SeqCst) <= 3,
        "observed {} tasks concurrently blocking, expected at most 3 (75% of 4)",
        max_observed.load(Ordering::SeqCst)
    );
}
