//! The poller task: a single, lazily-created task per runtime that owns the pollset and
//! the sleep list, waking waiters via `poll(2)` and timer expiry.

use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

use rustix::event::{poll, PollFd};
use rustix::io::Errno;

use crate::runtime::Runtime;
use crate::scheduler;
use crate::task::Task;

/// Creates and schedules the poller task the first time any task needs fd-wait or
/// timed-sleep support. Idempotent: later calls are no-ops.
pub(crate) fn ensure_started(rt: &Runtime) {
    {
        let sched = rt.sched.read().expect("sched lock poisoned");
        if sched.poller_started {
            return;
        }
    }
    let mut sched = rt.sched.write().expect("sched lock poisoned");
    if sched.poller_started {
        return;
    }
    sched.poller_started = true;
    drop(sched);

    // Safety: `rt` outlives every task it creates, including this one (`run()` only
    // returns once all tasks, the poller included, have exited).
    let rt_ptr = rt as *const Runtime;
    unsafe {
        scheduler::task_create_raw(rt_ptr, Box::new(move |me| poller_loop(me)));
    }
}

fn poller_loop(me: &Task) {
    loop {
        // Step 1: never preempt useful work.
        // Safety: `me` is the task currently executing.
        while unsafe { scheduler::task_yield(me) } != 0 {}

        // Step 2: if nothing else is registered, drain and exit.
        let rt = unsafe { &*me.runtime };
        if rt.task_count() == 1 {
            unsafe { scheduler::task_exit(me, rt.sched.read().expect("sched lock poisoned").exit_value) };
            unreachable!("task_exit never returns");
        }

        run_one_iteration(rt);
    }
}

fn run_one_iteration(rt: &Runtime) {
    // Step 3: handover pattern — keep ceding the lock while registrants are queued up
    // wanting it, so nobody waits a full `poll` timeout behind us unnecessarily.
    let mut poll_guard = rt.poll.lock().expect("poll lock poisoned");
    while rt.nwaiters.load(Ordering::SeqCst) > 0 {
        drop(poll_guard);
        std::thread::yield_now();
        poll_guard = rt.poll.lock().expect("poll lock poisoned");
    }

    // Step 4: compute the timeout from the earliest sleeper.
    let now = Instant::now();
    let timeout = match poll_guard.sleep_list.front() {
        p if p.is_null() => None,
        p => {
            // Safety: `p` is linked into `sleep_list`, which we hold the lock for.
            let deadline = unsafe { (*p).deadline }.expect("sleep list entry without a deadline");
            if deadline <= now {
                Some(Duration::ZERO)
            } else {
                Some((deadline - now).min(rt.config.poll_max_wait))
            }
        }
    };

    let mut fds: Vec<PollFd<'static>> = poll_guard
        .slots
        .iter()
        .map(|s| {
            // Safety: `s.fd` is a live descriptor for the lifetime of this borrow —
            // either the self-pipe (lives as long as `rt`) or one registered by a still
            // suspended task (lives until that task resumes and closes/replaces it). We
            // extend the borrow to `'static` because `PollFd` is only used locally,
            // within this function, never stored past the `poll` call below.
            let borrowed: std::os::fd::BorrowedFd<'static> = unsafe { std::os::fd::BorrowedFd::borrow_raw(s.fd) };
            PollFd::new(borrowed, s.events)
        })
        .collect();

    // Step 5: call poll, retrying on EINTR.
    loop {
        match poll(&mut fds, timeout) {
            Ok(_) => break,
            Err(Errno::INTR) => continue,
            Err(e) => panic!("poll(2) failed: {e}"),
        }
    }

    // Step 6: handle ready slots, self-pipe first (it's always slot 0).
    let mut ready_tasks = Vec::new();
    let mut i = 0;
    while i < fds.len() {
        let revents = fds[i].revents();
        if revents.is_empty() {
            i += 1;
            continue;
        }
        if i == 0 {
            drain_self_pipe(rt);
            rt.nwaiters.fetch_add(1, Ordering::SeqCst);
            i += 1;
            continue;
        }
        let slot = poll_guard.slots.swap_remove(i);
        fds.swap_remove(i);
        // Safety: a non-self-pipe slot always has a live waiter task.
        debug_assert!(!slot.waiter.is_null());
        ready_tasks.push(slot.waiter);
        // Don't advance `i`: swap_remove pulled the last element into this index.
    }

    // Step 7: drain expired sleepers, in ascending deadline order (the list's order).
    let now = Instant::now();
    loop {
        let head = poll_guard.sleep_list.front();
        if head.is_null() {
            break;
        }
        // Safety: `head` is linked into `sleep_list`, which we hold the lock for.
        let expired = unsafe { (*head).deadline }.expect("sleep list entry without a deadline") <= now;
        if !expired {
            break;
        }
        unsafe { poll_guard.sleep_list.remove(head) };
        ready_tasks.push(head);
    }

    // Step 8: release the poll lock before waking anyone, then mark them ready.
    drop(poll_guard);
    for t in ready_tasks {
        unsafe { scheduler::task_ready(t) };
    }
}

fn drain_self_pipe(rt: &Runtime) {
    let mut buf = [0u8; 64];
    loop {
        match rustix::io::read(&rt.self_pipe_r, &mut buf) {
            Ok(0) => break,
            Ok(_) => continue,
            Err(Errno::AGAIN) => break,
            Err(Errno::INTR) => continue,
            Err(e) => panic!("self-pipe read failed: {e}"),
        }
    }
}
