//! The per-worker scheduling loop and the task-lifecycle primitives (`task_create`,
//! `task_ready`, `task_yield`, `task_exit`) built directly on top of it.

use std::ptr::NonNull;
use std::sync::Arc;

use crate::config::RuntimeConfig;
use crate::context::{self, Context};
use crate::pool;
use crate::runtime::Runtime;
use crate::task::{Task, TaskId};

/// Entry-point trampoline planted by [`task_create_raw`] as every new task's initial
/// return address. Reconstructs the task pointer smuggled through `r12` by
/// [`Context::init`], runs the task's start closure, and falls through to `task_exit`
/// on return.
unsafe extern "C" fn trampoline() -> ! {
    let r12: u64;
    unsafe { std::arch::asm!("mov {0}, r12", out(reg) r12) };
    let task_ptr = r12 as *mut Task;

    // Safety: this is the first and only time this task is entered, so `take_start`
    // cannot race with anything — nothing else holds a reference to this task yet.
    let start = unsafe { (*task_ptr).take_start() };

    let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        let task_ref: &Task = unsafe { &*task_ptr };
        start(task_ref);
    }));

    if outcome.is_err() {
        // Unwinding through a hand-rolled stack-swap frame has no valid landing pads;
        // a panicking task is a programmer error, so this follows the crate's
        // panic-aborts-the-process policy rather than attempting to propagate it.
        tracing::error!(target: "taskmn", "task panicked; aborting (cannot unwind a foreign stack)");
        std::process::abort();
    }

    unsafe { task_exit(&*task_ptr, 0) }
}

/// Allocates and registers a new task, given only a raw runtime pointer (used by the
/// poller, which predates having a `Task` handle of its own to call [`task_create`]
/// through, and by [`crate::run`] for the root task).
///
/// # Safety
/// `rt_ptr` must be valid for the whole life of the created task.
pub(crate) unsafe fn task_create_raw(rt_ptr: *const Runtime, start: Box<dyn FnOnce(&Task) + Send>) -> TaskId {
    let rt = unsafe { &*rt_ptr };
    let id = TaskId(rt.next_task_id());

    let task_nn = unsafe { Task::allocate(id, rt.config.stack_size, rt_ptr, start) };
    let task_ptr = task_nn.as_ptr();
    let stack_top = unsafe { (*task_ptr).stack_top() };
    // Safety: `task_ptr` is freshly allocated, not yet reachable from anywhere else.
    unsafe {
        (*task_ptr).context = Context::init(stack_top, trampoline, task_ptr as *mut ());
        rt.register_task(task_ptr);
        task_ready(task_ptr);
    }
    id
}

/// Creates a new task that will run `start(&new_task)` once scheduled.
pub fn task_create<F>(cur: &Task, start: F) -> TaskId
where
    F: FnOnce(&Task) + Send + 'static,
{
    // Safety: `cur.runtime` outlives every task created through it.
    unsafe { task_create_raw(cur.runtime, Box::new(start)) }
}

/// Marks `t` ready and appends it to the run queue. `t` must not be linked into any
/// other list.
///
/// # Safety
/// `t` must be a live, registered task not already on any list.
pub(crate) unsafe fn task_ready(t: *mut Task) {
    let rt = unsafe { &*(*t).runtime };
    unsafe {
        (*t).flags.ready = true;
        rt.push_ready(t);
    }
}

/// Suspends the calling task, returning control to its worker's scheduler context.
///
/// # Safety
/// `cur` must be the task currently executing on this worker, mid-dispatch (i.e. its
/// `sched_ctx` must be set by the scheduler loop that switched into it).
pub(crate) unsafe fn switch_out(cur: &Task) {
    let task_ptr = cur as *const Task as *mut Task;
    let sched_ctx = unsafe { (*task_ptr).sched_ctx };
    debug_assert!(!sched_ctx.is_null(), "switch_out called outside a scheduler dispatch");
    let self_ctx = unsafe { &mut (*task_ptr).context as *mut Context };
    unsafe { context::context_switch(self_ctx, sched_ctx) };
}

/// Suspends the calling task, marking it to be re-enqueued once the worker notices.
/// Returns the number of distinct other tasks that ran before this task was resumed.
///
/// # Safety
/// `cur` must be the task currently executing on this worker.
pub unsafe fn task_yield(cur: &Task) -> u64 {
    let rt = unsafe { &*cur.runtime };
    let before = rt.sched.read().expect("sched lock poisoned").switch_count;

    let task_ptr = cur as *const Task as *mut Task;
    unsafe { (*task_ptr).flags.readyout = true };
    unsafe { switch_out(cur) };

    let after = rt.sched.read().expect("sched lock poisoned").switch_count;
    // `after - before` counts every dispatch in the interval, including the one that
    // just resumed `cur` itself; subtract that one to report only *other* tasks.
    after.saturating_sub(before).saturating_sub(1)
}

/// Terminates the calling task. `v` becomes the runtime's exit value (last writer
/// wins); never returns.
///
/// # Safety
/// `cur` must be the task currently executing on this worker.
pub unsafe fn task_exit(cur: &Task, v: i32) -> ! {
    let rt = unsafe { &*cur.runtime };
    rt.sched.write().expect("sched lock poisoned").exit_value = v;

    let task_ptr = cur as *const Task as *mut Task;
    unsafe { (*task_ptr).flags.exiting = true };
    unsafe { switch_out(cur) };
    unreachable!("an exited task must never be switched back into");
}

/// What a worker's run-queue poll turned up.
enum Dispatch {
    Task(*mut Task),
    /// No task was found and the pool's target size says this worker should retire.
    Shrink,
}

/// Pops the run queue, stalling (with periodic pool-size re-checks and a deadlock
/// assertion) when it's empty.
fn pop_ready_or_stall(rt: &Runtime) -> Dispatch {
    let mut runq = rt.runq.lock().expect("runq lock poisoned");
    loop {
        // Safety: we hold the run queue's lock.
        let t = unsafe { runq.ready.pop_front() };
        if !t.is_null() {
            return Dispatch::Task(t);
        }
        if maybe_shrink(rt) {
            return Dispatch::Shrink;
        }

        runq.nstalled += 1;
        let curthr = rt.pool.lock().expect("pool lock poisoned").curthr;
        if runq.nstalled >= curthr && rt.task_count() > 0 {
            panic!(
                "scheduler deadlock: all {curthr} worker(s) stalled with {} task(s) still alive",
                rt.task_count()
            );
        }
        let (guard, _timed_out) =
            rt.runq_cond.wait_timeout(runq, rt.config.stall_timeout).expect("runq condvar poisoned");
        runq = guard;
        runq.nstalled -= 1;
    }
}

/// If the pool is over its target size, claims one unit of shrink and reports it.
fn maybe_shrink(rt: &Runtime) -> bool {
    let mut pool = rt.pool.lock().expect("pool lock poisoned");
    if pool.curthr > pool.nthr {
        pool.curthr -= 1;
        true
    } else {
        false
    }
}

fn maybe_grow(rt: &Arc<Runtime>) {
    let diff = {
        let pool = rt.pool.lock().expect("pool lock poisoned");
        pool.nthr.saturating_sub(pool.curthr)
    };
    if diff > 0 {
        pool::grow(rt, diff);
    }
}

/// Runs one dispatch: install a scheduler context, switch into the task, and handle
/// its post-switch state (exit vs. yield).
fn run_one_task(rt: &Runtime, task_ptr: *mut Task) {
    unsafe {
        (*task_ptr).flags.ready = false;
        (*task_ptr).flags.readyout = false;
    }
    rt.sched.write().expect("sched lock poisoned").switch_count += 1;

    let mut worker_ctx = Context::empty();
    unsafe {
        (*task_ptr).sched_ctx = &mut worker_ctx as *mut Context;
        context::context_switch(&mut worker_ctx as *mut Context, &mut (*task_ptr).context as *mut Context);
    }

    let (exiting, readyout) = unsafe { ((*task_ptr).flags.exiting, (*task_ptr).flags.readyout) };
    if exiting {
        unsafe {
            rt.unregister_task(task_ptr);
            Task::free(NonNull::new(task_ptr).expect("task pointer is never null"));
        }
    } else if readyout {
        unsafe { task_ready(task_ptr) };
    }
}

/// The body of one worker OS thread: dispatch ready tasks until told to shrink or the
/// runtime drains entirely.
pub(crate) fn scheduler_loop(rt: Arc<Runtime>) {
    loop {
        if rt.task_count() == 0 {
            return;
        }
        match pop_ready_or_stall(&rt) {
            Dispatch::Shrink => return,
            Dispatch::Task(task_ptr) => {
                run_one_task(&rt, task_ptr);
                if maybe_shrink(&rt) {
                    return;
                }
                maybe_grow(&rt);
            }
        }
    }
}

/// Creates a runtime, spawns `nthr` workers, and runs `entry(&root_task)` as the first
/// task. Blocks until every task has exited, then returns the last-recorded exit value.
///
/// The calling thread itself becomes one of the `nthr` workers (see [`pool::start`]) —
/// `run` does not return until the whole pool, including any workers it spawned, has
/// fully drained.
pub fn run<F>(entry: F, nthr: usize, config: RuntimeConfig) -> i32
where
    F: FnOnce(&Task) + Send + 'static,
{
    crate::logging::init();
    assert!(nthr >= 1, "a runtime needs at least one worker thread");

    let rt = Arc::new(Runtime::new(config, nthr).expect("failed to initialize runtime"));

    // `arg` folds into the closure itself here, since Rust closures already capture
    // state idiomatically rather than needing a second `void *arg` parameter.
    unsafe { task_create_raw(Arc::as_ptr(&rt), Box::new(entry)) };

    pool::start(Arc::clone(&rt));
    while rt.task_count() > 0 {
        // `scheduler_loop` returned while tasks remain alive: this thread shrank away
        // spuriously (a pool-size race during drain). Re-enter as a freshly counted
        // worker rather than leaving the runtime under-provisioned; `pool::start`'s
        // fan-out already happened once above and must not repeat.
        rt.pool.lock().expect("pool lock poisoned").curthr += 1;
        scheduler_loop(Arc::clone(&rt));
    }

    let handles: Vec<_> = rt.worker_handles.lock().expect("worker handles lock poisoned").drain(..).collect();
    for h in handles {
        let _ = h.join();
    }

    rt.sched.read().expect("sched lock poisoned").exit_value
}
