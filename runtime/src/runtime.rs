//! The shared, per-instance runtime record: the four locking domains named in the
//! crate's concurrency design, plus construction and the handful of primitives (task
//! registry bookkeeping, run-queue push) that more than one module needs direct access
//! to.
//!
//! Everything here is reachable only through `Arc<Runtime>` — there is no process-global
//! state, so multiple runtimes can coexist in one process.

use std::os::fd::{AsFd, OwnedFd};
use std::sync::atomic::AtomicUsize;
use std::sync::{Arc, Condvar, Mutex, RwLock};

use rustix::event::PollFlags;
use rustix::pipe::{pipe_with, PipeFlags};

use crate::config::RuntimeConfig;
use crate::error::{Result, RuntimeError};
use crate::fdio::set_nonblocking;
use crate::task::{Task, TaskList};

/// Everything the `sched` rwlock protects: the all-tasks registry and the handful of
/// scalar counters that only ever change under a write lock.
pub(crate) struct SchedState {
    /// Owning index of every live task, swap-with-last on removal so a task's
    /// `registry_slot` stays valid for its whole life except across its own removal.
    pub(crate) all_tasks: Vec<*mut Task>,
    pub(crate) next_id: u64,
    pub(crate) switch_count: u64,
    pub(crate) exit_value: i32,
    pub(crate) poller_started: bool,
}

/// Everything the `runq` mutex protects.
pub(crate) struct RunQueue {
    pub(crate) ready: TaskList,
    pub(crate) nstalled: usize,
}

/// One pollset slot, index-aligned with its waiter. Slot 0 is always the self-pipe's
/// read end, with `waiter` null.
pub(crate) struct PollSlot {
    pub(crate) fd: std::os::fd::RawFd,
    pub(crate) events: PollFlags,
    pub(crate) waiter: *mut Task,
}

/// Everything the `poll` mutex protects.
pub(crate) struct PollState {
    pub(crate) slots: Vec<PollSlot>,
    pub(crate) sleep_list: TaskList,
}

/// Everything the `pool` mutex protects — this doubles as the blocking-admission
/// rendezvous's external mutex: `admission_waiters` is the wait-list that
/// `task_blocking`/`task_nonblocking` sleep on and wake.
pub(crate) struct PoolState {
    pub(crate) nthr: usize,
    pub(crate) curthr: usize,
    pub(crate) nblocking: usize,
    pub(crate) admission_waiters: TaskList,
}

/// The process-instance-wide runtime state shared by every worker thread and task.
pub struct Runtime {
    pub(crate) config: RuntimeConfig,
    pub(crate) sched: RwLock<SchedState>,
    pub(crate) runq: Mutex<RunQueue>,
    pub(crate) runq_cond: Condvar,
    pub(crate) poll: Mutex<PollState>,
    /// The self-pipe's two ends. Constant for the runtime's whole life, so both fds are
    /// readable/writable without taking `poll` — that is precisely what lets a
    /// registrant interrupt a poller blocked inside `poll(2)` while holding that lock
    /// (see `fdio::fd_wait`'s handshake).
    pub(crate) self_pipe_r: OwnedFd,
    pub(crate) self_pipe_w: OwnedFd,
    pub(crate) pool: Mutex<PoolState>,
    /// Count of registrants that have written a self-pipe wakeup byte not yet drained
    /// by the poller. Kept outside `poll`'s mutex so a registrant can bump it while
    /// the poller is holding that lock inside a blocking `poll(2)` call — incrementing
    /// it is exactly how the registrant interrupts that call (see `fdio::fd_wait`).
    pub(crate) nwaiters: AtomicUsize,
    /// Join handles for every OS thread spawned by the worker pool (fan-out startup
    /// and later grows), collected here so `run()` can wait for full drain before
    /// returning rather than racing the last worker's teardown.
    pub(crate) worker_handles: Mutex<Vec<std::thread::JoinHandle<()>>>,
}

// Safety: every field is accessed only through its owning lock; the raw `*mut Task`
// pointers inside are to heap-stable allocations owned exclusively by this runtime.
unsafe impl Send for Runtime {}
unsafe impl Sync for Runtime {}

impl Runtime {
    pub(crate) fn new(config: RuntimeConfig, nthr: usize) -> Result<Self> {
        let (self_pipe_r, self_pipe_w) =
            pipe_with(PipeFlags::CLOEXEC).map_err(|e| RuntimeError::SelfPipeInit(e.into()))?;
        set_nonblocking(self_pipe_r.as_fd()).map_err(RuntimeError::SelfPipeInit)?;
        set_nonblocking(self_pipe_w.as_fd()).map_err(RuntimeError::SelfPipeInit)?;

        let self_pipe_slot = PollSlot {
            fd: std::os::fd::AsRawFd::as_raw_fd(&self_pipe_r),
            events: PollFlags::IN,
            waiter: std::ptr::null_mut(),
        };

        Ok(Self {
            config,
            sched: RwLock::new(SchedState {
                all_tasks: Vec::new(),
                next_id: 1,
                switch_count: 0,
                exit_value: 0,
                poller_started: false,
            }),
            runq: Mutex::new(RunQueue { ready: TaskList::new(), nstalled: 0 }),
            runq_cond: Condvar::new(),
            poll: Mutex::new(PollState { slots: vec![self_pipe_slot], sleep_list: TaskList::new() }),
            self_pipe_r,
            self_pipe_w,
            pool: Mutex::new(PoolState {
                nthr,
                curthr: 0,
                nblocking: 0,
                admission_waiters: TaskList::new(),
            }),
            nwaiters: AtomicUsize::new(0),
            worker_handles: Mutex::new(Vec::new()),
        })
    }

    /// Registers a newly allocated task in the all-tasks registry, recording its slot.
    ///
    /// # Safety
    /// `task` must not already be registered.
    pub(crate) unsafe fn register_task(&self, task: *mut Task) {
        let mut sched = self.sched.write().expect("sched lock poisoned");
        let slot = sched.all_tasks.len();
        sched.all_tasks.push(task);
        unsafe { (*task).registry_slot = slot };
    }

    /// Removes a task from the all-tasks registry via swap-with-last, keeping every
    /// other task's `registry_slot` correct.
    ///
    /// # Safety
    /// `task` must currently be registered.
    pub(crate) unsafe fn unregister_task(&self, task: *mut Task) {
        let mut sched = self.sched.write().expect("sched lock poisoned");
        let slot = unsafe { (*task).registry_slot };
        let last = sched.all_tasks.len() - 1;
        sched.all_tasks.swap(slot, last);
        sched.all_tasks.pop();
        if slot != last {
            let moved = sched.all_tasks[slot];
            unsafe { (*moved).registry_slot = slot };
        }
    }

    /// Total number of live, registered tasks.
    pub(crate) fn task_count(&self) -> usize {
        self.sched.read().expect("sched lock poisoned").all_tasks.len()
    }

    pub(crate) fn next_task_id(&self) -> u64 {
        let mut sched = self.sched.write().expect("sched lock poisoned");
        let id = sched.next_id;
        sched.next_id += 1;
        id
    }

    /// Appends `task` to the run queue tail and wakes one stalled worker. Does not touch
    /// `task`'s flags — callers (`scheduler::task_ready`, the poller, `rendez_wake`) are
    /// responsible for setting `ready` beforehand.
    ///
    /// # Safety
    /// `task` must not currently be linked into any other list.
    pub(crate) unsafe fn push_ready(&self, task: *mut Task) {
        let mut runq = self.runq.lock().expect("runq lock poisoned");
        unsafe { runq.ready.push_back(task) };
        self.runq_cond.notify_one();
    }

    /// Reconstructs an owned `Arc` handle from a raw pointer obtained via
    /// `Arc::as_ptr` on a still-live `Arc<Runtime>`. Used by code that only has a
    /// task's non-owning `*const Runtime` back-reference but needs an owned handle to
    /// hand to a newly spawned OS thread.
    ///
    /// # Safety
    /// `ptr` must presently be kept alive by at least one other live `Arc<Runtime>` for
    /// as long as the returned clone (or anything cloned from it) might still be used.
    pub(crate) unsafe fn upgrade(ptr: *const Runtime) -> Arc<Runtime> {
        unsafe { Arc::increment_strong_count(ptr) };
        unsafe { Arc::from_raw(ptr) }
    }
}
