//! Rendezvous: a condition-variable analog operating at task granularity, paired with
//! an external mutex the caller holds across the sleep/wake calls.

use std::sync::{Mutex, MutexGuard};

use crate::scheduler;
use crate::task::{Task, TaskList};

/// A task-level condition variable. Constructing one (`Rendez::new`) is all the setup
/// needed; the caller supplies their own mutex to pair it with at each sleep/wake call.
pub struct Rendez {
    waiters: Mutex<TaskList>,
}

impl Default for Rendez {
    fn default() -> Self { Self::new() }
}

impl Rendez {
    #[must_use]
    pub fn new() -> Self { Self { waiters: Mutex::new(TaskList::new()) } }

    /// Number of tasks currently asleep on this rendezvous. Exposed for tests and
    /// diagnostics; not part of the wake/sleep protocol itself.
    #[must_use]
    pub fn waiter_count(&self) -> usize {
        self.waiters.lock().expect("rendez waiters lock poisoned").iter().count()
    }
}

/// Appends `cur` to `r`'s wait-list, releases the caller's `guard`, and suspends. On
/// resumption, re-acquires `mutex` and returns the new guard: release caller's lock,
/// sleep, caller's lock held again on return.
///
/// # Safety
/// `cur` must be the task currently executing on this worker.
pub unsafe fn rendez_sleep<'a, T>(cur: &Task, r: &Rendez, mutex: &'a Mutex<T>, guard: MutexGuard<'a, T>) -> MutexGuard<'a, T> {
    let task_ptr = cur as *const Task as *mut Task;
    {
        let mut waiters = r.waiters.lock().expect("rendez waiters lock poisoned");
        // Safety: `task_ptr` is not linked into any other list — it is the task
        // currently running, which by definition isn't queued anywhere else.
        unsafe { waiters.push_back(task_ptr) };
    }
    drop(guard);

    unsafe { scheduler::switch_out(cur) };

    mutex.lock().expect("caller's mutex poisoned")
}

/// Wakes the longest-waiting task on `r`, if any. Returns `true` if a task was woken.
pub fn rendez_wake(r: &Rendez) -> bool {
    let woken = {
        let mut waiters = r.waiters.lock().expect("rendez waiters lock poisoned");
        // Safety: we hold `r`'s lock, which is the only thing that mutates this list.
        unsafe { waiters.pop_front() }
    };
    if woken.is_null() {
        return false;
    }
    // Safety: `woken` was just unlinked from `r`'s wait-list and is not on any other.
    unsafe { scheduler::task_ready(woken) };
    true
}

/// Wakes every task currently on `r`'s wait-list. Returns how many were woken.
pub fn rendez_wake_all(r: &Rendez) -> usize {
    let mut count = 0;
    while rendez_wake(r) {
        count += 1;
    }
    count
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wake_on_empty_rendez_wakes_nobody() {
        let r = Rendez::new();
        assert!(!rendez_wake(&r));
        assert_eq!(rendez_wake_all(&r), 0);
    }
}
