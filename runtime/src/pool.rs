//! The elastic worker-thread pool: parallel fan-out startup, runtime grow/shrink, and
//! the public `task_pool_size` knob.

use std::sync::Arc;

use crate::runtime::Runtime;
use crate::scheduler;
use crate::task::Task;

/// Spawns up to two child threads splitting `n` workers between them
/// (`ceil(n/2)`/`floor(n/2)`), each repeating the split recursively before finally
/// running the scheduler loop itself — O(log n) spawn latency instead of O(n).
fn fan_out(rt: &Arc<Runtime>, n: usize) {
    if n == 0 {
        return;
    }
    let a = n.div_ceil(2);
    let b = n / 2;
    if a > 0 {
        spawn_subtree(rt, a);
    }
    if b > 0 {
        spawn_subtree(rt, b);
    }
}

fn spawn_subtree(rt: &Arc<Runtime>, n: usize) {
    let rt = Arc::clone(rt);
    let handle = std::thread::Builder::new()
        .name("taskmn-worker".into())
        .spawn(move || {
            rt.pool.lock().expect("pool lock poisoned").curthr += 1;
            fan_out(&rt, n - 1);
            scheduler::scheduler_loop(rt);
        })
        .expect("failed to spawn worker thread");
    rt.worker_handles.lock().expect("worker handles lock poisoned").push(handle);
}

/// Called exactly once, by the thread that invoked [`crate::run`]: it becomes the first
/// worker and fans the remaining `nthr - 1` workers out across new OS threads before
/// entering the scheduler loop itself. Blocks until this thread's own loop returns. A
/// spurious drain that re-enters the pool must call `scheduler::scheduler_loop`
/// directly instead of this — fanning out again would spawn phantom workers.
pub(crate) fn start(rt: Arc<Runtime>) {
    rt.pool.lock().expect("pool lock poisoned").curthr += 1;
    let target = rt.pool.lock().expect("pool lock poisoned").nthr;
    fan_out(&rt, target.saturating_sub(1));
    scheduler::scheduler_loop(rt);
}

/// Grows the pool by `diff` beyond whatever is currently spawning/running, via the
/// same fan-out as startup. Used both by a worker noticing `nthr > curthr` at the end
/// of a dispatch and by [`task_pool_size`] raising the target directly.
pub(crate) fn grow(rt: &Arc<Runtime>, diff: usize) {
    fan_out(rt, diff);
}

/// Changes the worker-pool target size. Raising it spawns new workers immediately;
/// lowering it takes effect as existing workers notice on their next dispatch or stall
/// check (see `scheduler::maybe_shrink`).
pub fn task_pool_size(cur: &Task, n: usize) {
    let diff = {
        let mut pool_state = unsafe { &*cur.runtime }.pool.lock().expect("pool lock poisoned");
        pool_state.nthr = n;
        pool_state.nthr.saturating_sub(pool_state.curthr)
    };
    if diff > 0 {
        // Safety: `cur.runtime` is kept alive by the `Arc<Runtime>` that `run()` holds
        // on its stack for the runtime's entire lifetime, which has not yet returned
        // (we are executing inside one of its tasks).
        let rt = unsafe { Runtime::upgrade(cur.runtime) };
        grow(&rt, diff);
    }
}

#[cfg(test)]
mod tests {
    #[test]
    fn fan_out_split_sums_to_total() {
        for n in 0..64usize {
            let a = n.div_ceil(2);
            let b = n / 2;
            assert_eq!(a + b, n);
        }
    }
}
