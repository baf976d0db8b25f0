//! The [`Task`] type, its heap layout, and the intrusive doubly-linked list used for
//! every queue a task can be a member of (run queue, sleep list, rendezvous wait-sets).

use std::alloc::{alloc, dealloc, Layout};
use std::any::Any;
use std::fmt;
use std::ptr::{self, NonNull};
use std::time::Instant;

use crate::context::Context;
use crate::runtime::Runtime;

/// Opaque handle to a task, returned by [`crate::task_create`]. Stable across the
/// task's whole lifetime; cheap to copy and pass between threads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskId(pub(crate) u64);

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { write!(f, "{}", self.0) }
}

/// Fixed-capacity, truncating string buffer backing [`Task::name`]/[`Task::state`].
///
/// 96 bytes comfortably holds a debug label while keeping [`Task`] small — tasks are
/// allocated by the hundreds or thousands in typical use.
#[derive(Clone)]
pub(crate) struct FixedStr {
    buf: [u8; Self::CAP],
    len: usize,
}

impl FixedStr {
    const CAP: usize = 96;

    const fn empty() -> Self { Self { buf: [0; Self::CAP], len: 0 } }

    fn set(&mut self, s: &str) {
        let n = s.len().min(Self::CAP);
        // Truncate on a char boundary so `as_str` never panics on the slice.
        let mut n = n;
        while n > 0 && !s.is_char_boundary(n) {
            n -= 1;
        }
        self.buf[..n].copy_from_slice(&s.as_bytes()[..n]);
        self.len = n;
    }

    pub(crate) fn as_str(&self) -> &str {
        // Safety: only ever written via `set`, which truncates on a char boundary.
        std::str::from_utf8(&self.buf[..self.len]).unwrap_or("")
    }
}

/// Per-task scheduling/runtime flags. Each task carries exactly one of these; no flag
/// combination implies membership in more than one of {run queue, sleep list, pollset,
/// rendezvous wait-set} — that invariant is enforced by callers, not by this type.
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct TaskFlags {
    pub(crate) ready: bool,
    pub(crate) readyout: bool,
    pub(crate) exiting: bool,
    pub(crate) blocked: bool,
}

/// One cooperative thread of control: its own stack, saved CPU context, identity, and
/// queue linkage.
///
/// # Layout
///
/// Allocated by [`Task::allocate`] as a single buffer: the `Task` record itself sits at
/// the high end, 64-byte aligned, and everything below it (down to the buffer's start)
/// is the task's usable stack, which grows further downward as the task runs — one
/// `alloc` call backing both the struct and its stack rather than two separate
/// allocations.
pub struct Task {
    pub(crate) id: TaskId,
    pub(crate) name: FixedStr,
    pub(crate) state: FixedStr,

    pub(crate) context: Context,
    /// Non-null only while this task is mid-switch, pointing at the worker's
    /// scheduler-owned context to switch back into.
    pub(crate) sched_ctx: *mut Context,

    pub(crate) deadline: Option<Instant>,
    pub(crate) user_data: Option<Box<dyn Any + Send>>,

    /// Non-owning back-reference; valid for the task's whole life because `run()` does
    /// not return until every task (including this one) has exited.
    pub(crate) runtime: *const Runtime,

    pub(crate) flags: TaskFlags,
    /// Index into the runtime's all-tasks registry; kept in sync on every swap-remove.
    pub(crate) registry_slot: usize,

    // Intrusive doubly-linked list pointers. Meaningful only relative to whichever one
    // list this task currently belongs to (run queue XOR sleep list XOR a rendezvous
    // wait-set XOR none). Never read/written except through `TaskList`.
    pub(crate) next: *mut Task,
    pub(crate) prev: *mut Task,

    /// The user's entry point, consumed exactly once by the trampoline on first switch.
    start: Option<Box<dyn FnOnce(&Task) + Send>>,

    // Bookkeeping needed to free the combined stack+struct allocation on exit.
    alloc_base: *mut u8,
    alloc_layout: Layout,
}

// Safety: a `Task` is only ever touched by (a) whichever single worker thread currently
// owns it off a queue, or (b) under the lock protecting the queue it's linked into.
// There is no unsynchronized concurrent access by construction.
unsafe impl Send for Task {}
unsafe impl Sync for Task {}

impl Task {
    const TASK_ALIGN: usize = 64;

    /// Allocates a task and its stack as one combined buffer and returns an owning
    /// pointer. The caller becomes responsible for eventually calling [`Task::free`]
    /// exactly once (the scheduler does this when a task's `exiting` flag is observed).
    ///
    /// # Safety
    ///
    /// `runtime` must outlive the returned task.
    pub(crate) unsafe fn allocate(
        id: TaskId,
        stack_size: usize,
        runtime: *const Runtime,
        start: Box<dyn FnOnce(&Task) + Send>,
    ) -> NonNull<Task> {
        let total = stack_size + std::mem::size_of::<Task>() + Self::TASK_ALIGN;
        let layout = Layout::from_size_align(total, Self::TASK_ALIGN).expect("layout overflow");

        // Safety: `total` is nonzero and alignment is a valid power of two.
        let base = unsafe { alloc(layout) };
        assert!(!base.is_null(), "out of memory allocating a {total}-byte task stack");

        let buf_end = base as usize + total;
        let task_addr = (buf_end - std::mem::size_of::<Task>()) & !(Self::TASK_ALIGN - 1);
        debug_assert!(task_addr >= base as usize, "stack_size too small to host the task record");

        let task_ptr = task_addr as *mut Task;
        // Safety: `task_ptr` is within the allocation, correctly aligned, and large
        // enough for a `Task`, per the arithmetic above.
        unsafe {
            task_ptr.write(Task {
                id,
                name: FixedStr::empty(),
                state: FixedStr::empty(),
                context: Context::empty(),
                sched_ctx: ptr::null_mut(),
                deadline: None,
                user_data: None,
                runtime,
                flags: TaskFlags::default(),
                registry_slot: 0,
                next: ptr::null_mut(),
                prev: ptr::null_mut(),
                start: Some(start),
                alloc_base: base,
                alloc_layout: layout,
            });
        }

        // Safety: just wrote a valid `Task` at this address.
        NonNull::new(task_ptr).unwrap()
    }

    /// The high, exclusive end of this task's stack region — where `rsp` starts before
    /// the first push.
    pub(crate) fn stack_top(&self) -> *mut u8 {
        let self_addr = (self as *const Task) as usize;
        (self_addr & !0xF) as *mut u8
    }

    /// Takes the start closure, leaving `None` behind. Called exactly once, by the
    /// trampoline, the first time this task is switched into.
    pub(crate) fn take_start(&mut self) -> Box<dyn FnOnce(&Task) + Send> {
        self.start.take().expect("task trampoline invoked more than once")
    }

    /// Sets the debug name, truncating to the fixed buffer capacity.
    pub fn set_name(&mut self, name: impl AsRef<str>) { self.name.set(name.as_ref()); }

    /// The debug name last set by [`Task::set_name`] (or `task_create`'s caller),
    /// possibly truncated.
    #[must_use]
    pub fn name(&self) -> &str { self.name.as_str() }

    /// Sets the debug state string, truncating to the fixed buffer capacity.
    pub fn set_state(&mut self, state: impl AsRef<str>) { self.state.set(state.as_ref()); }

    /// The debug state string last set by [`Task::set_state`].
    #[must_use]
    pub fn state(&self) -> &str { self.state.as_str() }

    /// This task's stable identifier.
    #[must_use]
    pub fn id(&self) -> TaskId { self.id }

    /// Mutable access to this task's opaque user-data slot.
    #[must_use]
    pub fn data(&mut self) -> &mut Option<Box<dyn Any + Send>> { &mut self.user_data }

    /// Frees a task allocated by [`Task::allocate`]. The task must not be linked into
    /// any list and must not be switched into again after this call.
    ///
    /// # Safety
    ///
    /// `ptr` must have come from [`Task::allocate`] and must not be used again.
    pub(crate) unsafe fn free(ptr: NonNull<Task>) {
        let base = unsafe { (*ptr.as_ptr()).alloc_base };
        let layout = unsafe { (*ptr.as_ptr()).alloc_layout };
        unsafe {
            ptr::drop_in_place(ptr.as_ptr());
            dealloc(base, layout);
        }
    }
}

/// An intrusive doubly-linked list of [`Task`]s, used for the run queue, the sleep
/// list, and every rendezvous wait-set.
///
/// Invariant: a task is linked into at most one `TaskList` at a time. Every method here
/// is `unsafe` because correctness depends on that invariant, which the list itself
/// cannot check — it is enforced by the synchronization discipline documented on each
/// call site (always manipulated under the relevant lock).
pub(crate) struct TaskList {
    head: *mut Task,
    tail: *mut Task,
}

impl TaskList {
    pub(crate) const fn new() -> Self { Self { head: ptr::null_mut(), tail: ptr::null_mut() } }

    pub(crate) fn is_empty(&self) -> bool { self.head.is_null() }

    pub(crate) fn front(&self) -> *mut Task { self.head }

    /// Appends `t` at the tail.
    ///
    /// # Safety
    /// `t` must not currently be linked into any list.
    pub(crate) unsafe fn push_back(&mut self, t: *mut Task) {
        unsafe {
            (*t).prev = self.tail;
            (*t).next = ptr::null_mut();
            if self.tail.is_null() {
                self.head = t;
            } else {
                (*self.tail).next = t;
            }
            self.tail = t;
        }
    }

    /// Unlinks and returns the head, or null if empty.
    ///
    /// # Safety
    /// The list's internal pointers must be consistent (always true between calls).
    pub(crate) unsafe fn pop_front(&mut self) -> *mut Task {
        let t = self.head;
        if !t.is_null() {
            unsafe { self.remove(t) };
        }
        t
    }

    /// Unlinks `t` from this list, wherever in the middle or ends it sits.
    ///
    /// # Safety
    /// `t` must currently be linked into this exact list.
    pub(crate) unsafe fn remove(&mut self, t: *mut Task) {
        unsafe {
            if !(*t).prev.is_null() {
                (*(*t).prev).next = (*t).next;
            } else {
                self.head = (*t).next;
            }
            if !(*t).next.is_null() {
                (*(*t).next).prev = (*t).prev;
            } else {
                self.tail = (*t).prev;
            }
            (*t).next = ptr::null_mut();
            (*t).prev = ptr::null_mut();
        }
    }

    /// Inserts `t` immediately before `before` (which must be linked into this list),
    /// or at the tail if `before` is null. Used by the sleep list to keep deadlines
    /// sorted ascending.
    ///
    /// # Safety
    /// `before` (if non-null) must be linked into this list; `t` must not be linked
    /// into any list.
    pub(crate) unsafe fn insert_before(&mut self, before: *mut Task, t: *mut Task) {
        unsafe {
            if before.is_null() {
                self.push_back(t);
                return;
            }
            let prev = (*before).prev;
            (*t).prev = prev;
            (*t).next = before;
            (*before).prev = t;
            if prev.is_null() {
                self.head = t;
            } else {
                (*prev).next = t;
            }
        }
    }

    /// Iterates the list from head to tail without unlinking anything.
    pub(crate) fn iter(&self) -> TaskListIter { TaskListIter { next: self.head } }
}

pub(crate) struct TaskListIter {
    next: *mut Task,
}

impl Iterator for TaskListIter {
    type Item = *mut Task;

    fn next(&mut self) -> Option<*mut Task> {
        if self.next.is_null() {
            return None;
        }
        let cur = self.next;
        // Safety: list structure is stable for the duration of the iteration (caller
        // holds the relevant lock across it, per every call site in this crate).
        self.next = unsafe { (*cur).next };
        Some(cur)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_str_truncates_without_panicking_on_utf8_boundary() {
        let mut s = FixedStr::empty();
        let long = "x".repeat(FixedStr::CAP * 2);
        s.set(&long);
        assert_eq!(s.as_str().len(), FixedStr::CAP);
    }

    #[test]
    fn list_push_pop_preserves_fifo_order() {
        unsafe {
            let mut list = TaskList::new();
            let a = Task::allocate(TaskId(1), 64 * 1024, ptr::null(), Box::new(|_| {}));
            let b = Task::allocate(TaskId(2), 64 * 1024, ptr::null(), Box::new(|_| {}));

            list.push_back(a.as_ptr());
            list.push_back(b.as_ptr());

            assert_eq!((*list.pop_front()).id, TaskId(1));
            assert_eq!((*list.pop_front()).id, TaskId(2));
            assert!(list.is_empty());

            Task::free(a);
            Task::free(b);
        }
    }
}
