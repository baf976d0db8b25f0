//! Descriptor readiness registration and the read/write/non-blocking helpers built on
//! top of it.
//!
//! Every descriptor handed to these functions is expected to already be non-blocking
//! (`set_nonblocking`/[`fd_noblock`]); a blocking descriptor would stall the calling
//! worker thread exactly the way the whole point of this crate is to avoid.

use std::io;
use std::os::fd::{AsRawFd, BorrowedFd, RawFd};
use std::sync::atomic::Ordering;
use std::sync::MutexGuard;
use std::time::{Duration, Instant};

use rustix::event::PollFlags;
use rustix::fs::{fcntl_getfl, fcntl_setfl, OFlags};
use rustix::io::Errno;

use crate::error::{Result, RuntimeError};
use crate::poller;
use crate::runtime::{PollSlot, PollState, Runtime};
use crate::scheduler;
use crate::task::Task;

/// Direction a task is waiting for readiness on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Read,
    Write,
}

impl Direction {
    fn flags(self) -> PollFlags {
        match self {
            Direction::Read => PollFlags::IN,
            Direction::Write => PollFlags::OUT,
        }
    }
}

/// Puts `fd` in non-blocking mode. Every descriptor a task registers with [`fd_wait`]
/// must have gone through this first.
pub fn fd_noblock(fd: BorrowedFd<'_>) -> io::Result<()> { set_nonblocking(fd) }

pub(crate) fn set_nonblocking(fd: BorrowedFd<'_>) -> io::Result<()> {
    let flags = fcntl_getfl(fd).map_err(io::Error::from)?;
    fcntl_setfl(fd, flags | OFlags::NONBLOCK).map_err(io::Error::from)?;
    Ok(())
}

/// Registers `cur` as waiting for `fd` to become ready for `dir`, then suspends until
/// the poller observes readiness (or the registration itself fails, e.g. a full
/// pollset).
///
/// # Safety
/// `cur` must be the task currently executing on this worker.
pub unsafe fn fd_wait(cur: &Task, fd: RawFd, dir: Direction) -> Result<()> {
    let rt = unsafe { &*cur.runtime };
    poller::ensure_started(rt);

    let mut poll = acquire_poll_lock_with_handshake(rt);
    if poll.slots.len() >= rt.config.max_poll_fds {
        return Err(RuntimeError::PollsetFull { capacity: rt.config.max_poll_fds });
    }
    poll.slots.push(PollSlot { fd, events: dir.flags(), waiter: cur as *const Task as *mut Task });
    drop(poll);

    unsafe { scheduler::switch_out(cur) };
    Ok(())
}

/// Suspends the current task for at least `ms` milliseconds, returning the actual
/// elapsed time in milliseconds.
///
/// # Safety
/// `cur` must be the task currently executing on this worker.
pub unsafe fn task_delay(cur: &Task, ms: u64) -> u64 {
    let rt = unsafe { &*cur.runtime };
    poller::ensure_started(rt);

    let start = Instant::now();
    let deadline = start + Duration::from_millis(ms);

    let mut poll = acquire_poll_lock_with_handshake(rt);
    let task_ptr = cur as *const Task as *mut Task;
    // Safety: `task_ptr` is not linked anywhere else; we hold the poll lock, which is
    // the sleep list's lock.
    unsafe {
        (*task_ptr).deadline = Some(deadline);
        let mut before = std::ptr::null_mut();
        for candidate in poll.sleep_list.iter() {
            let candidate_deadline = (*candidate).deadline.expect("sleep list entry without a deadline");
            if candidate_deadline > deadline {
                before = candidate;
                break;
            }
        }
        poll.sleep_list.insert_before(before, task_ptr);
    }
    drop(poll);

    unsafe { scheduler::switch_out(cur) };
    start.elapsed().as_millis() as u64
}

/// Takes the poll lock, performing the self-pipe handshake if it is already held by the
/// poller: write a wakeup byte so the poller's blocking `poll(2)` call returns, then
/// queue up for the lock behind it. Returns the acquired guard with `nwaiters` already
/// adjusted to match.
fn acquire_poll_lock_with_handshake(rt: &Runtime) -> MutexGuard<'_, PollState> {
    if let Ok(guard) = rt.poll.try_lock() {
        return guard;
    }

    // `self_pipe_w` is never touched by the `poll` mutex, so this write proceeds even
    // while the poller holds that lock blocked inside `poll(2)` — that's exactly what
    // interrupts the call.
    loop {
        match rustix::io::write(&rt.self_pipe_w, &[1u8]) {
            Ok(_) | Err(Errno::AGAIN) => break, // AGAIN: a wakeup byte is already queued
            Err(Errno::INTR) => continue,
            Err(e) => panic!("self-pipe write failed: {e}"),
        }
    }

    let guard = rt.poll.lock().expect("poll lock poisoned");
    rt.nwaiters.fetch_sub(1, Ordering::SeqCst);
    guard
}

/// Reads into `buf`, retrying on `EAGAIN` by waiting for readability.
///
/// # Safety
/// `cur` must be the task currently executing on this worker; `fd` must be non-blocking.
pub unsafe fn fd_read(cur: &Task, fd: BorrowedFd<'_>, buf: &mut [u8]) -> io::Result<usize> {
    loop {
        match rustix::io::read(fd, buf) {
            Ok(n) => return Ok(n),
            Err(Errno::AGAIN) => {
                unsafe { fd_wait(cur, fd.as_raw_fd(), Direction::Read) }.map_err(io::Error::other)?;
            }
            Err(Errno::INTR) => continue,
            Err(e) => return Err(e.into()),
        }
    }
}

/// Like [`fd_read`], but waits for readability *before* the first read attempt — useful
/// when the caller has no reason to believe data is already present.
///
/// # Safety
/// `cur` must be the task currently executing on this worker; `fd` must be non-blocking.
pub unsafe fn fd_read1(cur: &Task, fd: BorrowedFd<'_>, buf: &mut [u8]) -> io::Result<usize> {
    unsafe { fd_wait(cur, fd.as_raw_fd(), Direction::Read) }.map_err(io::Error::other)?;
    unsafe { fd_read(cur, fd, buf) }
}

/// Writes all of `buf`, retrying on `EAGAIN` by waiting for writability. Returns the
/// total number of bytes written (always `buf.len()` on success).
///
/// # Safety
/// `cur` must be the task currently executing on this worker; `fd` must be non-blocking.
pub unsafe fn fd_write(cur: &Task, fd: BorrowedFd<'_>, buf: &[u8]) -> io::Result<usize> {
    let mut written = 0;
    while written < buf.len() {
        match rustix::io::write(fd, &buf[written..]) {
            Ok(0) => unsafe { fd_wait(cur, fd.as_raw_fd(), Direction::Write) }.map_err(io::Error::other)?,
            Ok(n) => written += n,
            Err(Errno::AGAIN) => {
                unsafe { fd_wait(cur, fd.as_raw_fd(), Direction::Write) }.map_err(io::Error::other)?;
            }
            Err(Errno::INTR) => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn direction_maps_to_distinct_poll_flags() {
        assert_ne!(Direction::Read.flags(), Direction::Write.flags());
    }
}
