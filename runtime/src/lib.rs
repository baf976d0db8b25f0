//! `taskmn`: a cooperative, stackful-task runtime with an integrated `poll(2)`-based
//! I/O reactor.
//!
//! Tasks are lightweight, user-scheduled threads of control — each with its own stack
//! — multiplexed onto a small, elastic pool of OS threads. A task suspends at a small,
//! fixed set of points ([`task_yield`], [`task_exit`], [`fd_wait`], [`task_delay`],
//! [`rendez::rendez_sleep`]) and nowhere else; between those points it runs to
//! completion on whichever worker thread picked it up, never preempted and never
//! racing itself.
//!
//! # Error taxonomy
//!
//! - **Programmer errors** — double-blocking a task, a poisoned lock, total scheduler
//!   deadlock, failed context construction — are not representable as a [`Result`] at
//!   all: they panic, because the runtime's invariants cannot be trusted once
//!   violated. A panicking task aborts the process outright rather than unwinding,
//!   since a hand-rolled stack-swap frame has no valid unwind landing pads.
//! - **Recoverable conditions** return [`error::RuntimeError`] (pollset exhaustion,
//!   self-pipe/`poll` setup failures) or plain [`std::io::Result`] (fd read/write
//!   failures).
//! - **Transient I/O** (`EINTR`, `EAGAIN`) is absorbed internally and never surfaces.
//!
//! # API mapping
//!
//! Operations that carry an explicit task handle mainly for identity or debugging
//! (`task_name(cur)`, `task_get_state(cur)`, …) are rendered here as methods on
//! [`Task`] instead (`cur.name()`, `cur.state()`, …), since Rust already has a receiver
//! for that. Everything else — creation, scheduling, I/O, rendezvous, blocking
//! admission, pool sizing — is a free function taking `&Task` as its first argument.
#![cfg_attr(not(test), deny(clippy::unwrap_in_result))]

mod blocking;
mod config;
mod context;
mod error;
mod fdio;
mod logging;
mod pool;
mod rendez;
mod runtime;
mod scheduler;
mod task;

pub use blocking::{task_blocking, task_nonblocking, BlockingGuard};
pub use config::RuntimeConfig;
pub use error::{Result, RuntimeError};
pub use fdio::{fd_noblock, fd_read, fd_read1, fd_write, fd_wait, task_delay, Direction};
pub use pool::task_pool_size;
pub use rendez::{rendez_sleep, rendez_wake, rendez_wake_all, Rendez};
pub use scheduler::{run, task_create, task_exit, task_yield};
pub use task::{Task, TaskId};
