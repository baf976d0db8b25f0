//! Recoverable error types surfaced by the public API.
//!
//! Per the crate's error-handling policy (see the crate root docs): programmer errors —
//! double-blocking a task, a poisoned lock, a failed context switch, total scheduler
//! deadlock — are never represented here. Those `panic!`/`assert!` directly, since the
//! runtime's invariants cannot be trusted once violated. [`RuntimeError`] only covers
//! conditions a caller can reasonably recover from.

use std::io;

/// Errors returned by fallible runtime operations.
///
/// Each variant names a distinct failure mode. See the [`crate`] docs for the broader
/// taxonomy of programmer errors (panic) vs. recoverable errors (this type) vs.
/// transient I/O conditions (absorbed internally and never observed by callers).
#[derive(Debug, thiserror::Error, miette::Diagnostic)]
pub enum RuntimeError {
    /// [`crate::fd_wait`] was asked to register a descriptor but the pollset was
    /// already at [`crate::RuntimeConfig::max_poll_fds`] capacity.
    #[error("pollset is full ({capacity} descriptors registered)")]
    #[diagnostic(
        code(taskmn::pollset_full),
        help(
            "raise `RuntimeConfig::max_poll_fds`, or reduce the number of concurrently \
             fd-waiting tasks"
        )
    )]
    PollsetFull {
        /// The configured capacity that was exceeded.
        capacity: usize,
    },

    /// The self-pipe used to wake the poller out of a blocking `poll(2)` call could not
    /// be created.
    #[error("failed to create the poller's self-pipe")]
    #[diagnostic(code(taskmn::self_pipe_init))]
    SelfPipeInit(#[source] io::Error),
}

/// Convenience alias for operations that can fail with [`RuntimeError`].
pub type Result<T> = std::result::Result<T, RuntimeError>;
