//! Runtime-tunable constants, exposed as a builder so a caller can tune them per
//! [`crate::run`] call without recompiling.

use std::time::Duration;

/// Tunable limits and timeouts for one [`crate::run`] invocation.
///
/// Construct with [`RuntimeConfig::default`] and override individual fields with the
/// builder methods.
#[derive(Debug, Clone, Copy)]
pub struct RuntimeConfig {
    pub(crate) stack_size: usize,
    pub(crate) max_poll_fds: usize,
    pub(crate) blocked_thresh_pct: u32,
    pub(crate) stall_timeout: Duration,
    pub(crate) poll_max_wait: Duration,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            stack_size: 128 * 1024,
            max_poll_fds: 1024,
            blocked_thresh_pct: 75,
            stall_timeout: Duration::from_secs(2),
            poll_max_wait: Duration::from_secs(5),
        }
    }
}

impl RuntimeConfig {
    /// Stack size allocated per task, in bytes. Default 128 KiB.
    #[must_use]
    pub fn stack_size(mut self, bytes: usize) -> Self {
        self.stack_size = bytes;
        self
    }

    /// Maximum number of descriptors the pollset may track at once, including the
    /// self-pipe's read end. Default 1024.
    #[must_use]
    pub fn max_poll_fds(mut self, n: usize) -> Self {
        self.max_poll_fds = n;
        self
    }

    /// Percentage of live worker threads allowed inside a blocking section
    /// simultaneously. Default 75.
    #[must_use]
    pub fn blocked_thresh_pct(mut self, pct: u32) -> Self {
        self.blocked_thresh_pct = pct;
        self
    }

    /// How long a stalled worker waits on the run-queue condition variable before
    /// re-checking pool-size invariants. Default 2s.
    #[must_use]
    pub fn stall_timeout(mut self, d: Duration) -> Self {
        self.stall_timeout = d;
        self
    }

    /// Upper bound on how long the poller blocks in a single `poll(2)` call, even if
    /// the nearest sleeper's deadline is further out. Default 5s.
    #[must_use]
    pub fn poll_max_wait(mut self, d: Duration) -> Self {
        self.poll_max_wait = d;
        self
    }
}
