//! Tracing initialization, gated by the `TASKMN_SPAM` environment variable.
//!
//! Unset (or empty), the runtime logs at `INFO`; any non-empty value switches the global
//! filter to `DEBUG` for the `taskmn` target.

use tracing_subscriber::EnvFilter;

const SPAM_VAR: &str = "TASKMN_SPAM";

/// Installs a global `tracing` subscriber if one isn't already set.
///
/// Safe to call more than once (e.g. once per test in the same process); subsequent
/// calls are no-ops since [`tracing::subscriber::set_global_default`] only succeeds
/// once per process.
pub fn init() {
    let spam = std::env::var(SPAM_VAR).map(|v| !v.is_empty()).unwrap_or(false);
    let default_directive = if spam { "taskmn=debug" } else { "taskmn=info" };

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .try_init();
}
