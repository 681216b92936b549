//! Structured logging setup (original: `ss_log` in soundshare.h/main.c).
//!
//! Timestamp + level come from `tracing_subscriber`'s formatter instead of a
//! hand-rolled `vfprintf`, but the intent is the same: one line per event on
//! stderr, cheap enough to leave on in production.

use tracing_subscriber::EnvFilter;

/// Initialize the global subscriber. Safe to call more than once; only the
/// first call has any effect.
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init();
}
