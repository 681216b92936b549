//! Process-wide shared state (§3 `SessionState`, §4.7, original `soundshare.h` `AppState`).
//!
//! Only the two session flags and shutdown flag are genuinely process-wide
//! per §9's re-architecture note; everything else (slot tables, per-session
//! byte counters) lives on the `Session`/`ReceiverSession` handle so that a
//! `stop()` followed by a fresh `start()` doesn't inherit stale counters.

use once_cell::sync::Lazy;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, Ordering};
use std::time::Instant;

static EPOCH: Lazy<Instant> = Lazy::new(Instant::now);

/// Monotonic milliseconds since an arbitrary epoch fixed at process start.
/// Mirrors the original's `clock_gettime(CLOCK_MONOTONIC)` helpers.
pub fn now_ms() -> i64 {
    EPOCH.elapsed().as_millis() as i64
}

pub fn now_ns() -> i64 {
    EPOCH.elapsed().as_nanos() as i64
}

/// Process-wide session flags (§3). At most one of streaming/receiving is
/// ever true; `shutdown_requested` is set by the signal handler.
#[derive(Default)]
pub struct AppState {
    pub is_streaming: AtomicBool,
    pub is_receiving: AtomicBool,
    pub shutdown_requested: AtomicBool,
}

impl AppState {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Per-session monotonic counters (§3 `SessionState`, §4.7). One instance is
/// created per `start()` call and discarded on `stop()`.
#[derive(Default)]
pub struct SessionStats {
    pub bytes_this_second: AtomicI64,
    pub total_bytes: AtomicI64,
    pub last_time_ms: AtomicI64,
    pub stream_start_ms: AtomicI64,
    pub current_latency_ms: AtomicI64,
    pub receiver_count: AtomicU32,
}

impl SessionStats {
    pub fn new() -> Self {
        let stats = Self::default();
        stats.current_latency_ms.store(-1, Ordering::SeqCst);
        stats
    }

    pub fn reset_clock(&self) {
        let now = now_ms();
        self.stream_start_ms.store(now, Ordering::SeqCst);
        self.last_time_ms.store(now, Ordering::SeqCst);
        self.bytes_this_second.store(0, Ordering::SeqCst);
        self.total_bytes.store(0, Ordering::SeqCst);
    }

    /// Record `n` bytes transferred, returning `Some((kbps, total, elapsed_ms))`
    /// once a full wall-clock second has rolled over (§4.3 step 4 / §4.7).
    pub fn record_bytes(&self, n: i64) -> Option<(i64, i64, i64)> {
        self.bytes_this_second.fetch_add(n, Ordering::SeqCst);
        self.total_bytes.fetch_add(n, Ordering::SeqCst);

        let now = now_ms();
        let last = self.last_time_ms.load(Ordering::SeqCst);
        let diff = now - last;
        if diff >= 1000 {
            // Best-effort CAS: if another writer already rolled the window
            // over, we simply skip publishing this round.
            if self
                .last_time_ms
                .compare_exchange(last, now, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                let b = self.bytes_this_second.swap(0, Ordering::SeqCst);
                let kbps = (b * 8) / diff.max(1);
                let total = self.total_bytes.load(Ordering::SeqCst);
                let elapsed = now - self.stream_start_ms.load(Ordering::SeqCst);
                return Some((kbps, total, elapsed));
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stats_start_with_unknown_latency() {
        let stats = SessionStats::new();
        assert_eq!(stats.current_latency_ms.load(Ordering::SeqCst), -1);
    }

    #[test]
    fn total_bytes_monotonic_non_decreasing() {
        let stats = SessionStats::new();
        stats.reset_clock();
        stats.record_bytes(100);
        let a = stats.total_bytes.load(Ordering::SeqCst);
        stats.record_bytes(50);
        let b = stats.total_bytes.load(Ordering::SeqCst);
        assert!(b >= a);
        assert_eq!(b, 150);
    }
}
