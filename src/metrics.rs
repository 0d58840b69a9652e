//! Process-wide counters for the command engine.
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use serde::Serialize;

static COMMANDS_SENT: AtomicU64 = AtomicU64::new(0);
static COMMANDS_COMPLETED: AtomicU64 = AtomicU64::new(0);
static COMMANDS_FAILED: AtomicU64 = AtomicU64::new(0);
static COMMANDS_COALESCED: AtomicU64 = AtomicU64::new(0);
static TIMEOUTS: AtomicU64 = AtomicU64::new(0);
static RETRIES: AtomicU64 = AtomicU64::new(0);
static UNSOLICITED: AtomicU64 = AtomicU64::new(0);
static CORRUPT_DISCARDED: AtomicU64 = AtomicU64::new(0);
static BUFFER_OVERFLOWS: AtomicU64 = AtomicU64::new(0);
static RESETS_REQUESTED: AtomicU64 = AtomicU64::new(0);
static RESPONSE_LATENCY_SUM_MS: AtomicU64 = AtomicU64::new(0);
static RESPONSE_LATENCY_COUNT: AtomicU64 = AtomicU64::new(0);

pub fn inc_commands_sent() {
    COMMANDS_SENT.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_commands_completed() {
    COMMANDS_COMPLETED.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_commands_failed() {
    COMMANDS_FAILED.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_commands_coalesced() {
    COMMANDS_COALESCED.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_timeouts() {
    TIMEOUTS.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_retries() {
    RETRIES.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_unsolicited() {
    UNSOLICITED.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_corrupt_discarded() {
    CORRUPT_DISCARDED.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_buffer_overflows() {
    BUFFER_OVERFLOWS.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_resets_requested() {
    RESETS_REQUESTED.fetch_add(1, Ordering::Relaxed);
}

/// Record the time from writing a command to receiving its final response.
pub fn observe_response_latency(sent_at: Instant) {
    let ms = sent_at.elapsed().as_millis() as u64;
    RESPONSE_LATENCY_SUM_MS.fetch_add(ms, Ordering::Relaxed);
    RESPONSE_LATENCY_COUNT.fetch_add(1, Ordering::Relaxed);
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct Snapshot {
    pub commands_sent: u64,
    pub commands_completed: u64,
    pub commands_failed: u64,
    pub commands_coalesced: u64,
    pub timeouts: u64,
    pub retries: u64,
    pub unsolicited: u64,
    pub corrupt_discarded: u64,
    pub buffer_overflows: u64,
    pub resets_requested: u64,
    pub response_latency_avg_ms: Option<u64>,
}

pub fn snapshot() -> Snapshot {
    let sum = RESPONSE_LATENCY_SUM_MS.load(Ordering::Relaxed);
    let count = RESPONSE_LATENCY_COUNT.load(Ordering::Relaxed);
    Snapshot {
        commands_sent: COMMANDS_SENT.load(Ordering::Relaxed),
        commands_completed: COMMANDS_COMPLETED.load(Ordering::Relaxed),
        commands_failed: COMMANDS_FAILED.load(Ordering::Relaxed),
        commands_coalesced: COMMANDS_COALESCED.load(Ordering::Relaxed),
        timeouts: TIMEOUTS.load(Ordering::Relaxed),
        retries: RETRIES.load(Ordering::Relaxed),
        unsolicited: UNSOLICITED.load(Ordering::Relaxed),
        corrupt_discarded: CORRUPT_DISCARDED.load(Ordering::Relaxed),
        buffer_overflows: BUFFER_OVERFLOWS.load(Ordering::Relaxed),
        resets_requested: RESETS_REQUESTED.load(Ordering::Relaxed),
        response_latency_avg_ms: if count > 0 { Some(sum / count) } else { None },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_only_grow() {
        let before = snapshot();
        inc_commands_sent();
        inc_timeouts();
        observe_response_latency(Instant::now());
        let after = snapshot();
        // Other tests run concurrently, so only lower bounds hold.
        assert!(after.commands_sent > before.commands_sent);
        assert!(after.timeouts > before.timeouts);
        assert!(after.response_latency_avg_ms.is_some());
    }
}
