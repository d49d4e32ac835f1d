//! Process-wide link counters.
//!
//! Protocol anomalies never surface as errors, so these counters are the only
//! place they leave a trace besides the log.
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

static MESSAGES_SENT: AtomicU64 = AtomicU64::new(0);
static ACKS_CONFIRMED: AtomicU64 = AtomicU64::new(0);
static ACKS_DROPPED: AtomicU64 = AtomicU64::new(0);
static ACKS_UNMATCHED: AtomicU64 = AtomicU64::new(0);
static ACK_TIMEOUTS: AtomicU64 = AtomicU64::new(0);
static RECEIVES_PAIRED: AtomicU64 = AtomicU64::new(0);
static RECEIVES_UNPAIRED: AtomicU64 = AtomicU64::new(0);
static STATS_LINES: AtomicU64 = AtomicU64::new(0);
static DISCARDED_LINES: AtomicU64 = AtomicU64::new(0);
static READ_ERRORS: AtomicU64 = AtomicU64::new(0);

pub fn inc_messages_sent() {
    MESSAGES_SENT.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_acks_confirmed() {
    ACKS_CONFIRMED.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_acks_dropped() {
    ACKS_DROPPED.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_acks_unmatched() {
    ACKS_UNMATCHED.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_ack_timeouts() {
    ACK_TIMEOUTS.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_receives_paired() {
    RECEIVES_PAIRED.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_receives_unpaired() {
    RECEIVES_UNPAIRED.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_stats_lines() {
    STATS_LINES.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_discarded_lines() {
    DISCARDED_LINES.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_read_errors() {
    READ_ERRORS.fetch_add(1, Ordering::Relaxed);
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct Snapshot {
    pub messages_sent: u64,
    pub acks_confirmed: u64,
    pub acks_dropped: u64,
    pub acks_unmatched: u64,
    pub ack_timeouts: u64,
    pub receives_paired: u64,
    pub receives_unpaired: u64,
    pub stats_lines: u64,
    pub discarded_lines: u64,
    pub read_errors: u64,
}

pub fn snapshot() -> Snapshot {
    Snapshot {
        messages_sent: MESSAGES_SENT.load(Ordering::Relaxed),
        acks_confirmed: ACKS_CONFIRMED.load(Ordering::Relaxed),
        acks_dropped: ACKS_DROPPED.load(Ordering::Relaxed),
        acks_unmatched: ACKS_UNMATCHED.load(Ordering::Relaxed),
        ack_timeouts: ACK_TIMEOUTS.load(Ordering::Relaxed),
        receives_paired: RECEIVES_PAIRED.load(Ordering::Relaxed),
        receives_unpaired: RECEIVES_UNPAIRED.load(Ordering::Relaxed),
        stats_lines: STATS_LINES.load(Ordering::Relaxed),
        discarded_lines: DISCARDED_LINES.load(Ordering::Relaxed),
        read_errors: READ_ERRORS.load(Ordering::Relaxed),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // counters are global, so only assert they moved forward
    #[test]
    fn counters_are_monotonic() {
        let before = snapshot();
        inc_acks_unmatched();
        inc_discarded_lines();
        inc_discarded_lines();
        let after = snapshot();
        assert!(after.acks_unmatched >= before.acks_unmatched + 1);
        assert!(after.discarded_lines >= before.discarded_lines + 2);
    }
}
