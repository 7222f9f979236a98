//! Engine counters.
//!
//! All counters are relaxed atomics: they are advisory, and occasional
//! lost updates under contention are acceptable.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct Metrics {
    pub packets_sent: AtomicU64,
    pub packets_received: AtomicU64,
    pub data_bytes_sent: AtomicU64,
    pub data_bytes_received: AtomicU64,
    pub grants_sent: AtomicU64,
    pub resends_sent: AtomicU64,
    pub resent_packets: AtomicU64,
    pub restarts_sent: AtomicU64,
    pub restarts_received: AtomicU64,
    pub busy_sent: AtomicU64,
    pub short_packets: AtomicU64,
    pub unknown_packet_types: AtomicU64,
    pub unknown_rpcs: AtomicU64,
    pub redundant_segments: AtomicU64,
    pub pacer_skipped_rpcs: AtomicU64,
    pub pacer_bytes: AtomicU64,
    pub throttled_rpcs: AtomicU64,
    pub client_rpc_timeouts: AtomicU64,
    pub server_rpc_discards: AtomicU64,
    pub peer_aborts: AtomicU64,
    pub reaped_rpcs: AtomicU64,
    pub freeze_requests: AtomicU64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Bump a counter by one, relaxed.
#[inline]
pub fn inc(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

/// Add to a counter, relaxed.
#[inline]
pub fn add(counter: &AtomicU64, value: u64) {
    counter.fetch_add(value, Ordering::Relaxed);
}

/// Read a counter, relaxed.
#[inline]
pub fn get(counter: &AtomicU64) -> u64 {
    counter.load(Ordering::Relaxed)
}
