use std::fmt::Debug;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// A monotonic cycle counter.
///
/// The NIC-queue estimator and the pacer reason entirely in cycles so that
/// the transmit path never touches a wall clock. Implementations must be
/// monotonic; the absolute origin is irrelevant.
pub trait TimeSource: Send + Sync + Debug {
    /// Current cycle count.
    fn cycles(&self) -> u64;

    /// Number of cycles per second, used to convert configured byte rates
    /// and nanosecond limits into cycle units.
    fn cycles_per_second(&self) -> u64;
}

/// Cycle counter backed by the OS monotonic clock (one cycle per nanosecond).
#[derive(Debug)]
pub struct SystemTimeSource {
    origin: Instant,
}

impl SystemTimeSource {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for SystemTimeSource {
    fn default() -> Self {
        Self::new()
    }
}

impl TimeSource for SystemTimeSource {
    fn cycles(&self) -> u64 {
        self.origin.elapsed().as_nanos() as u64
    }

    fn cycles_per_second(&self) -> u64 {
        1_000_000_000
    }
}

/// A manual cycle counter for deterministic simulations.
#[derive(Debug)]
pub struct ManualTimeSource {
    cycles: AtomicU64,
    cycles_per_second: u64,
}

impl ManualTimeSource {
    pub fn new(cycles_per_second: u64) -> Self {
        Self {
            cycles: AtomicU64::new(0),
            cycles_per_second,
        }
    }

    pub fn set(&self, cycles: u64) {
        self.cycles.store(cycles, Ordering::SeqCst);
    }

    pub fn advance(&self, cycles: u64) {
        self.cycles.fetch_add(cycles, Ordering::SeqCst);
    }
}

impl TimeSource for ManualTimeSource {
    fn cycles(&self) -> u64 {
        self.cycles.load(Ordering::SeqCst)
    }

    fn cycles_per_second(&self) -> u64 {
        self.cycles_per_second
    }
}
