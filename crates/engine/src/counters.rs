//! Swap-and-reset rate counters sampled by the auto-scaler.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Shared rate and diagnostic counters for one backup session.
///
/// Writers add with relaxed ordering; the scaler swaps every counter to
/// zero when it samples, so each sample covers a disjoint time window.
#[derive(Debug, Default)]
pub struct RateCounters {
    producer_bytes: AtomicU64,
    drained_bytes: AtomicU64,
    producer_blocked_ns: AtomicU64,
    sender_idle_ns: AtomicU64,
    /// Cumulative reconnect attempts; never reset by sampling.
    retries: AtomicU64,
}

/// One sampled window of rates and diagnostics.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct RateSample {
    /// Producer throughput in bytes per second.
    pub producer_bps: f64,
    /// Aggregate drain throughput in bytes per second.
    pub drain_bps: f64,
    /// Time the producer spent blocked on full ring buffers.
    pub producer_blocked: Duration,
    /// Time senders spent waiting on empty ring buffers.
    pub sender_idle: Duration,
}

impl RateCounters {
    /// Creates zeroed counters.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records bytes emitted by the archive producer.
    pub fn add_producer_bytes(&self, bytes: u64) {
        self.producer_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Records bytes released by acknowledgements.
    pub fn add_drained_bytes(&self, bytes: u64) {
        self.drained_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Records time the producer spent blocked on backpressure.
    pub fn add_producer_blocked(&self, blocked: Duration) {
        self.producer_blocked_ns
            .fetch_add(blocked.as_nanos().min(u128::from(u64::MAX)) as u64, Ordering::Relaxed);
    }

    /// Records time a sender spent waiting for data.
    pub fn add_sender_idle(&self, idle: Duration) {
        self.sender_idle_ns
            .fetch_add(idle.as_nanos().min(u128::from(u64::MAX)) as u64, Ordering::Relaxed);
    }

    /// Records one reconnect attempt.
    pub fn add_retry(&self) {
        self.retries.fetch_add(1, Ordering::Relaxed);
    }

    /// Returns the cumulative reconnect attempts for this session.
    #[must_use]
    pub fn retries(&self) -> u64 {
        self.retries.load(Ordering::Relaxed)
    }

    /// Atomically snapshots and resets every counter, scaling byte counts
    /// by `elapsed` into rates.
    pub fn sample_and_reset(&self, elapsed: Duration) -> RateSample {
        let secs = elapsed.as_secs_f64().max(f64::EPSILON);
        RateSample {
            producer_bps: self.producer_bytes.swap(0, Ordering::Relaxed) as f64 / secs,
            drain_bps: self.drained_bytes.swap(0, Ordering::Relaxed) as f64 / secs,
            producer_blocked: Duration::from_nanos(
                self.producer_blocked_ns.swap(0, Ordering::Relaxed),
            ),
            sender_idle: Duration::from_nanos(self.sender_idle_ns.swap(0, Ordering::Relaxed)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sample_scales_bytes_into_rates() {
        let counters = RateCounters::new();
        counters.add_producer_bytes(1000);
        counters.add_drained_bytes(500);
        let sample = counters.sample_and_reset(Duration::from_secs(2));
        assert!((sample.producer_bps - 500.0).abs() < 1e-6);
        assert!((sample.drain_bps - 250.0).abs() < 1e-6);
    }

    #[test]
    fn sample_resets_counters() {
        let counters = RateCounters::new();
        counters.add_producer_bytes(1000);
        counters.add_producer_blocked(Duration::from_millis(5));
        let _ = counters.sample_and_reset(Duration::from_secs(1));
        let second = counters.sample_and_reset(Duration::from_secs(1));
        assert_eq!(second.producer_bps, 0.0);
        assert_eq!(second.producer_blocked, Duration::ZERO);
    }

    #[test]
    fn diagnostics_accumulate_across_adds() {
        let counters = RateCounters::new();
        counters.add_sender_idle(Duration::from_millis(30));
        counters.add_sender_idle(Duration::from_millis(70));
        let sample = counters.sample_and_reset(Duration::from_secs(1));
        assert_eq!(sample.sender_idle, Duration::from_millis(100));
    }
}
