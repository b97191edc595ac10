//! Token-bucket debt accounting adapted to the backup sender's pacing rules.

use std::num::NonZeroU64;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

const MICROS_PER_SECOND: u128 = 1_000_000;
const MINIMUM_SLEEP_MICROS: u128 = MICROS_PER_SECOND / 10;
const MIN_WRITE_MAX: usize = 512;
/// Slice size for cancellation-aware sleeping.
const SLEEP_SLICE: Duration = Duration::from_millis(50);

/// Hard cap on burst size: no single unpaced run exceeds 256 KiB.
pub const MAX_BURST_BYTES: usize = 256 * 1024;

/// Record of how long a [`RateLimiter::register`] call slept.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
#[must_use]
pub struct LimiterSleep {
    requested: Duration,
    actual: Duration,
}

impl LimiterSleep {
    /// Returns the delay the limiter attempted to impose.
    #[must_use]
    pub const fn requested(&self) -> Duration {
        self.requested
    }

    /// Returns the delay actually observed.
    #[must_use]
    pub const fn actual(&self) -> Duration {
        self.actual
    }

    /// Returns `true` when no sleep was needed.
    #[must_use]
    pub const fn is_noop(&self) -> bool {
        self.requested.is_zero() && self.actual.is_zero()
    }
}

fn calculate_write_max(limit: NonZeroU64) -> usize {
    let kib = if limit.get() < 1024 {
        1
    } else {
        limit.get() / 1024
    };
    let base = u128::from(kib).saturating_mul(128).max(MIN_WRITE_MAX as u128);
    let write_max = base.min(MAX_BURST_BYTES as u128) as usize;
    write_max.max(MIN_WRITE_MAX)
}

/// Token-bucket limiter pacing writes to a configured byte rate.
#[derive(Clone, Debug)]
pub struct RateLimiter {
    limit_bytes: NonZeroU64,
    write_max: usize,
    total_written: u128,
    last_instant: Option<Instant>,
    simulated_elapsed_us: u128,
    cancel: Option<Arc<AtomicBool>>,
}

impl RateLimiter {
    /// Constructs a limiter for the supplied byte-per-second rate.
    #[must_use]
    pub fn new(limit: NonZeroU64) -> Self {
        Self {
            limit_bytes: limit,
            write_max: calculate_write_max(limit),
            total_written: 0,
            last_instant: None,
            simulated_elapsed_us: 0,
            cancel: None,
        }
    }

    /// Constructs a limiter from a raw rate, returning `None` when the rate
    /// is zero (pacing disabled).
    #[must_use]
    pub fn from_rate(bytes_per_second: u64) -> Option<Self> {
        NonZeroU64::new(bytes_per_second).map(Self::new)
    }

    /// Attaches a cancellation flag checked between sleep slices.
    #[must_use]
    pub fn with_cancel(mut self, cancel: Arc<AtomicBool>) -> Self {
        self.cancel = Some(cancel);
        self
    }

    /// Returns the configured limit in bytes per second.
    #[inline]
    #[must_use]
    pub const fn limit_bytes(&self) -> NonZeroU64 {
        self.limit_bytes
    }

    /// Returns the largest chunk the limiter schedules before sleeping.
    #[inline]
    #[must_use]
    pub const fn write_max_bytes(&self) -> usize {
        self.write_max
    }

    /// Clamps a caller's buffer length to the pacing chunk size.
    #[inline]
    #[must_use]
    pub fn recommended_write_size(&self, buffer_len: usize) -> usize {
        buffer_len.min(self.write_max.max(1))
    }

    fn clamp_debt_to_burst(&mut self) {
        self.total_written = self.total_written.min(MAX_BURST_BYTES as u128);
    }

    fn cancelled(&self) -> bool {
        self.cancel
            .as_ref()
            .is_some_and(|flag| flag.load(Ordering::Relaxed))
    }

    fn sleep_for(&self, requested: Duration) {
        let mut remaining = requested;
        while !remaining.is_zero() && !self.cancelled() {
            let slice = remaining.min(SLEEP_SLICE);
            thread::sleep(slice);
            remaining = remaining.saturating_sub(slice);
        }
    }

    /// Records a completed write and sleeps off any accumulated debt.
    pub fn register(&mut self, bytes: usize) -> LimiterSleep {
        if bytes == 0 {
            return LimiterSleep::default();
        }

        self.total_written = self.total_written.saturating_add(bytes as u128);
        self.clamp_debt_to_burst();

        let start = Instant::now();
        let bytes_per_second = u128::from(self.limit_bytes.get());

        let mut elapsed_us = self.simulated_elapsed_us;
        if let Some(previous) = self.last_instant {
            let measured = start
                .duration_since(previous)
                .as_micros()
                .min(u128::from(u64::MAX));
            elapsed_us = elapsed_us.saturating_add(measured);
        }
        self.simulated_elapsed_us = 0;
        if elapsed_us > 0 {
            let allowed = elapsed_us.saturating_mul(bytes_per_second) / MICROS_PER_SECOND;
            self.total_written = self.total_written.saturating_sub(allowed);
        }
        self.clamp_debt_to_burst();

        let sleep_us = self.total_written.saturating_mul(MICROS_PER_SECOND) / bytes_per_second;
        if sleep_us < MINIMUM_SLEEP_MICROS {
            self.last_instant = Some(start);
            return LimiterSleep::default();
        }

        let requested = Duration::from_micros(sleep_us.min(u128::from(u64::MAX)) as u64);
        self.sleep_for(requested);

        let end = Instant::now();
        let elapsed_us = end
            .checked_duration_since(start)
            .map_or(0, |duration| duration.as_micros().min(u128::from(u64::MAX)));
        if sleep_us > elapsed_us {
            self.simulated_elapsed_us = sleep_us - elapsed_us;
        }
        let remaining_us = sleep_us.saturating_sub(elapsed_us);
        self.total_written = remaining_us.saturating_mul(bytes_per_second) / MICROS_PER_SECOND;
        self.clamp_debt_to_burst();
        self.last_instant = Some(end);
        LimiterSleep {
            requested,
            actual: Duration::from_micros(elapsed_us as u64),
        }
    }

    #[cfg(test)]
    pub(crate) const fn debt_for_testing(&self) -> u128 {
        self.total_written
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nz(value: u64) -> NonZeroU64 {
        NonZeroU64::new(value).expect("non-zero value required")
    }

    #[test]
    fn from_rate_zero_disables_pacing() {
        assert!(RateLimiter::from_rate(0).is_none());
    }

    #[test]
    fn from_rate_nonzero_builds_limiter() {
        let limiter = RateLimiter::from_rate(128 * 1024).unwrap();
        assert_eq!(limiter.limit_bytes().get(), 128 * 1024);
    }

    #[test]
    fn write_max_scales_with_rate() {
        // 100 KiB/s -> 100 * 128 = 12800 bytes per scheduled write.
        let limiter = RateLimiter::new(nz(1024 * 100));
        assert_eq!(limiter.write_max_bytes(), 12_800);
    }

    #[test]
    fn write_max_has_floor() {
        let limiter = RateLimiter::new(nz(100));
        assert_eq!(limiter.write_max_bytes(), 512);
    }

    #[test]
    fn write_max_is_capped_at_burst() {
        let limiter = RateLimiter::new(nz(u64::MAX));
        assert_eq!(limiter.write_max_bytes(), MAX_BURST_BYTES);
    }

    #[test]
    fn recommended_write_size_clamps() {
        let limiter = RateLimiter::new(nz(1024 * 100));
        assert_eq!(limiter.recommended_write_size(1 << 20), 12_800);
        assert_eq!(limiter.recommended_write_size(100), 100);
    }

    #[test]
    fn register_zero_bytes_is_noop() {
        let mut limiter = RateLimiter::new(nz(10_000));
        assert!(limiter.register(0).is_noop());
        assert_eq!(limiter.debt_for_testing(), 0);
    }

    #[test]
    fn small_write_at_high_rate_does_not_sleep() {
        let mut limiter = RateLimiter::new(nz(1_000_000_000));
        let sleep = limiter.register(100);
        assert!(sleep.requested() < Duration::from_millis(1));
    }

    #[test]
    fn debt_is_clamped_to_burst() {
        let mut limiter = RateLimiter::new(nz(1));
        let _ = limiter.register(10 * MAX_BURST_BYTES);
        assert!(limiter.debt_for_testing() <= MAX_BURST_BYTES as u128);
    }

    #[test]
    fn cancelled_limiter_returns_promptly() {
        let cancel = Arc::new(AtomicBool::new(true));
        let mut limiter = RateLimiter::new(nz(1)).with_cancel(Arc::clone(&cancel));
        let start = Instant::now();
        let _ = limiter.register(MAX_BURST_BYTES);
        // Debt at 256 KiB over 1 B/s would sleep for days; cancellation
        // must cut that to a single slice.
        assert!(start.elapsed() < Duration::from_secs(2));
    }
}
