//! Pacing writer wrapper used by the data-path producers.

use std::io::{self, Write};

use crate::limiter::RateLimiter;

/// A writer that paces its inner sink through an optional [`RateLimiter`].
///
/// With no limiter attached the wrapper is transparent. With a limiter,
/// writes are sliced to the limiter's scheduled chunk size and each slice is
/// registered so sustained throughput converges on the configured rate.
pub struct LimitedWriter<W> {
    inner: W,
    limiter: Option<RateLimiter>,
}

impl<W: Write> LimitedWriter<W> {
    /// Wraps `inner`, pacing through `limiter` when one is supplied.
    pub fn new(inner: W, limiter: Option<RateLimiter>) -> Self {
        Self { inner, limiter }
    }

    /// Returns the inner writer.
    pub fn into_inner(self) -> W {
        self.inner
    }

    /// Provides immutable access to the inner writer.
    #[must_use]
    pub const fn get_ref(&self) -> &W {
        &self.inner
    }
}

impl<W: Write> Write for LimitedWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let Some(limiter) = self.limiter.as_mut() else {
            return self.inner.write(buf);
        };
        let n = limiter.recommended_write_size(buf.len());
        let written = self.inner.write(&buf[..n])?;
        let _ = limiter.register(written);
        Ok(written)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    #[test]
    fn unlimited_writer_passes_through() {
        let mut writer = LimitedWriter::new(Vec::new(), None);
        writer.write_all(b"0123456789").unwrap();
        assert_eq!(writer.into_inner(), b"0123456789");
    }

    #[test]
    fn limited_writer_slices_large_buffers() {
        let limiter = RateLimiter::from_rate(1024 * 100).unwrap();
        let max = limiter.write_max_bytes();
        let mut writer = LimitedWriter::new(Vec::new(), Some(limiter));
        let n = writer.write(&vec![0u8; max * 4]).unwrap();
        assert_eq!(n, max);
    }

    #[test]
    fn write_all_delivers_every_byte() {
        let limiter = RateLimiter::from_rate(10 * 1024 * 1024).unwrap();
        let mut writer = LimitedWriter::new(Vec::new(), Some(limiter));
        let payload = vec![7u8; 64 * 1024];
        writer.write_all(&payload).unwrap();
        assert_eq!(writer.get_ref().len(), payload.len());
    }

    #[test]
    fn sustained_rate_is_bounded() {
        // 1 MiB/s: writing 512 KiB beyond the burst allowance must take
        // at least a measurable fraction of the nominal time.
        let limiter = RateLimiter::from_rate(1024 * 1024).unwrap();
        let mut writer = LimitedWriter::new(std::io::sink(), Some(limiter));
        let start = Instant::now();
        writer.write_all(&vec![0u8; 768 * 1024]).unwrap();
        assert!(start.elapsed() >= Duration::from_millis(200));
    }
}
